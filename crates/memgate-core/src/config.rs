use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ConfigError;
use crate::schema::InputSchema;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RESET_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_CALL_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceCategory {
    MemoryOperation,
    AggregatedOperation,
    SpecializedOperation,
}

impl ServiceCategory {
    pub const ALL: [Self; 3] = [
        Self::MemoryOperation,
        Self::AggregatedOperation,
        Self::SpecializedOperation,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MemoryOperation => "memory-operation",
            Self::AggregatedOperation => "aggregated-operation",
            Self::SpecializedOperation => "specialized-operation",
        }
    }

    /// Unknown labels map to `None` rather than an error.
    pub fn parse(label: &str) -> Option<Self> {
        let lowered = label.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|c| c.as_str() == lowered)
    }
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStrategy {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_RESET_TIMEOUT_SECONDS),
        }
    }
}

/// Per-service override of the global breaker thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_seconds")]
    pub reset_timeout_seconds: u64,
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_seconds: DEFAULT_RESET_TIMEOUT_SECONDS,
            call_timeout_seconds: DEFAULT_CALL_TIMEOUT_SECONDS,
        }
    }
}

impl GlobalConfig {
    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold.max(1),
            reset_timeout: Duration::from_secs(self.reset_timeout_seconds),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds.max(1))
    }
}

/// Descriptor for one tool. The name is the key it is stored under in the
/// registry document and is not serialized alongside the other fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(skip)]
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub category: ServiceCategory,
    #[serde(alias = "endpoint")]
    pub handler: String,
    #[serde(default)]
    pub strategies: Vec<ServiceStrategy>,
    #[serde(default = "empty_object_schema")]
    pub schema: Value,
    #[serde(default = "empty_object_schema")]
    pub output_schema: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_health_path")]
    pub health_check: String,
    #[serde(default = "default_metrics_path")]
    pub metrics: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<BreakerOverrides>,
}

impl ServiceConfig {
    pub fn new(
        name: impl Into<String>,
        category: ServiceCategory,
        handler: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            name,
            description: String::new(),
            version: default_version(),
            category,
            handler: handler.into(),
            strategies: Vec::new(),
            schema: empty_object_schema(),
            output_schema: empty_object_schema(),
            dependencies: Vec::new(),
            health_check: default_health_path(),
            metrics: default_metrics_path(),
            instances: Vec::new(),
            circuit_breaker: None,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, name: &str, description: &str, default: bool) -> Self {
        self.strategies.push(ServiceStrategy {
            name: name.to_string(),
            description: description.to_string(),
            default,
        });
        self
    }

    /// First strategy flagged as default, else the first declared one.
    pub fn default_strategy(&self) -> Option<&str> {
        self.strategies
            .iter()
            .find(|s| s.default)
            .or_else(|| self.strategies.first())
            .map(|s| s.name.as_str())
    }

    pub fn breaker_settings(&self, global: &GlobalConfig) -> BreakerSettings {
        let base = global.breaker_settings();
        let Some(overrides) = self.circuit_breaker else {
            return base;
        };
        BreakerSettings {
            failure_threshold: overrides
                .failure_threshold
                .map_or(base.failure_threshold, |v| v.max(1)),
            reset_timeout: overrides
                .reset_timeout_seconds
                .map_or(base.reset_timeout, Duration::from_secs),
        }
    }

    /// Structural checks on a single entry. Dependency existence is checked
    /// per call, not here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidService {
            name: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("service name cannot be empty".to_string()));
        }
        if self.handler.trim().is_empty() {
            return Err(invalid("handler locator cannot be empty".to_string()));
        }
        if let Err(err) = semver::Version::parse(&self.version) {
            return Err(invalid(format!("version {:?}: {err}", self.version)));
        }
        let defaults = self.strategies.iter().filter(|s| s.default).count();
        if defaults > 1 {
            return Err(invalid(format!(
                "{defaults} strategies marked default, at most one allowed"
            )));
        }
        let mut seen = HashSet::new();
        for strategy in &self.strategies {
            if !seen.insert(strategy.name.as_str()) {
                return Err(invalid(format!("duplicate strategy {:?}", strategy.name)));
            }
        }
        if self.dependencies.iter().any(|d| d == &self.name) {
            return Err(ConfigError::DependencyCycle(vec![
                self.name.clone(),
                self.name.clone(),
            ]));
        }
        InputSchema::compile(&self.schema).map_err(|e| invalid(format!("schema: {e}")))?;
        InputSchema::compile(&self.output_schema)
            .map_err(|e| invalid(format!("output_schema: {e}")))?;
        Ok(())
    }
}

/// On-disk shape of the service catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub global_config: GlobalConfig,
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,
}

impl RegistryDocument {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        let mut doc: Self = serde_json::from_slice(bytes)?;
        for (name, service) in &mut doc.services {
            service.name.clone_from(name);
        }
        doc.validate()?;
        Ok(doc)
    }

    pub fn to_vec_pretty(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for service in self.services.values() {
            service.validate()?;
        }
        if let Some(cycle) = find_dependency_cycle(&self.services) {
            return Err(ConfigError::DependencyCycle(cycle));
        }
        Ok(())
    }
}

/// Depth-first search over declared dependencies. Dangling names are
/// ignored; they are reported when the service is called.
pub fn find_dependency_cycle(services: &IndexMap<String, ServiceConfig>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        services: &'a IndexMap<String, ServiceConfig>,
        marks: &mut std::collections::HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == name).unwrap_or(0);
                let mut cycle: Vec<String> = path
                    .iter()
                    .skip(start)
                    .map(|s| (*s).to_string())
                    .collect();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }
        let service = services.get(name)?;
        marks.insert(name, Mark::Visiting);
        path.push(name);
        for dep in &service.dependencies {
            if let Some(cycle) = visit(dep, services, marks, path) {
                return Some(cycle);
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        None
    }

    let mut marks = std::collections::HashMap::new();
    let mut path = Vec::new();
    services
        .keys()
        .find_map(|name| visit(name, services, &mut marks, &mut path))
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_reset_timeout_seconds() -> u64 {
    DEFAULT_RESET_TIMEOUT_SECONDS
}

fn default_call_timeout_seconds() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECONDS
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn empty_object_schema() -> Value {
    json!({"type": "object"})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with(services: Value) -> Result<RegistryDocument, ConfigError> {
        let raw = json!({
            "global_config": {"failure_threshold": 3, "reset_timeout_seconds": 10},
            "services": services
        });
        RegistryDocument::from_slice(raw.to_string().as_bytes())
    }

    #[test]
    fn parses_catalog_in_document_order() {
        let doc = doc_with(json!({
            "zeta": {"title": "Z", "category": "memory-operation", "handler": "memory.add"},
            "alpha": {"title": "A", "category": "specialized-operation", "endpoint": "memory.get"}
        }))
        .expect("parse doc");
        let names: Vec<&str> = doc.services.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        let alpha = &doc.services["alpha"];
        assert_eq!(alpha.name, "alpha");
        assert_eq!(alpha.handler, "memory.get");
        assert_eq!(alpha.category, ServiceCategory::SpecializedOperation);
        assert_eq!(doc.global_config.failure_threshold, 3);
        assert_eq!(doc.global_config.call_timeout_seconds, DEFAULT_CALL_TIMEOUT_SECONDS);
    }

    #[test]
    fn rejects_unknown_category() {
        let err = doc_with(json!({
            "x": {"title": "X", "category": "bogus", "handler": "h"}
        }))
        .expect_err("bogus category must fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_two_default_strategies() {
        let err = doc_with(json!({
            "x": {
                "title": "X", "category": "memory-operation", "handler": "h",
                "strategies": [
                    {"name": "a", "default": true},
                    {"name": "b", "default": true}
                ]
            }
        }))
        .expect_err("two defaults must fail");
        assert!(err.to_string().contains("at most one"));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let err = doc_with(json!({
            "a": {"title": "A", "category": "aggregated-operation", "handler": "h", "dependencies": ["b"]},
            "b": {"title": "B", "category": "aggregated-operation", "handler": "h", "dependencies": ["a"]}
        }))
        .expect_err("cycle must fail");
        match err {
            ConfigError::DependencyCycle(path) => assert_eq!(path, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dangling_dependency_loads() {
        let doc = doc_with(json!({
            "a": {"title": "A", "category": "aggregated-operation", "handler": "h", "dependencies": ["missing"]}
        }));
        assert!(doc.is_ok());
    }

    #[test]
    fn default_strategy_falls_back_to_first() {
        let cfg = ServiceConfig::new("s", ServiceCategory::MemoryOperation, "h")
            .with_strategy("one", "", false)
            .with_strategy("two", "", true);
        assert_eq!(cfg.default_strategy(), Some("two"));

        let cfg = ServiceConfig::new("s", ServiceCategory::MemoryOperation, "h")
            .with_strategy("one", "", false)
            .with_strategy("two", "", false);
        assert_eq!(cfg.default_strategy(), Some("one"));

        let cfg = ServiceConfig::new("s", ServiceCategory::MemoryOperation, "h");
        assert_eq!(cfg.default_strategy(), None);
    }

    #[test]
    fn service_overrides_breaker_thresholds() {
        let global = GlobalConfig::default();
        let mut cfg = ServiceConfig::new("s", ServiceCategory::MemoryOperation, "h");
        assert_eq!(cfg.breaker_settings(&global), BreakerSettings::default());
        cfg.circuit_breaker = Some(BreakerOverrides {
            failure_threshold: Some(2),
            reset_timeout_seconds: None,
        });
        let settings = cfg.breaker_settings(&global);
        assert_eq!(settings.failure_threshold, 2);
        assert_eq!(settings.reset_timeout, Duration::from_secs(60));
    }

    #[test]
    fn category_parse_is_lenient_on_case_and_underscores() {
        assert_eq!(
            ServiceCategory::parse("Memory_Operation"),
            Some(ServiceCategory::MemoryOperation)
        );
        assert_eq!(ServiceCategory::parse("bogus-category"), None);
    }
}
