use std::sync::Arc;

use indexmap::IndexMap;
use memgate_core::{
    find_dependency_cycle, ConfigError, GlobalConfig, HandlerCatalog, HandlerError, InputSchema,
    ServiceCategory, ServiceConfig, ServiceHandler,
};
use memgate_storage::{CatalogStore, StorageError};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not resolve handler for {service}: {source}")]
    Resolution {
        service: String,
        #[source]
        source: HandlerError,
    },

    #[error("health probe for {service} failed: {source}")]
    Probe {
        service: String,
        #[source]
        source: HandlerError,
    },

    #[error("unknown service {0:?}")]
    UnknownService(String),

    #[error("registration task failed: {0}")]
    Task(String),
}

/// One registered service: its descriptor, compiled input schema and the
/// lazily built handler. Replacing a service swaps the whole slot, so a
/// cached handler never outlives the descriptor it was built from.
#[derive(Clone)]
struct ServiceSlot {
    config: Arc<ServiceConfig>,
    schema: Arc<InputSchema>,
    instance: Arc<OnceCell<Arc<dyn ServiceHandler>>>,
}

impl ServiceSlot {
    fn new(config: ServiceConfig) -> Result<Self, ConfigError> {
        let schema = InputSchema::compile(&config.schema).map_err(|reason| {
            ConfigError::InvalidService {
                name: config.name.clone(),
                reason: format!("schema does not compile: {reason}"),
            }
        })?;
        Ok(Self {
            config: Arc::new(config),
            schema: Arc::new(schema),
            instance: Arc::new(OnceCell::new()),
        })
    }
}

/// Catalog of tool descriptors, backed by a [`CatalogStore`].
///
/// Reads take a short shared lock and clone `Arc`s out. Registration is
/// serialised by a separate writer lock so the read-modify-write of the
/// stored document never interleaves.
pub struct ServiceRegistry {
    store: Arc<dyn CatalogStore>,
    catalog: HandlerCatalog,
    global: GlobalConfig,
    slots: RwLock<IndexMap<String, ServiceSlot>>,
    writer: Mutex<()>,
}

impl ServiceRegistry {
    /// Reads and validates the whole document. Any structural error,
    /// including a dependency cycle, fails the load.
    pub fn load(store: Arc<dyn CatalogStore>, catalog: HandlerCatalog) -> Result<Self, RegistryError> {
        let doc = store.load()?;
        let mut slots = IndexMap::with_capacity(doc.services.len());
        for (name, config) in doc.services {
            if !catalog.contains(&config.handler) {
                tracing::warn!(
                    service = %name,
                    handler = %config.handler,
                    "no handler registered for locator; calls will fail until one is"
                );
            }
            slots.insert(name, ServiceSlot::new(config)?);
        }
        tracing::info!(
            services = slots.len(),
            source = %store.describe(),
            "service registry loaded"
        );
        Ok(Self {
            store,
            catalog,
            global: doc.global_config,
            slots: RwLock::new(slots),
            writer: Mutex::new(()),
        })
    }

    pub const fn global_config(&self) -> GlobalConfig {
        self.global
    }

    /// Service names in registration order.
    pub fn discover_services(&self) -> Vec<String> {
        self.slots.read().keys().cloned().collect()
    }

    pub fn get_service_config(&self, name: &str) -> Option<Arc<ServiceConfig>> {
        self.slots.read().get(name).map(|slot| slot.config.clone())
    }

    pub fn get_services_by_category(&self, category: ServiceCategory) -> Vec<Arc<ServiceConfig>> {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.config.category == category)
            .map(|slot| slot.config.clone())
            .collect()
    }

    /// Declared dependencies of `name` that are not registered. `None` when
    /// `name` itself is unknown.
    pub fn missing_dependencies(&self, name: &str) -> Option<Vec<String>> {
        let slots = self.slots.read();
        let slot = slots.get(name)?;
        Some(
            slot.config
                .dependencies
                .iter()
                .filter(|dep| !slots.contains_key(dep.as_str()))
                .cloned()
                .collect(),
        )
    }

    pub fn validate_dependencies(&self, name: &str) -> bool {
        self.missing_dependencies(name)
            .is_some_and(|missing| missing.is_empty())
    }

    /// Returns the cached handler for `name`, building it on first use.
    /// Concurrent first callers share a single construction.
    pub fn get_service_instance(
        &self,
        name: &str,
    ) -> Result<Option<Arc<dyn ServiceHandler>>, RegistryError> {
        let Some(slot) = self.slots.read().get(name).cloned() else {
            return Ok(None);
        };
        let handler = slot
            .instance
            .get_or_try_init(|| self.catalog.build(&slot.config))
            .map_err(|source| {
                tracing::error!(service = %name, error = %source, "handler resolution failed");
                RegistryError::Resolution {
                    service: name.to_string(),
                    source,
                }
            })?;
        Ok(Some(handler.clone()))
    }

    pub fn get_default_strategy(&self, name: &str) -> Option<String> {
        self.slots
            .read()
            .get(name)
            .and_then(|slot| slot.config.default_strategy().map(str::to_string))
    }

    pub fn validate_service_schema(&self, name: &str, arguments: &Value) -> bool {
        self.schema_violations(name, arguments)
            .is_some_and(|errors| errors.is_empty())
    }

    /// Schema violations for `arguments`; `None` when `name` is unknown.
    pub fn schema_violations(&self, name: &str, arguments: &Value) -> Option<Vec<String>> {
        let schema = self.slots.read().get(name).map(|slot| slot.schema.clone())?;
        Some(schema.violations(arguments))
    }

    /// Adds or replaces a service and persists the whole document before the
    /// in-memory view changes. Replacing drops any cached handler.
    pub fn register_service(&self, config: ServiceConfig) -> Result<(), RegistryError> {
        let _writer = self.writer.lock();
        config.validate()?;
        let slot = ServiceSlot::new(config.clone())?;

        let mut candidate: IndexMap<String, ServiceConfig> = self
            .slots
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), (*slot.config).clone()))
            .collect();
        candidate.insert(config.name.clone(), config.clone());
        if let Some(cycle) = find_dependency_cycle(&candidate) {
            return Err(ConfigError::DependencyCycle(cycle).into());
        }

        let mut doc = self.store.load()?;
        doc.services.insert(config.name.clone(), config.clone());
        self.store.save(&doc)?;

        let replaced = self
            .slots
            .write()
            .insert(config.name.clone(), slot)
            .is_some();
        tracing::info!(
            service = %config.name,
            handler = %config.handler,
            replaced,
            "service registered"
        );
        Ok(())
    }

    /// Asks the handler's own probe. A handler that cannot be built counts
    /// as an error, not as unhealthy.
    pub async fn get_service_health_status(&self, name: &str) -> Result<bool, RegistryError> {
        let handler = self
            .get_service_instance(name)?
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?;
        handler.health().await.map_err(|source| RegistryError::Probe {
            service: name.to_string(),
            source,
        })
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("store", &self.store.describe())
            .field("services", &self.discover_services())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use memgate_core::{GatewayContext, RegistryDocument};
    use memgate_storage::InMemoryCatalogStore;
    use serde_json::json;

    use super::*;

    struct Echo;

    #[async_trait]
    impl ServiceHandler for Echo {
        async fn execute(&self, args: Value, _ctx: GatewayContext) -> Result<Value, HandlerError> {
            Ok(json!({"status": "success", "echoed": args}))
        }
    }

    fn document(services: Vec<ServiceConfig>) -> RegistryDocument {
        RegistryDocument {
            global_config: GlobalConfig::default(),
            services: services.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    fn registry_with(
        services: Vec<ServiceConfig>,
        catalog: HandlerCatalog,
    ) -> (ServiceRegistry, Arc<InMemoryCatalogStore>) {
        let store = Arc::new(InMemoryCatalogStore::new(document(services)));
        let registry = ServiceRegistry::load(store.clone(), catalog).expect("load");
        (registry, store)
    }

    fn echo_catalog() -> HandlerCatalog {
        HandlerCatalog::new().with_instance("echo", Arc::new(Echo))
    }

    #[test]
    fn discovery_follows_document_order_and_category() {
        let (registry, _) = registry_with(
            vec![
                ServiceConfig::new("zeta", ServiceCategory::MemoryOperation, "echo"),
                ServiceConfig::new("alpha", ServiceCategory::SpecializedOperation, "echo"),
                ServiceConfig::new("mid", ServiceCategory::MemoryOperation, "echo"),
            ],
            echo_catalog(),
        );
        assert_eq!(registry.discover_services(), ["zeta", "alpha", "mid"]);
        let memory: Vec<String> = registry
            .get_services_by_category(ServiceCategory::MemoryOperation)
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(memory, ["zeta", "mid"]);
        assert!(registry
            .get_services_by_category(ServiceCategory::AggregatedOperation)
            .is_empty());
    }

    #[test]
    fn dangling_dependencies_are_reported() {
        let (registry, _) = registry_with(
            vec![
                ServiceConfig::new("a", ServiceCategory::AggregatedOperation, "echo")
                    .with_dependencies(["b", "ghost"]),
                ServiceConfig::new("b", ServiceCategory::MemoryOperation, "echo"),
            ],
            echo_catalog(),
        );
        assert!(!registry.validate_dependencies("a"));
        assert_eq!(registry.missing_dependencies("a"), Some(vec!["ghost".to_string()]));
        assert!(registry.validate_dependencies("b"));
        assert!(!registry.validate_dependencies("nope"));
        assert_eq!(registry.missing_dependencies("nope"), None);
    }

    #[test]
    fn instance_is_built_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let catalog = HandlerCatalog::new().with("echo", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Echo) as Arc<dyn ServiceHandler>)
        });
        let (registry, _) = registry_with(
            vec![ServiceConfig::new("e", ServiceCategory::MemoryOperation, "echo")],
            catalog,
        );
        let first = registry.get_service_instance("e").expect("resolve").expect("known");
        let second = registry.get_service_instance("e").expect("resolve").expect("known");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(registry.get_service_instance("missing").expect("ok").is_none());
    }

    #[test]
    fn unresolvable_locator_is_a_resolution_error() {
        let (registry, _) = registry_with(
            vec![ServiceConfig::new("broken", ServiceCategory::MemoryOperation, "nowhere")],
            echo_catalog(),
        );
        assert!(matches!(
            registry.get_service_instance("broken"),
            Err(RegistryError::Resolution { service, .. }) if service == "broken"
        ));
    }

    #[test]
    fn schema_validation_uses_compiled_schema() {
        let (registry, _) = registry_with(
            vec![ServiceConfig::new("e", ServiceCategory::MemoryOperation, "echo").with_schema(
                json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                }),
            )],
            echo_catalog(),
        );
        assert!(registry.validate_service_schema("e", &json!({"message": "hi"})));
        assert!(!registry.validate_service_schema("e", &json!({"message": 1})));
        assert!(!registry.validate_service_schema("e", &json!({})));
        assert!(!registry.validate_service_schema("unknown", &json!({})));
    }

    #[test]
    fn default_strategy_prefers_flagged_entry() {
        let (registry, _) = registry_with(
            vec![
                ServiceConfig::new("s", ServiceCategory::MemoryOperation, "echo")
                    .with_strategy("fast", "", false)
                    .with_strategy("deep", "", true),
                ServiceConfig::new("plain", ServiceCategory::MemoryOperation, "echo"),
            ],
            echo_catalog(),
        );
        assert_eq!(registry.get_default_strategy("s").as_deref(), Some("deep"));
        assert_eq!(registry.get_default_strategy("plain"), None);
    }

    #[test]
    fn register_persists_and_replaces_cached_instance() {
        let (registry, store) = registry_with(
            vec![ServiceConfig::new("e", ServiceCategory::MemoryOperation, "echo")],
            echo_catalog(),
        );
        let before = registry.get_service_instance("e").expect("ok").expect("known");

        let mut replacement = ServiceConfig::new("e", ServiceCategory::MemoryOperation, "echo");
        replacement.description = "v2".to_string();
        registry.register_service(replacement).expect("replace");
        registry
            .register_service(ServiceConfig::new("f", ServiceCategory::MemoryOperation, "echo"))
            .expect("add");

        let after = registry.get_service_instance("e").expect("ok").expect("known");
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(registry.discover_services(), ["e", "f"]);
        assert_eq!(store.save_count(), 2);
        let saved = store.snapshot();
        assert_eq!(saved.services["e"].description, "v2");
        assert!(saved.services.contains_key("f"));
    }

    #[test]
    fn register_rejects_cycles_without_persisting() {
        let (registry, store) = registry_with(
            vec![ServiceConfig::new("a", ServiceCategory::AggregatedOperation, "echo")
                .with_dependencies(["b"])],
            echo_catalog(),
        );
        let err = registry
            .register_service(
                ServiceConfig::new("b", ServiceCategory::AggregatedOperation, "echo")
                    .with_dependencies(["a"]),
            )
            .expect_err("cycle");
        assert!(matches!(err, RegistryError::Config(ConfigError::DependencyCycle(_))));
        assert_eq!(store.save_count(), 0);
        assert_eq!(registry.discover_services(), ["a"]);
    }

    #[test]
    fn register_rejects_bad_schema() {
        let (registry, store) = registry_with(Vec::new(), echo_catalog());
        let err = registry
            .register_service(
                ServiceConfig::new("bad", ServiceCategory::MemoryOperation, "echo")
                    .with_schema(json!({"type": 12})),
            )
            .expect_err("schema");
        assert!(matches!(err, RegistryError::Config(_)));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn health_status_uses_handler_probe() {
        let (registry, _) = registry_with(
            vec![
                ServiceConfig::new("e", ServiceCategory::MemoryOperation, "echo"),
                ServiceConfig::new("broken", ServiceCategory::MemoryOperation, "nowhere"),
            ],
            echo_catalog(),
        );
        assert!(registry.get_service_health_status("e").await.expect("probe"));
        assert!(registry.get_service_health_status("broken").await.is_err());
        assert!(matches!(
            registry.get_service_health_status("ghost").await,
            Err(RegistryError::UnknownService(_))
        ));
    }
}
