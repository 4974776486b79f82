use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use indexmap::IndexMap;
use memgate_core::{
    ceil_secs, BreakerSnapshot, CircuitBreaker, CircuitState, Clock, GatewayContext, HandlerError,
    ServiceCategory, ServiceConfig, ServiceHandler, SystemClock, ToolInvoker,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::metrics::{CallOutcome, MetricsRegistry, ToolMetric};
use crate::protocol::{ErrorResult, ToolResult, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::redact::Redactor;
use crate::registry::{RegistryError, ServiceRegistry};

pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a call was refused or failed. Converted to [`ErrorResult`] before it
/// leaves the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("method not found: unknown tool {name:?}")]
    UnknownTool { name: String, available: Vec<String> },

    #[error("invalid params: unsatisfied dependencies for {service}: {}", .missing.join(", "))]
    UnsatisfiedDependencies {
        service: String,
        dependencies: Vec<String>,
        missing: Vec<String>,
    },

    #[error("invalid params: arguments for {service} do not match its schema")]
    InvalidArguments {
        service: String,
        schema: Value,
        errors: Vec<String>,
    },

    #[error("internal error: circuit open for {service}, retry after {retry_after}s")]
    CircuitOpen { service: String, retry_after: u64 },

    #[error("internal error: no handler available for {service}")]
    Resolution { service: String },

    #[error("internal error: {service} failed: {message}")]
    Execution { service: String, message: String },

    #[error("internal error: call to {service} was cancelled")]
    Cancelled { service: String },
}

impl GatewayError {
    pub const fn code(&self) -> i64 {
        match self {
            Self::UnknownTool { .. } => METHOD_NOT_FOUND,
            Self::UnsatisfiedDependencies { .. } | Self::InvalidArguments { .. } => INVALID_PARAMS,
            Self::CircuitOpen { .. }
            | Self::Resolution { .. }
            | Self::Execution { .. }
            | Self::Cancelled { .. } => INTERNAL_ERROR,
        }
    }

    fn data(&self) -> Value {
        match self {
            Self::UnknownTool { available, .. } => json!({ "availableTools": available }),
            Self::UnsatisfiedDependencies {
                dependencies,
                missing,
                ..
            } => json!({ "dependencies": dependencies, "missing": missing }),
            Self::InvalidArguments { schema, errors, .. } => {
                json!({ "schema": schema, "errors": errors })
            }
            Self::CircuitOpen {
                service,
                retry_after,
            } => json!({ "retryAfter": retry_after, "service": service }),
            Self::Resolution { .. } => json!({}),
            Self::Execution { service, .. } => json!({ "service": service }),
            Self::Cancelled { service } => json!({ "service": service, "cancelled": true }),
        }
    }
}

impl From<GatewayError> for ErrorResult {
    fn from(err: GatewayError) -> Self {
        Self::new(err.code(), err.to_string()).with_data(err.data())
    }
}

/// Entry of `tools/list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub title: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
}

impl From<&ServiceConfig> for ToolDescriptor {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            name: config.name.clone(),
            title: config.title.clone(),
            description: config.description.clone(),
            input_schema: config.schema.clone(),
            output_schema: config.output_schema.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub healthy: bool,
    pub circuit_breaker_state: CircuitState,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct GatewayOptions {
    pub clock: Arc<dyn Clock>,
    /// Overrides `global_config.call_timeout_seconds`.
    pub call_timeout: Option<Duration>,
    pub redactor: Redactor,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            call_timeout: None,
            redactor: Redactor::default(),
        }
    }
}

impl GatewayOptions {
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }
}

struct GatewayInner {
    registry: Arc<ServiceRegistry>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    redactor: Redactor,
    metrics: MetricsRegistry,
}

/// The single entry point for tool calls.
///
/// Cheap to clone; clones share breakers, metrics and the registry. Every
/// failure is returned as an [`ErrorResult`], never raised.
#[derive(Clone)]
pub struct ToolGateway {
    inner: Arc<GatewayInner>,
}

impl std::fmt::Debug for ToolGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolGateway")
            .field("registry", &self.inner.registry)
            .field("call_timeout", &self.inner.call_timeout)
            .finish_non_exhaustive()
    }
}

impl ToolGateway {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self::with_options(registry, GatewayOptions::default())
    }

    /// Builds the gateway and one breaker per registered service.
    pub fn with_options(registry: Arc<ServiceRegistry>, options: GatewayOptions) -> Self {
        let call_timeout = options
            .call_timeout
            .unwrap_or_else(|| registry.global_config().call_timeout());
        let gateway = Self {
            inner: Arc::new(GatewayInner {
                registry,
                breakers: RwLock::new(HashMap::new()),
                clock: options.clock,
                call_timeout,
                redactor: options.redactor,
                metrics: MetricsRegistry::default(),
            }),
        };
        for name in gateway.inner.registry.discover_services() {
            if let Some(config) = gateway.inner.registry.get_service_config(&name) {
                gateway.breaker_for(&config);
            }
        }
        gateway
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.inner.registry
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.breakers.read().get(name).cloned()
    }

    pub fn breaker_snapshot(&self, name: &str) -> Option<BreakerSnapshot> {
        self.breaker(name).map(|b| b.snapshot())
    }

    fn breaker_for(&self, config: &ServiceConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breaker(&config.name) {
            return existing;
        }
        let settings = config.breaker_settings(&self.inner.registry.global_config());
        self.inner
            .breakers
            .write()
            .entry(config.name.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    config.name.clone(),
                    settings,
                    self.inner.clock.clone(),
                ))
            })
            .clone()
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, ErrorResult> {
        self.call_tool_with_cancel(name, arguments, CancellationToken::new())
            .await
    }

    /// Like [`Self::call_tool`]; cancelling `cancel` returns early and
    /// signals the handler through its context.
    pub async fn call_tool_with_cancel(
        &self,
        name: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ErrorResult> {
        self.dispatch(name, arguments, cancel, 0)
            .await
            .map_err(ErrorResult::from)
    }

    async fn dispatch(
        &self,
        name: &str,
        arguments: Value,
        cancel: CancellationToken,
        depth: u32,
    ) -> Result<ToolResult, GatewayError> {
        let registry = &self.inner.registry;
        let Some(config) = registry.get_service_config(name) else {
            tracing::debug!(tool = %name, "call for unknown tool");
            return Err(GatewayError::UnknownTool {
                name: name.to_string(),
                available: registry.discover_services(),
            });
        };
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };

        let missing = registry.missing_dependencies(name).unwrap_or_default();
        if !missing.is_empty() {
            self.record(name, CallOutcome::Invalid, None);
            return Err(GatewayError::UnsatisfiedDependencies {
                service: name.to_string(),
                dependencies: config.dependencies.clone(),
                missing,
            });
        }

        let errors = registry.schema_violations(name, &arguments).unwrap_or_default();
        if !errors.is_empty() {
            self.record(name, CallOutcome::Invalid, None);
            return Err(GatewayError::InvalidArguments {
                service: name.to_string(),
                schema: config.schema.clone(),
                errors,
            });
        }

        let breaker = self.breaker_for(&config);
        if !breaker.can_execute() {
            let retry_after = breaker.retry_after().map_or(0, ceil_secs);
            self.record(name, CallOutcome::Rejected, None);
            tracing::debug!(tool = %name, retry_after, "circuit rejected call");
            return Err(GatewayError::CircuitOpen {
                service: name.to_string(),
                retry_after,
            });
        }

        let resolved = std::panic::catch_unwind(AssertUnwindSafe(|| {
            registry.get_service_instance(name)
        }));
        let handler = match resolved {
            Ok(Ok(Some(handler))) => handler,
            Ok(Ok(None)) => {
                breaker.release_probe();
                return Err(GatewayError::UnknownTool {
                    name: name.to_string(),
                    available: registry.discover_services(),
                });
            }
            Ok(Err(err)) => {
                breaker.release_probe();
                self.record(name, CallOutcome::Fault, None);
                tracing::error!(tool = %name, error = %err, "dispatch aborted: handler unavailable");
                return Err(GatewayError::Resolution {
                    service: name.to_string(),
                });
            }
            Err(panic) => {
                breaker.release_probe();
                self.record(name, CallOutcome::Fault, None);
                tracing::error!(
                    tool = %name,
                    panic = %panic_message(panic.as_ref()),
                    "dispatch aborted: handler construction panicked"
                );
                return Err(GatewayError::Resolution {
                    service: name.to_string(),
                });
            }
        };

        let strategy = arguments
            .get("strategy")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| registry.get_default_strategy(name));
        let ctx = GatewayContext::new(name, cancel.child_token())
            .with_strategy(strategy)
            .with_depth(depth)
            .with_invoker(Arc::new(self.clone()));

        let payload = self
            .execute_guarded(name, handler, arguments, ctx, breaker, &cancel)
            .await?;
        Ok(ToolResult::from_payload(payload))
    }

    /// Runs the handler on its own task under the call timeout. The outcome
    /// is recorded on the breaker inside that task, so it lands even when
    /// the caller stops waiting.
    async fn execute_guarded(
        &self,
        service: &str,
        handler: Arc<dyn ServiceHandler>,
        arguments: Value,
        ctx: GatewayContext,
        breaker: Arc<CircuitBreaker>,
        cancel: &CancellationToken,
    ) -> Result<Value, GatewayError> {
        let timeout = self.inner.call_timeout;
        let inner = self.inner.clone();
        let name = service.to_string();
        let mut task = tokio::spawn(async move {
            let started = Instant::now();
            let call = AssertUnwindSafe(handler.execute(arguments, ctx)).catch_unwind();
            let outcome = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
                Err(_) => Err(HandlerError::Timeout(
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                )),
            };
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            let recorded = match &outcome {
                Ok(payload) => {
                    breaker.record_success();
                    if payload.get("status").and_then(Value::as_str) == Some("success") {
                        CallOutcome::Ok
                    } else {
                        CallOutcome::ToolError
                    }
                }
                Err(err) if err.counts_as_failure() => {
                    breaker.record_failure();
                    tracing::warn!(tool = %name, error = %err, "handler fault");
                    CallOutcome::Fault
                }
                Err(_) => {
                    breaker.release_probe();
                    CallOutcome::Cancelled
                }
            };
            inner.metrics.record(&name, recorded, Some(latency_ms));
            outcome
        });

        let joined = tokio::select! {
            biased;
            joined = &mut task => joined,
            () = cancel.cancelled() => {
                tracing::debug!(tool = %service, "caller cancelled; handler left to finish");
                return Err(GatewayError::Cancelled { service: service.to_string() });
            }
        };
        match joined {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(HandlerError::Cancelled)) => Err(GatewayError::Cancelled {
                service: service.to_string(),
            }),
            Ok(Err(err)) => Err(GatewayError::Execution {
                service: service.to_string(),
                message: self.inner.redactor.redact(&err.to_string()),
            }),
            Err(join_err) => Err(GatewayError::Execution {
                service: service.to_string(),
                message: self.inner.redactor.redact(&join_err.to_string()),
            }),
        }
    }

    fn record(&self, tool: &str, outcome: CallOutcome, latency_ms: Option<f64>) {
        self.inner.metrics.record(tool, outcome, latency_ms);
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let registry = &self.inner.registry;
        registry
            .discover_services()
            .iter()
            .filter_map(|name| registry.get_service_config(name))
            .map(|config| ToolDescriptor::from(config.as_ref()))
            .collect()
    }

    /// Probes every service concurrently. A probe that errors, panics or
    /// stalls only marks its own entry unhealthy.
    pub async fn get_service_health(&self) -> IndexMap<String, ServiceHealth> {
        let names = self.inner.registry.discover_services();
        let probes = names.into_iter().map(|name| async move {
            let health = self.probe_service(&name).await;
            (name, health)
        });
        join_all(probes).await.into_iter().collect()
    }

    async fn probe_service(&self, name: &str) -> ServiceHealth {
        let registry = &self.inner.registry;
        let version = registry
            .get_service_config(name)
            .map(|c| c.version.clone())
            .unwrap_or_default();
        let circuit_breaker_state = self
            .breaker(name)
            .map_or(CircuitState::Closed, |b| b.state());
        let probe = AssertUnwindSafe(registry.get_service_health_status(name)).catch_unwind();
        let (healthy, error) = match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, probe).await {
            Ok(Ok(Ok(healthy))) => (healthy, None),
            Ok(Ok(Err(err))) => (false, Some(self.inner.redactor.redact(&err.to_string()))),
            Ok(Err(panic)) => (
                false,
                Some(format!("health probe panicked: {}", panic_message(panic.as_ref()))),
            ),
            Err(_) => (
                false,
                Some(format!(
                    "health probe timed out after {}s",
                    HEALTH_PROBE_TIMEOUT.as_secs()
                )),
            ),
        };
        if let Some(error) = &error {
            tracing::warn!(service = %name, %error, "health probe failed");
        }
        ServiceHealth {
            healthy,
            circuit_breaker_state,
            version,
            error,
        }
    }

    /// Names in `category`; an unrecognised label yields an empty list.
    pub fn discover_by_category(&self, category: &str) -> Vec<String> {
        ServiceCategory::parse(category).map_or_else(Vec::new, |category| {
            self.inner
                .registry
                .get_services_by_category(category)
                .iter()
                .map(|c| c.name.clone())
                .collect()
        })
    }

    /// Persists `config` and makes it callable. An existing breaker keeps
    /// its state and count and only picks up the new thresholds.
    pub async fn register_service(&self, config: ServiceConfig) -> Result<(), RegistryError> {
        let registry = self.inner.registry.clone();
        let candidate = config.clone();
        tokio::task::spawn_blocking(move || registry.register_service(candidate))
            .await
            .map_err(|e| RegistryError::Task(e.to_string()))??;

        let settings = config.breaker_settings(&self.inner.registry.global_config());
        let clock = self.inner.clock.clone();
        self.inner
            .breakers
            .write()
            .entry(config.name.clone())
            .and_modify(|breaker| breaker.update_settings(settings))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config.name.clone(), settings, clock)));
        Ok(())
    }

    pub fn service_metrics(&self, name: &str) -> Option<ToolMetric> {
        self.inner.metrics.get(name)
    }

    pub fn render_metrics_text(&self) -> String {
        let mut breakers: Vec<(String, BreakerSnapshot)> = self
            .inner
            .breakers
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.snapshot()))
            .collect();
        breakers.sort_by(|a, b| a.0.cmp(&b.0));
        self.inner.metrics.render(&breakers)
    }
}

#[async_trait]
impl ToolInvoker for ToolGateway {
    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        parent: &GatewayContext,
    ) -> Result<Value, HandlerError> {
        let cancel = parent.cancellation().clone();
        match self.dispatch(name, arguments, cancel, parent.depth() + 1).await {
            Ok(result) => Ok(result.structured_content.unwrap_or(Value::Null)),
            Err(GatewayError::Cancelled { .. }) => Err(HandlerError::Cancelled),
            Err(err) => Err(HandlerError::Dependency {
                service: name.to_string(),
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
