use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::HandlerError;

/// Deepest chain of nested tool calls a handler may start through its context.
pub const MAX_CALL_DEPTH: u32 = 8;

/// The object that does a service's work.
///
/// `execute` returns a payload whose `status` field reports the outcome:
/// `"success"` or anything else for a handled failure. Raising an error
/// instead counts against the service's circuit breaker.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn execute(&self, arguments: Value, ctx: GatewayContext) -> Result<Value, HandlerError>;

    /// Liveness probe. Handlers without a backing endpoint are always live.
    async fn health(&self) -> Result<bool, HandlerError> {
        Ok(true)
    }
}

/// Re-entry point used by handlers that compose other services.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        parent: &GatewayContext,
    ) -> Result<Value, HandlerError>;
}

#[derive(Clone)]
pub struct GatewayContext {
    service: String,
    strategy: Option<String>,
    depth: u32,
    cancel: CancellationToken,
    invoker: Option<Arc<dyn ToolInvoker>>,
}

impl fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayContext")
            .field("service", &self.service)
            .field("strategy", &self.strategy)
            .field("depth", &self.depth)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl GatewayContext {
    pub fn new(service: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            service: service.into(),
            strategy: None,
            depth: 0,
            cancel,
            invoker: None,
        }
    }

    /// Context with no way back into a gateway; nested `invoke` calls fail.
    pub fn detached(service: impl Into<String>) -> Self {
        Self::new(service, CancellationToken::new())
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Option<String>) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    #[must_use]
    pub const fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn strategy(&self) -> Option<&str> {
        self.strategy.as_deref()
    }

    pub const fn depth(&self) -> u32 {
        self.depth
    }

    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Calls another registered service through the gateway that is running
    /// this handler, so the callee gets its own validation and breaker.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, HandlerError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(HandlerError::Tool(format!(
                "nested call depth {} exceeded while calling {name}",
                MAX_CALL_DEPTH
            )));
        }
        let Some(invoker) = self.invoker.as_ref() else {
            return Err(HandlerError::Tool(format!(
                "{} has no gateway to call {name} through",
                self.service
            )));
        };
        invoker.invoke(name, arguments, self).await
    }
}

pub type HandlerFactory =
    Arc<dyn Fn(&ServiceConfig) -> Result<Arc<dyn ServiceHandler>, HandlerError> + Send + Sync>;

/// Locator key to constructor map, filled at startup.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    factories: HashMap<String, HandlerFactory>,
}

impl fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("HandlerCatalog").field("keys", &keys).finish()
    }
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, locator: impl Into<String>, factory: F)
    where
        F: Fn(&ServiceConfig) -> Result<Arc<dyn ServiceHandler>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(locator.into(), Arc::new(factory));
    }

    #[must_use]
    pub fn with<F>(mut self, locator: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ServiceConfig) -> Result<Arc<dyn ServiceHandler>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register(locator, factory);
        self
    }

    /// Registers a factory that hands out clones of one shared handler.
    #[must_use]
    pub fn with_instance(self, locator: impl Into<String>, handler: Arc<dyn ServiceHandler>) -> Self {
        self.with(locator, move |_| Ok(handler.clone()))
    }

    pub fn merge(&mut self, other: Self) {
        self.factories.extend(other.factories);
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.factories.contains_key(locator)
    }

    pub fn build(&self, config: &ServiceConfig) -> Result<Arc<dyn ServiceHandler>, HandlerError> {
        let factory = self
            .factories
            .get(&config.handler)
            .ok_or_else(|| HandlerError::UnknownLocator(config.handler.clone()))?;
        factory(config)
    }
}
