//! Built-in handlers for the memory API tools.

pub mod context;
pub mod memory;

use std::sync::Arc;

use memgate_client::{build_memory_backend, MemoryApiConfig, MemoryBackend};
use memgate_core::{HandlerCatalog, HandlerError, ServiceConfig, ServiceHandler};

pub use context::MemoryContextHandler;
pub use memory::{MemoryHandler, MemoryOp};

pub const MEMORY_CONTEXT_LOCATOR: &str = "memory.context";

/// Catalog of every built-in locator. Each service gets its own client,
/// pointed at the service's `instances` when it lists any.
pub fn builtin_catalog(api: &MemoryApiConfig) -> HandlerCatalog {
    let mut catalog = HandlerCatalog::new();
    for op in MemoryOp::ALL {
        let api = api.clone();
        catalog.register(op.locator(), move |config: &ServiceConfig| {
            let backend = build_memory_backend(api.with_replicas(&config.instances))
                .map_err(|e| HandlerError::Construction(e.to_string()))?;
            Ok(Arc::new(MemoryHandler::new(op, backend, config.health_check.clone()))
                as Arc<dyn ServiceHandler>)
        });
    }
    register_context(&mut catalog);
    catalog
}

/// Same locators, all sharing one backend.
pub fn catalog_with_backend(backend: Arc<dyn MemoryBackend>) -> HandlerCatalog {
    let mut catalog = HandlerCatalog::new();
    for op in MemoryOp::ALL {
        let backend = backend.clone();
        catalog.register(op.locator(), move |config: &ServiceConfig| {
            Ok(Arc::new(MemoryHandler::new(
                op,
                backend.clone(),
                config.health_check.clone(),
            )) as Arc<dyn ServiceHandler>)
        });
    }
    register_context(&mut catalog);
    catalog
}

fn register_context(catalog: &mut HandlerCatalog) {
    catalog.register(MEMORY_CONTEXT_LOCATOR, |_: &ServiceConfig| {
        Ok(Arc::new(MemoryContextHandler) as Arc<dyn ServiceHandler>)
    });
}

#[cfg(test)]
mod tests {
    use memgate_core::ServiceCategory;

    use super::*;

    #[test]
    fn builtin_catalog_covers_every_locator() {
        let catalog = builtin_catalog(&MemoryApiConfig::new("http://127.0.0.1:9"));
        for op in MemoryOp::ALL {
            assert!(catalog.contains(op.locator()), "{}", op.locator());
        }
        assert!(catalog.contains(MEMORY_CONTEXT_LOCATOR));
    }

    #[test]
    fn instances_override_base_url() {
        let catalog = builtin_catalog(&MemoryApiConfig::new("http://127.0.0.1:9"));
        let mut cfg = ServiceConfig::new("get_memory", ServiceCategory::MemoryOperation, "memory.get");
        cfg.instances = vec!["http://10.0.0.1:8000".to_string()];
        assert!(catalog.build(&cfg).is_ok());
    }
}
