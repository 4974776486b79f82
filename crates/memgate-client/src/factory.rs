use std::sync::Arc;

use crate::config::MemoryApiConfig;
use crate::error::ClientError;
use crate::providers::HttpMemoryClient;
use crate::traits::MemoryBackend;

pub fn build_memory_backend(cfg: MemoryApiConfig) -> Result<Arc<dyn MemoryBackend>, ClientError> {
    Ok(Arc::new(HttpMemoryClient::new(cfg)?))
}
