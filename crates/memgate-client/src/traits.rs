use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClientError;
use crate::types::{AddMemoryRequest, ListRequest, MemoryScope, SearchRequest, UpdateMemoryRequest};

/// The external memory-storage service. Responses are passed through as the
/// API returns them.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn add(&self, request: AddMemoryRequest) -> Result<Value, ClientError>;

    async fn search(&self, request: SearchRequest) -> Result<Value, ClientError>;

    async fn list(&self, request: ListRequest) -> Result<Value, ClientError>;

    async fn get(&self, memory_id: &str) -> Result<Value, ClientError>;

    async fn update(
        &self,
        memory_id: &str,
        request: UpdateMemoryRequest,
    ) -> Result<Value, ClientError>;

    async fn delete(&self, memory_id: &str) -> Result<Value, ClientError>;

    async fn delete_all(&self, scope: MemoryScope) -> Result<Value, ClientError>;

    async fn history(&self, memory_id: &str) -> Result<Value, ClientError>;

    /// `GET` on an introspection path such as `/health`; true on any 2xx.
    async fn probe(&self, path: &str) -> Result<bool, ClientError>;
}
