use std::sync::Arc;

use async_trait::async_trait;
use memgate_client::{
    AddMemoryRequest, ClientError, ListRequest, MemoryBackend, MemoryScope, Message,
    SearchRequest, UpdateMemoryRequest,
};
use memgate_core::{GatewayContext, HandlerError, ServiceHandler};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

/// Memory API operation a [`MemoryHandler`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    Add,
    Search,
    List,
    Get,
    Update,
    Delete,
    DeleteAll,
    History,
}

impl MemoryOp {
    pub const ALL: [Self; 8] = [
        Self::Add,
        Self::Search,
        Self::List,
        Self::Get,
        Self::Update,
        Self::Delete,
        Self::DeleteAll,
        Self::History,
    ];

    /// Handler locator used in the registry document.
    pub const fn locator(self) -> &'static str {
        match self {
            Self::Add => "memory.add",
            Self::Search => "memory.search",
            Self::List => "memory.list",
            Self::Get => "memory.get",
            Self::Update => "memory.update",
            Self::Delete => "memory.delete",
            Self::DeleteAll => "memory.delete_all",
            Self::History => "memory.history",
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddInput {
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    text: Option<String>,
    #[serde(flatten)]
    scope: MemoryScope,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    infer: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SearchInput {
    query: String,
    #[serde(flatten)]
    scope: MemoryScope,
    #[serde(default)]
    filters: Option<Value>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    threshold: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ListInput {
    #[serde(flatten)]
    scope: MemoryScope,
    #[serde(default)]
    filters: Option<Value>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MemoryIdInput {
    memory_id: String,
}

#[derive(Debug, Deserialize)]
struct UpdateInput {
    memory_id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Translates tool arguments into one memory API call.
pub struct MemoryHandler {
    op: MemoryOp,
    backend: Arc<dyn MemoryBackend>,
    health_path: String,
}

impl MemoryHandler {
    pub fn new(op: MemoryOp, backend: Arc<dyn MemoryBackend>, health_path: impl Into<String>) -> Self {
        Self {
            op,
            backend,
            health_path: health_path.into(),
        }
    }

    pub const fn op(&self) -> MemoryOp {
        self.op
    }

    async fn run(&self, arguments: Value, strategy: Option<&str>) -> Result<Value, ClientError> {
        let backend = self.backend.as_ref();
        match self.op {
            MemoryOp::Add => {
                let input: AddInput = parse_args(arguments)?;
                let mut messages = input.messages;
                if let Some(text) = input.text.filter(|t| !t.trim().is_empty()) {
                    messages.push(Message::user(text));
                }
                let result = backend
                    .add(AddMemoryRequest {
                        messages,
                        scope: input.scope,
                        metadata: input.metadata,
                        infer: input.infer,
                    })
                    .await?;
                Ok(success(json!({ "result": result })))
            }
            MemoryOp::Search => {
                let input: SearchInput = parse_args(arguments)?;
                let strategy = strategy.unwrap_or("semantic");
                let mut request = SearchRequest {
                    query: input.query,
                    scope: input.scope,
                    filters: input.filters,
                    top_k: input.limit,
                    threshold: input.threshold,
                    ..SearchRequest::default()
                };
                match strategy {
                    "semantic" => {}
                    "keyword" => request.keyword_search = Some(true),
                    "reranked" => request.rerank = Some(true),
                    other => {
                        return Err(ClientError::InvalidRequest(format!(
                            "unknown search strategy {other:?}"
                        )))
                    }
                }
                let results = backend.search(request).await?;
                Ok(success(json!({
                    "strategy": strategy,
                    "results": memory_items(&results),
                })))
            }
            MemoryOp::List => {
                let input: ListInput = parse_args(arguments)?;
                let memories = backend
                    .list(ListRequest {
                        scope: input.scope,
                        filters: input.filters,
                        page: input.page,
                        page_size: input.page_size,
                    })
                    .await?;
                Ok(success(json!({ "results": memory_items(&memories) })))
            }
            MemoryOp::Get => {
                let input: MemoryIdInput = parse_args(arguments)?;
                let memory = backend.get(&input.memory_id).await?;
                Ok(success(json!({ "memory": memory })))
            }
            MemoryOp::Update => {
                let input: UpdateInput = parse_args(arguments)?;
                let result = backend
                    .update(
                        &input.memory_id,
                        UpdateMemoryRequest {
                            text: input.text,
                            metadata: input.metadata,
                        },
                    )
                    .await?;
                Ok(success(json!({ "result": result })))
            }
            MemoryOp::Delete => {
                let input: MemoryIdInput = parse_args(arguments)?;
                let result = backend.delete(&input.memory_id).await?;
                Ok(success(json!({ "memory_id": input.memory_id, "result": result })))
            }
            MemoryOp::DeleteAll => {
                let scope: MemoryScope = parse_args(arguments)?;
                let result = backend.delete_all(scope).await?;
                Ok(success(json!({ "result": result })))
            }
            MemoryOp::History => {
                let input: MemoryIdInput = parse_args(arguments)?;
                let history = backend.history(&input.memory_id).await?;
                Ok(success(json!({ "memory_id": input.memory_id, "history": history })))
            }
        }
    }
}

#[async_trait]
impl ServiceHandler for MemoryHandler {
    async fn execute(&self, arguments: Value, ctx: GatewayContext) -> Result<Value, HandlerError> {
        let outcome = tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => return Err(HandlerError::Cancelled),
            outcome = self.run(arguments, ctx.strategy()) => outcome,
        };
        match outcome {
            Ok(payload) => Ok(payload),
            Err(err) if err.is_client_fault() => Ok(failure(err.to_string())),
            Err(err) => Err(HandlerError::Downstream(err.to_string())),
        }
    }

    async fn health(&self) -> Result<bool, HandlerError> {
        self.backend
            .probe(&self.health_path)
            .await
            .map_err(|e| HandlerError::Downstream(e.to_string()))
    }
}

pub(crate) fn success(fields: Value) -> Value {
    let mut payload = serde_json::Map::new();
    payload.insert("status".to_string(), json!("success"));
    if let Value::Object(extra) = fields {
        payload.extend(extra);
    }
    Value::Object(payload)
}

pub(crate) fn failure(message: impl Into<String>) -> Value {
    json!({ "status": "error", "message": message.into() })
}

/// The memory API answers list calls with either a bare array or
/// `{"results": [...]}`.
pub(crate) fn memory_items(response: &Value) -> Vec<Value> {
    match response {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, ClientError> {
    serde_json::from_value(arguments)
        .map_err(|e| ClientError::InvalidRequest(format!("invalid arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locators_are_unique() {
        let mut seen: Vec<&str> = MemoryOp::ALL.iter().map(|op| op.locator()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), MemoryOp::ALL.len());
    }

    #[test]
    fn memory_items_accepts_both_shapes() {
        assert_eq!(memory_items(&json!([{"id": "a"}])).len(), 1);
        assert_eq!(memory_items(&json!({"results": [{"id": "a"}, {"id": "b"}]})).len(), 2);
        assert!(memory_items(&json!({"detail": "x"})).is_empty());
    }

    #[test]
    fn success_merges_fields_after_status() {
        let v = success(json!({"results": []}));
        assert_eq!(v, json!({"status": "success", "results": []}));
    }
}
