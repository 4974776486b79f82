use std::sync::Arc;

use async_trait::async_trait;
use memgate_client::{
    AddMemoryRequest, ClientError, ListRequest, MemoryBackend, MemoryScope, SearchRequest,
    UpdateMemoryRequest,
};
use memgate_core::RegistryDocument;
use memgate_mcp::{catalog_with_backend, ServiceRegistry, ToolGateway};
use memgate_storage::InMemoryCatalogStore;
use parking_lot::Mutex;
use serde_json::{json, Value};

const SHIPPED_REGISTRY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../registry/services.json");

/// Records every call and answers from canned data.
#[derive(Default)]
struct FakeBackend {
    calls: Mutex<Vec<String>>,
    searches: Mutex<Vec<SearchRequest>>,
    adds: Mutex<Vec<AddMemoryRequest>>,
    lists: Mutex<Vec<ListRequest>>,
    search_status: Mutex<Option<u16>>,
    get_status: Mutex<Option<u16>>,
}

impl FakeBackend {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn api_error(status: Option<u16>) -> Result<(), ClientError> {
        match status {
            Some(status) => Err(ClientError::Api {
                status,
                body: "{\"detail\":\"nope\"}".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MemoryBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn add(&self, request: AddMemoryRequest) -> Result<Value, ClientError> {
        self.calls.lock().push("add".to_string());
        self.adds.lock().push(request);
        Ok(json!([{"id": "m-new", "event": "ADD"}]))
    }

    async fn search(&self, request: SearchRequest) -> Result<Value, ClientError> {
        self.calls.lock().push("search".to_string());
        self.searches.lock().push(request);
        Self::api_error(*self.search_status.lock())?;
        Ok(json!({"results": [
            {"id": "m-1", "memory": "likes tea", "score": 0.9},
            {"id": "m-2", "memory": "lives in Oslo", "score": 0.7}
        ]}))
    }

    async fn list(&self, request: ListRequest) -> Result<Value, ClientError> {
        self.calls.lock().push("list".to_string());
        self.lists.lock().push(request);
        Ok(json!([
            {"id": "m-3", "memory": "booked a flight"},
            {"id": "m-1", "memory": "likes tea"}
        ]))
    }

    async fn get(&self, memory_id: &str) -> Result<Value, ClientError> {
        self.calls.lock().push(format!("get:{memory_id}"));
        Self::api_error(*self.get_status.lock())?;
        Ok(json!({"id": memory_id, "memory": "likes tea"}))
    }

    async fn update(
        &self,
        memory_id: &str,
        request: UpdateMemoryRequest,
    ) -> Result<Value, ClientError> {
        self.calls.lock().push(format!("update:{memory_id}"));
        Ok(json!({"message": "updated", "text": request.text}))
    }

    async fn delete(&self, memory_id: &str) -> Result<Value, ClientError> {
        self.calls.lock().push(format!("delete:{memory_id}"));
        Ok(json!({"message": "deleted"}))
    }

    async fn delete_all(&self, scope: MemoryScope) -> Result<Value, ClientError> {
        self.calls
            .lock()
            .push(format!("delete_all:{}", scope.user_id.unwrap_or_default()));
        Ok(json!({"message": "all deleted"}))
    }

    async fn history(&self, memory_id: &str) -> Result<Value, ClientError> {
        self.calls.lock().push(format!("history:{memory_id}"));
        Ok(json!([{"event": "ADD"}, {"event": "UPDATE"}]))
    }

    async fn probe(&self, _path: &str) -> Result<bool, ClientError> {
        Ok(true)
    }
}

fn gateway(backend: Arc<FakeBackend>) -> ToolGateway {
    let bytes = std::fs::read(SHIPPED_REGISTRY).expect("read shipped registry");
    let doc = RegistryDocument::from_slice(&bytes).expect("shipped registry is valid");
    let store = Arc::new(InMemoryCatalogStore::new(doc));
    let registry = ServiceRegistry::load(store, catalog_with_backend(backend)).expect("load");
    ToolGateway::new(Arc::new(registry))
}

async fn payload(gateway: &ToolGateway, name: &str, arguments: Value) -> Value {
    let result = gateway
        .call_tool(name, arguments)
        .await
        .unwrap_or_else(|err| panic!("{name} failed: {err}"));
    result.structured_content.expect("structured content")
}

#[tokio::test]
async fn add_memory_folds_text_into_messages() {
    let backend = Arc::new(FakeBackend::default());
    let gw = gateway(backend.clone());

    let out = payload(
        &gw,
        "add_memory",
        json!({"text": "I prefer window seats", "user_id": "alice", "infer": false}),
    )
    .await;
    assert_eq!(out["status"], "success");
    assert_eq!(out["result"][0]["id"], "m-new");

    let adds = backend.adds.lock();
    let request = adds.first().expect("one add");
    assert_eq!(request.messages.len(), 1);
    assert_eq!(request.messages[0].content, "I prefer window seats");
    assert_eq!(request.scope.user_id.as_deref(), Some("alice"));
    assert_eq!(request.infer, Some(false));
}

#[tokio::test]
async fn search_strategies_map_to_api_flags() {
    let backend = Arc::new(FakeBackend::default());
    let gw = gateway(backend.clone());

    let semantic = payload(&gw, "search_memories", json!({"query": "tea", "user_id": "alice"})).await;
    assert_eq!(semantic["strategy"], "semantic");
    assert_eq!(semantic["results"].as_array().map(Vec::len), Some(2));

    let keyword = payload(
        &gw,
        "search_memories",
        json!({"query": "tea", "user_id": "alice", "strategy": "keyword", "limit": 3}),
    )
    .await;
    assert_eq!(keyword["strategy"], "keyword");
    payload(
        &gw,
        "search_memories",
        json!({"query": "tea", "user_id": "alice", "strategy": "reranked"}),
    )
    .await;

    let searches = backend.searches.lock();
    assert_eq!(searches.len(), 3);
    assert_eq!(searches[0].keyword_search, None);
    assert_eq!(searches[0].rerank, None);
    assert_eq!(searches[1].keyword_search, Some(true));
    assert_eq!(searches[1].top_k, Some(3));
    assert_eq!(searches[2].rerank, Some(true));
}

#[tokio::test]
async fn unknown_search_strategy_is_rejected_by_schema() {
    let backend = Arc::new(FakeBackend::default());
    let gw = gateway(backend.clone());
    let err = gw
        .call_tool("search_memories", json!({"query": "tea", "strategy": "psychic"}))
        .await
        .expect_err("strategy outside enum");
    assert_eq!(err.code, -32602);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn single_memory_operations_pass_ids_through() {
    let backend = Arc::new(FakeBackend::default());
    let gw = gateway(backend.clone());

    let got = payload(&gw, "get_memory", json!({"memory_id": "m-1"})).await;
    assert_eq!(got["memory"]["id"], "m-1");
    let updated = payload(
        &gw,
        "update_memory",
        json!({"memory_id": "m-1", "text": "likes green tea"}),
    )
    .await;
    assert_eq!(updated["result"]["text"], "likes green tea");
    let deleted = payload(&gw, "delete_memory", json!({"memory_id": "m-1"})).await;
    assert_eq!(deleted["memory_id"], "m-1");
    let history = payload(&gw, "memory_history", json!({"memory_id": "m-1"})).await;
    assert_eq!(history["history"].as_array().map(Vec::len), Some(2));
    let wiped = payload(&gw, "delete_all_memories", json!({"user_id": "alice"})).await;
    assert_eq!(wiped["status"], "success");

    assert_eq!(
        backend.calls(),
        [
            "get:m-1",
            "update:m-1",
            "delete:m-1",
            "history:m-1",
            "delete_all:alice"
        ]
    );
}

#[tokio::test]
async fn bulk_delete_without_scope_never_reaches_the_api() {
    let backend = Arc::new(FakeBackend::default());
    let gw = gateway(backend.clone());
    let err = gw
        .call_tool("delete_all_memories", json!({}))
        .await
        .expect_err("scope required");
    assert_eq!(err.code, -32602);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn api_client_errors_are_tool_errors_and_outages_are_faults() {
    let backend = Arc::new(FakeBackend::default());
    let gw = gateway(backend.clone());

    *backend.get_status.lock() = Some(404);
    let result = gw
        .call_tool("get_memory", json!({"memory_id": "gone"}))
        .await
        .expect("404 is a handled result");
    assert!(result.is_error);
    assert_eq!(gw.breaker("get_memory").expect("breaker").failure_count(), 0);

    *backend.get_status.lock() = Some(502);
    let err = gw
        .call_tool("get_memory", json!({"memory_id": "m-1"}))
        .await
        .expect_err("502 is a fault");
    assert_eq!(err.code, -32603);
    assert_eq!(gw.breaker("get_memory").expect("breaker").failure_count(), 1);
}

#[tokio::test]
async fn context_search_first_merges_and_dedups() {
    let backend = Arc::new(FakeBackend::default());
    let gw = gateway(backend.clone());

    let out = payload(
        &gw,
        "memory_context",
        json!({"query": "travel", "user_id": "alice", "limit": 3}),
    )
    .await;
    assert_eq!(out["status"], "success");
    assert_eq!(out["strategy"], "search_first");
    let ids: Vec<&str> = out["memories"]
        .as_array()
        .expect("memories")
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, ["m-1", "m-2", "m-3"]);
    assert_eq!(out["relevant_count"], 2);
    assert_eq!(out["recent_count"], 2);
    assert_eq!(backend.calls(), ["search", "list"]);
    assert_eq!(backend.lists.lock()[0].page_size, Some(3));

    // Both dependencies went through the gateway and were counted there.
    assert_eq!(gw.service_metrics("search_memories").expect("metrics").ok, 1);
    assert_eq!(gw.service_metrics("get_memories").expect("metrics").ok, 1);
}

#[tokio::test]
async fn context_recent_first_leads_with_recent() {
    let backend = Arc::new(FakeBackend::default());
    let gw = gateway(backend.clone());

    let out = payload(
        &gw,
        "memory_context",
        json!({"query": "travel", "user_id": "alice", "strategy": "recent_first"}),
    )
    .await;
    let ids: Vec<&str> = out["memories"]
        .as_array()
        .expect("memories")
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, ["m-3", "m-1", "m-2"]);
    assert_eq!(backend.calls(), ["list", "search"]);
}

#[tokio::test]
async fn context_reports_failed_dependency_as_tool_error() {
    let backend = Arc::new(FakeBackend::default());
    let gw = gateway(backend.clone());
    *backend.search_status.lock() = Some(400);

    let result = gw
        .call_tool("memory_context", json!({"query": "travel", "user_id": "alice"}))
        .await
        .expect("handled");
    assert!(result.is_error);
    let out = result.structured_content.expect("payload");
    assert!(out["message"]
        .as_str()
        .is_some_and(|m| m.starts_with("search_memories")));
    assert_eq!(gw.breaker("memory_context").expect("breaker").failure_count(), 0);
}

#[tokio::test]
async fn every_shipped_service_reports_healthy() {
    let gw = gateway(Arc::new(FakeBackend::default()));
    let report = gw.get_service_health().await;
    assert_eq!(report.len(), 9);
    assert!(report.values().all(|h| h.healthy), "{report:?}");
}
