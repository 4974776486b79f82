use std::collections::HashSet;

use async_trait::async_trait;
use memgate_client::MemoryScope;
use memgate_core::{GatewayContext, HandlerError, ServiceHandler};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::memory::{failure, memory_items, success};

pub const SEARCH_SERVICE: &str = "search_memories";
pub const LIST_SERVICE: &str = "get_memories";

const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
struct ContextInput {
    query: String,
    #[serde(flatten)]
    scope: MemoryScope,
    #[serde(default)]
    limit: Option<usize>,
}

/// Builds a context window for an agent from two other services: a
/// relevance search and the most recent memories for the same scope.
///
/// Both calls go back through the gateway, so each has its own schema check
/// and breaker. The strategy decides which list leads the merged output.
#[derive(Debug, Default)]
pub struct MemoryContextHandler;

impl MemoryContextHandler {
    async fn fetch(
        ctx: &GatewayContext,
        service: &str,
        arguments: Value,
    ) -> Result<Result<Vec<Value>, String>, HandlerError> {
        let payload = ctx.invoke(service, arguments).await?;
        if payload.get("status").and_then(Value::as_str) != Some("success") {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            return Ok(Err(format!("{service}: {message}")));
        }
        Ok(Ok(payload.get("results").map(memory_items).unwrap_or_default()))
    }
}

#[async_trait]
impl ServiceHandler for MemoryContextHandler {
    async fn execute(&self, arguments: Value, ctx: GatewayContext) -> Result<Value, HandlerError> {
        let input: ContextInput = match serde_json::from_value(arguments) {
            Ok(v) => v,
            Err(e) => return Ok(failure(format!("invalid arguments: {e}"))),
        };
        if input.scope.is_empty() {
            return Ok(failure("one of user_id, agent_id or run_id is required"));
        }
        let limit = input.limit.unwrap_or(DEFAULT_LIMIT).max(1);
        let strategy = ctx.strategy().unwrap_or("search_first").to_string();

        let mut scope = match serde_json::to_value(&input.scope) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let mut search_args = scope.clone();
        search_args.insert("query".to_string(), json!(input.query));
        search_args.insert("limit".to_string(), json!(limit));
        scope.insert("page_size".to_string(), json!(limit));
        let list_args = Value::Object(scope);
        let search_args = Value::Object(search_args);

        let (relevant, recent) = match strategy.as_str() {
            "search_first" => {
                let relevant = Self::fetch(&ctx, SEARCH_SERVICE, search_args).await?;
                let recent = Self::fetch(&ctx, LIST_SERVICE, list_args).await?;
                (relevant, recent)
            }
            "recent_first" => {
                let recent = Self::fetch(&ctx, LIST_SERVICE, list_args).await?;
                let relevant = Self::fetch(&ctx, SEARCH_SERVICE, search_args).await?;
                (relevant, recent)
            }
            other => return Ok(failure(format!("unknown context strategy {other:?}"))),
        };
        let (relevant, recent) = match (relevant, recent) {
            (Ok(relevant), Ok(recent)) => (relevant, recent),
            (Err(message), _) | (_, Err(message)) => return Ok(failure(message)),
        };

        let (lead, rest) = if strategy == "recent_first" {
            (&recent, &relevant)
        } else {
            (&relevant, &recent)
        };
        let memories = merge_unique(lead, rest, limit);
        Ok(success(json!({
            "strategy": strategy,
            "memories": memories,
            "relevant_count": relevant.len(),
            "recent_count": recent.len(),
        })))
    }
}

/// `lead` then `rest`, dropping repeated ids, capped at `limit`.
fn merge_unique(lead: &[Value], rest: &[Value], limit: usize) -> Vec<Value> {
    let mut seen = HashSet::new();
    lead.iter()
        .chain(rest)
        .filter(|item| match item.get("id").and_then(Value::as_str) {
            Some(id) => seen.insert(id.to_string()),
            None => true,
        })
        .take(limit)
        .cloned()
        .collect()
}
