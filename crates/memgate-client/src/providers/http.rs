use memgate_core::RoundRobin;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Value};

use crate::config::MemoryApiConfig;
use crate::error::ClientError;
use crate::traits::MemoryBackend;
use crate::types::{AddMemoryRequest, ListRequest, MemoryScope, SearchRequest, UpdateMemoryRequest};

pub struct HttpMemoryClient {
    config: MemoryApiConfig,
    client: Client,
    replicas: RoundRobin<String>,
}

impl HttpMemoryClient {
    pub fn new(config: MemoryApiConfig) -> Result<Self, ClientError> {
        let urls: Vec<String> = config
            .base_urls
            .iter()
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if urls.is_empty() {
            return Err(ClientError::Config(
                "memory api needs at least one base url".to_string(),
            ));
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            config,
            client,
            replicas: RoundRobin::new(urls),
        })
    }

    pub fn replicas(&self) -> &[String] {
        self.replicas.instances()
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        let base = self
            .replicas
            .pick()
            .ok_or_else(|| ClientError::Config("no memory api replica".to_string()))?;
        let url = format!("{base}{path}");
        tracing::debug!(%method, %url, "memory api request");
        let mut builder = self.client.request(method, url);
        if let Some(key) = self.config.api_key.as_deref() {
            builder = builder.header("Authorization", format!("Token {key}"));
        }
        let mut query = Vec::new();
        if let Some(org) = self.config.org_id.as_deref() {
            query.push(("org_id", org));
        }
        if let Some(project) = self.config.project_id.as_deref() {
            query.push(("project_id", project));
        }
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        Ok(builder)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value, ClientError> {
        let res = builder.send().await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            return Err(ClientError::Api {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&body).map_err(|e| {
            ClientError::InvalidResponse(format!("expected json body ({e})"))
        })
    }
}

fn memory_path(memory_id: &str, suffix: &str) -> Result<String, ClientError> {
    let id = memory_id.trim();
    if id.is_empty() {
        return Err(ClientError::InvalidRequest(
            "memory_id cannot be empty".to_string(),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(ClientError::InvalidRequest(format!(
            "memory_id {id:?} has unsupported characters"
        )));
    }
    Ok(format!("/v1/memories/{id}/{suffix}"))
}

#[async_trait::async_trait]
impl MemoryBackend for HttpMemoryClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn add(&self, request: AddMemoryRequest) -> Result<Value, ClientError> {
        if request.messages.is_empty() {
            return Err(ClientError::InvalidRequest(
                "at least one message is required".to_string(),
            ));
        }
        if request.scope.is_empty() {
            return Err(ClientError::InvalidRequest(
                "one of user_id, agent_id or run_id is required".to_string(),
            ));
        }
        let builder = self.request(Method::POST, "/v1/memories/")?.json(&request);
        self.send(builder).await
    }

    async fn search(&self, request: SearchRequest) -> Result<Value, ClientError> {
        if request.query.trim().is_empty() {
            return Err(ClientError::InvalidRequest(
                "query cannot be empty".to_string(),
            ));
        }
        let builder = self
            .request(Method::POST, "/v2/memories/search/")?
            .json(&request);
        self.send(builder).await
    }

    async fn list(&self, request: ListRequest) -> Result<Value, ClientError> {
        let builder = self.request(Method::POST, "/v2/memories/")?.json(&request);
        self.send(builder).await
    }

    async fn get(&self, memory_id: &str) -> Result<Value, ClientError> {
        let path = memory_path(memory_id, "")?;
        self.send(self.request(Method::GET, &path)?).await
    }

    async fn update(
        &self,
        memory_id: &str,
        request: UpdateMemoryRequest,
    ) -> Result<Value, ClientError> {
        if request.text.is_none() && request.metadata.is_none() {
            return Err(ClientError::InvalidRequest(
                "nothing to update: pass text or metadata".to_string(),
            ));
        }
        let path = memory_path(memory_id, "")?;
        let builder = self.request(Method::PUT, &path)?.json(&request);
        self.send(builder).await
    }

    async fn delete(&self, memory_id: &str) -> Result<Value, ClientError> {
        let path = memory_path(memory_id, "")?;
        self.send(self.request(Method::DELETE, &path)?).await
    }

    async fn delete_all(&self, scope: MemoryScope) -> Result<Value, ClientError> {
        if scope.is_empty() {
            return Err(ClientError::InvalidRequest(
                "refusing to delete without user_id, agent_id or run_id".to_string(),
            ));
        }
        let builder = self
            .request(Method::DELETE, "/v1/memories/")?
            .query(&scope.query_pairs());
        self.send(builder).await
    }

    async fn history(&self, memory_id: &str) -> Result<Value, ClientError> {
        let path = memory_path(memory_id, "history/")?;
        self.send(self.request(Method::GET, &path)?).await
    }

    async fn probe(&self, path: &str) -> Result<bool, ClientError> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let res = self.request(Method::GET, &path)?.send().await?;
        Ok(res.status().is_success())
    }
}
