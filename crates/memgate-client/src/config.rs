use std::time::Duration;

pub const DEFAULT_MEMORY_API_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone)]
pub struct MemoryApiConfig {
    /// One entry per replica; requests rotate across them.
    pub base_urls: Vec<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
}

impl MemoryApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_urls: vec![base_url.into()],
            api_key: None,
            timeout: Duration::from_secs(15),
            org_id: None,
            project_id: None,
        }
    }

    pub fn from_env() -> Self {
        let base_urls = std::env::var("MEMGATE_MEMORY_API_URL")
            .ok()
            .map(|raw| split_urls(&raw))
            .filter(|urls| !urls.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_MEMORY_API_URL.to_string()]);
        let timeout_ms = std::env::var("MEMGATE_MEMORY_API_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(15_000)
            .clamp(100, 300_000);
        Self {
            base_urls,
            api_key: non_empty_env("MEMGATE_MEMORY_API_KEY"),
            timeout: Duration::from_millis(timeout_ms),
            org_id: non_empty_env("MEMGATE_MEMORY_ORG_ID"),
            project_id: non_empty_env("MEMGATE_MEMORY_PROJECT_ID"),
        }
    }

    /// Same credentials, different replica set. An empty list keeps the
    /// current replicas.
    #[must_use]
    pub fn with_replicas(&self, urls: &[String]) -> Self {
        let mut next = self.clone();
        let urls: Vec<String> = urls
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if !urls.is_empty() {
            next.base_urls = urls;
        }
        next
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty())
        .collect()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
