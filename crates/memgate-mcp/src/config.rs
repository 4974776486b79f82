use std::path::PathBuf;

pub const DEFAULT_REGISTRY_PATH: &str = "./registry/services.json";
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8788";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Http,
}

impl Transport {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stdio" => Some(Self::Stdio),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

/// Process-level settings for `memgated`, read from `MEMGATE_*` variables.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub registry_path: PathBuf,
    pub transport: Transport,
    pub http_addr: String,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let transport = match non_empty("MEMGATE_TRANSPORT") {
            Some(raw) => Transport::parse(&raw)
                .ok_or_else(|| format!("MEMGATE_TRANSPORT must be stdio or http, got {raw:?}"))?,
            None => Transport::Stdio,
        };
        Ok(Self {
            registry_path: non_empty("MEMGATE_REGISTRY")
                .map_or_else(|| PathBuf::from(DEFAULT_REGISTRY_PATH), PathBuf::from),
            transport,
            http_addr: non_empty("MEMGATE_HTTP_ADDR")
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
        })
    }
}
