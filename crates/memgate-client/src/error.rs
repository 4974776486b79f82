use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("memory api returned invalid response: {0}")]
    InvalidResponse(String),

    #[error("memory api error: status={status}, body={body}")]
    Api { status: u16, body: String },
}

impl ClientError {
    /// 4xx responses and rejected input are the caller's problem, not an
    /// outage of the memory API.
    pub const fn is_client_fault(&self) -> bool {
        match self {
            Self::InvalidRequest(_) => true,
            Self::Api { status, .. } => *status >= 400 && *status < 500 && *status != 429,
            _ => false,
        }
    }
}
