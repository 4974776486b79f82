use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("registry document is malformed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("service {name:?} is invalid: {reason}")]
    InvalidService { name: String, reason: String },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
}

/// Faults raised by a service handler, or by the gateway on its behalf.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler factory registered for locator {0:?}")]
    UnknownLocator(String),

    #[error("handler construction failed: {0}")]
    Construction(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("downstream call failed: {0}")]
    Downstream(String),

    #[error("handler timed out after {0} ms")]
    Timeout(u64),

    #[error("call cancelled")]
    Cancelled,

    #[error("{service} failed with code {code}: {message}")]
    Dependency {
        service: String,
        code: i64,
        message: String,
    },

    #[error("{0}")]
    Tool(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Whether this outcome should count against the service's breaker.
    pub const fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}
