pub mod config;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod protocol;
pub mod redact;
pub mod registry;
pub mod server;

pub use config::{ServerSettings, Transport};
pub use gateway::{GatewayError, GatewayOptions, ServiceHealth, ToolDescriptor, ToolGateway};
pub use handlers::{builtin_catalog, catalog_with_backend};
pub use metrics::{CallOutcome, ToolMetric};
pub use protocol::{ContentBlock, ErrorResult, JsonRpcRequest, JsonRpcResponse, ToolResult};
pub use redact::Redactor;
pub use registry::{RegistryError, ServiceRegistry};
pub use server::McpServer;
