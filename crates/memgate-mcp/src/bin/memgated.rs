use std::process::ExitCode;
use std::sync::Arc;

use memgate_client::MemoryApiConfig;
use memgate_mcp::{
    builtin_catalog, GatewayOptions, McpServer, Redactor, ServerSettings, ServiceRegistry,
    ToolGateway, Transport,
};
use memgate_storage::JsonFileCatalogStore;

fn init_tracing() {
    // stdout carries the stdio transport, so logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let settings = match ServerSettings::from_env() {
        Ok(v) => v,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let api = MemoryApiConfig::from_env();
    let store = Arc::new(JsonFileCatalogStore::new(&settings.registry_path));
    let registry = match ServiceRegistry::load(store, builtin_catalog(&api)) {
        Ok(v) => Arc::new(v),
        Err(err) => {
            tracing::error!(
                path = %settings.registry_path.display(),
                error = %err,
                "cannot load service registry"
            );
            return ExitCode::FAILURE;
        }
    };

    let options = GatewayOptions::default().with_redactor(Redactor::new(api.api_key.clone()));
    let server = Arc::new(McpServer::new(ToolGateway::with_options(registry, options)));

    let served = match settings.transport {
        Transport::Stdio => server.serve_stdio().await,
        Transport::Http => server.serve_http(&settings.http_addr).await,
    };
    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "transport failed");
            ExitCode::FAILURE
        }
    }
}
