use datapilot::llm::anthropic::AnthropicProvider;
use datapilot::server::{create_router, AppState};
use datapilot::{profile, PlatformIsolation, PythonExecutor, ToolInvocationLoop};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct ServerConfig {
    addr: String,
    tier: String,
    model: Option<String>,
}

impl ServerConfig {
    fn from_env_and_args() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let mut addr = std::env::var("DATAPILOT_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let mut tier =
            std::env::var("DATAPILOT_PROFILE").unwrap_or_else(|_| "STANDARD".to_string());
        let mut model = std::env::var("DATAPILOT_MODEL").ok();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--addr" => {
                    if let Some(v) = args.get(i + 1) {
                        addr = v.clone();
                    }
                    i += 2;
                }
                "--profile" => {
                    if let Some(v) = args.get(i + 1) {
                        tier = v.clone();
                    }
                    i += 2;
                }
                "--model" => {
                    if let Some(v) = args.get(i + 1) {
                        model = Some(v.clone());
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }

        Self { addr, tier, model }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "datapilot=info".to_string()),
        )
        .with_target(false)
        .init();

    let cfg = ServerConfig::from_env_and_args();

    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("ANTHROPIC_API_KEY is not set; upstream model calls will fail");
    }

    let security_profile = profile::resolve(&cfg.tier)?;
    let provider = match cfg.model.clone() {
        Some(model) => AnthropicProvider::with_model(api_key, model),
        None => AnthropicProvider::new(api_key),
    };
    let executor = Arc::new(PythonExecutor::new(Arc::new(PlatformIsolation::new()))?);
    let agent = Arc::new(ToolInvocationLoop::new(
        Arc::new(provider),
        executor,
        security_profile,
    ));

    let router = create_router(AppState { agent });

    tracing::info!(
        "datapilot-server listening on {} (security tier {})",
        cfg.addr,
        cfg.tier
    );
    let listener = tokio::net::TcpListener::bind(&cfg.addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
