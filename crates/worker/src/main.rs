use std::time::Duration;

use sandpool::{
    TRACE_TARGET_SCRIPT,
    request::{HttpConfig, HttpProxy},
    worker::serve_with,
};
use sandpool_script::ScriptEngine;
use tracing::Level;

/// Outbound request timeout in milliseconds; unset means none.
const HTTP_TIMEOUT_ENV: &str = "SANDPOOL_HTTP_TIMEOUT_MS";
/// Proxy for every outbound request.
const HTTP_PROXY_ENV: &str = "SANDPOOL_HTTP_PROXY";

fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main());

    // stdin is read on a blocking thread that never returns on its own;
    // exit instead of waiting for the runtime to wind down.
    std::process::exit(code)
}

async fn async_main() -> i32 {
    let http = match HttpProxy::new(&http_config()) {
        Ok(http) => http,
        Err(err) => {
            tracing::error!(?err, "invalid HTTP configuration");
            return 2;
        }
    };

    tracing::debug!(pid = std::process::id(), "worker started");
    let served = serve_with(
        ScriptEngine::new(),
        tokio::io::stdin(),
        tokio::io::stdout(),
        |worker| worker.with_http(http),
    )
    .await;
    match served {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(%err, "worker stopped");
            1
        }
    }
}

fn http_config() -> HttpConfig {
    let mut config = HttpConfig::default();
    if let Ok(raw) = std::env::var(HTTP_TIMEOUT_ENV) {
        match raw.parse::<u64>() {
            Ok(0) => {}
            Ok(ms) => config = config.with_timeout(Duration::from_millis(ms)),
            Err(err) => {
                tracing::warn!(%raw, ?err, "Invalid {HTTP_TIMEOUT_ENV}; ignoring");
            }
        }
    }
    match std::env::var(HTTP_PROXY_ENV) {
        Ok(proxy) if !proxy.trim().is_empty() => config.with_proxy(proxy),
        _ => config,
    }
}

/// Logs go to stderr; stdout carries the parent channel.
fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env()?
        .add_directive(format!("{TRACE_TARGET_SCRIPT}=off").parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
    Ok(())
}
