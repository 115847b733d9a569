use anyhow::Context;
use ironcurtain_core::config::ProxyConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Protocol traffic owns stdout; all diagnostics go to stderr and are
    // controlled with `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = ProxyConfig::from_env().context("invalid proxy configuration")?;
    ironcurtain_proxy::run_main(config).await
}
