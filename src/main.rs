use tracing_subscriber::{EnvFilter, fmt};
use tracing::info;

use wisdom::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env()?;
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "wisdom",
        "wisdom starting: RUST_LOG='{}', port={}, session_dir='{}', session_duration_ms={}, sweep_interval_ms={}",
        rust_log,
        config.server.port,
        config.session.dir.display(),
        config.session.duration.as_millis(),
        config.session.sweep_interval.as_millis()
    );

    wisdom::server::run(config).await
}
