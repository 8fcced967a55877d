use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:6379";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PUBKV_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let server = pubkv_server::spawn(&addr).await?;
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
