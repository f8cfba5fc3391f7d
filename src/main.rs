use anyhow::Context;
use placewatch::{init_tracing, run, AppConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::from_env();
    info!(profile = ?config.public_profile(), "starting placewatch");
    run(config).await.context("placewatch stopped with an error")
}
