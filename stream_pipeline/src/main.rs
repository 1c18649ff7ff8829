use anyhow::Context;
use stream_pipeline::{config, start_app, telemetry::init_subscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_configuration().context("failed to load configuration")?;
    init_subscriber(&config.log_level);

    if let Err(e) = start_app(config).await {
        tracing::error!("Pipeline terminated: {:#}", e);
        return Err(e);
    }

    Ok(())
}
