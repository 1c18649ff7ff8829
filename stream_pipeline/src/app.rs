use crate::{
    annotate::Annotator,
    buffer::FrameBuffer,
    config::Config,
    inference::InferenceStage,
    pipeline::{Pipeline, PipelineError, PipelineStatus, Stages},
    publisher::Publisher,
    server::{HttpServer, SharedState},
    source::FrameSource,
    stats::PipelineStats,
};

use anyhow::Context;
use std::sync::Arc;
use tokio::{signal, sync::broadcast};
use yolo_inference::Postprocessor;

/// `config` must come from `config::get_configuration`, which validates it.
pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let stats = Arc::new(PipelineStats::new()?);
    let buffer = Arc::new(FrameBuffer::new(config.buffer.capacity, stats.clone()));
    let labels = config.model.load_labels().map_err(PipelineError::Config)?;

    let accelerator = config.accelerator.build();
    tracing::info!(backend = accelerator.name(), "Opening accelerator");
    let inference = InferenceStage::start(
        accelerator,
        config.model.input,
        config.accelerator.timeout(),
        config.accelerator.reinit_budget,
        stats.clone(),
    )?;

    let publisher = Publisher::new(config.publisher.jpeg_quality);
    let latest = publisher.subscribe();
    let source = FrameSource::new(&config.source, stats.clone()).map_err(PipelineError::from)?;

    let stages = Stages {
        inference,
        postprocessor: Postprocessor::new(
            config.model.output,
            config.model.num_classes,
            config.model.thresholds,
        ),
        annotator: Annotator::new(labels.clone()),
        sink: publisher,
        hud: config.publisher.hud,
    };
    let pipeline = Pipeline::start(stages, buffer.clone(), stats.clone())?;

    let state = SharedState {
        latest,
        stats,
        status: pipeline.status(),
        labels: Arc::new(labels),
    };
    let server = HttpServer::new(state, &config.server)
        .await
        .context("failed to bind viewer")?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let source_handle = tokio::spawn(source.run(buffer, shutdown_tx.subscribe()));
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    let mut status = pipeline.status();
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, starting graceful shutdown.");
        }
        _ = status.wait_for(|s| matches!(s, PipelineStatus::Stopped | PipelineStatus::HardwareUnavailable)) => {
            tracing::info!("Pipeline stopped, shutting down.");
        }
    }

    let _ = shutdown_tx.send(());
    pipeline.shutdown();
    let _ = source_handle.await;
    let result = tokio::task::spawn_blocking(move || pipeline.join()).await?;
    let _ = server_handle.await;

    result.map_err(anyhow::Error::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
