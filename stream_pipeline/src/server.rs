use crate::{
    config::ServerConfig, pipeline::PipelineStatus, publisher::LatestFrame, routes::api_routes,
    stats::PipelineStats,
};
use axum::Router;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    sync::{broadcast::Receiver, watch},
    task::JoinHandle,
};
use yolo_inference::LabelSet;

#[derive(Clone)]
pub struct SharedState {
    pub latest: LatestFrame,
    pub stats: Arc<PipelineStats>,
    pub status: watch::Receiver<PipelineStatus>,
    pub labels: Arc<LabelSet>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let router = Router::new().merge(api_routes()).with_state(state);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self, shutdown_rx: Receiver<()>) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting viewer on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
