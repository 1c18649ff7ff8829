mod frame;
mod health;
mod index;
mod metrics;
mod stats;
mod video_feed;

use crate::server::SharedState;
use axum::{routing::get, Router};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index::index))
        .route("/video_feed", get(video_feed::video_feed))
        .route("/frame.jpg", get(frame::latest_frame))
        .route("/detections", get(frame::latest_detections))
        .route("/stats", get(stats::stats))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
