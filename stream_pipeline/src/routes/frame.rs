use crate::server::SharedState;
use axum::{
    extract::State,
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use yolo_inference::BoundingBox;

const X_SEQUENCE: HeaderName = HeaderName::from_static("x-sequence");
const X_TIMESTAMP_MS: HeaderName = HeaderName::from_static("x-timestamp-ms");

/// Latest annotated frame as a standalone JPEG, 204 until one is published.
pub async fn latest_frame(State(state): State<SharedState>) -> Response {
    let Some(frame) = state.latest.current() else {
        return StatusCode::NO_CONTENT.into_response();
    };

    (
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (X_SEQUENCE, frame.sequence.to_string()),
            (X_TIMESTAMP_MS, frame.timestamp_ms.to_string()),
        ],
        frame.jpeg.clone(),
    )
        .into_response()
}

#[derive(Serialize)]
pub struct LabeledDetection {
    class_id: u32,
    label: String,
    confidence: f32,
    bbox: BoundingBox,
}

#[derive(Serialize)]
pub struct FrameDetections {
    sequence: u64,
    timestamp_ms: u64,
    published_ms: u64,
    width: u32,
    height: u32,
    detections: Vec<LabeledDetection>,
}

pub async fn latest_detections(State(state): State<SharedState>) -> Response {
    let Some(frame) = state.latest.current() else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let detections = frame
        .detections
        .iter()
        .map(|d| LabeledDetection {
            class_id: d.class_id,
            label: state.labels.name(d.class_id),
            confidence: d.confidence,
            bbox: d.bbox,
        })
        .collect();

    Json(FrameDetections {
        sequence: frame.sequence,
        timestamp_ms: frame.timestamp_ms,
        published_ms: frame.published_ms,
        width: frame.width,
        height: frame.height,
        detections,
    })
    .into_response()
}
