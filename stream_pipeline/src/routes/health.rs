use crate::{pipeline::PipelineStatus, server::SharedState};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;

#[derive(Serialize)]
pub struct Status {
    status: PipelineStatus,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    let status = *state.status.borrow();
    let code = match status {
        PipelineStatus::Starting | PipelineStatus::Running => StatusCode::OK,
        PipelineStatus::Stopped | PipelineStatus::HardwareUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (code, Json(Status { status }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{publisher::Publisher, routes::test_support};

    #[tokio::test]
    async fn test_health_reports_status() {
        let publisher = Publisher::new(80);
        let (state, status_tx) = test_support::state(&publisher, PipelineStatus::Running);

        let response = healthcheck(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(test_support::body(response).await, br#"{"status":"running"}"#);

        status_tx.send_replace(PipelineStatus::HardwareUnavailable);
        let response = healthcheck(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            test_support::body(response).await,
            br#"{"status":"hardware_unavailable"}"#
        );
    }
}
