use crate::{server::SharedState, stats::StatsSnapshot};
use axum::{extract::State, response::Json};

pub async fn stats(State(state): State<SharedState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}
