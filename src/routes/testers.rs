use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::CoordinatorError;
use crate::state::SharedState;
use crate::testers;

#[derive(Deserialize)]
pub struct TestersParams {
    #[serde(default)]
    pub include_offline: bool,
    #[serde(default)]
    pub include_sensitive: bool,
}

pub async fn location_testers(
    State(state): State<SharedState>,
    Path(location): Path<String>,
    Query(params): Query<TestersParams>,
) -> Result<impl IntoResponse, CoordinatorError> {
    if !state.locations().exists(&location) {
        return Err(CoordinatorError::BadRequest(format!(
            "Unknown location: {location}"
        )));
    }
    let snapshot = testers::get_testers(
        &state.config,
        &state.cache,
        &location,
        params.include_offline,
        params.include_sensitive,
    );
    Ok(Json(snapshot))
}

pub async fn location_queue(
    State(state): State<SharedState>,
    Path(location): Path<String>,
) -> Result<impl IntoResponse, CoordinatorError> {
    let locations = state.locations();
    if !locations.exists(&location) {
        return Err(CoordinatorError::BadRequest(format!(
            "Unknown location: {location}"
        )));
    }
    let info = locations.resolve(&location);
    let queues = state.queues();
    let lengths = queues.lengths(&location, &info).await;
    let (pending, priority0) = queues.pending_tests(&location, &info).await;
    Ok(Json(json!({
        "location": location,
        "queues": lengths,
        "pendingTests": pending,
        "priority0": priority0,
        "testers": testers::tester_count(&state.config, &state.cache, &location),
    })))
}
