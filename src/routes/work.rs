use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::CoordinatorError;
use crate::state::SharedState;
use crate::testers::{self, TesterUpdate};

#[derive(Deserialize)]
pub struct GetWorkParams {
    pub location: String,
    pub tester: String,
    #[serde(default)]
    pub tester_index: Option<usize>,
    #[serde(default)]
    pub tester_count: Option<usize>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rebooted: Option<bool>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub freedisk: Option<f64>,
    #[serde(default)]
    pub screenwidth: Option<u32>,
    #[serde(default)]
    pub screenheight: Option<u32>,
}

fn capability_info(params: &GetWorkParams) -> Option<Map<String, Value>> {
    let mut info = Map::new();
    info.insert("pc".to_string(), json!(params.tester));
    if let Some(version) = &params.version {
        info.insert("ver".to_string(), json!(version));
    }
    if let Some(freedisk) = params.freedisk {
        info.insert("freedisk".to_string(), json!(freedisk));
    }
    if let Some(width) = params.screenwidth {
        info.insert("screenwidth".to_string(), json!(width));
    }
    if let Some(height) = params.screenheight {
        info.insert("screenheight".to_string(), json!(height));
    }
    Some(info)
}

/// Tester poll: records a heartbeat and hands out the next eligible job.
pub async fn get_work(
    State(state): State<SharedState>,
    Query(params): Query<GetWorkParams>,
) -> Result<impl IntoResponse, CoordinatorError> {
    if !state.locations().exists(&params.location) {
        return Err(CoordinatorError::BadRequest(format!(
            "Unknown location: {}",
            params.location
        )));
    }
    testers::update_tester(
        &state.config,
        &params.location,
        &params.tester,
        TesterUpdate {
            info: capability_info(&params),
            cpu: params.cpu,
            error: params.error.clone(),
            rebooted: params.rebooted,
        },
    );

    let locations = state.locations();
    let queues = state.queues();
    let mut work = None;
    // The tester's own location first, then its fallback chain.
    let mut candidates = vec![params.location.clone()];
    candidates.extend(locations.fallbacks(&params.location));
    for location in candidates {
        let info = locations.resolve(&location);
        work = queues
            .get_work(
                &location,
                &info,
                Some(&params.tester),
                params.tester_index,
                params.tester_count,
            )
            .await;
        if work.is_some() {
            break;
        }
    }

    match work {
        Some(item) => {
            let job: Value =
                serde_json::from_str(&item.payload).unwrap_or(Value::String(item.payload));
            tracing::debug!(location = %params.location, tester = %params.tester,
                priority = item.priority, "job dispatched");
            Ok(Json(json!({"job": job, "priority": item.priority})).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    pub location: String,
    pub tester: String,
    #[serde(default)]
    pub info: Option<Map<String, Value>>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rebooted: Option<bool>,
}

pub async fn heartbeat(
    State(state): State<SharedState>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, CoordinatorError> {
    if !state.locations().exists(&body.location) {
        return Err(CoordinatorError::BadRequest(format!(
            "Unknown location: {}",
            body.location
        )));
    }
    testers::update_tester(
        &state.config,
        &body.location,
        &body.tester,
        TesterUpdate {
            info: body.info,
            cpu: body.cpu,
            error: body.error,
            rebooted: body.rebooted,
        },
    );
    Ok(Json(json!({"status": "ok"})))
}
