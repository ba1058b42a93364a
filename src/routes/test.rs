use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::error::CoordinatorError;
use crate::state::SharedState;
use crate::testid;

fn default_runs() -> u32 {
    1
}

#[derive(Deserialize)]
pub struct RunTestRequest {
    pub url: String,
    pub location: String,
    #[serde(default = "default_runs")]
    pub runs: u32,
    #[serde(default)]
    pub fvonly: bool,
    #[serde(default)]
    pub priority: usize,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub affinity: Option<String>,
}

pub async fn run_test(
    State(state): State<SharedState>,
    Json(body): Json<RunTestRequest>,
) -> Result<impl IntoResponse, CoordinatorError> {
    if body.url.trim().is_empty() {
        return Err(CoordinatorError::BadRequest("Missing test url".into()));
    }
    let locations = state.locations();
    if !locations.exists(&body.location) {
        return Err(CoordinatorError::BadRequest(format!(
            "Unknown location: {}",
            body.location
        )));
    }
    let info = locations.resolve(&body.location);
    let priority = body.priority.min(9);
    let runs = body.runs.clamp(1, 100);

    let settings = state.settings();
    let test_id = testid::generate_test_id(
        &state.config,
        &settings,
        body.private,
        info.location_shard.as_deref(),
    )
    .await;

    let test_dir = state.config.data_dir.join(testid::test_path(&test_id));
    std::fs::create_dir_all(&test_dir)?;
    let test_info = json!({
        "id": test_id,
        "url": body.url,
        "location": body.location,
        "browser": info.browser,
        "runs": runs,
        "fvonly": if body.fvonly { 1 } else { 0 },
        "priority": priority,
        "label": body.label,
        "started": Utc::now().timestamp(),
    });
    std::fs::write(test_dir.join("testinfo.json"), test_info.to_string())?;
    std::fs::write(test_dir.join("test.waiting"), b"")?;

    let job = json!({
        "id": test_id,
        "url": body.url,
        "location": body.location,
        "browser": info.browser,
        "runs": runs,
        "fvonly": if body.fvonly { 1 } else { 0 },
        "priority": priority,
    });
    let queued = state
        .queues()
        .enqueue_test(
            &body.location,
            &info,
            &test_id,
            &job,
            runs,
            priority,
            body.affinity.as_deref(),
        )
        .await;
    if !queued {
        return Err(CoordinatorError::QueueUnavailable(body.location.clone()));
    }

    tracing::info!(%test_id, location = %body.location, runs, priority, "test queued");
    Ok(Json(json!({
        "testId": test_id,
        "location": body.location,
        "runs": runs,
        "priority": priority,
    })))
}

pub async fn test_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, CoordinatorError> {
    testid::validate_test_id(&id)?;
    let test_dir = state.config.data_dir.join(testid::test_path(&id));
    let Some(test_info) = crate::pagedata::load_test_info(&test_dir) else {
        return Err(CoordinatorError::UnknownTest(id));
    };
    let completed = crate::pagedata::test_complete(&test_dir, Some(&test_info));
    let location = test_info
        .get("location")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut status = json!({
        "testId": id,
        "location": location,
        "completed": completed,
    });
    if !completed && !location.is_empty() {
        let info = state.locations().resolve(&location);
        let queues = state.queues();
        status["behindCount"] = json!(queues.position(&location, &info, &id).await);
        if let Some(remote) = queues.scheduler_status(&id).await {
            status["schedulerStatus"] = remote;
        }
    }
    Ok(Json(status))
}
