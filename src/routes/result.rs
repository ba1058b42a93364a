use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Redirect};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::CoordinatorError;
use crate::pagedata::{self, stats, LoadOptions};
use crate::state::SharedState;
use crate::testid;

#[derive(Deserialize)]
pub struct ResultParams {
    #[serde(default)]
    pub recalculate: bool,
    #[serde(default)]
    pub basic: bool,
}

/// Single-run metrics record.
pub async fn run_result(
    State(state): State<SharedState>,
    Path((id, run, cached)): Path<(String, u32, u8)>,
    Query(params): Query<ResultParams>,
) -> Result<impl IntoResponse, CoordinatorError> {
    testid::validate_test_id(&id)?;
    let settings = state.settings();
    if let Some(server) = testid::server_for_test(&id, &settings) {
        let target = format!("{}/result/{id}/{run}/{cached}", server.trim_end_matches('/'));
        return Ok(Redirect::temporary(&target).into_response());
    }
    let test_dir = state.config.data_dir.join(testid::test_path(&id));
    let test_info = pagedata::load_test_info(&test_dir);
    let Some(record) = pagedata::load_page_run_data(
        &test_dir,
        run.max(1),
        cached != 0,
        test_info.as_ref(),
        LoadOptions {
            recalculate: params.recalculate,
            basic: params.basic,
        },
    ) else {
        if testid::test_archive_expired(&id, &settings) {
            return Err(CoordinatorError::TestExpired(id));
        }
        return Err(CoordinatorError::UnknownTest(id));
    };
    Ok(Json(Value::Object(record)).into_response())
}

#[derive(Deserialize)]
pub struct AggregateParams {
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default)]
    pub cached: u8,
    #[serde(default)]
    pub fastest: bool,
}

fn default_metric() -> String {
    "loadTime".to_string()
}

/// Cross-run statistics for one metric and cache state.
pub async fn aggregate_result(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(params): Query<AggregateParams>,
) -> Result<impl IntoResponse, CoordinatorError> {
    testid::validate_test_id(&id)?;
    let test_dir = state.config.data_dir.join(testid::test_path(&id));
    let runs = pagedata::load_all_page_data(&test_dir, LoadOptions::default());
    if runs.is_empty() {
        if testid::test_archive_expired(&id, &state.settings()) {
            return Err(CoordinatorError::TestExpired(id));
        }
        return Err(CoordinatorError::UnknownTest(id));
    }

    let cached = if params.cached != 0 {
        stats::REPEAT_VIEW
    } else {
        stats::FIRST_VIEW
    };
    let median_run = stats::get_median_run(&runs, cached, &params.metric, params.fastest);
    let aggregate = stats::calculate_aggregate_stats(&runs, cached, &params.metric);
    let (first_view_avg, repeat_view_avg) = stats::calculate_page_stats(&runs);

    let mut body = json!({
        "testId": id,
        "metric": params.metric,
        "cached": cached,
        "successfulRuns": stats::count_successful_tests(&runs, cached),
        "medianRun": median_run,
    });
    if let Some(aggregate) = aggregate {
        body["stats"] = json!({
            "count": aggregate.count,
            "avg": aggregate.avg,
            "median": aggregate.median,
            "stdDev": aggregate.std_dev,
            "min": aggregate.min,
            "max": aggregate.max,
        });
    }
    if let Some(fv) = first_view_avg {
        body["firstViewAverage"] = Value::Object(fv);
    }
    if let Some(rv) = repeat_view_avg {
        body["repeatViewAverage"] = Value::Object(rv);
    }
    Ok(Json(body))
}
