use axum::extract::State;
use axum::Json;
use serde_json::{json, Map, Value};

use crate::state::SharedState;
use crate::testers;

/// Coordinator liveness plus a per-location queue and tester summary.
pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    let locations = state.locations();
    let queues = state.queues();

    let mut summary = Map::new();
    for name in locations.names() {
        let info = locations.resolve(&name);
        let (pending, _) = queues.pending_tests(&name, &info).await;
        let snapshot = testers::get_testers(&state.config, &state.cache, &name, false, false);
        let status = snapshot
            .get("status")
            .cloned()
            .unwrap_or(Value::String("OFFLINE".to_string()));
        summary.insert(
            name,
            json!({
                "status": status,
                "pendingTests": pending,
                "testers": snapshot.get("testers")
                    .and_then(Value::as_array)
                    .map(|t| t.len())
                    .unwrap_or(0),
            }),
        );
    }

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "locations": summary,
    }))
}
