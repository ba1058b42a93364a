use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(crate::routes::health::health))
        // Test submission and status
        .route("/runtest", post(crate::routes::test::run_test))
        .route("/testStatus/{id}", get(crate::routes::test::test_status))
        // Tester work loop
        .route("/work/getwork", get(crate::routes::work::get_work))
        .route("/work/heartbeat", post(crate::routes::work::heartbeat))
        // Location introspection
        .route(
            "/testers/{location}",
            get(crate::routes::testers::location_testers),
        )
        .route(
            "/queue/{location}",
            get(crate::routes::testers::location_queue),
        )
        // Results
        .route(
            "/result/{id}/aggregate",
            get(crate::routes::result::aggregate_result),
        )
        .route(
            "/result/{id}/{run}/{cached}",
            get(crate::routes::result::run_result),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
