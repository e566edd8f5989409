//! Read routes for indexed greetings.

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use std::sync::Arc;

use auco::etl::store::IndexedData;

use crate::storage::{GreetingRow, GreetingStorage};

/// `GET /greetings`: every committed greeting, ordered by id.
async fn greetings_handler(
    State(storage): State<Arc<GreetingStorage>>,
) -> Result<Json<IndexedData<GreetingRow>>, (StatusCode, String)> {
    storage.indexed_data().await.map(Json).map_err(|e| {
        tracing::error!(target: "auco_greeting::http", error = %e, "Failed to read greetings");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// Routes to merge into the core HTTP router.
pub fn greeting_routes(storage: GreetingStorage) -> Router {
    Router::new()
        .route("/greetings", get(greetings_handler))
        .with_state(Arc::new(storage))
}
