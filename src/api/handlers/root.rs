use axum::response::{IntoResponse, Json};
use serde_json::json;

/// Service descriptor served at `/`; undocumented on purpose.
pub async fn root() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
