use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// List all live sessions from a registry snapshot. The snapshot is taken
/// once; session tasks keep running while the response is built.
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let summaries = state.registry().summaries();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_sessions": summaries.len(),
        "max_sessions": state.registry().max_sessions(),
        "sessions": summaries
    })))
}
