use axum::{extract::State, http::StatusCode, response::Json};
use diesel::prelude::*;
use serde_json::json;

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let database = match state.pool.get() {
        Ok(mut conn) => diesel::sql_query("SELECT 1").execute(&mut conn).is_ok(),
        Err(_) => false,
    };
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "success": database,
            "code": status.as_u16(),
            "message": if database { "ok" } else { "database unavailable" },
            "data": { "database": database },
        })),
    )
}
