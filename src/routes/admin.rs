use axum::{extract::State, http::StatusCode};

use crate::auth::CurrentActor;
use crate::dispatch::reconcile::{self, ReconcileSummary};
use crate::error::{ApiResponse, AppError, AppResult};
use crate::notifier::{self, ResyncSummary};
use crate::state::AppState;

pub async fn reconcile_phone_duplicates(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<ReconcileSummary>> {
    let mut conn = state.db()?;
    actor.require_admin()?;
    let summary = reconcile::reconcile_phone_duplicates(&mut conn)?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "phone duplicate check finished",
        summary,
    ))
}

/// Pushes every original record's phone to the contact endpoint again.
pub async fn resync_contacts(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<ResyncSummary>> {
    actor.require_admin()?;
    let summary = notifier::resync_contacts(
        state.pool.clone(),
        state.notifier.clone(),
        state.config.resync_pace(),
    )
    .await
    .map_err(|err| AppError::internal(format!("contact resync failed: {err}")))?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "contact resync finished",
        summary,
    ))
}
