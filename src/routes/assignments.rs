use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{day_end, day_start, AssignmentResponse, PageResponse};
use crate::auth::CurrentActor;
use crate::dispatch::coordinator::{self, BatchSummary};
use crate::dispatch::ledger::AssignmentFilter;
use crate::error::{ApiResponse, AppResult};
use crate::pagination::{PageRequest, SortDirection};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AssignmentListQuery {
    pub company_id: Option<i64>,
    pub assigned_to: Option<i64>,
    pub is_claimed: Option<bool>,
    pub is_completed: Option<bool>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub direction: Option<SortDirection>,
}

impl AssignmentListQuery {
    fn filter(&self) -> AppResult<AssignmentFilter> {
        Ok(AssignmentFilter {
            company_id: self.company_id,
            assigned_to: self.assigned_to,
            is_claimed: self.is_claimed,
            is_completed: self.is_completed,
            assigned_from: day_start("date_from", self.date_from.as_deref())?,
            assigned_until: day_end("date_to", self.date_to.as_deref())?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchAssignRequest {
    pub record_ids: Vec<i64>,
    pub company_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BatchAssignUsersRequest {
    pub record_ids: Vec<i64>,
    pub user_ids: Vec<i64>,
}

pub async fn list_assignments(
    State(state): State<AppState>,
    Query(query): Query<AssignmentListQuery>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<PageResponse<AssignmentResponse>>> {
    let filter = query.filter()?;
    let request = PageRequest::new(query.page, query.per_page, query.direction);
    let mut conn = state.db()?;
    let page = coordinator::list_assignments(&mut conn, &actor, &filter, request)?;
    Ok(ApiResponse::ok(page.map(AssignmentResponse::from).into()))
}

pub async fn batch_assign(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Json(payload): Json<BatchAssignRequest>,
) -> AppResult<ApiResponse<BatchSummary>> {
    let mut conn = state.db()?;
    let summary =
        coordinator::batch_assign(&mut conn, &actor, &payload.record_ids, &payload.company_ids)?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "records assigned to companies",
        summary,
    ))
}

pub async fn batch_assign_users(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Json(payload): Json<BatchAssignUsersRequest>,
) -> AppResult<ApiResponse<BatchSummary>> {
    let mut conn = state.db()?;
    let summary = coordinator::batch_assign_to_users(
        &mut conn,
        &actor,
        &payload.record_ids,
        &payload.user_ids,
    )?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "records assigned to users",
        summary,
    ))
}

pub async fn delete_assignment(
    State(state): State<AppState>,
    Path(assignment_id): Path<i64>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<()>> {
    let mut conn = state.db()?;
    coordinator::delete_assignment(&mut conn, &actor, assignment_id)?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "assignment deleted",
        (),
    ))
}

pub async fn claim_assignment(
    State(state): State<AppState>,
    Path(assignment_id): Path<i64>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<AssignmentResponse>> {
    let mut conn = state.db()?;
    let assignment = coordinator::claim_assignment(&mut conn, &actor, assignment_id)?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "assignment claimed",
        assignment.into(),
    ))
}

pub async fn complete_assignment(
    State(state): State<AppState>,
    Path(assignment_id): Path<i64>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<AssignmentResponse>> {
    let mut conn = state.db()?;
    let assignment = coordinator::complete_assignment(&mut conn, &actor, assignment_id)?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "assignment completed",
        assignment.into(),
    ))
}
