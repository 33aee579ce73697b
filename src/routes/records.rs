use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{
    day_end, day_start, to_iso, AssignmentResponse, PageQuery, PageResponse, RecordSummary,
};
use crate::auth::CurrentActor;
use crate::dispatch::coordinator::{self, FanOutSummary, IngestRequest};
use crate::dispatch::records::{ClaimProjection, RecordFilter};
use crate::error::{ApiResponse, AppError, AppResult};
use crate::models::{DataRecord, Platform};
use crate::notifier;
use crate::pagination::{PageRequest, SortDirection};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub id: i64,
    pub image_url: Option<String>,
    pub chat_images: Vec<String>,
    pub submitter_id: i64,
    pub platform: String,
    pub platform_id: Option<String>,
    pub phone: Option<String>,
    pub is_duplicate: bool,
    pub synced_to_external: bool,
    pub is_claimed: bool,
    pub is_completed: bool,
    pub claimer_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl RecordResponse {
    fn new(record: DataRecord, projection: ClaimProjection) -> Self {
        let chat_images = record
            .chat_images
            .as_ref()
            .and_then(|value| value.as_array())
            .map(|urls| {
                urls.iter()
                    .filter_map(|url| url.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: record.id,
            image_url: record.image_url,
            chat_images,
            submitter_id: record.submitter_id,
            platform: record.platform,
            platform_id: record.platform_id,
            phone: record.phone,
            is_duplicate: record.is_duplicate,
            synced_to_external: record.synced_to_external,
            is_claimed: projection.is_claimed,
            is_completed: projection.is_completed,
            claimer_id: projection.claimer_id,
            created_at: to_iso(record.created_at),
            updated_at: to_iso(record.updated_at),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RecordListQuery {
    pub id: Option<i64>,
    pub platform: Option<String>,
    pub is_duplicate: Option<bool>,
    pub is_claimed: Option<bool>,
    pub is_completed: Option<bool>,
    pub search: Option<String>,
    pub phone: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub direction: Option<SortDirection>,
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

impl RecordListQuery {
    fn filter(&self) -> AppResult<RecordFilter> {
        let platform = match trimmed(self.platform.as_deref()) {
            Some(value) => Some(
                value
                    .parse::<Platform>()
                    .map_err(|err| AppError::unprocessable(err.to_string()))?,
            ),
            None => None,
        };
        Ok(RecordFilter {
            id: self.id,
            submitter_id: None,
            platform,
            is_duplicate: self.is_duplicate,
            is_claimed: self.is_claimed,
            is_completed: self.is_completed,
            search: trimmed(self.search.as_deref()),
            phone: trimmed(self.phone.as_deref()),
            created_from: day_start("start_date", self.start_date.as_deref())?,
            created_until: day_end("end_date", self.end_date.as_deref())?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub record: RecordResponse,
    pub fan_out: Option<FanOutSummary>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MarkDuplicateResponse {
    pub record: RecordSummary,
    pub assignment: AssignmentResponse,
}

pub async fn create_record(
    State(state): State<AppState>,
    CurrentActor(actor): CurrentActor,
    Json(payload): Json<IngestRequest>,
) -> AppResult<ApiResponse<IngestResponse>> {
    let mut conn = state.db()?;
    let outcome = coordinator::ingest(&mut conn, &actor, payload)?;
    drop(conn);

    notifier::spawn_sync(
        state.pool.clone(),
        state.notifier.clone(),
        outcome.record.clone(),
    );

    let message = if outcome.warnings.is_empty() {
        "record created"
    } else {
        "record created with warnings"
    };
    Ok(ApiResponse::with_status(
        StatusCode::CREATED,
        message,
        IngestResponse {
            record: RecordResponse::new(outcome.record, ClaimProjection::default()),
            fan_out: outcome.fan_out,
            warnings: outcome.warnings,
        },
    ))
}

pub async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<RecordListQuery>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<PageResponse<RecordSummary>>> {
    let filter = query.filter()?;
    let request = PageRequest::new(query.page, query.per_page, query.direction);
    let mut conn = state.db()?;
    let page = coordinator::list_records(&mut conn, &actor, filter, request)?;
    let page = page.map(|record| RecordSummary::from(&record));
    Ok(ApiResponse::ok(page.into()))
}

pub async fn get_record(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<RecordResponse>> {
    let mut conn = state.db()?;
    let (record, projection) = coordinator::view_record(&mut conn, &actor, record_id)?;
    Ok(ApiResponse::ok(RecordResponse::new(record, projection)))
}

pub async fn delete_record(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<()>> {
    let mut conn = state.db()?;
    coordinator::delete_record(&mut conn, &actor, record_id)?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "record deleted",
        (),
    ))
}

pub async fn list_unclaimed(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<PageResponse<AssignmentResponse>>> {
    let mut conn = state.db()?;
    let page = coordinator::get_claimable(&mut conn, &actor, query.request())?;
    Ok(ApiResponse::ok(page.map(AssignmentResponse::from).into()))
}

pub async fn list_my_claimed(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<PageResponse<AssignmentResponse>>> {
    let mut conn = state.db()?;
    let page = coordinator::get_user_incomplete(&mut conn, &actor, query.request())?;
    Ok(ApiResponse::ok(page.map(AssignmentResponse::from).into()))
}

pub async fn claim_record(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<AssignmentResponse>> {
    let mut conn = state.db()?;
    let assignment = coordinator::claim_record(&mut conn, &actor, record_id)?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "record claimed",
        assignment.into(),
    ))
}

pub async fn complete_record(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<AssignmentResponse>> {
    let mut conn = state.db()?;
    let assignment = coordinator::complete_record(&mut conn, &actor, record_id)?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "record completed",
        assignment.into(),
    ))
}

pub async fn mark_duplicate(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
    CurrentActor(actor): CurrentActor,
) -> AppResult<ApiResponse<MarkDuplicateResponse>> {
    let mut conn = state.db()?;
    let (record, assignment) = coordinator::mark_duplicate(&mut conn, &actor, record_id)?;
    Ok(ApiResponse::with_status(
        StatusCode::OK,
        "record marked as duplicate",
        MarkDuplicateResponse {
            record: RecordSummary::from(&record),
            assignment: assignment.into(),
        },
    ))
}
