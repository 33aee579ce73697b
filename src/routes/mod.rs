use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    models::{Assignment, DataRecord},
    pagination::{Page, PageRequest, SortDirection},
    state::AppState,
};

pub mod admin;
pub mod assignments;
pub mod auth;
pub mod health;
pub mod records;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .filter_map(|value| match value.parse::<HeaderValue>() {
                Ok(header) => Some(header),
                Err(_) => {
                    tracing::warn!(origin = value, "ignoring invalid CORS allowed origin");
                    None
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/me", get(auth::me));

    let records_routes = Router::new()
        .route("/", get(records::list_records).post(records::create_record))
        .route("/unclaimed", get(records::list_unclaimed))
        .route("/my-claimed", get(records::list_my_claimed))
        .route(
            "/:id",
            get(records::get_record).delete(records::delete_record),
        )
        .route("/:id/claim", post(records::claim_record))
        .route("/:id/complete", post(records::complete_record))
        .route("/:id/mark-duplicate", post(records::mark_duplicate));

    let assignments_routes = Router::new()
        .route("/", get(assignments::list_assignments))
        .route("/batch", post(assignments::batch_assign))
        .route("/batch-users", post(assignments::batch_assign_users))
        .route("/:id", delete(assignments::delete_assignment))
        .route("/:id/claim", post(assignments::claim_assignment))
        .route("/:id/complete", post(assignments::complete_assignment));

    let admin_routes = Router::new()
        .route(
            "/reconcile/phone-duplicates",
            post(admin::reconcile_phone_duplicates),
        )
        .route("/resync/contacts", post(admin::resync_contacts));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/data-records", records_routes)
        .nest("/api/assignments", assignments_routes)
        .nest("/api/admin", admin_routes)
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    Router::new()
        .merge(protected_routes)
        .nest("/api/auth", auth_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024))
}

pub(crate) fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}

fn parse_day(field: &str, value: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::unprocessable(format!("{field} must be a YYYY-MM-DD date")))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Midnight at the start of a `YYYY-MM-DD` query value.
pub(crate) fn day_start(field: &str, value: Option<&str>) -> AppResult<Option<NaiveDateTime>> {
    non_blank(value)
        .map(|value| Ok(parse_day(field, value)?.and_time(NaiveTime::MIN)))
        .transpose()
}

/// Last microsecond of a `YYYY-MM-DD` query value.
pub(crate) fn day_end(field: &str, value: Option<&str>) -> AppResult<Option<NaiveDateTime>> {
    non_blank(value)
        .map(|value| {
            let day = parse_day(field, value)?;
            Ok(day
                .succ_opt()
                .map(|next| next.and_time(NaiveTime::MIN) - chrono::Duration::microseconds(1))
                .unwrap_or(NaiveDateTime::MAX))
        })
        .transpose()
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub direction: Option<SortDirection>,
}

impl PageQuery {
    pub fn request(&self) -> PageRequest {
        PageRequest::new(self.page, self.per_page, self.direction)
    }
}

#[derive(Debug, Serialize)]
pub struct PageResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub current_page: i64,
    pub per_page: i64,
    pub last_page: i64,
}

impl<T> From<Page<T>> for PageResponse<T> {
    fn from(page: Page<T>) -> Self {
        let last_page = page.last_page();
        Self {
            data: page.items,
            total: page.total,
            current_page: page.page,
            per_page: page.per_page,
            last_page,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordSummary {
    pub id: i64,
    pub platform: String,
    pub platform_id: Option<String>,
    pub phone: Option<String>,
    pub image_url: Option<String>,
    pub is_duplicate: bool,
    pub submitter_id: i64,
    pub created_at: String,
}

impl From<&DataRecord> for RecordSummary {
    fn from(record: &DataRecord) -> Self {
        Self {
            id: record.id,
            platform: record.platform.clone(),
            platform_id: record.platform_id.clone(),
            phone: record.phone.clone(),
            image_url: record.image_url.clone(),
            is_duplicate: record.is_duplicate,
            submitter_id: record.submitter_id,
            created_at: to_iso(record.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AssignmentResponse {
    pub id: i64,
    pub data_record_id: i64,
    pub company_id: i64,
    pub assigned_to: Option<i64>,
    pub is_claimed: bool,
    pub claimed_at: Option<String>,
    pub is_completed: bool,
    pub assigned_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<RecordSummary>,
}

impl From<Assignment> for AssignmentResponse {
    fn from(assignment: Assignment) -> Self {
        Self {
            id: assignment.id,
            data_record_id: assignment.data_record_id,
            company_id: assignment.company_id,
            assigned_to: assignment.assigned_to,
            is_claimed: assignment.is_claimed,
            claimed_at: assignment.claimed_at.map(to_iso),
            is_completed: assignment.is_completed,
            assigned_at: to_iso(assignment.assigned_at),
            record: None,
        }
    }
}

impl From<(Assignment, DataRecord)> for AssignmentResponse {
    fn from((assignment, record): (Assignment, DataRecord)) -> Self {
        let summary = RecordSummary::from(&record);
        Self {
            record: Some(summary),
            ..Self::from(assignment)
        }
    }
}
