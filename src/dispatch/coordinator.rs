//! Operations callers invoke on behalf of an [`Actor`].
//!
//! Each function checks the actor's capability against the rows it touches
//! and leaves atomicity to the ledger's conditional updates or to an explicit
//! transaction.

use std::collections::BTreeSet;

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use super::dedup::DedupStrategy;
use super::records::{self, ClaimProjection};
use super::{ledger, Actor, DispatchError, DispatchResult};
use crate::models::{
    Assignment, DataRecord, NewAssignment, NewDataRecord, Platform, UnknownPlatform,
};
use crate::pagination::{Page, PageRequest};
use crate::schema::{companies, data_records, users};

pub const MAX_PLATFORM_ID_LEN: usize = 255;

/// Raw submission as received from a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRequest {
    pub platform: String,
    pub platform_id: Option<String>,
    pub phone: Option<String>,
    pub image_url: Option<String>,
    pub chat_images: Option<Vec<String>>,
}

/// A submission that passed validation, with blank fields dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub platform: Platform,
    pub platform_id: Option<String>,
    pub phone: Option<String>,
    pub image_url: Option<String>,
    pub chat_images: Vec<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Mainland mobile number: eleven digits, `1` then `3`-`9`.
pub fn is_mobile_number(phone: &str) -> bool {
    let bytes = phone.as_bytes();
    bytes.len() == 11
        && bytes.iter().all(u8::is_ascii_digit)
        && bytes[0] == b'1'
        && (b'3'..=b'9').contains(&bytes[1])
}

fn is_web_url(value: &str) -> bool {
    Url::parse(value)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
        .unwrap_or(false)
}

impl IngestRequest {
    pub fn validate(self) -> DispatchResult<Submission> {
        let platform: Platform = self
            .platform
            .trim()
            .parse()
            .map_err(|err: UnknownPlatform| DispatchError::validation(err.to_string()))?;

        let platform_id = non_blank(self.platform_id);
        if platform_id
            .as_deref()
            .is_some_and(|id| id.chars().count() > MAX_PLATFORM_ID_LEN)
        {
            return Err(DispatchError::validation(format!(
                "platform_id must be at most {MAX_PLATFORM_ID_LEN} characters"
            )));
        }

        let phone = non_blank(self.phone);
        if let Some(phone) = phone.as_deref() {
            if !is_mobile_number(phone) {
                return Err(DispatchError::validation(
                    "phone is not a valid mobile number",
                ));
            }
        }

        let image_url = non_blank(self.image_url);
        if let Some(url) = image_url.as_deref() {
            if !is_web_url(url) {
                return Err(DispatchError::validation(
                    "image_url must be an http(s) URL",
                ));
            }
        }

        let chat_images: Vec<String> = self
            .chat_images
            .unwrap_or_default()
            .into_iter()
            .filter_map(|url| non_blank(Some(url)))
            .collect();
        if let Some(bad) = chat_images.iter().find(|url| !is_web_url(url)) {
            return Err(DispatchError::validation(format!(
                "chat_images contains an invalid URL: {bad}"
            )));
        }

        Ok(Submission {
            platform,
            platform_id,
            phone,
            image_url,
            chat_images,
        })
    }
}

impl Submission {
    pub fn dedup_strategy(&self) -> DedupStrategy<'_> {
        DedupStrategy::choose(
            self.image_url.as_deref(),
            self.phone.as_deref(),
            self.platform,
            self.platform_id.as_deref(),
        )
    }

    fn to_new_record(
        &self,
        submitter_id: i64,
        is_duplicate: bool,
        now: NaiveDateTime,
    ) -> NewDataRecord {
        let chat_images = (!self.chat_images.is_empty()).then(|| {
            serde_json::Value::Array(
                self.chat_images
                    .iter()
                    .cloned()
                    .map(serde_json::Value::String)
                    .collect(),
            )
        });
        NewDataRecord {
            image_url: self.image_url.clone(),
            chat_images,
            submitter_id,
            platform: self.platform.as_str().to_string(),
            platform_id: self.platform_id.clone(),
            phone: self.phone.clone(),
            is_duplicate,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FanOutSummary {
    pub companies: usize,
    pub created: usize,
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub record: DataRecord,
    pub fan_out: Option<FanOutSummary>,
    pub warnings: Vec<String>,
}

/// Persists a submission with its duplicate flag, then fans it out.
///
/// The outcome is successful once the record is stored; fan-out failures only
/// add a warning.
pub fn ingest(
    conn: &mut PgConnection,
    actor: &Actor,
    request: IngestRequest,
) -> DispatchResult<IngestOutcome> {
    let submission = request.validate()?;

    let record = conn.transaction::<_, DispatchError, _>(|conn| {
        let strategy = submission.dedup_strategy();
        if let Some(key) = strategy.lock_key() {
            records::lock_key(conn, &key)?;
        }
        // Stamped after the lock so creation order follows lock order.
        let now = Utc::now().naive_utc();
        let prior = records::latest_match_created_at(conn, &strategy)?;
        let is_duplicate = strategy.is_duplicate(prior, now);
        records::insert(
            conn,
            &submission.to_new_record(actor.user_id, is_duplicate, now),
        )
    })?;

    info!(
        record_id = record.id,
        user_id = actor.user_id,
        platform = %record.platform,
        is_duplicate = record.is_duplicate,
        "record ingested"
    );

    let mut warnings = Vec::new();
    let fan_out = match fan_out_to_all_active_companies(conn, record.id) {
        Ok(summary) => Some(summary),
        Err(err) => {
            warn!(record_id = record.id, error = %err, "fan-out to active companies failed");
            warnings.push(format!(
                "record saved but could not be assigned to companies: {err}"
            ));
            None
        }
    };

    Ok(IngestOutcome {
        record,
        fan_out,
        warnings,
    })
}

/// Gives every currently active company an unassigned row for the record.
/// Companies already holding a row for it are skipped, so repeated calls add
/// nothing.
pub fn fan_out_to_all_active_companies(
    conn: &mut PgConnection,
    record_id: i64,
) -> DispatchResult<FanOutSummary> {
    conn.transaction::<_, DispatchError, _>(|conn| {
        records::require(conn, record_id)?;

        let active: Vec<i64> = companies::table
            .filter(companies::is_active.eq(true))
            .select(companies::id)
            .order(companies::id.asc())
            .load(conn)?;
        let holding = ledger::companies_holding(conn, record_id, &active)?;

        let now = Utc::now().naive_utc();
        let rows: Vec<NewAssignment> = active
            .iter()
            .filter(|company_id| !holding.contains(*company_id))
            .map(|&company_id| NewAssignment {
                data_record_id: record_id,
                company_id,
                assigned_to: None,
                assigned_at: now,
            })
            .collect();
        let created = ledger::insert_missing(conn, &rows)?;

        info!(
            record_id,
            companies = active.len(),
            created,
            "record fanned out"
        );
        Ok(FanOutSummary {
            companies: active.len(),
            created,
        })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatchSummary {
    pub created: usize,
    pub skipped: usize,
}

fn distinct(ids: &[i64]) -> Vec<i64> {
    ids.iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn missing_ids(wanted: &[i64], found: &[i64]) -> Vec<i64> {
    wanted
        .iter()
        .copied()
        .filter(|id| !found.contains(id))
        .collect()
}

fn require_all(kind: &str, wanted: &[i64], found: &[i64]) -> DispatchResult<()> {
    let missing = missing_ids(wanted, found);
    if missing.is_empty() {
        return Ok(());
    }
    let listed: Vec<String> = missing.iter().map(i64::to_string).collect();
    Err(DispatchError::validation(format!(
        "unknown {kind} id(s): {}",
        listed.join(", ")
    )))
}

fn require_records(conn: &mut PgConnection, record_ids: &[i64]) -> DispatchResult<()> {
    let found: Vec<i64> = data_records::table
        .filter(data_records::id.eq_any(record_ids))
        .select(data_records::id)
        .load(conn)?;
    require_all("record", record_ids, &found)
}

/// Assigns every record to every listed company, without a specific user.
pub fn batch_assign(
    conn: &mut PgConnection,
    actor: &Actor,
    record_ids: &[i64],
    company_ids: &[i64],
) -> DispatchResult<BatchSummary> {
    actor.require_admin()?;
    let record_ids = distinct(record_ids);
    let company_ids = distinct(company_ids);
    if record_ids.is_empty() || company_ids.is_empty() {
        return Err(DispatchError::validation(
            "record_ids and company_ids must not be empty",
        ));
    }

    conn.transaction::<_, DispatchError, _>(|conn| {
        require_records(conn, &record_ids)?;
        let found: Vec<i64> = companies::table
            .filter(companies::id.eq_any(&company_ids))
            .select(companies::id)
            .load(conn)?;
        require_all("company", &company_ids, &found)?;

        let now = Utc::now().naive_utc();
        let rows: Vec<NewAssignment> = record_ids
            .iter()
            .flat_map(|&data_record_id| {
                company_ids.iter().map(move |&company_id| NewAssignment {
                    data_record_id,
                    company_id,
                    assigned_to: None,
                    assigned_at: now,
                })
            })
            .collect();
        let created = ledger::insert_missing(conn, &rows)?;
        let summary = BatchSummary {
            created,
            skipped: rows.len() - created,
        };
        info!(
            user_id = actor.user_id,
            created = summary.created,
            skipped = summary.skipped,
            "batch assigned records to companies"
        );
        Ok(summary)
    })
}

/// Pre-assigns every record to every listed user within that user's company.
/// Users without a company are skipped.
pub fn batch_assign_to_users(
    conn: &mut PgConnection,
    actor: &Actor,
    record_ids: &[i64],
    user_ids: &[i64],
) -> DispatchResult<BatchSummary> {
    actor.require_admin()?;
    let record_ids = distinct(record_ids);
    let user_ids = distinct(user_ids);
    if record_ids.is_empty() || user_ids.is_empty() {
        return Err(DispatchError::validation(
            "record_ids and user_ids must not be empty",
        ));
    }

    conn.transaction::<_, DispatchError, _>(|conn| {
        require_records(conn, &record_ids)?;
        let targets: Vec<(i64, Option<i64>)> = users::table
            .filter(users::id.eq_any(&user_ids))
            .select((users::id, users::company_id))
            .load(conn)?;
        let found: Vec<i64> = targets.iter().map(|(id, _)| *id).collect();
        require_all("user", &user_ids, &found)?;

        let companyless = targets
            .iter()
            .filter(|(_, company)| company.is_none())
            .count();
        let now = Utc::now().naive_utc();
        let rows: Vec<NewAssignment> = record_ids
            .iter()
            .flat_map(|&data_record_id| {
                targets.iter().filter_map(move |&(user_id, company_id)| {
                    company_id.map(|company_id| NewAssignment {
                        data_record_id,
                        company_id,
                        assigned_to: Some(user_id),
                        assigned_at: now,
                    })
                })
            })
            .collect();
        let created = ledger::insert_missing(conn, &rows)?;
        let summary = BatchSummary {
            created,
            skipped: rows.len() - created + companyless * record_ids.len(),
        };
        info!(
            user_id = actor.user_id,
            created = summary.created,
            skipped = summary.skipped,
            "batch assigned records to users"
        );
        Ok(summary)
    })
}

/// Claims the record for the actor through one of its company's rows.
pub fn claim_record(
    conn: &mut PgConnection,
    actor: &Actor,
    record_id: i64,
) -> DispatchResult<Assignment> {
    let record = records::require(conn, record_id)?;
    if record.submitter_id == actor.user_id {
        return Err(DispatchError::CannotClaimOwnRecord);
    }
    let Some(company_id) = actor.company_id else {
        return Err(DispatchError::NotClaimable);
    };

    for candidate in ledger::claim_candidates(conn, record_id, company_id, actor.user_id)? {
        match ledger::claim(conn, candidate.id, actor.user_id) {
            Ok(assignment) => {
                info!(
                    record_id,
                    assignment_id = assignment.id,
                    user_id = actor.user_id,
                    company_id,
                    "record claimed"
                );
                return Ok(assignment);
            }
            // Lost this row to another claimer; try the next one.
            Err(
                DispatchError::AlreadyClaimed
                | DispatchError::NotPermitted
                | DispatchError::NotFound(_),
            ) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(DispatchError::NotClaimable)
}

pub fn claim_assignment(
    conn: &mut PgConnection,
    actor: &Actor,
    assignment_id: i64,
) -> DispatchResult<Assignment> {
    let Some(current) = ledger::find(conn, assignment_id)? else {
        return Err(DispatchError::NotFound("assignment"));
    };
    if actor.company_id != Some(current.company_id) {
        return Err(DispatchError::NotPermitted);
    }
    let record = records::require(conn, current.data_record_id)?;
    if record.submitter_id == actor.user_id {
        return Err(DispatchError::CannotClaimOwnRecord);
    }

    let assignment = ledger::claim(conn, assignment_id, actor.user_id)?;
    info!(
        record_id = assignment.data_record_id,
        assignment_id,
        user_id = actor.user_id,
        "assignment claimed"
    );
    Ok(assignment)
}

/// Completes the actor's claimed row for the record.
pub fn complete_record(
    conn: &mut PgConnection,
    actor: &Actor,
    record_id: i64,
) -> DispatchResult<Assignment> {
    records::require(conn, record_id)?;
    let Some(company_id) = actor.company_id else {
        return Err(DispatchError::NotPermitted);
    };
    let rows = ledger::for_record_in_company(conn, record_id, company_id)?;

    let mine = |row: &&Assignment| row.assigned_to == Some(actor.user_id) && row.is_claimed;
    if let Some(open) = rows.iter().filter(mine).find(|row| !row.is_completed) {
        let assignment = ledger::complete(conn, open.id, actor.user_id)?;
        info!(
            record_id,
            assignment_id = assignment.id,
            user_id = actor.user_id,
            "record completed"
        );
        return Ok(assignment);
    }
    Err(explain_record_not_completable(&rows, actor.user_id))
}

fn explain_record_not_completable(rows: &[Assignment], user_id: i64) -> DispatchError {
    if rows
        .iter()
        .any(|row| row.assigned_to == Some(user_id) && row.is_completed)
    {
        DispatchError::AlreadyCompleted
    } else if rows.iter().any(|row| row.is_claimable_by(user_id)) {
        DispatchError::NotClaimedYet
    } else {
        DispatchError::NotPermitted
    }
}

pub fn complete_assignment(
    conn: &mut PgConnection,
    actor: &Actor,
    assignment_id: i64,
) -> DispatchResult<Assignment> {
    let assignment = ledger::complete(conn, assignment_id, actor.user_id)?;
    info!(
        record_id = assignment.data_record_id,
        assignment_id,
        user_id = actor.user_id,
        "assignment completed"
    );
    Ok(assignment)
}

/// Flags the record as a duplicate and completes the actor's claimed row in
/// the same transaction.
pub fn mark_duplicate(
    conn: &mut PgConnection,
    actor: &Actor,
    record_id: i64,
) -> DispatchResult<(DataRecord, Assignment)> {
    let (record, assignment) = conn.transaction::<_, DispatchError, _>(|conn| {
        records::require(conn, record_id)?;
        let company_id = actor.company_id.ok_or(DispatchError::NotPermitted)?;
        let claimed = ledger::lock_claimed_by(conn, record_id, company_id, actor.user_id)?
            .ok_or(DispatchError::NotPermitted)?;
        if claimed.is_completed {
            return Err(DispatchError::AlreadyCompleted);
        }
        let record = records::set_duplicate(conn, record_id, true)?;
        let assignment = ledger::complete(conn, claimed.id, actor.user_id)?;
        Ok((record, assignment))
    })?;

    info!(
        record_id,
        assignment_id = assignment.id,
        user_id = actor.user_id,
        "record marked duplicate"
    );
    Ok((record, assignment))
}

pub fn get_claimable(
    conn: &mut PgConnection,
    actor: &Actor,
    request: PageRequest,
) -> DispatchResult<Page<(Assignment, DataRecord)>> {
    match actor.company_id {
        Some(company_id) => ledger::claimable_page(conn, company_id, actor.user_id, request),
        None => Ok(Page::new(Vec::new(), 0, request)),
    }
}

pub fn get_user_incomplete(
    conn: &mut PgConnection,
    actor: &Actor,
    request: PageRequest,
) -> DispatchResult<Page<(Assignment, DataRecord)>> {
    ledger::incomplete_page(conn, actor.user_id, request)
}

/// A record plus its claim state as seen from the actor's company.
pub fn view_record(
    conn: &mut PgConnection,
    actor: &Actor,
    record_id: i64,
) -> DispatchResult<(DataRecord, ClaimProjection)> {
    let record = records::require(conn, record_id)?;
    let projection = records::claim_projection(conn, record_id, actor.company_id)?;
    Ok((record, projection))
}

/// Admins see every record; everyone else only their own submissions.
pub fn list_records(
    conn: &mut PgConnection,
    actor: &Actor,
    mut filter: records::RecordFilter,
    request: PageRequest,
) -> DispatchResult<Page<DataRecord>> {
    if !actor.is_admin() {
        filter.submitter_id = Some(actor.user_id);
    }
    records::list(conn, &filter, request)
}

pub fn delete_record(conn: &mut PgConnection, actor: &Actor, record_id: i64) -> DispatchResult<()> {
    records::delete_owned(conn, record_id, actor.user_id)?;
    info!(record_id, user_id = actor.user_id, "record deleted");
    Ok(())
}

pub fn list_assignments(
    conn: &mut PgConnection,
    actor: &Actor,
    filter: &ledger::AssignmentFilter,
    request: PageRequest,
) -> DispatchResult<Page<Assignment>> {
    actor.require_admin()?;
    ledger::list(conn, filter, request)
}

pub fn delete_assignment(
    conn: &mut PgConnection,
    actor: &Actor,
    assignment_id: i64,
) -> DispatchResult<()> {
    actor.require_admin()?;
    ledger::delete(conn, assignment_id)?;
    info!(assignment_id, user_id = actor.user_id, "assignment deleted");
    Ok(())
}
