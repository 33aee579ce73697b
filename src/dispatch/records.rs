use chrono::NaiveDateTime;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel::PgConnection;

use super::dedup::DedupStrategy;
use super::{DispatchError, DispatchResult};
use crate::models::{DataRecord, NewDataRecord, Platform};
use crate::pagination::{Page, PageRequest, SortDirection};
use crate::schema::{data_record_assignments, data_records};

pub fn find(conn: &mut PgConnection, record_id: i64) -> DispatchResult<Option<DataRecord>> {
    Ok(data_records::table
        .find(record_id)
        .first::<DataRecord>(conn)
        .optional()?)
}

pub fn require(conn: &mut PgConnection, record_id: i64) -> DispatchResult<DataRecord> {
    find(conn, record_id)?.ok_or(DispatchError::NotFound("record"))
}

pub fn insert(conn: &mut PgConnection, new_record: &NewDataRecord) -> DispatchResult<DataRecord> {
    Ok(diesel::insert_into(data_records::table)
        .values(new_record)
        .get_result(conn)?)
}

/// Holds a transaction-scoped advisory lock on `key` until commit/rollback.
pub fn lock_key(conn: &mut PgConnection, key: &str) -> DispatchResult<()> {
    diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind::<Text, _>(key)
        .execute(conn)?;
    Ok(())
}

/// Creation time of the most recent existing record matching the strategy.
pub fn latest_match_created_at(
    conn: &mut PgConnection,
    strategy: &DedupStrategy<'_>,
) -> DispatchResult<Option<NaiveDateTime>> {
    let latest = match strategy {
        DedupStrategy::Phone(phone) => data_records::table
            .filter(data_records::phone.eq(*phone))
            .order((data_records::created_at.desc(), data_records::id.desc()))
            .select(data_records::created_at)
            .first::<NaiveDateTime>(conn)
            .optional()?,
        DedupStrategy::PlatformId {
            platform,
            platform_id,
        } => data_records::table
            .filter(data_records::platform.eq(platform.as_str()))
            .filter(data_records::platform_id.eq(*platform_id))
            .order((data_records::created_at.desc(), data_records::id.desc()))
            .select(data_records::created_at)
            .first::<NaiveDateTime>(conn)
            .optional()?,
        DedupStrategy::Unchecked => None,
    };
    Ok(latest)
}

pub fn set_duplicate(
    conn: &mut PgConnection,
    record_id: i64,
    is_duplicate: bool,
) -> DispatchResult<DataRecord> {
    diesel::update(data_records::table.find(record_id))
        .set(data_records::is_duplicate.eq(is_duplicate))
        .get_result::<DataRecord>(conn)
        .optional()?
        .ok_or(DispatchError::NotFound("record"))
}

pub fn mark_synced(conn: &mut PgConnection, record_id: i64) -> DispatchResult<()> {
    diesel::update(data_records::table.find(record_id))
        .set(data_records::synced_to_external.eq(true))
        .execute(conn)?;
    Ok(())
}

/// Whether some other record with this phone already reached the legacy system.
pub fn phone_already_synced(
    conn: &mut PgConnection,
    phone: &str,
    excluding_record_id: i64,
) -> DispatchResult<bool> {
    let existing = data_records::table
        .filter(data_records::phone.eq(phone))
        .filter(data_records::id.ne(excluding_record_id))
        .filter(data_records::synced_to_external.eq(true))
        .select(data_records::id)
        .first::<i64>(conn)
        .optional()?;
    Ok(existing.is_some())
}

/// Listing filters; every field narrows the result.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub id: Option<i64>,
    pub submitter_id: Option<i64>,
    pub platform: Option<Platform>,
    pub is_duplicate: Option<bool>,
    /// Any company row claimed, or none.
    pub is_claimed: Option<bool>,
    /// Any company row completed, or none.
    pub is_completed: Option<bool>,
    /// Substring of `platform_id`.
    pub search: Option<String>,
    /// Substring of `phone`.
    pub phone: Option<String>,
    pub created_from: Option<NaiveDateTime>,
    pub created_until: Option<NaiveDateTime>,
}

fn contains_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn filtered_query(filter: &RecordFilter) -> data_records::BoxedQuery<'static, Pg> {
    use crate::schema::data_record_assignments as dra;

    let mut query = data_records::table.into_boxed();
    if let Some(id) = filter.id {
        query = query.filter(data_records::id.eq(id));
    }
    if let Some(submitter_id) = filter.submitter_id {
        query = query.filter(data_records::submitter_id.eq(submitter_id));
    }
    if let Some(platform) = filter.platform {
        query = query.filter(data_records::platform.eq(platform.as_str()));
    }
    if let Some(duplicate) = filter.is_duplicate {
        query = query.filter(data_records::is_duplicate.eq(duplicate));
    }
    if let Some(claimed) = filter.is_claimed {
        let claimed_ids = dra::table
            .filter(dra::is_claimed.eq(true))
            .select(dra::data_record_id);
        query = if claimed {
            query.filter(data_records::id.eq_any(claimed_ids))
        } else {
            query.filter(diesel::dsl::not(data_records::id.eq_any(claimed_ids)))
        };
    }
    if let Some(completed) = filter.is_completed {
        let completed_ids = dra::table
            .filter(dra::is_completed.eq(true))
            .select(dra::data_record_id);
        query = if completed {
            query.filter(data_records::id.eq_any(completed_ids))
        } else {
            query.filter(diesel::dsl::not(data_records::id.eq_any(completed_ids)))
        };
    }
    if let Some(search) = filter.search.as_deref() {
        query = query.filter(data_records::platform_id.like(contains_pattern(search)));
    }
    if let Some(phone) = filter.phone.as_deref() {
        query = query.filter(data_records::phone.like(contains_pattern(phone)));
    }
    if let Some(from) = filter.created_from {
        query = query.filter(data_records::created_at.ge(from));
    }
    if let Some(until) = filter.created_until {
        query = query.filter(data_records::created_at.le(until));
    }
    query
}

/// One page of records, newest first unless the request says otherwise.
pub fn list(
    conn: &mut PgConnection,
    filter: &RecordFilter,
    request: PageRequest,
) -> DispatchResult<Page<DataRecord>> {
    let total: i64 = filtered_query(filter).count().get_result(conn)?;
    let ordered = match request.direction {
        SortDirection::Asc => {
            filtered_query(filter).order((data_records::created_at.asc(), data_records::id.asc()))
        }
        SortDirection::Desc => {
            filtered_query(filter).order((data_records::created_at.desc(), data_records::id.desc()))
        }
    };
    let items = ordered
        .offset(request.offset())
        .limit(request.limit())
        .load::<DataRecord>(conn)?;
    Ok(Page::new(items, total, request))
}

/// Original (non-duplicate) records that carry a phone.
pub fn count_contacts(conn: &mut PgConnection) -> DispatchResult<i64> {
    Ok(data_records::table
        .filter(data_records::is_duplicate.eq(false))
        .filter(data_records::phone.is_not_null())
        .count()
        .get_result(conn)?)
}

/// Next batch of `(id, phone)` for original records with a phone, after `after_id`.
pub fn contacts_after(
    conn: &mut PgConnection,
    after_id: i64,
    limit: i64,
) -> DispatchResult<Vec<(i64, String)>> {
    Ok(data_records::table
        .filter(data_records::is_duplicate.eq(false))
        .filter(data_records::phone.is_not_null())
        .filter(data_records::id.gt(after_id))
        .order(data_records::id.asc())
        .limit(limit)
        .select((data_records::id, data_records::phone.assume_not_null()))
        .load(conn)?)
}

/// Deletes a record on behalf of its submitter; assignments cascade.
pub fn delete_owned(
    conn: &mut PgConnection,
    record_id: i64,
    submitter_id: i64,
) -> DispatchResult<()> {
    let record = require(conn, record_id)?;
    if record.submitter_id != submitter_id {
        return Err(DispatchError::NotPermitted);
    }
    diesel::delete(data_records::table.find(record_id)).execute(conn)?;
    Ok(())
}

/// Record-level claim state derived from the assignment ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClaimProjection {
    pub is_claimed: bool,
    pub is_completed: bool,
    pub claimer_id: Option<i64>,
}

/// Projects the ledger onto one record, optionally limited to one company.
pub fn claim_projection(
    conn: &mut PgConnection,
    record_id: i64,
    company_id: Option<i64>,
) -> DispatchResult<ClaimProjection> {
    let mut query = data_record_assignments::table
        .filter(data_record_assignments::data_record_id.eq(record_id))
        .filter(data_record_assignments::is_claimed.eq(true))
        .select((
            data_record_assignments::assigned_to,
            data_record_assignments::is_completed,
        ))
        .order(data_record_assignments::claimed_at.asc())
        .into_boxed();
    if let Some(company_id) = company_id {
        query = query.filter(data_record_assignments::company_id.eq(company_id));
    }
    let claims: Vec<(Option<i64>, bool)> = query.load(conn)?;
    Ok(project_claims(&claims))
}

fn project_claims(claims: &[(Option<i64>, bool)]) -> ClaimProjection {
    ClaimProjection {
        is_claimed: !claims.is_empty(),
        is_completed: claims.iter().any(|(_, completed)| *completed),
        claimer_id: claims.first().and_then(|(claimer, _)| *claimer),
    }
}
