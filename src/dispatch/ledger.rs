//! The assignment ledger: one row per (record, company, optional user).
//!
//! State transitions are single conditional UPDATEs keyed on the row id. A
//! zero-row update means the precondition no longer holds; the row is then
//! re-read only to explain the failure, never to decide a retry.

use chrono::{NaiveDateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::PgConnection;

use super::{DispatchError, DispatchResult};
use crate::models::{Assignment, DataRecord, NewAssignment};
use crate::pagination::{Page, PageRequest, SortDirection};
use crate::schema::{data_record_assignments as dra, data_records};

type AssignmentWithRecordQuery = diesel::dsl::IntoBoxed<
    'static,
    diesel::dsl::InnerJoin<dra::table, data_records::table>,
    Pg,
>;

pub fn find(conn: &mut PgConnection, assignment_id: i64) -> DispatchResult<Option<Assignment>> {
    Ok(dra::table
        .find(assignment_id)
        .first::<Assignment>(conn)
        .optional()?)
}

/// Inserts rows, silently skipping any whose (record, company, user) triple exists.
pub fn insert_missing(conn: &mut PgConnection, rows: &[NewAssignment]) -> DispatchResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    Ok(diesel::insert_into(dra::table)
        .values(rows)
        .on_conflict_do_nothing()
        .execute(conn)?)
}

/// Company ids among `company_ids` that already hold any row for the record.
pub fn companies_holding(
    conn: &mut PgConnection,
    record_id: i64,
    company_ids: &[i64],
) -> DispatchResult<Vec<i64>> {
    Ok(dra::table
        .filter(dra::data_record_id.eq(record_id))
        .filter(dra::company_id.eq_any(company_ids))
        .select(dra::company_id)
        .distinct()
        .load(conn)?)
}

/// Takes an unclaimed row for `user_id`.
///
/// Winning sets `is_claimed`, `claimed_at` and fills `assigned_to` when it was
/// empty. Exactly one of several concurrent callers can match the predicate.
pub fn claim(
    conn: &mut PgConnection,
    assignment_id: i64,
    user_id: i64,
) -> DispatchResult<Assignment> {
    let now = Utc::now().naive_utc();
    let target = dra::table
        .filter(dra::id.eq(assignment_id))
        .filter(dra::is_claimed.eq(false))
        .filter(dra::assigned_to.is_null().or(dra::assigned_to.eq(user_id)));

    // The predicate limits assigned_to to NULL or the caller, so writing the
    // caller is coalesce(assigned_to, caller). SET expressions see the old row.
    let updated = diesel::update(target)
        .set((
            dra::is_claimed.eq(true),
            dra::claimed_at.eq(Some(now)),
            dra::assigned_on_claim.eq(dra::assigned_to.is_null()),
            dra::assigned_to.eq(Some(user_id)),
        ))
        .get_result::<Assignment>(conn)
        .optional();

    match updated {
        Ok(Some(assignment)) => Ok(assignment),
        Ok(None) => {
            let current = find(conn, assignment_id)?;
            Err(explain_claim_failure(current.as_ref(), user_id))
        }
        // The caller already holds another row for this record and company.
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            Err(DispatchError::NotClaimable)
        }
        Err(err) => Err(err.into()),
    }
}

fn explain_claim_failure(current: Option<&Assignment>, user_id: i64) -> DispatchError {
    let Some(current) = current else {
        return DispatchError::NotFound("assignment");
    };
    match current.assigned_to {
        Some(owner) if owner != user_id && !current.assigned_on_claim => {
            DispatchError::NotPermitted
        }
        _ if current.is_claimed => DispatchError::AlreadyClaimed,
        Some(owner) if owner != user_id => DispatchError::NotPermitted,
        _ => DispatchError::AlreadyClaimed,
    }
}

/// Finishes a row the caller has claimed.
pub fn complete(
    conn: &mut PgConnection,
    assignment_id: i64,
    user_id: i64,
) -> DispatchResult<Assignment> {
    let target = dra::table
        .filter(dra::id.eq(assignment_id))
        .filter(dra::is_claimed.eq(true))
        .filter(dra::assigned_to.eq(user_id))
        .filter(dra::is_completed.eq(false));

    let updated = diesel::update(target)
        .set(dra::is_completed.eq(true))
        .get_result::<Assignment>(conn)
        .optional()?;

    match updated {
        Some(assignment) => Ok(assignment),
        None => {
            let current = find(conn, assignment_id)?;
            Err(explain_complete_failure(current.as_ref(), user_id))
        }
    }
}

fn explain_complete_failure(current: Option<&Assignment>, user_id: i64) -> DispatchError {
    match current {
        None => DispatchError::NotFound("assignment"),
        Some(row) if !row.is_claimed => DispatchError::NotClaimedYet,
        Some(row) if row.assigned_to != Some(user_id) => DispatchError::NotPermitted,
        Some(_) => DispatchError::AlreadyCompleted,
    }
}

/// Unclaimed rows of `record_id` in `company_id` that `user_id` may take,
/// rows pre-assigned to the user first.
pub fn claim_candidates(
    conn: &mut PgConnection,
    record_id: i64,
    company_id: i64,
    user_id: i64,
) -> DispatchResult<Vec<Assignment>> {
    Ok(dra::table
        .filter(dra::data_record_id.eq(record_id))
        .filter(dra::company_id.eq(company_id))
        .filter(dra::is_claimed.eq(false))
        .filter(dra::assigned_to.is_null().or(dra::assigned_to.eq(user_id)))
        .order((dra::assigned_to.is_null().asc(), dra::id.asc()))
        .load(conn)?)
}

/// Every row of `record_id` visible to a user of `company_id`.
pub fn for_record_in_company(
    conn: &mut PgConnection,
    record_id: i64,
    company_id: i64,
) -> DispatchResult<Vec<Assignment>> {
    Ok(dra::table
        .filter(dra::data_record_id.eq(record_id))
        .filter(dra::company_id.eq(company_id))
        .order(dra::id.asc())
        .load(conn)?)
}

/// Locks the caller's claimed row for the record, if any, until the
/// surrounding transaction ends.
pub fn lock_claimed_by(
    conn: &mut PgConnection,
    record_id: i64,
    company_id: i64,
    user_id: i64,
) -> DispatchResult<Option<Assignment>> {
    Ok(dra::table
        .filter(dra::data_record_id.eq(record_id))
        .filter(dra::company_id.eq(company_id))
        .filter(dra::assigned_to.eq(user_id))
        .filter(dra::is_claimed.eq(true))
        .order(dra::is_completed.asc())
        .for_update()
        .first::<Assignment>(conn)
        .optional()?)
}

fn claimable_query(company_id: i64, user_id: i64) -> AssignmentWithRecordQuery {
    dra::table
        .inner_join(data_records::table)
        .filter(dra::company_id.eq(company_id))
        .filter(dra::is_claimed.eq(false))
        .filter(dra::assigned_to.is_null().or(dra::assigned_to.eq(user_id)))
        .into_boxed()
}

fn incomplete_query(user_id: i64) -> AssignmentWithRecordQuery {
    dra::table
        .inner_join(data_records::table)
        .filter(dra::assigned_to.eq(user_id))
        .filter(dra::is_claimed.eq(true))
        .filter(dra::is_completed.eq(false))
        .into_boxed()
}

pub fn claimable_page(
    conn: &mut PgConnection,
    company_id: i64,
    user_id: i64,
    request: PageRequest,
) -> DispatchResult<Page<(Assignment, DataRecord)>> {
    let total: i64 = claimable_query(company_id, user_id)
        .count()
        .get_result(conn)?;
    let ordered = match request.direction {
        SortDirection::Asc => {
            claimable_query(company_id, user_id).order((dra::assigned_at.asc(), dra::id.asc()))
        }
        SortDirection::Desc => {
            claimable_query(company_id, user_id).order((dra::assigned_at.desc(), dra::id.desc()))
        }
    };
    let items = ordered
        .offset(request.offset())
        .limit(request.limit())
        .load::<(Assignment, DataRecord)>(conn)?;
    Ok(Page::new(items, total, request))
}

pub fn incomplete_page(
    conn: &mut PgConnection,
    user_id: i64,
    request: PageRequest,
) -> DispatchResult<Page<(Assignment, DataRecord)>> {
    let total: i64 = incomplete_query(user_id).count().get_result(conn)?;
    let ordered = match request.direction {
        SortDirection::Asc => {
            incomplete_query(user_id).order((dra::claimed_at.asc(), dra::id.asc()))
        }
        SortDirection::Desc => {
            incomplete_query(user_id).order((dra::claimed_at.desc(), dra::id.desc()))
        }
    };
    let items = ordered
        .offset(request.offset())
        .limit(request.limit())
        .load::<(Assignment, DataRecord)>(conn)?;
    Ok(Page::new(items, total, request))
}

/// Administrative listing filters; every field narrows the result.
#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    pub company_id: Option<i64>,
    pub assigned_to: Option<i64>,
    pub is_claimed: Option<bool>,
    pub is_completed: Option<bool>,
    pub assigned_from: Option<NaiveDateTime>,
    pub assigned_until: Option<NaiveDateTime>,
}

fn filtered_query(filter: &AssignmentFilter) -> dra::BoxedQuery<'static, Pg> {
    let mut query = dra::table.into_boxed();
    if let Some(company_id) = filter.company_id {
        query = query.filter(dra::company_id.eq(company_id));
    }
    if let Some(user_id) = filter.assigned_to {
        query = query.filter(dra::assigned_to.eq(user_id));
    }
    if let Some(claimed) = filter.is_claimed {
        query = query.filter(dra::is_claimed.eq(claimed));
    }
    if let Some(completed) = filter.is_completed {
        query = query.filter(dra::is_completed.eq(completed));
    }
    if let Some(from) = filter.assigned_from {
        query = query.filter(dra::assigned_at.ge(from));
    }
    if let Some(until) = filter.assigned_until {
        query = query.filter(dra::assigned_at.le(until));
    }
    query
}

pub fn list(
    conn: &mut PgConnection,
    filter: &AssignmentFilter,
    request: PageRequest,
) -> DispatchResult<Page<Assignment>> {
    let total: i64 = filtered_query(filter).count().get_result(conn)?;
    let ordered = match request.direction {
        SortDirection::Asc => filtered_query(filter).order((dra::assigned_at.asc(), dra::id.asc())),
        SortDirection::Desc => {
            filtered_query(filter).order((dra::assigned_at.desc(), dra::id.desc()))
        }
    };
    let items = ordered
        .offset(request.offset())
        .limit(request.limit())
        .load::<Assignment>(conn)?;
    Ok(Page::new(items, total, request))
}

pub fn delete(conn: &mut PgConnection, assignment_id: i64) -> DispatchResult<()> {
    let deleted = diesel::delete(dra::table.find(assignment_id)).execute(conn)?;
    if deleted == 0 {
        return Err(DispatchError::NotFound("assignment"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn row(assigned_to: Option<i64>, is_claimed: bool, is_completed: bool) -> Assignment {
        let at = NaiveDate::from_ymd_opt(2025, 10, 13)
            .and_then(|d| d.and_hms_opt(8, 0, 0))
            .unwrap();
        Assignment {
            id: 1,
            data_record_id: 10,
            company_id: 3,
            assigned_to,
            assigned_on_claim: false,
            is_claimed,
            claimed_at: is_claimed.then_some(at),
            is_completed,
            assigned_at: at,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn claim_of_missing_row_is_not_found() {
        assert!(matches!(
            explain_claim_failure(None, 5),
            DispatchError::NotFound("assignment")
        ));
    }

    #[test]
    fn losing_an_open_claim_race_reports_already_claimed() {
        let mut taken = row(Some(8), true, false);
        taken.assigned_on_claim = true;
        assert!(matches!(
            explain_claim_failure(Some(&taken), 5),
            DispatchError::AlreadyClaimed
        ));
    }

    #[test]
    fn preassigned_rows_reject_other_users_before_and_after_claim() {
        let waiting = row(Some(8), false, false);
        assert!(matches!(
            explain_claim_failure(Some(&waiting), 5),
            DispatchError::NotPermitted
        ));
        let claimed = row(Some(8), true, false);
        assert!(matches!(
            explain_claim_failure(Some(&claimed), 5),
            DispatchError::NotPermitted
        ));
    }

    #[test]
    fn reclaiming_own_row_reports_already_claimed() {
        let mine = row(Some(5), true, false);
        assert!(matches!(
            explain_claim_failure(Some(&mine), 5),
            DispatchError::AlreadyClaimed
        ));
    }

    #[test]
    fn complete_failures_follow_precondition_order() {
        assert!(matches!(
            explain_complete_failure(None, 5),
            DispatchError::NotFound(_)
        ));
        assert!(matches!(
            explain_complete_failure(Some(&row(None, false, false)), 5),
            DispatchError::NotClaimedYet
        ));
        assert!(matches!(
            explain_complete_failure(Some(&row(Some(8), true, false)), 5),
            DispatchError::NotPermitted
        ));
        assert!(matches!(
            explain_complete_failure(Some(&row(Some(5), true, true)), 5),
            DispatchError::AlreadyCompleted
        ));
    }

    #[test]
    fn claimability_respects_preassignment() {
        assert!(row(None, false, false).is_claimable_by(5));
        assert!(row(Some(5), false, false).is_claimable_by(5));
        assert!(!row(Some(8), false, false).is_claimable_by(5));
        assert!(!row(Some(5), true, false).is_claimable_by(5));
    }
}
