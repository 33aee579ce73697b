//! Backfill of duplicate flags for phone-only records.
//!
//! Among records without an image reference that share a phone number, the
//! earliest one is the original and every later one is a duplicate.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::Serialize;
use tracing::info;

use super::{DispatchError, DispatchResult};
use crate::schema::data_records;

/// Minimal row shape the reconciliation needs.
#[derive(Debug, Clone, PartialEq, Eq, Queryable)]
pub struct PhoneRecord {
    pub id: i64,
    pub phone: String,
    pub created_at: NaiveDateTime,
    pub is_duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhoneGroup {
    pub phone: String,
    pub total_records: usize,
    pub duplicate_records: usize,
    pub earliest_record_id: i64,
    pub earliest_created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ReconcileSummary {
    pub total_scanned: usize,
    pub unique_phones: usize,
    pub duplicate_phones: usize,
    pub duplicate_records: usize,
    pub records_updated: usize,
    pub details: Vec<PhoneGroup>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Plan {
    summary: ReconcileSummary,
    flag: Vec<i64>,
    unflag: Vec<i64>,
}

/// Expects rows ordered by phone, then creation time, then id.
fn plan(rows: &[PhoneRecord]) -> Plan {
    let mut plan = Plan::default();
    plan.summary.total_scanned = rows.len();

    for group in rows.chunk_by(|a, b| a.phone == b.phone) {
        plan.summary.unique_phones += 1;
        if group.len() < 2 {
            continue;
        }
        let (earliest, later) = (&group[0], &group[1..]);
        if earliest.is_duplicate {
            plan.unflag.push(earliest.id);
        }
        let newly_flagged = later.iter().filter(|row| !row.is_duplicate);
        plan.flag.extend(newly_flagged.map(|row| row.id));

        plan.summary.duplicate_phones += 1;
        plan.summary.duplicate_records += later.len();
        plan.summary.details.push(PhoneGroup {
            phone: earliest.phone.clone(),
            total_records: group.len(),
            duplicate_records: later.len(),
            earliest_record_id: earliest.id,
            earliest_created_at: earliest.created_at,
        });
    }
    plan.summary.records_updated = plan.flag.len() + plan.unflag.len();
    plan
}

/// Rewrites the duplicate flags of every phone-only record in one transaction.
pub fn reconcile_phone_duplicates(conn: &mut PgConnection) -> DispatchResult<ReconcileSummary> {
    let summary = conn.transaction::<_, DispatchError, _>(|conn| {
        let rows: Vec<PhoneRecord> = data_records::table
            .filter(data_records::image_url.is_null())
            .filter(data_records::phone.is_not_null())
            .filter(data_records::phone.ne(""))
            .select((
                data_records::id,
                data_records::phone.assume_not_null(),
                data_records::created_at,
                data_records::is_duplicate,
            ))
            .order((
                data_records::phone.asc(),
                data_records::created_at.asc(),
                data_records::id.asc(),
            ))
            .for_update()
            .load(conn)?;

        let Plan {
            summary,
            flag,
            unflag,
        } = plan(&rows);

        if !flag.is_empty() {
            diesel::update(data_records::table.filter(data_records::id.eq_any(&flag)))
                .set(data_records::is_duplicate.eq(true))
                .execute(conn)?;
        }
        if !unflag.is_empty() {
            diesel::update(data_records::table.filter(data_records::id.eq_any(&unflag)))
                .set(data_records::is_duplicate.eq(false))
                .execute(conn)?;
        }
        Ok(summary)
    })?;

    info!(
        total_scanned = summary.total_scanned,
        duplicate_phones = summary.duplicate_phones,
        records_updated = summary.records_updated,
        "phone duplicate reconciliation finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate};

    use super::*;

    fn at(minutes: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap()
            + Duration::minutes(minutes)
    }

    fn rec(id: i64, phone: &str, minutes: i64, is_duplicate: bool) -> PhoneRecord {
        PhoneRecord {
            id,
            phone: phone.to_string(),
            created_at: at(minutes),
            is_duplicate,
        }
    }

    #[test]
    fn empty_input_plans_nothing() {
        assert_eq!(plan(&[]), Plan::default());
    }

    #[test]
    fn earliest_record_stays_original_and_the_rest_are_flagged() {
        let rows = vec![
            rec(7, "13800000001", 0, true),
            rec(3, "13800000001", 5, false),
            rec(9, "13800000001", 9, true),
            rec(4, "13900000002", 1, false),
        ];
        let plan = plan(&rows);
        assert_eq!(plan.unflag, vec![7]);
        assert_eq!(plan.flag, vec![3]);
        assert_eq!(plan.summary.total_scanned, 4);
        assert_eq!(plan.summary.unique_phones, 2);
        assert_eq!(plan.summary.duplicate_phones, 1);
        assert_eq!(plan.summary.duplicate_records, 2);
        assert_eq!(plan.summary.records_updated, 2);
        assert_eq!(
            plan.summary.details,
            vec![PhoneGroup {
                phone: "13800000001".into(),
                total_records: 3,
                duplicate_records: 2,
                earliest_record_id: 7,
                earliest_created_at: at(0),
            }]
        );
    }

    #[test]
    fn singleton_groups_are_left_alone() {
        let plan = plan(&[rec(1, "13800000001", 0, true)]);
        assert!(plan.flag.is_empty());
        assert!(plan.unflag.is_empty());
        assert_eq!(plan.summary.unique_phones, 1);
        assert_eq!(plan.summary.duplicate_phones, 0);
    }

    #[test]
    fn already_consistent_groups_need_no_updates() {
        let plan = plan(&[
            rec(1, "13800000001", 0, false),
            rec(2, "13800000001", 1, true),
        ]);
        assert_eq!(plan.summary.records_updated, 0);
        assert_eq!(plan.summary.duplicate_records, 1);
    }
}
