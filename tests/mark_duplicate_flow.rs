mod common;

use anyhow::{anyhow, Result};
use axum::http::StatusCode;
use common::{acquire_db_lock, json_body, TestApp};
use diesel::connection::SimpleConnection;
use leaddesk::dispatch::coordinator::{self, IngestRequest};
use leaddesk::dispatch::{ledger, records, DispatchError};
use leaddesk::models::{Assignment, DataRecord};

struct Fixture {
    record_id: i64,
    company_id: i64,
    worker_id: i64,
    worker_token: String,
}

async fn claimed_record(app: &TestApp) -> Result<Fixture> {
    let company_id = app.insert_company("C1", true).await?;
    let submitter = app.insert_user("submitter", "pw", "user", None).await?;
    let (worker_id, worker_token) = app
        .user_with_token("worker", "processor", Some(company_id))
        .await?;
    let submitter = app.actor(submitter).await?;
    let worker = app.actor(worker_id).await?;

    let record_id = app
        .with_conn(move |conn| {
            let outcome = coordinator::ingest(
                conn,
                &submitter,
                IngestRequest {
                    platform: "douyin".into(),
                    phone: Some("13800000001".into()),
                    ..IngestRequest::default()
                },
            )?;
            coordinator::claim_record(conn, &worker, outcome.record.id)?;
            Ok(outcome.record.id)
        })
        .await?;

    Ok(Fixture {
        record_id,
        company_id,
        worker_id,
        worker_token,
    })
}

async fn load(app: &TestApp, fixture: &Fixture) -> Result<(DataRecord, Assignment)> {
    let (record_id, company_id) = (fixture.record_id, fixture.company_id);
    app.with_conn(move |conn| {
        let record = records::require(conn, record_id)?;
        let assignment = ledger::for_record_in_company(conn, record_id, company_id)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("assignment missing"))?;
        Ok((record, assignment))
    })
    .await
}

#[tokio::test]
async fn mark_duplicate_flags_record_and_completes_claim() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let fixture = claimed_record(&app).await?;

    let response = app
        .post(
            &format!("/api/data-records/{}/mark-duplicate", fixture.record_id),
            Some(&fixture.worker_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["data"]["record"]["is_duplicate"], true);
    assert_eq!(body["data"]["assignment"]["is_completed"], true);

    let (record, assignment) = load(&app, &fixture).await?;
    assert!(record.is_duplicate);
    assert!(assignment.is_completed);
    assert!(assignment.is_claimed);
    assert_eq!(assignment.assigned_to, Some(fixture.worker_id));

    let response = app
        .post(
            &format!("/api/data-records/{}/mark-duplicate", fixture.record_id),
            Some(&fixture.worker_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn mark_duplicate_requires_own_claim() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let fixture = claimed_record(&app).await?;
    let (_, outsider_token) = app
        .user_with_token("outsider", "processor", Some(fixture.company_id))
        .await?;

    let response = app
        .post(
            &format!("/api/data-records/{}/mark-duplicate", fixture.record_id),
            Some(&outsider_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .post(
            "/api/data-records/424242/mark-duplicate",
            Some(&outsider_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let (record, assignment) = load(&app, &fixture).await?;
    assert!(!record.is_duplicate);
    assert!(!assignment.is_completed);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn mark_duplicate_after_completion_is_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let fixture = claimed_record(&app).await?;
    let worker = app.actor(fixture.worker_id).await?;
    let record_id = fixture.record_id;

    let outcome = app
        .with_conn(move |conn| {
            coordinator::complete_record(conn, &worker, record_id)?;
            Ok(coordinator::mark_duplicate(conn, &worker, record_id))
        })
        .await?;
    assert!(matches!(outcome, Err(DispatchError::AlreadyCompleted)));

    let (record, _) = load(&app, &fixture).await?;
    assert!(!record.is_duplicate);

    app.cleanup().await?;
    Ok(())
}

const REJECT_COMPLETION: &str = r#"
CREATE OR REPLACE FUNCTION reject_assignment_completion() RETURNS trigger AS $$
BEGIN
    IF NEW.is_completed THEN
        RAISE EXCEPTION 'assignment completion rejected';
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;
DROP TRIGGER IF EXISTS reject_assignment_completion ON data_record_assignments;
CREATE TRIGGER reject_assignment_completion
    BEFORE UPDATE ON data_record_assignments
    FOR EACH ROW EXECUTE FUNCTION reject_assignment_completion();
"#;

const ALLOW_COMPLETION: &str = r#"
DROP TRIGGER IF EXISTS reject_assignment_completion ON data_record_assignments;
DROP FUNCTION IF EXISTS reject_assignment_completion();
"#;

#[tokio::test]
async fn failed_completion_rolls_back_duplicate_flag() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let fixture = claimed_record(&app).await?;
    let worker = app.actor(fixture.worker_id).await?;
    let record_id = fixture.record_id;

    let outcome = app
        .with_conn(move |conn| {
            conn.batch_execute(REJECT_COMPLETION)?;
            let outcome = coordinator::mark_duplicate(conn, &worker, record_id);
            conn.batch_execute(ALLOW_COMPLETION)?;
            Ok(outcome)
        })
        .await?;
    assert!(matches!(outcome, Err(DispatchError::Database(_))));

    let (record, assignment) = load(&app, &fixture).await?;
    assert!(!record.is_duplicate);
    assert!(!assignment.is_completed);
    assert!(assignment.is_claimed);

    // Once the update goes through, both changes land together.
    let worker = app.actor(fixture.worker_id).await?;
    app.with_conn(move |conn| Ok(coordinator::mark_duplicate(conn, &worker, record_id)?))
        .await?;
    let (record, assignment) = load(&app, &fixture).await?;
    assert!(record.is_duplicate);
    assert!(assignment.is_completed);

    app.cleanup().await?;
    Ok(())
}
