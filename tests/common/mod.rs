#![allow(dead_code)]

use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use http_body_util::BodyExt;
use leaddesk::auth::{jwt::JwtService, password};
use leaddesk::config::{AppConfig, DEFAULT_NOTIFIER_TIMEOUT_SECONDS};
use leaddesk::db::{self, PgPool};
use leaddesk::dispatch::{self, Actor};
use leaddesk::models::{NewCompany, NewUser};
use leaddesk::notifier::{ContactSink, Delivery, LegacyOrder, NotifyError};
use leaddesk::routes;
use leaddesk::schema::{companies, users};
use leaddesk::state::AppState;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tower::util::ServiceExt;

/// Large enough for the concurrent-claim tests to hold one connection per thread.
pub const TEST_POOL_SIZE: u32 = 16;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Records every outbound push instead of sending it.
#[derive(Default)]
pub struct FakeSink {
    contacts: StdMutex<Vec<String>>,
    rejected_contacts: StdMutex<Vec<String>>,
    legacy: StdMutex<Vec<LegacyOrder>>,
    fail_legacy: AtomicBool,
    legacy_delay_ms: AtomicU64,
}

#[async_trait]
impl ContactSink for FakeSink {
    async fn push_contact(&self, phone: &str) -> Result<Delivery, NotifyError> {
        self.contacts
            .lock()
            .map_err(|_| NotifyError::Store("fake sink poisoned".into()))?
            .push(phone.to_string());
        let rejected = self
            .rejected_contacts
            .lock()
            .map_err(|_| NotifyError::Store("fake sink poisoned".into()))?
            .iter()
            .any(|rejected| rejected == phone);
        if rejected {
            return Err(NotifyError::Status {
                endpoint: "contact",
                status: 400,
                body: "invalid contact".into(),
            });
        }
        Ok(Delivery::Sent)
    }

    async fn push_legacy(&self, order: &LegacyOrder) -> Result<Delivery, NotifyError> {
        let delay = self.legacy_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.legacy
            .lock()
            .map_err(|_| NotifyError::Store("fake sink poisoned".into()))?
            .push(order.clone());
        if self.fail_legacy.load(Ordering::SeqCst) {
            return Err(NotifyError::Status {
                endpoint: "legacy",
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(Delivery::Sent)
    }
}

impl FakeSink {
    pub fn contacts(&self) -> Vec<String> {
        self.contacts.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn legacy_orders(&self) -> Vec<LegacyOrder> {
        self.legacy.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn fail_legacy(&self, fail: bool) {
        self.fail_legacy.store(fail, Ordering::SeqCst);
    }

    /// Makes the contact endpoint answer 400 for `phone`.
    pub fn reject_contact(&self, phone: &str) {
        if let Ok(mut rejected) = self.rejected_contacts.lock() {
            rejected.push(phone.to_string());
        }
    }

    /// Holds every legacy push for `delay` before answering.
    pub fn delay_legacy(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.legacy_delay_ms.store(millis, Ordering::SeqCst);
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    sink: Arc<FakeSink>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = AppConfig {
            database_url,
            database_max_pool_size: TEST_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            cors_allowed_origin: None,
            legacy_sync_url: None,
            contact_sync_url: None,
            contact_sync_key: None,
            notifier_timeout_seconds: DEFAULT_NOTIFIER_TIMEOUT_SECONDS,
            contact_resync_pace_ms: 0,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let sink = Arc::new(FakeSink::default());
        let sink_for_state: Arc<dyn ContactSink> = sink.clone();
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool, config, sink_for_state, jwt);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            sink,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(truncate_all).await
    }

    pub fn sink(&self) -> Arc<FakeSink> {
        self.sink.clone()
    }

    pub fn pool(&self) -> PgPool {
        self.state.pool.clone()
    }

    pub async fn insert_company(&self, code: &str, is_active: bool) -> Result<i64> {
        let company = NewCompany {
            name: format!("{code} Ltd"),
            code: code.to_string(),
            is_active,
        };
        self.with_conn(move |conn| {
            diesel::insert_into(companies::table)
                .values(&company)
                .returning(companies::id)
                .get_result(conn)
                .context("failed to insert company")
        })
        .await
    }

    pub async fn insert_user(
        &self,
        username: &str,
        password: &str,
        role: &str,
        company_id: Option<i64>,
    ) -> Result<i64> {
        let user = NewUser {
            username: username.to_string(),
            name: username.to_string(),
            password_hash: password::hash_password(password)?,
            role: role.to_string(),
            company_id,
        };
        self.with_conn(move |conn| {
            diesel::insert_into(users::table)
                .values(&user)
                .returning(users::id)
                .get_result(conn)
                .context("failed to insert user")
        })
        .await
    }

    /// Inserts a user and returns a bearer token for them.
    pub async fn user_with_token(
        &self,
        username: &str,
        role: &str,
        company_id: Option<i64>,
    ) -> Result<(i64, String)> {
        let id = self
            .insert_user(username, "password", role, company_id)
            .await?;
        let token = self.state.jwt.generate_token(id, username, role)?;
        Ok((id, token))
    }

    pub async fn actor(&self, user_id: i64) -> Result<Actor> {
        self.with_conn(move |conn| Ok(dispatch::load_actor(conn, user_id)?))
            .await
    }

    pub async fn login_token(&self, username: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            username: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json(
                "/api/auth/login",
                &LoginPayload { username, password },
                None,
            )
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        let body = json_body(response).await?;
        body["data"]["access_token"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("login response carried no token: {body}"))
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn post(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::POST).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn json_body(response: hyper::Response<Body>) -> Result<Value> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).context("response body is not JSON")
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        db::run_migrations(&mut conn)?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE data_record_assignments, data_records, users, companies RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
