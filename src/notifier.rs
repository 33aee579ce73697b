//! Best-effort push of newly ingested phone numbers to external systems.
//!
//! Two endpoints are involved. The contact endpoint receives every phone
//! number. The legacy order endpoint receives a phone only until one record
//! carrying it has been delivered there; a successful legacy delivery sets the
//! record's `synced_to_external` flag. Nothing here ever fails an ingest.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use diesel::Connection;
use reqwest::{Client, Response};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::db::PgPool;
use crate::dispatch::{records, DispatchError, DispatchResult};
use crate::models::{DataRecord, Platform};

/// Status code the legacy system uses for leads pushed by this service.
pub const LEGACY_ORDER_STATUS: u8 = 12;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{endpoint} endpoint timed out")]
    Timeout { endpoint: &'static str },
    #[error("{endpoint} endpoint request failed: {source}")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} endpoint answered {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
    #[error("record store unavailable: {0}")]
    Store(String),
}

impl NotifyError {
    fn from_reqwest(endpoint: &'static str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            NotifyError::Timeout { endpoint }
        } else {
            NotifyError::Transport { endpoint, source }
        }
    }
}

/// Whether a push actually left the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Disabled,
}

/// Order-shaped payload understood by the legacy system. Only the phone and
/// the channel label carry information; the other fields must be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyOrder {
    pub sn: String,
    pub sn_info: String,
    pub buy_nick: String,
    pub buy_id: String,
    pub buy_price: String,
    pub sell_name: String,
    pub create_time: String,
    pub pay_time: String,
    pub info: String,
    pub mobile: String,
    pub addr: String,
    pub buyer_name: String,
    pub remark: String,
    pub order_status: String,
    pub status: u8,
}

impl LegacyOrder {
    pub fn new(phone: &str, platform: Platform) -> Self {
        Self {
            sn: phone.to_string(),
            sn_info: String::new(),
            buy_nick: String::new(),
            buy_id: String::new(),
            buy_price: String::new(),
            sell_name: platform.label().to_string(),
            create_time: String::new(),
            pay_time: String::new(),
            info: String::new(),
            mobile: phone.to_string(),
            addr: String::new(),
            buyer_name: String::new(),
            remark: String::new(),
            order_status: String::new(),
            status: LEGACY_ORDER_STATUS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactUpload<'a> {
    pub key: &'a str,
    pub contact: &'a str,
}

#[async_trait]
pub trait ContactSink: Send + Sync + 'static {
    async fn push_contact(&self, phone: &str) -> Result<Delivery, NotifyError>;

    async fn push_legacy(&self, order: &LegacyOrder) -> Result<Delivery, NotifyError>;
}

/// Pushes over HTTP. An endpoint without a URL is skipped and reported as
/// [`Delivery::Disabled`].
pub struct HttpContactSink {
    client: Client,
    legacy_url: Option<String>,
    contact_url: Option<String>,
    contact_key: String,
}

impl HttpContactSink {
    pub fn new(
        legacy_url: Option<String>,
        contact_url: Option<String>,
        contact_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("leaddesk/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build notifier HTTP client")?;
        Ok(Self {
            client,
            legacy_url,
            contact_url,
            contact_key: contact_key.unwrap_or_default(),
        })
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Self::new(
            config.legacy_sync_url.clone(),
            config.contact_sync_url.clone(),
            config.contact_sync_key.clone(),
            Duration::from_secs(config.notifier_timeout_seconds),
        )
    }
}

async fn require_success(endpoint: &'static str, response: Response) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Status {
        endpoint,
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ContactSink for HttpContactSink {
    async fn push_contact(&self, phone: &str) -> Result<Delivery, NotifyError> {
        const ENDPOINT: &str = "contact";
        let Some(url) = self.contact_url.as_deref() else {
            return Ok(Delivery::Disabled);
        };
        let upload = ContactUpload {
            key: &self.contact_key,
            contact: phone,
        };

        let response = self
            .client
            .post(url)
            .form(&upload)
            .send()
            .await
            .map_err(|err| NotifyError::from_reqwest(ENDPOINT, err))?;
        match require_success(ENDPOINT, response).await {
            Ok(()) => Ok(Delivery::Sent),
            Err(rejected) => {
                warn!(error = %rejected, "contact form upload rejected, resending as JSON");
                let response = self
                    .client
                    .post(url)
                    .json(&upload)
                    .send()
                    .await
                    .map_err(|err| NotifyError::from_reqwest(ENDPOINT, err))?;
                require_success(ENDPOINT, response).await?;
                Ok(Delivery::Sent)
            }
        }
    }

    async fn push_legacy(&self, order: &LegacyOrder) -> Result<Delivery, NotifyError> {
        const ENDPOINT: &str = "legacy";
        let Some(url) = self.legacy_url.as_deref() else {
            return Ok(Delivery::Disabled);
        };
        let response = self
            .client
            .post(url)
            .json(order)
            .send()
            .await
            .map_err(|err| NotifyError::from_reqwest(ENDPOINT, err))?;
        require_success(ENDPOINT, response).await?;
        Ok(Delivery::Sent)
    }
}

async fn with_store<T, F>(pool: &PgPool, f: F) -> Result<T, NotifyError>
where
    T: Send + 'static,
    F: FnOnce(&mut diesel::PgConnection) -> DispatchResult<T> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|err| NotifyError::Store(err.to_string()))?;
        f(&mut conn).map_err(|err| NotifyError::Store(err.to_string()))
    })
    .await
    .map_err(|err| NotifyError::Store(err.to_string()))?
}

/// Advisory lock key serializing legacy pushes for one phone number.
pub fn legacy_lock_key(phone: &str) -> String {
    format!("legacy:{phone}")
}

#[derive(Debug)]
enum LegacyOutcome {
    AlreadySynced,
    Synced,
    Disabled,
    Failed(NotifyError),
}

/// Checks, pushes and marks under one per-phone lock, so concurrent records
/// sharing a phone produce at most one legacy order. The lock is held for the
/// duration of the HTTP call.
async fn push_legacy_once(
    pool: &PgPool,
    sink: Arc<dyn ContactSink>,
    record_id: i64,
    phone: String,
    platform: Platform,
) -> Result<LegacyOutcome, NotifyError> {
    let runtime = Handle::current();
    with_store(pool, move |conn| {
        conn.transaction::<_, DispatchError, _>(|conn| {
            records::lock_key(conn, &legacy_lock_key(&phone))?;
            if records::phone_already_synced(conn, &phone, record_id)? {
                return Ok(LegacyOutcome::AlreadySynced);
            }
            let order = LegacyOrder::new(&phone, platform);
            match runtime.block_on(sink.push_legacy(&order)) {
                Ok(Delivery::Sent) => {
                    records::mark_synced(conn, record_id)?;
                    Ok(LegacyOutcome::Synced)
                }
                Ok(Delivery::Disabled) => Ok(LegacyOutcome::Disabled),
                Err(err) => Ok(LegacyOutcome::Failed(err)),
            }
        })
    })
    .await
}

/// Pushes a freshly stored record's phone number outward.
///
/// Every failure is logged and swallowed. The only persisted effect is the
/// `synced_to_external` flag after a successful legacy delivery.
pub async fn sync_new_record(pool: PgPool, sink: Arc<dyn ContactSink>, record: DataRecord) {
    let record_id = record.id;
    let Some(phone) = record.phone.filter(|phone| !phone.is_empty()) else {
        debug!(record_id, "record has no phone, skipping outbound sync");
        return;
    };

    match sink.push_contact(&phone).await {
        Ok(Delivery::Sent) => info!(record_id, phone = %phone, "contact pushed"),
        Ok(Delivery::Disabled) => debug!(record_id, "contact push disabled"),
        Err(err) => warn!(record_id, phone = %phone, error = %err, "contact push failed"),
    }

    let platform = match record.platform.parse::<Platform>() {
        Ok(platform) => platform,
        Err(err) => {
            error!(record_id, error = %err, "stored platform is unknown, skipping legacy push");
            return;
        }
    };

    match push_legacy_once(&pool, sink, record_id, phone.clone(), platform).await {
        Ok(LegacyOutcome::AlreadySynced) => {
            info!(record_id, phone = %phone, "phone already synced, skipping legacy push")
        }
        Ok(LegacyOutcome::Synced) => {
            info!(record_id, phone = %phone, "record synced to legacy system")
        }
        Ok(LegacyOutcome::Disabled) => debug!(record_id, "legacy push disabled"),
        Ok(LegacyOutcome::Failed(err)) => {
            warn!(record_id, phone = %phone, error = %err, "legacy push failed")
        }
        Err(err) => error!(record_id, error = %err, "legacy sync state unavailable"),
    }
}

/// Runs [`sync_new_record`] in the background.
pub fn spawn_sync(pool: PgPool, sink: Arc<dyn ContactSink>, record: DataRecord) -> JoinHandle<()> {
    tokio::spawn(sync_new_record(pool, sink, record))
}

/// Records read per query during a bulk contact resync.
pub const RESYNC_BATCH_SIZE: i64 = 100;
/// Pause between two contact pushes of a bulk resync.
pub const DEFAULT_RESYNC_PACE: Duration = Duration::from_millis(50);
/// Failures reported back in a [`ResyncSummary`]; the rest are only logged.
pub const MAX_REPORTED_FAILURES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResyncFailure {
    pub record_id: i64,
    pub phone: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResyncSummary {
    pub total_records: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub success_rate: f64,
    pub duration_seconds: f64,
    pub failures: Vec<ResyncFailure>,
}

impl ResyncSummary {
    fn finish(mut self, started: Instant) -> Self {
        self.success_rate = if self.total_records == 0 {
            0.0
        } else {
            hundredths(self.success_count as f64 * 100.0 / self.total_records as f64)
        };
        self.duration_seconds = hundredths(started.elapsed().as_secs_f64());
        self
    }
}

fn hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Pushes the phone of every non-duplicate record to the contact endpoint
/// again, oldest first, pausing `pace` between pushes.
///
/// Individual push failures are counted, not returned; only a store failure
/// aborts the run.
pub async fn resync_contacts(
    pool: PgPool,
    sink: Arc<dyn ContactSink>,
    pace: Duration,
) -> Result<ResyncSummary, NotifyError> {
    let started = Instant::now();
    let total = with_store(&pool, records::count_contacts).await?;
    let mut summary = ResyncSummary {
        total_records: usize::try_from(total).unwrap_or_default(),
        ..ResyncSummary::default()
    };
    info!(
        total_records = summary.total_records,
        "contact resync started"
    );

    let mut after_id = 0;
    loop {
        let batch = with_store(&pool, move |conn| {
            records::contacts_after(conn, after_id, RESYNC_BATCH_SIZE)
        })
        .await?;
        let Some(&(last_id, _)) = batch.last() else {
            break;
        };
        after_id = last_id;

        for (record_id, phone) in batch {
            let phone = phone.trim();
            if phone.is_empty() {
                summary.skipped_count += 1;
                continue;
            }
            match sink.push_contact(phone).await {
                Ok(Delivery::Sent) => summary.success_count += 1,
                Ok(Delivery::Disabled) => summary.skipped_count += 1,
                Err(err) => {
                    warn!(record_id, phone, error = %err, "contact resync push failed");
                    summary.failure_count += 1;
                    if summary.failures.len() < MAX_REPORTED_FAILURES {
                        summary.failures.push(ResyncFailure {
                            record_id,
                            phone: phone.to_string(),
                            error: err.to_string(),
                        });
                    }
                }
            }
            if !pace.is_zero() {
                tokio::time::sleep(pace).await;
            }
        }
    }

    let summary = summary.finish(started);
    info!(
        total_records = summary.total_records,
        success_count = summary.success_count,
        failure_count = summary.failure_count,
        skipped_count = summary.skipped_count,
        "contact resync finished"
    );
    Ok(summary)
}
