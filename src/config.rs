use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

pub const DEFAULT_NOTIFIER_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_JWT_EXPIRY_MINUTES: i64 = 720;
pub const DEFAULT_CONTACT_RESYNC_PACE_MS: u64 = 50;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_expiry_minutes: i64,
    /// Comma-separated list; unset mirrors the request origin.
    pub cors_allowed_origin: Option<String>,
    /// Order endpoint of the legacy CRM. Unset disables the legacy push.
    pub legacy_sync_url: Option<String>,
    /// Contact upload endpoint. Unset disables the contact push.
    pub contact_sync_url: Option<String>,
    pub contact_sync_key: Option<String>,
    pub notifier_timeout_seconds: u64,
    /// Pause between pushes of a bulk contact resync.
    pub contact_resync_pace_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: required_var("DATABASE_URL")?,
            database_max_pool_size: parsed_var("DATABASE_MAX_POOL_SIZE", DEFAULT_MAX_POOL_SIZE)?,
            server_host: non_empty_var("SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            server_port: parsed_var("SERVER_PORT", 3000)?,
            jwt_secret: required_var("JWT_SECRET")?,
            jwt_issuer: non_empty_var("JWT_ISSUER").unwrap_or_else(|| "leaddesk".to_string()),
            jwt_audience: non_empty_var("JWT_AUDIENCE")
                .unwrap_or_else(|| "leaddesk-clients".to_string()),
            jwt_expiry_minutes: parsed_var("JWT_EXPIRY_MINUTES", DEFAULT_JWT_EXPIRY_MINUTES)?,
            cors_allowed_origin: non_empty_var("CORS_ALLOWED_ORIGIN"),
            legacy_sync_url: non_empty_var("LEGACY_SYNC_URL"),
            contact_sync_url: non_empty_var("CONTACT_SYNC_URL"),
            contact_sync_key: non_empty_var("CONTACT_SYNC_KEY"),
            notifier_timeout_seconds: parsed_var(
                "NOTIFIER_TIMEOUT_SECONDS",
                DEFAULT_NOTIFIER_TIMEOUT_SECONDS,
            )?,
            contact_resync_pace_ms: parsed_var(
                "CONTACT_RESYNC_PACE_MS",
                DEFAULT_CONTACT_RESYNC_PACE_MS,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.database_max_pool_size > 0,
            "DATABASE_MAX_POOL_SIZE must be at least 1"
        );
        ensure!(
            self.jwt_expiry_minutes > 0,
            "JWT_EXPIRY_MINUTES must be positive"
        );
        ensure!(
            self.notifier_timeout_seconds > 0,
            "NOTIFIER_TIMEOUT_SECONDS must be positive"
        );
        for (key, value) in [
            ("LEGACY_SYNC_URL", &self.legacy_sync_url),
            ("CONTACT_SYNC_URL", &self.contact_sync_url),
        ] {
            if let Some(url) = value {
                Url::parse(url).with_context(|| format!("{key} must be an absolute URL"))?;
            }
        }
        Ok(())
    }

    pub fn resync_pace(&self) -> Duration {
        Duration::from_millis(self.contact_resync_pace_ms)
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }
}

fn required_var(key: &str) -> Result<String> {
    non_empty_var(key).ok_or_else(|| anyhow!("{key} must be set"))
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    parse_or(key, non_empty_var(key).as_deref(), default)
}

fn parse_or<T>(key: &str, raw: Option<&str>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|err| anyhow!("{key} has invalid value {raw:?}: {err}")),
        None => Ok(default),
    }
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
