use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use diesel::prelude::*;
use tracing_subscriber::EnvFilter;

use leaddesk::{
    auth::password,
    config::AppConfig,
    db,
    dispatch::reconcile,
    models::{Company, NewCompany, NewUser, ROLES},
    notifier::{self, ContactSink, HttpContactSink},
    schema::{companies, users},
};

const USAGE: &str = "Usage:
  maintenance reconcile-phone-duplicates
  maintenance resync-contacts
  maintenance create-company <code> <name>
  maintenance create-user <username> <password> <role> [company-code]";

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["reconcile-phone-duplicates"] => reconcile_phone_duplicates(),
        ["resync-contacts"] => resync_contacts(),
        ["create-company", code, name] => create_company(code, name),
        ["create-user", username, pass, role] => create_user(username, pass, role, None),
        ["create-user", username, pass, role, company] => {
            create_user(username, pass, role, Some(company))
        }
        [] => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
        [cmd, ..] => {
            eprintln!("Unknown command or arguments: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
    }
}

fn connect() -> Result<(AppConfig, db::PgPool)> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    {
        let mut conn = pool.get().context("failed to get database connection")?;
        db::run_migrations(&mut conn)?;
    }
    Ok((config, pool))
}

fn reconcile_phone_duplicates() -> Result<()> {
    let (_, pool) = connect()?;
    let mut conn = pool.get().context("failed to get database connection")?;
    let summary = reconcile::reconcile_phone_duplicates(&mut conn)
        .context("phone duplicate reconciliation failed")?;

    println!("Phone-only records scanned: {}", summary.total_scanned);
    println!("Distinct phones:            {}", summary.unique_phones);
    println!("Phones with duplicates:     {}", summary.duplicate_phones);
    println!("Duplicate records:          {}", summary.duplicate_records);
    println!("Records updated:            {}", summary.records_updated);
    for group in &summary.details {
        println!(
            "  {} x{} (earliest record {})",
            group.phone, group.total_records, group.earliest_record_id
        );
    }
    Ok(())
}

fn resync_contacts() -> Result<()> {
    let (config, pool) = connect()?;
    if config.contact_sync_url.is_none() {
        bail!("CONTACT_SYNC_URL must be set to resync contacts");
    }
    let sink: Arc<dyn ContactSink> = Arc::new(HttpContactSink::from_config(&config)?);
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let summary = runtime
        .block_on(notifier::resync_contacts(pool, sink, config.resync_pace()))
        .context("contact resync failed")?;

    println!("Records with a phone: {}", summary.total_records);
    println!("Pushed:               {}", summary.success_count);
    println!("Failed:               {}", summary.failure_count);
    println!("Skipped:              {}", summary.skipped_count);
    println!("Success rate:         {:.2}%", summary.success_rate);
    println!("Duration:             {:.2}s", summary.duration_seconds);
    for failure in &summary.failures {
        let (id, phone, error) = (failure.record_id, &failure.phone, &failure.error);
        println!("  record {id} ({phone}): {error}");
    }
    Ok(())
}

fn create_company(code: &str, name: &str) -> Result<()> {
    let (_, pool) = connect()?;
    let mut conn = pool.get().context("failed to get database connection")?;
    let company: Company = diesel::insert_into(companies::table)
        .values(&NewCompany {
            name: name.to_string(),
            code: code.to_string(),
            is_active: true,
        })
        .get_result(&mut conn)
        .with_context(|| format!("failed to create company {code}"))?;
    println!("Created company {} ({})", company.code, company.id);
    Ok(())
}

fn create_user(username: &str, pass: &str, role: &str, company_code: Option<&str>) -> Result<()> {
    if !ROLES.contains(&role) {
        bail!("role must be one of {}", ROLES.join(", "));
    }
    let (_, pool) = connect()?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let company_id = match company_code {
        Some(code) => Some(
            companies::table
                .filter(companies::code.eq(code))
                .select(companies::id)
                .first::<i64>(&mut conn)
                .with_context(|| format!("company {code} not found"))?,
        ),
        None => None,
    };

    let id: i64 = diesel::insert_into(users::table)
        .values(&NewUser {
            username: username.to_string(),
            name: username.to_string(),
            password_hash: password::hash_password(pass)?,
            role: role.to_string(),
            company_id,
        })
        .returning(users::id)
        .get_result(&mut conn)
        .with_context(|| format!("failed to create user {username}"))?;
    println!("Created user {username} ({id})");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
