use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    auth::jwt::JwtService,
    config::AppConfig,
    db::PgPool,
    dispatch::{self, Actor},
    error::{AppError, AppResult},
    notifier::ContactSink,
};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub notifier: Arc<dyn ContactSink>,
    pub jwt: JwtService,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        notifier: Arc<dyn ContactSink>,
        jwt: JwtService,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            notifier,
            jwt,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }

    /// Resolves the current company and role of a token subject.
    pub fn actor(&self, conn: &mut PgConnection, user_id: i64) -> AppResult<Actor> {
        dispatch::load_actor(conn, user_id).map_err(|err| match err {
            dispatch::DispatchError::NotFound(_) => AppError::unauthorized(),
            other => AppError::from(other),
        })
    }
}
