//! Record intake, fan-out and the claim/complete state machine.
//!
//! Every operation takes the acting user explicitly and runs its
//! precondition check and mutation as one conditional statement (or one
//! transaction), so concurrent callers observe exactly one winner.

use diesel::prelude::*;
use diesel::PgConnection;
use thiserror::Error;

use crate::models::{User, ROLE_ADMIN};
use crate::schema::users;

pub mod coordinator;
pub mod dedup;
pub mod ledger;
pub mod reconcile;
pub mod records;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("cannot claim a record you submitted")]
    CannotClaimOwnRecord,
    #[error("record is not claimable or has already been claimed")]
    NotClaimable,
    #[error("assignment has already been claimed")]
    AlreadyClaimed,
    #[error("assignment must be claimed before it can be completed")]
    NotClaimedYet,
    #[error("not permitted to act on this assignment")]
    NotPermitted,
    #[error("assignment has already been completed")]
    AlreadyCompleted,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Caller-facing classification of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Internal,
}

impl DispatchError {
    pub fn validation(message: impl Into<String>) -> Self {
        DispatchError::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Validation(_) => ErrorKind::Validation,
            DispatchError::NotFound(_) => ErrorKind::NotFound,
            DispatchError::CannotClaimOwnRecord
            | DispatchError::NotClaimable
            | DispatchError::AlreadyClaimed
            | DispatchError::NotClaimedYet
            | DispatchError::AlreadyCompleted => ErrorKind::Conflict,
            DispatchError::NotPermitted => ErrorKind::Forbidden,
            DispatchError::Database(diesel::result::Error::NotFound) => ErrorKind::NotFound,
            DispatchError::Database(_) | DispatchError::Pool(_) => ErrorKind::Internal,
        }
    }
}

/// The user on whose behalf a coordinator operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub company_id: Option<i64>,
    pub role: String,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    pub fn require_admin(&self) -> DispatchResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(DispatchError::NotPermitted)
        }
    }
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            company_id: user.company_id,
            role: user.role.clone(),
        }
    }
}

/// Resolves the current company and role of an authenticated user.
pub fn load_actor(conn: &mut PgConnection, user_id: i64) -> DispatchResult<Actor> {
    let user: User = users::table
        .find(user_id)
        .first(conn)
        .optional()?
        .ok_or(DispatchError::NotFound("user"))?;
    Ok(Actor::from(&user))
}
