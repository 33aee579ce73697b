pub mod jwt;
pub mod password;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::{Deserialize, Serialize};

use crate::{dispatch::Actor, error::AppError, state::AppState};

/// Identity carried by a verified bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub username: String,
    pub role: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
            return Ok(user.clone());
        }

        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        let claims = state.jwt.verify_token(bearer.token()).map_err(|err| {
            tracing::debug!(error = %err, "rejected bearer token");
            AppError::unauthorized()
        })?;

        let user = AuthenticatedUser {
            user_id: claims.sub,
            username: claims.username,
            role: claims.role,
        };
        parts.extensions.insert(user.clone());
        Ok(user)
    }
}

/// The token subject with company and role re-read from the database, so a
/// user moved between companies acts for the new one on the next request.
#[derive(Debug, Clone)]
pub struct CurrentActor(pub Actor);

#[async_trait]
impl FromRequestParts<AppState> for CurrentActor {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = AuthenticatedUser::from_request_parts(parts, state).await?;
        let mut conn = state.db()?;
        let actor = state.actor(&mut conn, user.user_id)?;
        Ok(CurrentActor(actor))
    }
}
