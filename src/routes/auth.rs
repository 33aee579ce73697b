use axum::{extract::State, Json};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    auth::{password, AuthenticatedUser},
    error::{ApiResponse, AppError, AppResult},
    models::{Company, User},
    schema::{companies, users::dsl},
    state::AppState,
};

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Serialize)]
pub struct CompanyResponse {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub is_active: bool,
}

#[derive(Serialize)]
pub struct MeResponse {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub role: String,
    pub company: Option<CompanyResponse>,
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<ApiResponse<LoginResponse>> {
    let mut conn = state.db()?;

    let user: User = dsl::users
        .filter(dsl::username.eq(payload.username.trim()))
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    let valid = password::verify_password(&payload.password, &user.password_hash)
        .map_err(|_| AppError::unauthorized())?;

    if !valid {
        tracing::info!(username = %user.username, "rejected login");
        return Err(AppError::unauthorized());
    }

    let access_token = state
        .jwt
        .generate_token(user.id, &user.username, &user.role)
        .map_err(AppError::from)?;

    tracing::info!(user_id = user.id, "user logged in");
    Ok(ApiResponse::ok(LoginResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: state.jwt.expires_in_seconds(),
    }))
}

pub async fn me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<ApiResponse<MeResponse>> {
    let mut conn = state.db()?;
    let current: User = dsl::users
        .find(user.user_id)
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    let company = match current.company_id {
        Some(company_id) => companies::table
            .find(company_id)
            .first::<Company>(&mut conn)
            .optional()?,
        None => None,
    };

    Ok(ApiResponse::ok(MeResponse {
        id: current.id,
        username: current.username,
        name: current.name,
        role: current.role,
        company: company.map(|company| CompanyResponse {
            id: company.id,
            name: company.name,
            code: company.code,
            is_active: company.is_active,
        }),
    }))
}
