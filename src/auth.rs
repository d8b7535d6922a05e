use crate::error::{AppError, AppResult};
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    User,
    Pending,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Pending => "pending",
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Admin | Self::User)
    }
}

/// The identity projection handed to pipes and stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: UserRole,
}

#[derive(Clone, Default)]
pub struct AuthState {
    tokens: Arc<DashMap<String, SessionUser>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_token(&self, token: impl Into<String>, user: SessionUser) {
        self.tokens.insert(token.into(), user);
    }

    pub fn authenticate_token(&self, token: &str) -> Option<SessionUser> {
        self.tokens.get(token).map(|entry| entry.value().clone())
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() { None } else { Some(token) }
}

pub fn get_verified_user(headers: &HeaderMap, auth: &AuthState) -> AppResult<SessionUser> {
    let token = bearer_token(headers).ok_or_else(|| {
        AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing bearer token")
    })?;
    let user = auth.authenticate_token(token).ok_or_else(|| {
        AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token")
    })?;
    if !user.role.is_verified() {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "user account is not verified",
        ));
    }
    Ok(user)
}

pub fn get_admin_user(headers: &HeaderMap, auth: &AuthState) -> AppResult<SessionUser> {
    let user = get_verified_user(headers, auth)?;
    if user.role != UserRole::Admin {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            "admin access required",
        ));
    }
    Ok(user)
}
