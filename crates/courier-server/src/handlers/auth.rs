//! Auth and contact handlers

use super::logged;
use crate::auth::display_name;
use crate::config::AppState;
use crate::error::{Error, Result};
use crate::models::User;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct PhoneRequest {
    pub phone: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub phone: String,
    pub otp: String,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub verified: bool,
    /// `None` for a verified phone that is not registered yet.
    pub user: Option<User>,
    pub created: bool,
}

#[derive(Debug, Deserialize)]
pub struct ContactsRequest {
    pub phones: Vec<String>,
}

/// POST /auth/send-otp
pub async fn send_otp(
    State(state): State<AppState>,
    Json(req): Json<PhoneRequest>,
) -> Result<Json<Value>> {
    info!("POST /auth/send-otp - {}", req.phone);
    state
        .otp
        .issue(&req.phone)
        .await
        .map_err(logged("send-otp"))?;
    Ok(Json(json!({ "success": true })))
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    info!("POST /auth/login - {}", req.phone);
    let phone = req.phone.trim();
    state.otp.verify(phone, &req.otp).map_err(logged("login"))?;

    if let Some(user) = state.users.find(phone).await.map_err(logged("login"))? {
        info!("User {} logged in", phone);
        return Ok(Json(LoginResponse {
            verified: true,
            user: Some(user),
            created: false,
        }));
    }

    let has_names = [&req.first_name, &req.last_name]
        .iter()
        .all(|part| part.as_deref().map_or(false, |p| !p.trim().is_empty()));
    if !has_names {
        return Ok(Json(LoginResponse {
            verified: true,
            user: None,
            created: false,
        }));
    }

    let mut user = User::new(
        phone,
        display_name(
            req.first_name.as_deref(),
            req.middle_name.as_deref(),
            req.last_name.as_deref(),
        ),
    );
    user.email = req.email.filter(|e| !e.trim().is_empty());
    let user = state.users.create(user).await.map_err(logged("login"))?;
    info!("User {} registered as {:?}", user.phone, user.name);

    Ok(Json(LoginResponse {
        verified: true,
        user: Some(user),
        created: true,
    }))
}

/// POST /auth/check-user
pub async fn check_user(
    State(state): State<AppState>,
    Json(req): Json<PhoneRequest>,
) -> Result<Json<Value>> {
    info!("POST /auth/check-user - {}", req.phone);
    let exists = state
        .users
        .find(req.phone.trim())
        .await
        .map_err(logged("check-user"))?
        .is_some();
    Ok(Json(json!({ "exists": exists })))
}

/// POST /contacts/check
pub async fn check_contacts(
    State(state): State<AppState>,
    Json(req): Json<ContactsRequest>,
) -> Result<Json<Value>> {
    info!("POST /contacts/check - {} phones", req.phones.len());
    if req.phones.is_empty() {
        return Err(Error::ValidationFailed("phones must not be empty".into()));
    }
    let registered = state
        .coordinator
        .check_contacts(&req.phones)
        .await
        .map_err(logged("check-contacts"))?;
    Ok(Json(json!({ "registered": registered })))
}

/// GET /contacts/{phone}
pub async fn list_contacts(
    Path(phone): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<User>>> {
    info!("GET /contacts/{}", phone);
    let contacts = state
        .coordinator
        .contacts_of(&phone)
        .await
        .map_err(logged("contacts"))?;
    Ok(Json(contacts))
}
