//! HTTP handlers for login attempts and status inspection

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::ErrorResponse;
use crate::health::health;
use crate::lockout::AuthOutcome;
use crate::state::AppState;

/// Routes served by `lockout serve`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(state)
}

/// `POST /login` body
#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// `POST /login` response body
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginResponse {
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<u64>,
}

impl From<AuthOutcome> for LoginResponse {
    fn from(outcome: AuthOutcome) -> Self {
        let attempt_count = match outcome {
            AuthOutcome::Invalid { attempt_count } => Some(attempt_count),
            _ => None,
        };
        Self {
            result: outcome.code().to_string(),
            attempt_count,
        }
    }
}

fn outcome_status(outcome: &AuthOutcome) -> StatusCode {
    match outcome {
        AuthOutcome::Success => StatusCode::OK,
        AuthOutcome::Invalid { .. } => StatusCode::UNAUTHORIZED,
        AuthOutcome::Locked => StatusCode::LOCKED,
        AuthOutcome::NotFound => StatusCode::NOT_FOUND,
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    let status = StatusCode::BAD_REQUEST;
    (status, Json(ErrorResponse::with_code(status, "BAD_REQUEST", message))).into_response()
}

/// Present and not blank
fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, Response> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(bad_request(format!("'{}' is required", field))),
    }
}

async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let identity = match required(&request.identity, "identity") {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    // Empty credentials are a plain mismatch, not a malformed request
    let Some(credential) = request.credential.as_deref() else {
        return bad_request("'credential' is required");
    };

    match state.coordinator().authenticate(identity, credential).await {
        Ok(outcome) => (outcome_status(&outcome), Json(LoginResponse::from(outcome))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /status` query
#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub identity: Option<String>,
}

async fn status(State(state): State<AppState>, Query(query): Query<StatusQuery>) -> Response {
    let identity = match required(&query.identity, "identity") {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    match state.coordinator().status(identity).await {
        Ok(report) => (StatusCode::OK, report.to_string()).into_response(),
        Err(e) => e.into_response(),
    }
}
