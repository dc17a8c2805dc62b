//! WebSocket relay between browser clients and automation sessions.
//!
//! # Routes
//!
//! - `GET /ws` upgrades to the relay protocol. The first frame must be
//!   `hello { token }`; the server answers `welcome` or `rejected`.
//! - `GET /healthz` reports liveness and the number of registered sessions.
//! - `POST /api/tokens` issues an operator token. It requires
//!   `Authorization: Bearer <admin key>`.
//!
//! Closing a socket only detaches it. Sessions end on `close_session`,
//! on failure, or when the supervisor reclaims them.

mod connection;
mod forwarder;

use std::future::Future;
use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tenantshell_protocol::{ErrorBody, ErrorCode};
use tenantshell_runtime::SessionRegistry;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::credential_store::CredentialStore;
use crate::error::Result;
use crate::operators::OperatorDirectory;
use crate::tokens::TokenStore;

/// Everything a connection handler needs.
pub struct RelayState {
	pub registry: Arc<SessionRegistry>,
	pub tokens: TokenStore,
	pub operators: OperatorDirectory,
	pub credentials: Arc<dyn CredentialStore>,
	pub audit: Arc<dyn AuditSink>,
	/// `None` disables token issuance.
	pub admin_key: Option<String>,
}

pub fn router(state: Arc<RelayState>) -> Router {
	Router::new()
		.route("/ws", get(ws_handler))
		.route("/healthz", get(healthz))
		.route("/api/tokens", post(issue_token))
		.with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve(listener: TcpListener, state: Arc<RelayState>, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
	axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await?;
	Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
	ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

async fn healthz(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
	Json(json!({ "ok": true, "sessions": state.registry.len() }))
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
	operator: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
	pub token: String,
	pub expires_in_secs: u64,
	pub operator: String,
}

fn reject(status: StatusCode, code: ErrorCode, message: &str) -> Response {
	(status, Json(ErrorBody::new(code, message))).into_response()
}

async fn issue_token(State(state): State<Arc<RelayState>>, headers: HeaderMap, Json(request): Json<TokenRequest>) -> Response {
	let Some(admin_key) = state.admin_key.as_deref() else {
		return reject(StatusCode::SERVICE_UNAVAILABLE, ErrorCode::Forbidden, "token issuance is disabled");
	};
	let presented = headers
		.get(header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "));
	if !presented.is_some_and(|key| keys_match(key, admin_key)) {
		warn!(target = "tenantshell.relay", "token request with invalid admin key");
		return reject(StatusCode::UNAUTHORIZED, ErrorCode::Forbidden, "invalid admin key");
	}
	if !state.operators.is_known(&request.operator) {
		return reject(StatusCode::FORBIDDEN, ErrorCode::Forbidden, "unknown operator");
	}

	let token = state.tokens.issue(&request.operator);
	info!(target = "tenantshell.relay", operator = %request.operator, "operator token issued");
	Json(TokenResponse {
		token,
		expires_in_secs: state.tokens.ttl().as_secs(),
		operator: request.operator,
	})
	.into_response()
}

/// Compares without short-circuiting on the first differing byte.
fn keys_match(presented: &str, expected: &str) -> bool {
	let (a, b) = (presented.as_bytes(), expected.as_bytes());
	a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
