//! HTTP and WebSocket transport.
//!
//! Thin adapters over the [`SpeakerManager`]: decode the wire formats,
//! resolve tenant identifiers, translate errors to status codes or typed
//! control messages. All speaker routes live under `/api/v1/speaker`.

mod http;
mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::Error;
use crate::manager::SpeakerManager;

/// Maximum accepted multipart upload, enough for several minutes of WAV.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Tenant identifiers populated by upstream auth middleware, read from
/// request extensions as the lowest-precedence source.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user_id: String,
    pub agent_id: String,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SpeakerManager>,
    pub config: Arc<Config>,
}

/// Binds the configured listen address and serves until ctrl-c.
pub async fn serve(manager: Arc<SpeakerManager>, config: Arc<Config>) -> crate::Result<()> {
    let app = router(manager, config.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "voiceid server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
        })
        .await?;
    Ok(())
}

/// Builds the service router.
pub fn router(manager: Arc<SpeakerManager>, config: Arc<Config>) -> Router {
    let state = AppState { manager, config };

    let speaker = Router::new()
        .route("/register", post(http::register))
        .route("/identify", post(http::identify))
        .route("/verify/:speaker_id", post(http::verify))
        .route("/list", get(http::list))
        .route("/:speaker_id", delete(http::delete_speaker))
        .route("/stats", get(http::stats))
        .route("/register_base64", post(http::register_base64))
        .route("/identify_base64", post(http::identify_base64))
        .route("/identify_ws", get(ws::identify_ws));

    Router::new()
        .nest("/api/v1/speaker", speaker)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error wrapper that renders as `{"error": ...}` with the mapped status.
pub(crate) struct ApiError(pub Error);

pub(crate) type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::TenantMismatch(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Unimplemented(_) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Resolves one tenant identifier with the uniform precedence:
/// header > query parameter > form field > auth context. Returns an empty
/// string when no source provides it.
pub(crate) fn tenant_id(
    headers: &HeaderMap,
    header_name: &str,
    query: &HashMap<String, String>,
    key: &str,
    form: &HashMap<String, String>,
    auth: Option<&str>,
) -> String {
    if let Some(v) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
        if !v.is_empty() {
            return v.to_string();
        }
    }
    if let Some(v) = query.get(key) {
        if !v.is_empty() {
            return v.clone();
        }
    }
    if let Some(v) = form.get(key) {
        if !v.is_empty() {
            return v.clone();
        }
    }
    if let Some(v) = auth {
        if !v.is_empty() {
            return v.to_string();
        }
    }
    String::new()
}

/// Parses a positive threshold override from query or form, in that
/// order. Invalid or non-positive values are ignored.
pub(crate) fn threshold_override(
    query: &HashMap<String, String>,
    form: &HashMap<String, String>,
) -> Option<f32> {
    query
        .get("threshold")
        .or_else(|| form.get("threshold"))
        .and_then(|s| s.parse::<f32>().ok())
        .filter(|&t| t > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, value.parse().unwrap());
        headers
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn header_wins_over_everything() {
        let headers = headers_with("x-user-id", "header-uid");
        let query = map(&[("uid", "query-uid")]);
        let form = map(&[("uid", "form-uid")]);
        let uid = tenant_id(&headers, "x-user-id", &query, "uid", &form, Some("auth-uid"));
        assert_eq!(uid, "header-uid");
    }

    #[test]
    fn precedence_chain_falls_through() {
        let headers = HeaderMap::new();
        let query = map(&[("uid", "query-uid")]);
        let form = map(&[("uid", "form-uid")]);
        assert_eq!(
            tenant_id(&headers, "x-user-id", &query, "uid", &form, None),
            "query-uid"
        );

        let empty_query = HashMap::new();
        assert_eq!(
            tenant_id(&headers, "x-user-id", &empty_query, "uid", &form, None),
            "form-uid"
        );

        let empty_form = HashMap::new();
        assert_eq!(
            tenant_id(
                &headers,
                "x-user-id",
                &empty_query,
                "uid",
                &empty_form,
                Some("auth-uid")
            ),
            "auth-uid"
        );

        assert_eq!(
            tenant_id(&headers, "x-user-id", &empty_query, "uid", &empty_form, None),
            ""
        );
    }

    #[test]
    fn empty_header_does_not_shadow() {
        let headers = headers_with("x-user-id", "");
        let query = map(&[("uid", "query-uid")]);
        let form = HashMap::new();
        assert_eq!(
            tenant_id(&headers, "x-user-id", &query, "uid", &form, None),
            "query-uid"
        );
    }

    #[test]
    fn threshold_parsing() {
        let empty = HashMap::new();
        assert_eq!(threshold_override(&map(&[("threshold", "0.7")]), &empty), Some(0.7));
        // Form is the fallback source.
        assert_eq!(threshold_override(&empty, &map(&[("threshold", "0.6")])), Some(0.6));
        // Query outranks form.
        assert_eq!(
            threshold_override(&map(&[("threshold", "0.7")]), &map(&[("threshold", "0.6")])),
            Some(0.7)
        );
        // Invalid and non-positive are ignored.
        assert_eq!(threshold_override(&map(&[("threshold", "abc")]), &empty), None);
        assert_eq!(threshold_override(&map(&[("threshold", "0")]), &empty), None);
        assert_eq!(threshold_override(&map(&[("threshold", "-0.5")]), &empty), None);
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(status_for(&Error::missing("uid")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&Error::TenantMismatch("speaker s1".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&Error::NotFound("speaker s1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::Unimplemented("Base64 API")),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            status_for(&Error::Store("rpc failed".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&Error::InsufficientAudio),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
