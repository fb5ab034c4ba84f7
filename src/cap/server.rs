//! CAP intake HTTP server (C5).
//!
//! Routing/bootstrap shape ported from `api.rs`'s `build_router`/
//! `start_api_server` pair; the single `POST /` handler's behaviour (the
//! Content-Type gate, the 400/415 status codes, the XML ack body) is
//! ported from `original_source/cap/server.py::index`.

use crate::cap::parser::CapParser;
use crate::types::AlertEvent;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::stats::Stats;

#[derive(Clone)]
pub struct CapIntakeState {
    parser: Arc<CapParser>,
    tx: mpsc::Sender<AlertEvent>,
    stats: Arc<Stats>,
    strict: bool,
}

impl CapIntakeState {
    pub fn new(parser: Arc<CapParser>, tx: mpsc::Sender<AlertEvent>, stats: Arc<Stats>, strict: bool) -> Self {
        Self { parser, tx, stats, strict }
    }
}

fn content_type_ok(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/xml") || ct.starts_with("text/xml"))
        .unwrap_or(false)
}

/// `POST /` — submit a CAP v1.2 bulletin.
async fn intake(State(state): State<CapIntakeState>, headers: HeaderMap, body: Bytes) -> Response {
    state.stats.record_bulletin_received();

    if !content_type_ok(&headers) {
        let msg = format!(
            "invalid Content-Type: {}",
            headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("<missing>")
        );
        if state.strict {
            tracing::error!("{msg}");
            return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
        }
        tracing::warn!("{msg}");
    }

    let event = match state.parser.parse(&body) {
        Ok(event) => event,
        Err(e) => {
            state.stats.record_parse_error();
            warn!(error = %e, "rejected CAP bulletin");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    state.stats.record_bulletin_accepted();
    let ack = state.parser.generate_response(event.sender(), event.identifier(), &event.sent().to_rfc3339());

    match &event {
        AlertEvent::LinkTest { .. } => state.stats.record_link_test(),
        _ => {}
    }

    if state.tx.try_send(event).is_err() {
        state.stats.record_intake_queue_drop();
        warn!("intake queue full, dropping accepted bulletin (ack still returned)");
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        ack,
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

pub fn build_router(state: CapIntakeState) -> Router {
    Router::new()
        .route("/", post(intake))
        .route("/health", get(health))
        .with_state(state)
}

/// Start the CAP intake HTTP server. Returns the `JoinHandle` so the
/// caller can join it alongside the scheduler and supervisor tasks.
pub async fn start_intake_server(
    host: &str,
    port: u16,
    state: CapIntakeState,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "CAP intake server listening");

    let handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "CAP intake server error");
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::parser::CapParser;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> (CapIntakeState, mpsc::Receiver<AlertEvent>) {
        let parser = Arc::new(CapParser::new(true, "cfns.ack", "gateway@test"));
        let (tx, rx) = mpsc::channel(8);
        (CapIntakeState::new(parser, tx, Stats::new(), true), rx)
    }

    #[tokio::test]
    async fn rejects_wrong_content_type_in_strict_mode() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn rejects_malformed_xml_with_400() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/xml")
            .body(Body::from("<not-cap/>"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn accepts_link_test_and_forwards_to_queue() {
        let (state, mut rx) = test_state();
        let app = build_router(state);
        let xml = r#"<?xml version="1.0"?>
<alert xmlns="urn:oasis:names:tc:emergency:cap:1.2">
  <identifier>nl.rws.1</identifier>
  <sender>rws@x</sender>
  <sent>2026-07-26T10:00:00+02:00</sent>
  <status>Test</status>
  <msgType>Alert</msgType>
  <scope>Public</scope>
</alert>"#;
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/xml")
            .body(Body::from(xml))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let ev = rx.try_recv().expect("event forwarded");
        assert!(matches!(ev, AlertEvent::LinkTest { .. }));
    }
}
