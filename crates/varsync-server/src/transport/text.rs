//! Request/response text API, served on TCP and on the local socket.
//!
//! | route | body / query | result |
//! |---|---|---|
//! | `POST /api/sessions` | | `{session}` |
//! | `POST /api/{session}` | message, array or `{messages}` | `{session, result?, pending?}` |
//! | `GET /api/{session}/poll` | `?wait=250ms` | `{session, pending?}` |
//!
//! The caller is identified by the `x-varsync-connection` header, `api` when
//! absent.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;
use varsync_core::message::{parse_wait, Batch};
use varsync_core::{ConnectionId, Response};
use varsync_engine::{Origin, Role};

use super::TransportError;
use crate::handler;
use crate::server::AppState;

pub const CONNECTION_HEADER: &str = "x-varsync-connection";

/// Serve HTTP/1.1 on an already-detected socket connection.
pub async fn serve_stream<S>(stream: S, router: Router) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(router))
        .with_upgrades()
        .await?;
    Ok(())
}

fn connection_id(headers: &HeaderMap) -> ConnectionId {
    headers
        .get(CONNECTION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ConnectionId::from_raw)
        .unwrap_or_else(|| ConnectionId::from_raw("api"))
}

fn reply(status: StatusCode, response: Response) -> HttpResponse {
    (status, Json(response)).into_response()
}

pub async fn create_session(State(state): State<AppState>) -> HttpResponse {
    match state.manager.create().await {
        Ok(entry) => reply(
            StatusCode::CREATED,
            Response {
                session: Some(entry.wire_id.clone()),
                ..Response::default()
            },
        ),
        Err(e) => {
            warn!(error = %e, "session creation failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, Response::error(e.to_string()))
        }
    }
}

pub async fn post_batch(
    State(state): State<AppState>,
    Path(session): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    let Some(entry) = state.manager.get(&session) else {
        return reply(
            StatusCode::NOT_FOUND,
            Response::error(TransportError::SessionNotFound(session).to_string()),
        );
    };
    let batch = match Batch::parse(&body) {
        Ok(batch) => batch,
        Err(e) => return reply(StatusCode::BAD_REQUEST, Response::error(e.to_string())),
    };

    let id = connection_id(&headers);
    let connection = state.manager.hub().attach_polling(&session, &id, Role::Api, None);
    let origin = Origin::new(id, Role::Api).with_user_event(batch.user_event);
    let max_wait = state.config.max_poll_wait();
    let outcome = match handler::handle_batch(&entry, origin, batch.messages, max_wait).await {
        Ok(outcome) => outcome,
        Err(e) => return reply(StatusCode::INTERNAL_SERVER_ERROR, Response::error(e.to_string())),
    };

    let pending = match outcome.poll {
        Some(wait) => connection.backlog().poll(wait).await,
        None => connection.backlog().drain(),
    };
    connection.touch();
    reply(
        StatusCode::OK,
        Response {
            session: Some(session),
            result: outcome.result(),
            pending,
            error: None,
        },
    )
}

#[derive(Debug, Deserialize)]
pub struct PollParams {
    pub wait: Option<String>,
}

pub async fn poll(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Query(params): Query<PollParams>,
    headers: HeaderMap,
) -> HttpResponse {
    if state.manager.get(&session).is_none() {
        return reply(
            StatusCode::NOT_FOUND,
            Response::error(TransportError::SessionNotFound(session).to_string()),
        );
    }
    let wait = match params.wait.as_deref().map(parse_wait).transpose() {
        Ok(wait) => wait.unwrap_or(Duration::ZERO).min(state.config.max_poll_wait()),
        Err(e) => return reply(StatusCode::BAD_REQUEST, Response::error(e.to_string())),
    };
    let connection = state
        .manager
        .hub()
        .attach_polling(&session, &connection_id(&headers), Role::Api, None);
    let pending = connection.backlog().poll(wait).await;
    connection.touch();
    reply(
        StatusCode::OK,
        Response {
            session: Some(session),
            pending,
            ..Response::default()
        },
    )
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.manager.count(),
        "connections": state.manager.hub().count(),
    }))
}
