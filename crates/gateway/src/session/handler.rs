//! SSE transport handlers.
//!
//! `GET /{scope}/sse` authenticates the caller, binds the connection to
//! the path scope, and opens the event stream. The first event announces
//! the message endpoint; every JSON-RPC response after that is delivered
//! as a `message` event.
//!
//! `POST /{scope}/sse?session_id=...` accepts one JSON-RPC frame per
//! request. Frames are acknowledged with HTTP 202 and answered on the
//! stream, so a slow backend never blocks later frames.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audit::{AuditContext, AuditStatus};
use crate::error::GatewayError;
use crate::rpc::{
    InitializeResult, JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse, ToolCallParams,
    ToolsListResult,
};
use crate::state::AppState;

use super::session::{Session, SessionRegistry};

/// Oversized frames close the session after this many offenses.
const MAX_OVERSIZE_STRIKES: u32 = 3;

/// Outbound frames buffered per session before backpressure.
const SESSION_CHANNEL_CAPACITY: usize = 64;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Meta-tools from the v1 surface. Calls to them get a dedicated error
/// pointing at the scoped replacement instead of a generic not-found.
const REMOVED_META_TOOLS: &[&str] = &["find_tools", "call_tool"];

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    session_id: Uuid,
}

/// `GET /{scope}/sse`: handshake and event stream.
pub async fn sse_handler(
    Path(scope): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, (StatusCode, Json<JsonRpcResponse>)> {
    if state.resolver.validate_scope(&scope).is_err() {
        return Err(reject(
            StatusCode::NOT_FOUND,
            GatewayError::Auth(format!("Unknown scope '{scope}'")),
        ));
    }

    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            reject(
                StatusCode::UNAUTHORIZED,
                GatewayError::Auth("Missing Authorization header".to_string()),
            )
        })?;

    let ctx = state
        .resolver
        .resolve(authorization, &scope)
        .map_err(|e| reject(StatusCode::UNAUTHORIZED, e))?;

    let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
    let session = state
        .sessions
        .add(Session::new(scope.clone(), ctx, tx))
        .await;

    // The client learns where to POST frames from the first event.
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/{scope}/sse?session_id={}", session.session_id));

    let responses = ReceiverStream::new(rx).map(|response: JsonRpcResponse| {
        let payload =
            serde_json::to_string(&response).unwrap_or_else(|_| r#"{"jsonrpc":"2.0"}"#.to_string());
        Event::default().event("message").data(payload)
    });

    let events = stream::iter(std::iter::once(endpoint))
        .chain(responses)
        .map(Ok::<_, Infallible>);

    let stream = SessionStream {
        inner: events,
        sessions: state.sessions.clone(),
        session_id: session.session_id,
    };

    Ok(Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEPALIVE_INTERVAL)
                .text("keep-alive"),
        )
        .into_response())
}

/// `POST /{scope}/sse`: one JSON-RPC frame.
///
/// Errors that can be correlated to a session are answered on the
/// stream; a frame for an unknown session has no stream to answer on,
/// so it gets a JSON body instead.
pub async fn message_handler(
    Path(scope): Path<String>,
    Query(query): Query<MessageQuery>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let Some(session) = state.sessions.get(&query.session_id).await else {
        return reject(
            StatusCode::NOT_FOUND,
            GatewayError::Auth(format!("Unknown session '{}'", query.session_id)),
        )
        .into_response();
    };

    // Sessions are bound to the scope they were opened on.
    if session.scope != scope {
        return reject(
            StatusCode::NOT_FOUND,
            GatewayError::Auth(format!(
                "Session is bound to '/{}/sse'",
                session.scope
            )),
        )
        .into_response();
    }

    handle_frame(&state, &session, &body).await;
    StatusCode::ACCEPTED.into_response()
}

/// Process one inbound frame and queue any response on the session stream.
pub(crate) async fn handle_frame(state: &AppState, session: &Arc<Session>, body: &[u8]) {
    if body.len() > state.config.max_frame_bytes {
        let strikes = session.oversize_strike();
        let err = GatewayError::PayloadTooLarge {
            size_bytes: body.len(),
            max_bytes: state.config.max_frame_bytes,
        };
        let _ = session
            .send(JsonRpcResponse::error(Some(JsonRpcId::Null), err.to_rpc_error()))
            .await;
        if strikes >= MAX_OVERSIZE_STRIKES {
            tracing::warn!(
                session_id = %session.session_id,
                strikes,
                "Closing session after repeated oversized frames"
            );
            state.sessions.remove(&session.session_id).await;
        }
        return;
    }

    let request: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            // Malformed frames are answered with a null id and do not
            // terminate the session.
            let _ = session
                .send(JsonRpcResponse::error(
                    Some(JsonRpcId::Null),
                    JsonRpcError::parse_error(e.to_string()),
                ))
                .await;
            return;
        }
    };

    if request.is_notification() {
        if request.method == "notifications/initialized" {
            tracing::debug!(session_id = %session.session_id, "Client initialized");
        }
        // Notifications never get a response, even when unrecognized.
        return;
    }

    let id = request.id.clone().unwrap_or(JsonRpcId::Null);

    // The token was verified at handshake; long-lived streams still have
    // to respect its expiry for every later call.
    if session.ctx.expires_at <= OffsetDateTime::now_utc() {
        let err = GatewayError::Auth("Token expired".to_string());
        let _ = session
            .send(JsonRpcResponse::error(Some(id), err.to_rpc_error()))
            .await;
        return;
    }

    match request.method.as_str() {
        "initialize" => {
            let response = match serde_json::to_value(InitializeResult::for_gateway()) {
                Ok(result) => JsonRpcResponse::success(Some(id), result),
                Err(e) => JsonRpcResponse::error(Some(id), JsonRpcError::internal_error(e.to_string())),
            };
            let _ = session.send(response).await;
        }
        "ping" => {
            let _ = session
                .send(JsonRpcResponse::success(Some(id), Value::Object(Default::default())))
                .await;
        }
        "tools/list" => {
            let result = ToolsListResult {
                tools: state.registry.visible_tools(&session.scope, &session.ctx),
            };
            let response = match serde_json::to_value(result) {
                Ok(result) => JsonRpcResponse::success(Some(id), result),
                Err(e) => JsonRpcResponse::error(Some(id), JsonRpcError::internal_error(e.to_string())),
            };
            let _ = session.send(response).await;
        }
        "tools/call" => {
            dispatch_tool_call(state, session, id, request.params).await;
        }
        other => {
            let _ = session
                .send(JsonRpcResponse::error(
                    Some(id),
                    JsonRpcError::method_not_found(other),
                ))
                .await;
        }
    }
}

/// Validate a `tools/call` frame and hand it to a per-call task.
///
/// The task owns the call end to end, so one slow backend never delays
/// responses for other in-flight calls on the same session.
async fn dispatch_tool_call(
    state: &AppState,
    session: &Arc<Session>,
    id: JsonRpcId,
    params: Option<Value>,
) {
    let params: ToolCallParams = match params
        .ok_or_else(|| "Missing params".to_string())
        .and_then(|p| serde_json::from_value(p).map_err(|e| e.to_string()))
    {
        Ok(p) => p,
        Err(msg) => {
            let _ = session
                .send(JsonRpcResponse::error(
                    Some(id),
                    JsonRpcError::invalid_params(msg),
                ))
                .await;
            return;
        }
    };

    // Arguments have their own cap, tighter than the frame cap, so a
    // single call cannot monopolize backend bandwidth.
    let argument_bytes = serde_json::to_vec(&params.arguments)
        .map(|v| v.len())
        .unwrap_or(usize::MAX);
    if argument_bytes > state.config.max_argument_bytes {
        let err = GatewayError::PayloadTooLarge {
            size_bytes: argument_bytes,
            max_bytes: state.config.max_argument_bytes,
        };
        let _ = session
            .send(JsonRpcResponse::error(Some(id), err.to_rpc_error()))
            .await;
        return;
    }

    if REMOVED_META_TOOLS.contains(&params.name.as_str()) {
        let err = GatewayError::MetaToolRemoved(params.name.clone());
        let _ = session
            .send(JsonRpcResponse::error(Some(id), err.to_rpc_error()))
            .await;
        return;
    }

    if !session.begin_call(&id).await {
        let _ = session
            .send(JsonRpcResponse::error(
                Some(id.clone()),
                JsonRpcError::new(
                    JsonRpcError::INVALID_REQUEST,
                    format!("Request id {:?} is already in flight", id),
                ),
            ))
            .await;
        return;
    }

    let state = state.clone();
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let response = execute_tool_call(&state, &session, id.clone(), params).await;
        // A failed send means the client disconnected; the result is
        // dropped, never retried.
        let _ = session.send(response).await;
        session.end_call(&id).await;
    });
}

/// Run the admission chain and proxy for one call, recording exactly one
/// audit entry for its terminal outcome.
async fn execute_tool_call(
    state: &AppState,
    session: &Arc<Session>,
    id: JsonRpcId,
    params: ToolCallParams,
) -> JsonRpcResponse {
    let request_id = Uuid::new_v4().to_string();
    let mut audit = AuditContext::new(
        request_id.clone(),
        session.ctx.user_id.clone(),
        params.name.clone(),
    );

    let admitted = match state
        .admission
        .admit(&session.ctx, &session.scope, &params.name)
        .await
    {
        Ok(admitted) => admitted,
        Err(err) => {
            state
                .audit
                .record(audit.finish(AuditStatus::Denied, Some(err.audit_code())));
            return JsonRpcResponse::error(Some(id), err.to_rpc_error());
        }
    };
    audit.set_backend(&admitted.descriptor.backend_id);

    match state
        .proxy
        .route(&admitted, &session.ctx.user_id, &request_id, params.arguments)
        .await
    {
        Ok(result) => {
            state.audit.record(audit.finish(AuditStatus::Success, None));
            match serde_json::to_value(result) {
                Ok(value) => JsonRpcResponse::success(Some(id), value),
                Err(e) => {
                    JsonRpcResponse::error(Some(id), JsonRpcError::internal_error(e.to_string()))
                }
            }
        }
        Err(err) => {
            let status = match &err {
                GatewayError::BackendTimeout { .. } => AuditStatus::Timeout,
                _ => AuditStatus::BackendError,
            };
            state
                .audit
                .record(audit.finish(status, Some(err.audit_code())));
            JsonRpcResponse::error(Some(id), err.to_rpc_error())
        }
    }
}

fn reject(status: StatusCode, err: GatewayError) -> (StatusCode, Json<JsonRpcResponse>) {
    (
        status,
        Json(JsonRpcResponse::error(
            Some(JsonRpcId::Null),
            err.to_rpc_error(),
        )),
    )
}

/// Event stream that unregisters its session when the client goes away.
struct SessionStream<S> {
    inner: S,
    sessions: SessionRegistry,
    session_id: Uuid,
}

impl<S> Stream for SessionStream<S>
where
    S: Stream<Item = Result<Event, Infallible>> + Unpin,
{
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for SessionStream<S> {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = self.session_id;
        tokio::spawn(async move {
            sessions.remove(&session_id).await;
        });
    }
}
