use axum::{
    extract::{Query, State, WebSocketUpgrade, ws::WebSocket},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::AppState;
use crate::handlers::ApiError;
use crate::metrics::ServerMetrics;
use crate::ws::{DiffSession, QueueSession, RelayContext, Session, SessionOutcome};

/// Query string shared by the socket endpoints. Fields are optional so a
/// missing value gets our JSON error instead of the extractor's plain-text one.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub chat_id: Option<String>,
    pub user_id: Option<String>,
}

impl ConnectParams {
    fn required(value: Option<String>, name: &'static str) -> Result<String, ApiError> {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ApiError::MissingParam(name))
    }

    fn chat_and_user(self) -> Result<(String, String), ApiError> {
        let chat_id = Self::required(self.chat_id, "chat_id")?;
        let user_id = Self::required(self.user_id, "user_id")?;
        Ok((chat_id, user_id))
    }
}

/// `GET /api/ws/chat?chat_id&user_id`
pub async fn chat_websocket_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let (chat_id, user_id) = match params.chat_and_user() {
        Ok(ids) => ids,
        Err(e) => return e.into_response(),
    };
    let ctx = RelayContext::from_state(&state);
    let metrics = state.metrics.clone();

    ws.on_upgrade(move |socket| {
        tracked(metrics, socket, move |sink, stream| {
            Session::new(user_id, chat_id, ctx).start(sink, stream)
        })
    })
}

/// `GET /api/ws/diff?user_id`
pub async fn diff_websocket_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match ConnectParams::required(params.user_id, "user_id") {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let ctx = RelayContext::from_state(&state);
    let metrics = state.metrics.clone();

    ws.on_upgrade(move |socket| {
        tracked(metrics, socket, move |sink, stream| {
            DiffSession::new(user_id, ctx).start(sink, stream)
        })
    })
}

/// `GET /api/ws/queue?chat_id&user_id`
pub async fn queue_websocket_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let (chat_id, user_id) = match params.chat_and_user() {
        Ok(ids) => ids,
        Err(e) => return e.into_response(),
    };
    let ctx = RelayContext::from_state(&state);
    let metrics = state.metrics.clone();
    let manager = state.manager.clone();
    let capacity = state.server_config.queue.chat_capacity;

    ws.on_upgrade(move |socket| {
        tracked(metrics, socket, move |sink, stream| {
            QueueSession::new(user_id, chat_id, capacity, ctx, manager).start(sink, stream)
        })
    })
}

type SocketSink = futures::stream::SplitSink<WebSocket, axum::extract::ws::Message>;
type SocketStream = futures::stream::SplitStream<WebSocket>;

/// Split the socket, run the session, and keep the connection gauges honest.
async fn tracked<F, Fut>(metrics: Arc<ServerMetrics>, socket: WebSocket, run: F)
where
    F: FnOnce(SocketSink, SocketStream) -> Fut,
    Fut: std::future::Future<Output = SessionOutcome>,
{
    metrics.connection_opened();
    let (sink, stream) = socket.split();
    let outcome = run(sink, stream).await;
    metrics.connection_closed();
    debug!(?outcome, "WebSocket connection finished");
}
