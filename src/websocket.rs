//! # Voice WebSocket Handler
//!
//! Clients connect to `/ws` and hold a full-duplex voice conversation.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server queues `{"type":"ready"}` as the first message
//! 2. **Audio Streaming**: binary frames carry PCM audio (16-bit, 16kHz, mono)
//! 3. **Control**: text frames carry JSON `interrupt` / `prompt` / `ping`
//! 4. **Turn output**: `stt`, `llm_start`, `llm`, `llm_final`, `tts_audio`, `error`
//!
//! ## Actor Model:
//! Each connection is one actor. Its `StreamHandler` for WebSocket frames is the
//! receive loop; a second `StreamHandler` drains the session's outbound queue and
//! is the only place that writes to the socket.

use crate::config::PerformanceConfig;
use crate::error::AppError;
use crate::protocol::ServerMessage;
use crate::session::VoiceSession;
use crate::state::{AppState, MetricsHandle};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

pub struct VoiceSocket {
    session: Option<VoiceSession>,

    /// Taken in `started` and attached to the actor as a stream
    outbound: Option<mpsc::UnboundedReceiver<ServerMessage>>,

    metrics: MetricsHandle,
    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// Last time anything arrived from the client
    last_heartbeat: Instant,
}

impl VoiceSocket {
    pub fn new(
        session: VoiceSession,
        outbound: mpsc::UnboundedReceiver<ServerMessage>,
        metrics: MetricsHandle,
        performance: &PerformanceConfig,
    ) -> Self {
        Self {
            session: Some(session),
            outbound: Some(outbound),
            metrics,
            heartbeat_interval: Duration::from_secs(performance.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(performance.client_timeout_secs),
            last_heartbeat: Instant::now(),
        }
    }

    fn session_id(&self) -> &str {
        self.session.as_ref().map(|s| s.id()).unwrap_or("closed")
    }

    /// Tear the session down before the actor stops.
    ///
    /// `ctx.wait` holds back every other event until the active turn is gone,
    /// so no frame is handled and no turn output is written in between.
    fn close_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        match self.session.take() {
            Some(session) => {
                ctx.wait(session.close().into_actor(self).map(|_, _, ctx| ctx.stop()));
            }
            None => ctx.stop(),
        }
    }
}

impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started for session {}", self.session_id());

        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }

        let client_timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!("WebSocket heartbeat timeout for session {}, closing connection", act.session_id());
                act.close_session(ctx);
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket connection stopped for session {}", self.session_id());

        // Only reached with a live session when the actor was stopped from outside.
        if let Some(session) = self.session.take() {
            tokio::spawn(session.close());
        }
        self.metrics.close_session();
    }
}

/// Handle incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };

        match msg {
            Ok(ws::Message::Binary(data)) => session.handle_audio(&data),
            Ok(ws::Message::Text(text)) => session.handle_text(&text),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                self.close_session(ctx);
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                self.close_session(ctx);
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("WebSocket stream ended for session {}", self.session_id());
        self.close_session(ctx);
    }
}

/// Single writer: every outbound message for this connection passes through here.
impl StreamHandler<ServerMessage> for VoiceSocket {
    fn handle(&mut self, msg: ServerMessage, ctx: &mut Self::Context) {
        debug!("Sending {} to session {}", msg.kind(), self.session_id());
        ctx.text(msg.encode());
    }

    // The queue only ends once the session is gone; the socket's own stream decides when to stop.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// The handshake is validated first, then a session slot is reserved. Upgrades
/// beyond `max_concurrent_sessions` are refused with 503.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    ws::handshake(&req)?;

    let config = app_state.get_config();
    let limit = config.performance.max_concurrent_sessions;
    if !app_state.metrics.try_open_session(limit) {
        warn!("Rejecting WebSocket connection: {} sessions already active", limit);
        return Err(AppError::Unavailable(format!("Voice session limit reached ({})", limit)).into());
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let (session, outbound) = VoiceSession::start(
        app_state.models.clone(),
        app_state.metrics.clone(),
        session_id,
    );
    let actor = VoiceSocket::new(session, outbound, app_state.metrics.clone(), &config.performance);

    ws::start(actor, &req, stream).map_err(|err| {
        app_state.metrics.close_session();
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::models::testing::Fakes;
    use actix_web::{http::StatusCode, test as actix_test, App};

    fn upgrade_request() -> actix_test::TestRequest {
        actix_test::TestRequest::get()
            .uri("/ws")
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "Upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
    }

    fn state_with_limit(limit: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = limit;
        AppState::with_models(config, Fakes::happy().provider())
    }

    #[actix_web::test]
    async fn test_upgrade_accepted() {
        let state = state_with_limit(2);
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        let resp = actix_test::call_service(&app, upgrade_request().to_request()).await;
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(state.metrics.snapshot().total_sessions, 1);
    }

    #[actix_web::test]
    async fn test_upgrade_rejected_at_session_limit() {
        let state = state_with_limit(1);
        assert!(state.metrics.try_open_session(1));

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        let resp = actix_test::call_service(&app, upgrade_request().to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.active_sessions, 1);
        assert_eq!(snapshot.rejected_sessions, 1);
    }

    #[actix_web::test]
    async fn test_plain_request_is_not_upgraded() {
        let state = state_with_limit(1);
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/ws").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.metrics.snapshot().active_sessions, 0);
    }
}
