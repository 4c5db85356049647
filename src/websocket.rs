//! # WebSocket Relay Transport
//!
//! Drives one relay session over a WebSocket connection. Clients connect to
//! `/ws/audio`, stream binary audio frames and JSON control messages, and
//! receive the pipeline's output plus control replies.
//!
//! ## WebSocket Protocol:
//! - **Client → Server**: binary messages carry opaque audio; text messages
//!   carry a JSON control object (`ping`, `configure`, `close`)
//! - **Server → Client**: binary messages carry pipeline output; text messages
//!   carry JSON control replies (`pong`, `ack`, `error`)
//!
//! ## Actor Model:
//! Each connection is an independent Actix actor, so one session's read loop
//! never blocks another's, and frames from a single session are processed in
//! arrival order through the actor mailbox. The mailbox is also how other
//! tasks reach a live connection: [`SessionCommand`] messages sent through the
//! session's transport handle.

use crate::config::RelayConfig;
use crate::error::AppError;
use crate::frame::{InboundPayload, OutboundFrame};
use crate::pipeline::AudioPipeline;
use crate::session::registry::SessionRegistry;
use crate::session::state::{
    CloseReason, DispatchOutcome, Session, SessionCommand, SessionState,
};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// WebSocket actor owning one relay session's connection lifetime.
pub struct RelaySocket {
    session: Arc<Session>,
    state: AppState,
    pipeline: Arc<dyn AudioPipeline>,
    registry: Arc<SessionRegistry>,
    relay: RelayConfig,
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(app_state: &AppState, session: Arc<Session>) -> Self {
        Self {
            session,
            state: app_state.clone(),
            pipeline: app_state.pipeline(),
            registry: app_state.registry().clone(),
            relay: app_state.get_config().relay,
            last_heartbeat: Instant::now(),
        }
    }

    /// Write every pending outbound frame to the socket, in enqueue order.
    fn flush_outbound(&self, ctx: &mut ws::WebsocketContext<Self>) {
        for frame in self.session.drain_outbound() {
            match frame {
                OutboundFrame::Audio(bytes) => ctx.binary(bytes),
                OutboundFrame::Control(reply) => {
                    ctx.text(OutboundFrame::control_json(&reply))
                }
            }
        }
    }

    /// Graceful close: flush what's queued, send the close frame, and bound
    /// the remaining drain with a timer so a stalled peer cannot hold the
    /// session open. The actor stops when the client echoes the close frame
    /// or when the timer fires, whichever comes first.
    fn finish_close(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.flush_outbound(ctx);
        ctx.close(Some(ws::CloseCode::Normal.into()));

        ctx.run_later(self.relay.drain_timeout(), |act, ctx| {
            if act.session.state() != SessionState::Closed {
                warn!(
                    session_id = %act.session.id(),
                    "drain timeout expired, stopping connection"
                );
            }
            ctx.stop();
        });
    }

    /// Unrecoverable error: skip draining, release everything now.
    fn abort(&mut self, ctx: &mut ws::WebsocketContext<Self>, reason: CloseReason) {
        error!(session_id = %self.session.id(), reason = %reason, "aborting session");
        self.session.mark_closed();
        ctx.close(Some(ws::CloseCode::Error.into()));
        ctx.stop();
    }

    fn handle_inbound(
        &mut self,
        payload: InboundPayload,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let outcome = self.session.submit_inbound(payload, self.pipeline.as_ref());
        self.flush_outbound(ctx);

        match outcome {
            DispatchOutcome::Continue => {}
            DispatchOutcome::CloseRequested => {
                // submit_inbound already moved the session to Closing and the
                // Close command is in our mailbox; nothing more to do here.
                debug!(session_id = %self.session.id(), "client requested close");
            }
            DispatchOutcome::Fatal(msg) => {
                self.abort(ctx, CloseReason::PipelineFatal(msg));
            }
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    /// Connection start: register the session (the registry's checked insert
    /// is the authoritative admission decision), attach the transport handle,
    /// transition `Connecting → Active` and begin the heartbeat.
    fn started(&mut self, ctx: &mut Self::Context) {
        if self.registry.try_insert(self.session.clone()).is_err() {
            // Another upgrade won the last slot between the route-level check
            // and this insert.
            self.state.record_session_refused();
            warn!(
                session_id = %self.session.id(),
                max_sessions = self.registry.max_sessions(),
                "refusing session: limit reached during upgrade"
            );
            self.session.mark_closed();
            ctx.close(Some(ws::CloseCode::Again.into()));
            ctx.stop();
            return;
        }

        self.session.attach_transport(ctx.address().recipient());

        if let Err(err) = self.session.activate() {
            error!(session_id = %self.session.id(), error = %err, "failed to activate session");
            ctx.stop();
            return;
        }

        // Counted here rather than in the route handler so a failed upgrade
        // handshake never inflates the counter.
        self.state.record_session_opened();

        info!(
            session_id = %self.session.id(),
            pipeline = self.pipeline.name(),
            active_sessions = self.registry.len(),
            "session connected"
        );

        ctx.run_interval(self.relay.heartbeat_interval(), |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.relay.client_timeout() {
                warn!(session_id = %act.session.id(), "heartbeat timeout, closing connection");
                act.session.close(CloseReason::HeartbeatTimeout);
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Connection end: terminal transition and registry removal, regardless of
    /// how the connection ended. Removal here keeps the registry invariant
    /// that closed sessions are never registered.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.session.mark_closed();
        self.registry.remove(self.session.id());

        let stats = self.session.stats();
        info!(
            session_id = %self.session.id(),
            audio_frames = stats.audio_frames_in,
            control_frames = stats.control_frames_in,
            malformed_frames = stats.malformed_frames,
            active_sessions = self.registry.len(),
            "session closed"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.handle_inbound(InboundPayload::Binary(data.to_vec()), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.handle_inbound(InboundPayload::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session.id(), reason = ?reason, "client close frame");
                self.session.close(CloseReason::ClientDisconnect);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Fragmented messages are not part of this protocol.
                warn!(session_id = %self.session.id(), "ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                self.abort(ctx, CloseReason::TransportError(err.to_string()));
            }
        }
    }
}

/// Cross-task commands arriving through the session's transport handle.
impl Handler<SessionCommand> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: SessionCommand, ctx: &mut Self::Context) {
        match msg {
            SessionCommand::Flush => self.flush_outbound(ctx),
            SessionCommand::Close { reason } => {
                debug!(session_id = %self.session.id(), reason = %reason, "close command");
                self.finish_close(ctx);
            }
            SessionCommand::ForceClose => ctx.stop(),
        }
    }
}

/// WebSocket endpoint handler: upgrades the HTTP request and hands the
/// connection to a new [`RelaySocket`] actor.
///
/// Admission control happens here: when the registry is at capacity the
/// upgrade is refused with 503 before any session state is created.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    // Fast path: refuse obvious overload with a plain 503 before paying for
    // the upgrade. This read is advisory; the checked insert in
    // `RelaySocket::started` makes the final call under the registry lock.
    if app_state.registry().at_capacity() {
        app_state.record_session_refused();
        warn!(
            max_sessions = app_state.registry().max_sessions(),
            "refusing connection: session limit reached"
        );
        return Err(AppError::Overloaded("session limit reached".to_string()).into());
    }

    info!(
        peer = ?req.connection_info().realip_remote_addr(),
        "new relay connection"
    );

    let session = Arc::new(Session::new(&app_state.session_settings()));
    let socket = RelaySocket::new(&app_state, session);
    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::state::SessionSettings;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_non_upgrade_request_is_rejected() {
        let state = AppState::new(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/audio", web::get().to(relay_websocket)),
        )
        .await;

        // Plain GET without the upgrade handshake headers.
        let req = test::TestRequest::get().uri("/ws/audio").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());

        // A failed handshake never counts as an opened session.
        assert_eq!(state.get_metrics_snapshot().sessions_opened, 0);
    }

    #[actix_web::test]
    async fn test_connection_refused_at_capacity() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = AppState::new(config);

        // Occupy the single slot.
        let session = Arc::new(Session::new(&SessionSettings::default()));
        session.activate().unwrap();
        state.registry().try_insert(session).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/audio", web::get().to(relay_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws/audio").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.sessions_refused, 1);
        assert_eq!(metrics.sessions_opened, 0);
    }
}
