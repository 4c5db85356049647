//! # Session Lifecycle
//!
//! A `Session` tracks one client connection: identity, lifecycle state, the
//! bounded outbound queue, and the transport handle used to reach the
//! connection's task from elsewhere in the server.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: transport accepted, not yet registered
//! 2. **Active**: registered, processing frames
//! 3. **Closing**: close initiated, draining the outbound queue
//! 4. **Closed**: terminal; transport released, removed from the registry
//!
//! Any state can jump straight to Closed on an unrecoverable error.
//!
//! ## Thread Safety:
//! A session's state and queue are mutated by its own connection task, with
//! two deliberate cross-task entry points: [`Session::close`] and
//! [`Session::enqueue_outbound`]. Both go through internal locks and notify
//! the connection task via its actix mailbox, so a broadcast originator or
//! the shutdown path can call them from any task.

use crate::frame::{
    classify, ConfigureOptions, ControlMessage, ControlReply, Frame, InboundPayload, OutboundFrame,
};
use crate::pipeline::{AudioPipeline, PipelineError};
use crate::session::queue::{EnqueueResult, OutboundQueue};

use actix::prelude::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique, immutable session identity.
///
/// Generated as an opaque token owned by the acceptor - never derived from a
/// transient memory address, which would not be reproducible across platforms
/// or restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Why a session is being closed. Carried through the close path for logging.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Client sent a `close` control message.
    ClientRequest,
    /// Client's WebSocket close frame or the peer went away.
    ClientDisconnect,
    /// Read or write failure on the transport.
    TransportError(String),
    /// The pipeline signaled a fatal condition.
    PipelineFatal(String),
    /// No heartbeat within the configured window.
    HeartbeatTimeout,
    /// Server-initiated shutdown.
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientRequest => write!(f, "client requested close"),
            CloseReason::ClientDisconnect => write!(f, "client disconnected"),
            CloseReason::TransportError(msg) => write!(f, "transport error: {}", msg),
            CloseReason::PipelineFatal(msg) => write!(f, "fatal pipeline error: {}", msg),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::ServerShutdown => write!(f, "server shutdown"),
        }
    }
}

/// What the connection task should do after one inbound frame was dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Keep reading.
    Continue,
    /// A graceful close was initiated (client `close` message).
    CloseRequested,
    /// Unrecoverable failure; skip draining and close immediately.
    Fatal(String),
}

/// Commands delivered to a session's connection task through its mailbox.
/// This is the only way other tasks reach into a live connection.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub enum SessionCommand {
    /// Pending outbound frames are waiting; write them to the socket.
    Flush,
    /// Begin a graceful close (drain, then stop).
    Close { reason: CloseReason },
    /// Stop immediately without draining.
    ForceClose,
}

/// Declared audio format for a session, updated by `configure` messages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl AudioFormat {
    /// Apply a partial `configure` update, validating each provided field.
    pub fn apply(&mut self, opts: &ConfigureOptions) -> Result<(), String> {
        let mut updated = *self;

        if let Some(rate) = opts.sample_rate {
            if rate == 0 || rate > 192_000 {
                return Err(format!("unsupported sample rate: {}", rate));
            }
            updated.sample_rate = rate;
        }
        if let Some(channels) = opts.channels {
            if channels == 0 || channels > 2 {
                return Err(format!("unsupported channel count: {}", channels));
            }
            updated.channels = channels;
        }
        if let Some(bits) = opts.bit_depth {
            if !matches!(bits, 8 | 16 | 24 | 32) {
                return Err(format!("unsupported bit depth: {}", bits));
            }
            updated.bit_depth = bits;
        }

        *self = updated;
        Ok(())
    }
}

/// Settings a session is created with, derived from application config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Backpressure threshold of the outbound queue.
    pub outbound_queue_capacity: usize,
    /// Initial audio format before any `configure`.
    pub audio: AudioFormat,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 64,
            audio: AudioFormat::default(),
        }
    }
}

/// Per-session frame counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionStats {
    pub audio_frames_in: u64,
    pub control_frames_in: u64,
    pub malformed_frames: u64,
    pub pipeline_frame_errors: u64,
}

/// Server-side state for one client connection.
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    queue: Mutex<OutboundQueue>,
    /// Mailbox of the owning connection task. Present from actor start until
    /// the transition to Closed, where it is released exactly once.
    transport: Mutex<Option<Recipient<SessionCommand>>>,
    format: RwLock<AudioFormat>,
    stats: RwLock<SessionStats>,
}

impl Session {
    /// Create a session in `Connecting` with a freshly generated id.
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            id: SessionId::generate(),
            created_at: Utc::now(),
            state: RwLock::new(SessionState::Connecting),
            queue: Mutex::new(OutboundQueue::new(settings.outbound_queue_capacity)),
            transport: Mutex::new(None),
            format: RwLock::new(settings.audio),
            stats: RwLock::new(SessionStats::default()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub fn audio_format(&self) -> AudioFormat {
        *self.format.read().unwrap()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.read().unwrap().clone()
    }

    /// Attach the connection task's mailbox. Called once when the transport
    /// task starts.
    pub fn attach_transport(&self, recipient: Recipient<SessionCommand>) {
        *self.transport.lock().unwrap() = Some(recipient);
    }

    /// Transition `Connecting → Active` after successful registration.
    pub fn activate(&self) -> Result<(), String> {
        let mut state = self.state.write().unwrap();
        match *state {
            SessionState::Connecting => {
                *state = SessionState::Active;
                Ok(())
            }
            other => Err(format!("cannot activate session in state {:?}", other)),
        }
    }

    /// Classify one inbound message and dispatch it.
    ///
    /// ## Dispatch:
    /// - **Audio** → pipeline; a produced frame is enqueued outbound. A
    ///   per-frame pipeline error is logged and swallowed; a fatal one
    ///   escalates to the caller.
    /// - **Control** → `ping`/`configure`/`close` handling; unrecognized kinds
    ///   are logged and ignored.
    /// - **Malformed** → logged and discarded. Never closes the session.
    ///
    /// Frames arriving while the session is closing or closed are discarded.
    pub fn submit_inbound(
        &self,
        payload: InboundPayload,
        pipeline: &dyn AudioPipeline,
    ) -> DispatchOutcome {
        if !matches!(self.state(), SessionState::Active) {
            debug!(session_id = %self.id, "discarding inbound frame on non-active session");
            return DispatchOutcome::Continue;
        }

        match classify(payload) {
            Frame::Audio { data, .. } => self.dispatch_audio(&data, pipeline),
            Frame::Control(value) => self.dispatch_control(&value),
            Frame::Malformed { raw, reason } => {
                self.stats.write().unwrap().malformed_frames += 1;
                warn!(
                    session_id = %self.id,
                    bytes = raw.len(),
                    reason = %reason,
                    "discarding malformed control frame"
                );
                DispatchOutcome::Continue
            }
        }
    }

    fn dispatch_audio(&self, data: &[u8], pipeline: &dyn AudioPipeline) -> DispatchOutcome {
        self.stats.write().unwrap().audio_frames_in += 1;

        match pipeline.process(data) {
            Ok(Some(out)) => {
                self.enqueue_outbound(OutboundFrame::Audio(out));
                DispatchOutcome::Continue
            }
            Ok(None) => DispatchOutcome::Continue,
            Err(PipelineError::Frame(msg)) => {
                self.stats.write().unwrap().pipeline_frame_errors += 1;
                warn!(
                    session_id = %self.id,
                    frame_bytes = data.len(),
                    error = %msg,
                    "pipeline rejected audio frame"
                );
                DispatchOutcome::Continue
            }
            Err(PipelineError::Fatal(msg)) => {
                warn!(
                    session_id = %self.id,
                    error = %msg,
                    "pipeline signaled fatal error"
                );
                DispatchOutcome::Fatal(msg)
            }
        }
    }

    fn dispatch_control(&self, value: &serde_json::Value) -> DispatchOutcome {
        self.stats.write().unwrap().control_frames_in += 1;

        match ControlMessage::from_value(value) {
            Some(ControlMessage::Ping) => {
                self.enqueue_outbound(OutboundFrame::Control(ControlReply::Pong));
                DispatchOutcome::Continue
            }
            Some(ControlMessage::Configure(opts)) => {
                let reply = match self.apply_configure(&opts) {
                    Ok(()) => ControlReply::Ack,
                    Err(reason) => ControlReply::Error { reason },
                };
                self.enqueue_outbound(OutboundFrame::Control(reply));
                DispatchOutcome::Continue
            }
            Some(ControlMessage::Close) => {
                self.close(CloseReason::ClientRequest);
                DispatchOutcome::CloseRequested
            }
            None => {
                // Permissive by default: unknown kinds get no error reply.
                debug!(
                    session_id = %self.id,
                    message = %value,
                    "ignoring unrecognized control message"
                );
                DispatchOutcome::Continue
            }
        }
    }

    fn apply_configure(&self, opts: &ConfigureOptions) -> Result<(), String> {
        let mut format = self.format.write().unwrap();
        format.apply(opts)?;
        debug!(
            session_id = %self.id,
            sample_rate = format.sample_rate,
            channels = format.channels,
            bit_depth = format.bit_depth,
            "session reconfigured"
        );
        Ok(())
    }

    /// Append a frame to the outbound queue and nudge the connection task.
    ///
    /// Safe to call from any task. Overflow applies the queue's drop-oldest
    /// policy; the eviction is logged here with session context.
    pub fn enqueue_outbound(&self, frame: OutboundFrame) -> EnqueueResult {
        let result = self.queue.lock().unwrap().push(frame);

        if let EnqueueResult::DroppedOldest(_) = result {
            warn!(
                session_id = %self.id,
                "outbound queue full, dropped oldest frame"
            );
        }

        if let Some(transport) = self.transport.lock().unwrap().as_ref() {
            transport.do_send(SessionCommand::Flush);
        }

        result
    }

    /// Take all pending outbound frames, in enqueue order.
    pub fn drain_outbound(&self) -> Vec<OutboundFrame> {
        self.queue.lock().unwrap().drain()
    }

    pub fn pending_outbound(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn dropped_outbound(&self) -> u64 {
        self.queue.lock().unwrap().dropped()
    }

    /// Initiate a graceful close: `Connecting/Active → Closing`.
    ///
    /// Idempotent - calling it on an already closing or closed session is a
    /// no-op, never an error. Returns whether this call performed the
    /// transition. Safe to call from any task; the connection task is notified
    /// through its mailbox and performs the drain.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.write().unwrap();
            match *state {
                SessionState::Connecting | SessionState::Active => {
                    *state = SessionState::Closing;
                }
                SessionState::Closing | SessionState::Closed => return false,
            }
        }

        debug!(session_id = %self.id, reason = %reason, "session closing");

        if let Some(transport) = self.transport.lock().unwrap().as_ref() {
            transport.do_send(SessionCommand::Close { reason });
        }

        true
    }

    /// Terminal transition: any state → `Closed`. Releases the transport
    /// handle exactly once. Idempotent.
    pub fn mark_closed(&self) {
        *self.state.write().unwrap() = SessionState::Closed;
        self.transport.lock().unwrap().take();
    }

    /// Close without draining: notify the connection task to stop immediately
    /// and release the transport. Used when the drain timeout expires.
    pub fn force_close(&self) {
        let transport = self.transport.lock().unwrap().take();
        *self.state.write().unwrap() = SessionState::Closed;
        if let Some(transport) = transport {
            transport.do_send(SessionCommand::ForceClose);
        }
    }

    /// Snapshot for the observability endpoints.
    pub fn summary(&self) -> SessionSummary {
        let stats = self.stats();
        SessionSummary {
            session_id: self.id,
            state: self.state().as_str(),
            created_at: self.created_at,
            audio_format: self.audio_format(),
            audio_frames_in: stats.audio_frames_in,
            control_frames_in: stats.control_frames_in,
            malformed_frames: stats.malformed_frames,
            pipeline_frame_errors: stats.pipeline_frame_errors,
            pending_outbound: self.pending_outbound(),
            dropped_outbound: self.dropped_outbound(),
        }
    }
}

/// Point-in-time view of one session, serialized by the `/sessions` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub state: &'static str,
    pub created_at: DateTime<Utc>,
    pub audio_format: AudioFormat,
    pub audio_frames_in: u64,
    pub control_frames_in: u64,
    pub malformed_frames: u64,
    pub pipeline_frame_errors: u64,
    pub pending_outbound: usize,
    pub dropped_outbound: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::EchoPipeline;

    /// Pipeline double that fails every frame fatally.
    struct FatalPipeline;

    impl AudioPipeline for FatalPipeline {
        fn process(&self, _data: &[u8]) -> Result<Option<Vec<u8>>, PipelineError> {
            Err(PipelineError::Fatal("transform backend gone".to_string()))
        }

        fn name(&self) -> &'static str {
            "fatal"
        }
    }

    fn active_session() -> Session {
        let session = Session::new(&SessionSettings::default());
        session.activate().unwrap();
        session
    }

    #[test]
    fn test_ids_are_unique() {
        let settings = SessionSettings::default();
        let a = Session::new(&settings);
        let b = Session::new(&settings);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_activate_only_from_connecting() {
        let session = Session::new(&SessionSettings::default());
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.activate().is_ok());
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.activate().is_err());
    }

    #[test]
    fn test_binary_echo_reaches_outbound_queue_in_order() {
        let session = active_session();
        let pipeline = EchoPipeline;

        let outcome = session.submit_inbound(
            InboundPayload::Binary(vec![0x01, 0x02, 0x03]),
            &pipeline,
        );
        assert_eq!(outcome, DispatchOutcome::Continue);

        session.submit_inbound(InboundPayload::Binary(vec![0x04]), &pipeline);

        let drained = session.drain_outbound();
        assert_eq!(
            drained,
            vec![
                OutboundFrame::Audio(vec![0x01, 0x02, 0x03]),
                OutboundFrame::Audio(vec![0x04]),
            ]
        );
    }

    #[test]
    fn test_ping_gets_pong_and_session_stays_active() {
        let session = active_session();
        let outcome = session.submit_inbound(
            InboundPayload::Text(r#"{"type":"ping"}"#.to_string()),
            &EchoPipeline,
        );

        assert_eq!(outcome, DispatchOutcome::Continue);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(
            session.drain_outbound(),
            vec![OutboundFrame::Control(ControlReply::Pong)]
        );
    }

    #[test]
    fn test_malformed_text_is_discarded_without_reply_or_close() {
        let session = active_session();
        let outcome = session.submit_inbound(
            InboundPayload::Text("{not json".to_string()),
            &EchoPipeline,
        );

        assert_eq!(outcome, DispatchOutcome::Continue);
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.drain_outbound().is_empty());
        assert_eq!(session.stats().malformed_frames, 1);
    }

    #[test]
    fn test_unrecognized_control_kind_is_ignored() {
        let session = active_session();
        let outcome = session.submit_inbound(
            InboundPayload::Text(r#"{"type":"subscribe","topic":"x"}"#.to_string()),
            &EchoPipeline,
        );

        assert_eq!(outcome, DispatchOutcome::Continue);
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.drain_outbound().is_empty());
    }

    #[test]
    fn test_configure_acks_valid_options() {
        let session = active_session();
        session.submit_inbound(
            InboundPayload::Text(
                r#"{"type":"configure","sample_rate":44100,"channels":2}"#.to_string(),
            ),
            &EchoPipeline,
        );

        assert_eq!(
            session.drain_outbound(),
            vec![OutboundFrame::Control(ControlReply::Ack)]
        );
        let format = session.audio_format();
        assert_eq!(format.sample_rate, 44100);
        assert_eq!(format.channels, 2);
        // Untouched field keeps its default.
        assert_eq!(format.bit_depth, 16);
    }

    #[test]
    fn test_configure_rejects_invalid_options_without_applying() {
        let session = active_session();
        session.submit_inbound(
            InboundPayload::Text(
                r#"{"type":"configure","sample_rate":44100,"channels":9}"#.to_string(),
            ),
            &EchoPipeline,
        );

        match session.drain_outbound().as_slice() {
            [OutboundFrame::Control(ControlReply::Error { reason })] => {
                assert!(reason.contains("channel"));
            }
            other => panic!("expected error reply, got {:?}", other),
        }
        // Rejection leaves the whole format unchanged, including sample_rate.
        assert_eq!(session.audio_format().sample_rate, 16000);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_close_control_message_starts_graceful_close() {
        let session = active_session();
        let outcome = session.submit_inbound(
            InboundPayload::Text(r#"{"type":"close"}"#.to_string()),
            &EchoPipeline,
        );

        assert_eq!(outcome, DispatchOutcome::CloseRequested);
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn test_close_is_idempotent() {
        let session = active_session();
        assert!(session.close(CloseReason::ClientDisconnect));
        assert_eq!(session.state(), SessionState::Closing);

        // Second close is a no-op, never an error.
        assert!(!session.close(CloseReason::ServerShutdown));
        assert_eq!(session.state(), SessionState::Closing);

        session.mark_closed();
        assert!(!session.close(CloseReason::ServerShutdown));
        assert_eq!(session.state(), SessionState::Closed);

        // mark_closed is idempotent too.
        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_fatal_pipeline_error_escalates() {
        let session = active_session();
        let outcome =
            session.submit_inbound(InboundPayload::Binary(vec![0x01]), &FatalPipeline);

        match outcome {
            DispatchOutcome::Fatal(msg) => assert!(msg.contains("transform backend")),
            other => panic!("expected Fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_inbound_discarded_after_closing() {
        let session = active_session();
        session.close(CloseReason::ClientDisconnect);

        let outcome =
            session.submit_inbound(InboundPayload::Binary(vec![0x01]), &EchoPipeline);
        assert_eq!(outcome, DispatchOutcome::Continue);
        assert!(session.drain_outbound().is_empty());
        assert_eq!(session.stats().audio_frames_in, 0);
    }

    #[test]
    fn test_queue_overflow_drops_oldest_frame() {
        let settings = SessionSettings {
            outbound_queue_capacity: 2,
            ..SessionSettings::default()
        };
        let session = Session::new(&settings);
        session.activate().unwrap();

        for b in 0..3u8 {
            session.submit_inbound(InboundPayload::Binary(vec![b]), &EchoPipeline);
        }

        assert_eq!(session.dropped_outbound(), 1);
        assert_eq!(
            session.drain_outbound(),
            vec![
                OutboundFrame::Audio(vec![1]),
                OutboundFrame::Audio(vec![2]),
            ]
        );
    }
}
