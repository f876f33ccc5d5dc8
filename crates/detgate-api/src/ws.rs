//! Streaming detection channel.
//!
//! Clients send camera frames as binary messages. At most one frame per
//! session is in detection at any time; frames arriving meanwhile (or before
//! the minimum interval has elapsed) are dropped, not queued. Results are
//! pushed back as JSON text whenever an accepted frame finishes.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, warn, Instrument};

use detgate_models::{
    ClientControl, ConnectionState, DetectionResult, ErrorKind, MediaKind, StreamMessage,
    StreamSession,
};

use crate::config::GatewayConfig;
use crate::error::ApiResult;
use crate::metrics;
use crate::services::{DetectionService, MediaUpload};
use crate::state::AppState;

/// Global counter for active stream sessions.
static ACTIVE_SESSIONS: AtomicI64 = AtomicI64::new(0);

/// Configuration for WebSocket backpressure.
const WS_SEND_BUFFER_SIZE: usize = 16;
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on waiting for a cancelled invocation during teardown.
const TEARDOWN_GRACE: Duration = Duration::from_secs(10);

/// Upper bound on flushing queued messages after the session ends.
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-session timing.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Minimum spacing between accepted frames
    pub frame_interval: Duration,
    /// Close the session when nothing arrives for this long
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl From<&GatewayConfig> for StreamSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            frame_interval: config.frame_interval,
            idle_timeout: config.idle_timeout,
            heartbeat_interval: WS_HEARTBEAT_INTERVAL,
        }
    }
}

/// Outcome of offering a frame to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Session is not `Open`
    NotOpen,
    /// Previous frame still in detection
    Busy,
    /// Minimum interval since the last accepted frame not yet elapsed
    TooSoon,
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Accept => "accept",
            Admission::NotOpen => "not_open",
            Admission::Busy => "busy",
            Admission::TooSoon => "too_soon",
        }
    }
}

/// Frame admission policy: one in flight, bounded cadence.
#[derive(Debug)]
pub struct FrameGate {
    min_interval: Duration,
    last_accepted: Option<Instant>,
    in_flight: bool,
}

impl FrameGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted: None,
            in_flight: false,
        }
    }

    /// Decide on a frame arriving at `now`. Accepting marks the gate busy
    /// until [`FrameGate::complete`].
    pub fn admit(&mut self, now: Instant, open: bool) -> Admission {
        if !open {
            return Admission::NotOpen;
        }
        if self.in_flight {
            return Admission::Busy;
        }
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.min_interval {
                return Admission::TooSoon;
            }
        }
        self.in_flight = true;
        self.last_accepted = Some(now);
        Admission::Accept
    }

    /// The in-flight frame finished, whatever its outcome.
    pub fn complete(&mut self) {
        self.in_flight = false;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Client sent a close frame or the connection ended
    PeerClosed,
    /// Client asked via `{"type":"close"}`
    ClientRequested,
    IdleTimeout,
    /// Gateway-side failure reported to the client
    Fatal,
    TransportError,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ClientRequested => "client_requested",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Fatal => "fatal",
            CloseReason::TransportError => "transport_error",
        }
    }

    /// Whether the server should still send its own close frame.
    fn server_initiated(&self) -> bool {
        matches!(
            self,
            CloseReason::ClientRequested | CloseReason::IdleTimeout | CloseReason::Fatal
        )
    }
}

/// The one detection running for a session.
struct InFlight {
    seq: u64,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<ApiResult<DetectionResult>>,
}

/// Wait for the in-flight detection, if any. Pends forever when idle.
async fn join_in_flight(
    slot: &mut Option<InFlight>,
) -> (u64, Result<ApiResult<DetectionResult>, JoinError>) {
    match slot {
        Some(in_flight) => {
            let joined = (&mut in_flight.handle).await;
            (in_flight.seq, joined)
        }
        None => std::future::pending().await,
    }
}

/// Queue a message for the sender task.
async fn send_message(tx: &mpsc::Sender<Message>, msg: &StreamMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize stream message: {}", e);
            return false;
        }
    };
    match tx.try_send(Message::Text(json)) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(message)) => {
            debug!("Stream send buffer full, applying backpressure");
            if tx.send(message).await.is_err() {
                return false;
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => return false,
    }
    metrics::record_stream_message_sent(msg.message_type());
    true
}

/// `GET /ws/detect`: upgrade to a streaming session.
pub async fn ws_detect(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let max_frame = state.config.max_frame_bytes;
    let settings = StreamSettings::from(&state.config);
    let detector = state.detector.clone();

    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| async move {
            let active = ACTIVE_SESSIONS.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::set_stream_sessions_active(active);
            metrics::record_stream_session();
            let _active_guard = scopeguard::guard((), |_| {
                let active = ACTIVE_SESSIONS.fetch_sub(1, Ordering::SeqCst) - 1;
                metrics::set_stream_sessions_active(active);
            });

            run_session(socket, detector, settings).await;
        })
}

/// Drive one session from open to closed.
pub async fn run_session(
    socket: WebSocket,
    detector: DetectionService,
    settings: StreamSettings,
) -> StreamSession {
    let session = StreamSession::new();
    let span = tracing::info_span!("stream", session_id = %session.session_id);
    drive(session, socket, detector, settings).instrument(span).await
}

async fn drive(
    mut session: StreamSession,
    socket: WebSocket,
    detector: DetectionService,
    settings: StreamSettings,
) -> StreamSession {
    let (ws_sender, mut receiver) = socket.split();

    // Outbound messages go through a bounded channel drained by one task.
    let (tx, mut rx) = mpsc::channel::<Message>(WS_SEND_BUFFER_SIZE);
    let send_task = tokio::spawn(async move {
        let mut ws_sender = ws_sender;
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    if let Err(e) = session.transition(ConnectionState::Open) {
        warn!("Failed to open session: {}", e);
    }
    info!("Stream session opened");

    let mut gate = FrameGate::new(settings.frame_interval);
    let mut in_flight: Option<InFlight> = None;
    let mut heartbeat = interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    let idle = sleep(settings.idle_timeout);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            inbound = receiver.next() => {
                idle.as_mut().reset(Instant::now() + settings.idle_timeout);
                match inbound {
                    Some(Ok(Message::Binary(frame))) => {
                        let seq = session.next_frame_seq();
                        match gate.admit(Instant::now(), session.accepts_frames()) {
                            Admission::Accept => {
                                session.record_accepted();
                                metrics::record_frame("accepted");
                                debug!(seq, size = frame.len(), "Frame accepted");
                                in_flight = Some(spawn_frame(&detector, frame, seq));
                            }
                            rejected => {
                                session.record_dropped();
                                metrics::record_frame("dropped");
                                debug!(seq, reason = rejected.as_str(), "Frame dropped");
                            }
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientControl>(&text) {
                            Ok(ClientControl::Close) => break CloseReason::ClientRequested,
                            Err(_) => debug!("Ignoring text message"),
                        }
                    }
                    // Pings are answered by the transport
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
                    Some(Err(e)) => {
                        warn!("Stream transport error: {}", e);
                        break CloseReason::TransportError;
                    }
                }
            }

            (seq, joined) = join_in_flight(&mut in_flight) => {
                in_flight = None;
                gate.complete();
                match joined {
                    Ok(Ok(detection)) => {
                        if !send_message(&tx, &StreamMessage::result(seq, &detection)).await {
                            break CloseReason::PeerClosed;
                        }
                        session.record_result_sent();
                    }
                    Ok(Err(e)) if e.is_fatal_for_stream() => {
                        error!(seq, kind = %e.kind(), "Frame detection failed, closing session: {}", e);
                        send_message(&tx, &StreamMessage::error(e.kind())).await;
                        break CloseReason::Fatal;
                    }
                    Ok(Err(e)) => {
                        debug!(seq, kind = %e.kind(), "Frame produced no result: {}", e);
                    }
                    Err(e) => {
                        error!(seq, "Frame task failed: {}", e);
                        send_message(&tx, &StreamMessage::error(ErrorKind::Internal)).await;
                        break CloseReason::Fatal;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break CloseReason::PeerClosed;
                }
            }

            _ = &mut idle => {
                info!(idle_timeout = ?settings.idle_timeout, "Stream session idle, closing");
                break CloseReason::IdleTimeout;
            }
        }
    };

    if let Err(e) = session.transition(ConnectionState::Closing) {
        debug!("Session already closing: {}", e);
    }

    // Teardown: no new frames past this point. Cancel and await the
    // in-flight detection so its worker is gone and its frame released.
    if let Some(pending) = in_flight.take() {
        cancel_in_flight(pending).await;
        gate.complete();
    }

    if reason.server_initiated() {
        let _ = tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: reason.as_str().into(),
            })))
            .await;
    }
    drop(tx);

    let mut send_task = send_task;
    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }

    if let Err(e) = session.transition(ConnectionState::Closed) {
        warn!("Unexpected session state on close: {}", e);
    }

    info!(
        reason = reason.as_str(),
        frames_accepted = session.frames_accepted,
        frames_dropped = session.frames_dropped,
        results_sent = session.results_sent,
        "Stream session closed"
    );

    session
}

fn spawn_frame(detector: &DetectionService, frame: Vec<u8>, seq: u64) -> InFlight {
    let (cancel, cancel_rx) = watch::channel(false);
    let detector = detector.clone();
    let upload = MediaUpload {
        bytes: frame,
        file_name: format!("frame-{}.jpg", seq),
        media_kind: MediaKind::Image,
    };
    let handle = tokio::spawn(
        async move { detector.detect(upload, cancel_rx).await }.in_current_span(),
    );
    InFlight { seq, cancel, handle }
}

async fn cancel_in_flight(pending: InFlight) {
    let InFlight { seq, cancel, mut handle } = pending;
    let _ = cancel.send(true);

    match tokio::time::timeout(TEARDOWN_GRACE, &mut handle).await {
        Ok(Ok(Ok(_))) => debug!(seq, "In-flight frame finished during teardown"),
        Ok(Ok(Err(e))) => debug!(seq, kind = %e.kind(), "In-flight frame withdrawn"),
        Ok(Err(e)) => warn!(seq, "In-flight frame task failed: {}", e),
        Err(_) => {
            // Aborting drops the staging guard and the child handle, which
            // still removes the frame and kills the worker.
            warn!(seq, grace = ?TEARDOWN_GRACE, "In-flight frame ignored cancellation, aborting");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_rejects_when_not_open() {
        let mut gate = FrameGate::new(Duration::ZERO);
        assert_eq!(gate.admit(Instant::now(), false), Admission::NotOpen);
        assert!(!gate.in_flight());
    }

    #[test]
    fn test_gate_one_in_flight() {
        let mut gate = FrameGate::new(Duration::ZERO);
        let now = Instant::now();
        assert_eq!(gate.admit(now, true), Admission::Accept);
        for _ in 0..4 {
            assert_eq!(gate.admit(now, true), Admission::Busy);
        }
        gate.complete();
        assert_eq!(gate.admit(now, true), Admission::Accept);
    }

    #[test]
    fn test_gate_min_interval() {
        let mut gate = FrameGate::new(Duration::from_millis(500));
        let start = Instant::now();
        assert_eq!(gate.admit(start, true), Admission::Accept);
        gate.complete();

        assert_eq!(gate.admit(start + Duration::from_millis(200), true), Admission::TooSoon);
        assert_eq!(gate.admit(start + Duration::from_millis(500), true), Admission::Accept);
    }

    #[test]
    fn test_dropped_frames_do_not_reset_interval() {
        let mut gate = FrameGate::new(Duration::from_millis(500));
        let start = Instant::now();
        assert_eq!(gate.admit(start, true), Admission::Accept);
        gate.complete();
        assert_eq!(gate.admit(start + Duration::from_millis(400), true), Admission::TooSoon);
        assert_eq!(gate.admit(start + Duration::from_millis(600), true), Admission::Accept);
    }

    #[test]
    fn test_close_reasons() {
        assert!(CloseReason::IdleTimeout.server_initiated());
        assert!(CloseReason::Fatal.server_initiated());
        assert!(!CloseReason::PeerClosed.server_initiated());
        assert!(!CloseReason::TransportError.server_initiated());
    }
}
