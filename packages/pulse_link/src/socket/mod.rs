//! Socket channel: one persistent bidirectional connection.
//!
//! Owns the full lifecycle for a single logical socket:
//! - connect / teardown with at most one live connection at a time
//! - exponential-backoff reconnection with a give-up ceiling
//! - message-layer heartbeat while connected
//! - handler fan-out for inbound messages and status transitions
//!
//! Failures never escape as errors; callers observe connectivity through
//! `status()` / `on_status_change` only.

mod connector;

pub use connector::{FrameSink, FrameStream, SocketConnector, WsConnector};

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SocketConfig;
use crate::gate::EnvironmentGate;
use crate::handlers::{HandlerSet, Subscription};
use crate::message::{self, WireMessage};
use crate::status::ChannelStatus;

/// Why a live connection ended.
enum CloseReason {
    /// `disconnect()` cancelled us; teardown already handled state.
    Explicit,
    /// The peer closed or the transport failed; schedule a reconnect.
    Remote,
}

#[derive(Clone)]
pub struct SocketChannel {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    /// Environment-gate verdict, frozen at construction.
    enabled: bool,
    cfg: SocketConfig,
    connector: Arc<dyn SocketConnector>,
    status: Mutex<ChannelStatus>,
    messages: HandlerSet<WireMessage>,
    status_changes: HandlerSet<ChannelStatus>,
    link: Mutex<Link>,
}

/// Mutable connection state. All timers hang off the two tokens; cancelling
/// them is the only teardown mechanism, so no path may transition away from
/// the state that required a timer without cancelling it.
#[derive(Default)]
struct Link {
    /// Reconnect attempts since the last successful open.
    attempts: u32,
    /// Writer-task inbox for the current connection, if any.
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Cancels the current connection's reader, writer and heartbeat.
    conn_cancel: Option<CancellationToken>,
    /// Cancels the pending backoff timer. `Some` means one is pending and
    /// scheduling another is a no-op.
    reconnect_cancel: Option<CancellationToken>,
}

impl SocketChannel {
    pub fn new(url: impl Into<String>, cfg: SocketConfig, gate: &EnvironmentGate) -> Self {
        Self::with_connector(url, cfg, gate, Arc::new(WsConnector))
    }

    pub fn with_connector(
        url: impl Into<String>,
        cfg: SocketConfig,
        gate: &EnvironmentGate,
        connector: Arc<dyn SocketConnector>,
    ) -> Self {
        let url = url.into();
        let enabled = gate.allows_push(&url);
        if !enabled {
            info!(url = %url, "socket channel disabled by environment gate");
        }
        Self {
            shared: Arc::new(Shared {
                url,
                enabled,
                cfg,
                connector,
                status: Mutex::new(ChannelStatus::Disconnected),
                messages: HandlerSet::new(),
                status_changes: HandlerSet::new(),
                link: Mutex::new(Link::default()),
            }),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        *self.shared.status.lock()
    }

    pub fn on_message(&self, handler: impl Fn(&WireMessage) + Send + Sync + 'static) -> Subscription {
        self.shared.messages.subscribe(handler)
    }

    pub fn on_status_change(
        &self,
        handler: impl Fn(&ChannelStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.status_changes.subscribe(handler)
    }

    /// Start connecting. No-op when gate-disabled, already connected, or a
    /// connection attempt is already in flight.
    pub fn connect(&self) {
        if !self.shared.enabled {
            return;
        }
        // A manual connect starts a fresh backoff schedule; timer-driven
        // retries go through `Shared::open` directly and keep theirs.
        self.shared.link.lock().attempts = 0;
        Shared::open(&self.shared);
    }

    /// Enqueue a message on the live connection. Silent no-op when disabled
    /// or not connected — callers track deliverability through status.
    pub fn send(&self, kind: &str, payload: Value) {
        if !self.shared.enabled || !self.status().is_connected() {
            return;
        }
        let link = self.shared.link.lock();
        if let Some(tx) = &link.outbound {
            let _ = tx.send(WireMessage::new(kind, payload).to_frame());
        }
    }

    /// Tear down: cancel any pending reconnect, stop the heartbeat, close the
    /// connection, settle at `Disconnected`. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.shared.teardown();
    }
}

impl Shared {
    /// Flip status to `Connecting` unless a connection already exists or is
    /// being established. Returns false when nothing should be done.
    fn begin_connecting(&self) -> bool {
        let mut status = self.status.lock();
        if matches!(*status, ChannelStatus::Connected | ChannelStatus::Connecting) {
            return false;
        }
        *status = ChannelStatus::Connecting;
        true
    }

    fn set_status(&self, next: ChannelStatus) {
        let changed = {
            let mut status = self.status.lock();
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        };
        if changed {
            self.status_changes.emit(&next);
        }
    }

    fn open(shared: &Arc<Self>) {
        if !shared.begin_connecting() {
            return;
        }
        let cancel = CancellationToken::new();
        {
            let mut link = shared.link.lock();
            // At most one live connection: a new attempt replaces (and kills)
            // whatever was there.
            if let Some(old) = link.conn_cancel.replace(cancel.clone()) {
                old.cancel();
            }
            link.outbound = None;
        }
        shared.status_changes.emit(&ChannelStatus::Connecting);
        tokio::spawn(Self::run(Arc::clone(shared), cancel));
    }

    async fn run(shared: Arc<Self>, cancel: CancellationToken) {
        let connecting = shared.connector.connect(&shared.url);
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connecting => result,
        };
        let (sink, stream) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(url = %shared.url, error = %e, "socket connect failed");
                shared.set_status(ChannelStatus::Error);
                Self::schedule_reconnect(&shared, &cancel);
                return;
            }
        };
        // Torn down while the dial was in flight: discard the connection.
        if cancel.is_cancelled() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        {
            let mut link = shared.link.lock();
            link.outbound = Some(tx.clone());
            link.attempts = 0;
        }
        shared.set_status(ChannelStatus::Connected);
        info!(url = %shared.url, "socket connected");

        // Writer and heartbeat run under a child token: a remote close can
        // stop them without cancelling `cancel` itself, which stays reserved
        // for teardown (and is how a reconnect decision learns about one).
        let conn_tasks = cancel.child_token();
        tokio::spawn(Self::write_loop(sink, rx, conn_tasks.clone()));
        tokio::spawn(Self::heartbeat_loop(
            tx.clone(),
            shared.cfg.heartbeat_interval(),
            conn_tasks.clone(),
        ));

        let reason = Self::read_loop(&shared, stream, &tx, &cancel).await;

        match reason {
            CloseReason::Explicit => {}
            CloseReason::Remote => {
                conn_tasks.cancel();
                shared.link.lock().outbound = None;
                shared.set_status(ChannelStatus::Disconnected);
                Self::schedule_reconnect(&shared, &cancel);
            }
        }
    }

    async fn read_loop(
        shared: &Arc<Self>,
        mut stream: FrameStream,
        tx: &mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> CloseReason {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return CloseReason::Explicit,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(frame)) => shared.handle_frame(&frame, tx),
                Some(Err(e)) => {
                    warn!(url = %shared.url, error = %e, "socket stream error");
                    return CloseReason::Remote;
                }
                None => {
                    debug!(url = %shared.url, "socket stream closed by peer");
                    return CloseReason::Remote;
                }
            }
        }
    }

    fn handle_frame(&self, frame: &str, tx: &mpsc::UnboundedSender<String>) {
        let msg = match WireMessage::from_frame(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(url = %self.url, error = %e, "dropping malformed socket frame");
                return;
            }
        };
        match msg.kind.as_str() {
            // Keepalives are answered (or swallowed) at this layer and never
            // reach registered handlers.
            message::PING => {
                let _ = tx.send(WireMessage::pong().to_frame());
            }
            message::PONG => {}
            _ => self.messages.emit(&msg),
        }
    }

    async fn write_loop(
        mut sink: FrameSink,
        mut rx: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => frame,
            };
            match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        warn!(error = %e, "socket write failed");
                        break;
                    }
                }
                None => break,
            }
        }
        let _ = sink.close().await;
    }

    async fn heartbeat_loop(
        tx: mpsc::UnboundedSender<String>,
        period: std::time::Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period);
        // interval() fires immediately; the peer does not need a ping the
        // instant we connect.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if tx.send(WireMessage::ping().to_frame()).is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Arm the backoff timer for the next reconnect attempt. No-op when the
    /// connection token was cancelled — status handlers may call
    /// `disconnect()` mid-dispatch, which must win — or while a timer is
    /// already pending; gives up for good once the attempt ceiling is reached.
    fn schedule_reconnect(shared: &Arc<Self>, conn: &CancellationToken) {
        let (delay, token, attempt) = {
            let mut link = shared.link.lock();
            if conn.is_cancelled() || link.reconnect_cancel.is_some() {
                return;
            }
            if link.attempts >= shared.cfg.max_reconnect_attempts {
                warn!(
                    url = %shared.url,
                    attempts = link.attempts,
                    "reconnect attempts exhausted, giving up"
                );
                drop(link);
                shared.set_status(ChannelStatus::Disconnected);
                return;
            }
            link.attempts += 1;
            let attempt = link.attempts;
            let delay = shared.cfg.reconnect_delay(attempt);
            let token = CancellationToken::new();
            link.reconnect_cancel = Some(token.clone());
            (delay, token, attempt)
        };
        debug!(
            url = %shared.url,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if token.is_cancelled() {
                        return;
                    }
                    shared.link.lock().reconnect_cancel = None;
                    Self::open(&shared);
                }
            }
        });
    }

    fn teardown(&self) {
        {
            let mut link = self.link.lock();
            link.attempts = 0;
            link.outbound = None;
            // Cancelled while the lock is held: `schedule_reconnect` decides
            // under the same lock, so it either sees the cancellation or
            // stores a timer token this take() already claimed.
            if let Some(token) = link.reconnect_cancel.take() {
                token.cancel();
            }
            if let Some(token) = link.conn_cancel.take() {
                token.cancel();
            }
        }
        self.set_status(ChannelStatus::Disconnected);
    }
}
