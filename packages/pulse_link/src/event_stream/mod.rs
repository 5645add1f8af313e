//! Event-stream channel: one receive-only server-push connection.
//!
//! Mirrors the socket channel's subscribe/status surface without `send`.
//! Retry is a fixed-delay loop (the underlying stream primitive's native
//! behavior) rather than exponential backoff, but consecutive failures are
//! counted: once the ceiling is hit without an intervening successful open,
//! the channel tears itself down for good instead of retrying forever.

mod sse;

pub use sse::SseConnector;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::TransportError;
use crate::gate::EnvironmentGate;
use crate::handlers::{HandlerSet, Subscription};
use crate::status::ChannelStatus;

/// Category used for events that arrive without an explicit name.
pub const DEFAULT_CATEGORY: &str = "message";

/// One named server-push event. `data` is an opaque consumer-defined string
/// (JSON text for every category this portal uses).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub category: String,
    pub data: String,
}

/// Inbound half of one event-stream connection. `None` means the server
/// closed the stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TransportError>> + Send>>;

/// Opens one stream per call; all retry policy lives in the channel.
pub trait EventStreamConnector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<EventStream, TransportError>>;
}

#[derive(Clone)]
pub struct EventStreamChannel {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    enabled: bool,
    cfg: StreamConfig,
    connector: Arc<dyn EventStreamConnector>,
    status: Mutex<ChannelStatus>,
    status_changes: HandlerSet<ChannelStatus>,
    /// Handlers registered for every event regardless of category.
    generic: HandlerSet<StreamEvent>,
    /// Handlers keyed by category. Dispatch fans out to both sets.
    categories: Mutex<HashMap<String, HandlerSet<StreamEvent>>>,
    state: Mutex<StreamState>,
}

#[derive(Default)]
struct StreamState {
    /// Failures since the last successful open.
    failures: u32,
    cancel: Option<CancellationToken>,
}

impl EventStreamChannel {
    pub fn new(url: impl Into<String>, cfg: StreamConfig, gate: &EnvironmentGate) -> Self {
        Self::with_connector(url, cfg, gate, Arc::new(SseConnector::default()))
    }

    pub fn with_connector(
        url: impl Into<String>,
        cfg: StreamConfig,
        gate: &EnvironmentGate,
        connector: Arc<dyn EventStreamConnector>,
    ) -> Self {
        let url = url.into();
        let enabled = gate.allows_push(&url);
        if !enabled {
            info!(url = %url, "event-stream channel disabled by environment gate");
        }
        Self {
            shared: Arc::new(Shared {
                url,
                enabled,
                cfg,
                connector,
                status: Mutex::new(ChannelStatus::Disconnected),
                status_changes: HandlerSet::new(),
                generic: HandlerSet::new(),
                categories: Mutex::new(HashMap::new()),
                state: Mutex::new(StreamState::default()),
            }),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        *self.shared.status.lock()
    }

    pub fn on_status_change(
        &self,
        handler: impl Fn(&ChannelStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.status_changes.subscribe(handler)
    }

    /// Register for one named event category.
    pub fn on_category(
        &self,
        category: &str,
        handler: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared
            .categories
            .lock()
            .entry(category.to_string())
            .or_default()
            .subscribe(handler)
    }

    /// Register for every event, whatever its category.
    pub fn on_any(&self, handler: impl Fn(&StreamEvent) + Send + Sync + 'static) -> Subscription {
        self.shared.generic.subscribe(handler)
    }

    /// Open the stream. No-op when gate-disabled or already open/opening.
    pub fn connect(&self) {
        if !self.shared.enabled {
            return;
        }
        if !self.shared.begin_connecting() {
            return;
        }
        let cancel = CancellationToken::new();
        {
            let mut state = self.shared.state.lock();
            if let Some(old) = state.cancel.replace(cancel.clone()) {
                old.cancel();
            }
            state.failures = 0;
        }
        self.shared.status_changes.emit(&ChannelStatus::Connecting);
        tokio::spawn(Shared::run(Arc::clone(&self.shared), cancel));
    }

    /// Tear down the stream and stop retrying. Safe to call repeatedly.
    pub fn disconnect(&self) {
        if let Some(token) = self.shared.state.lock().cancel.take() {
            token.cancel();
        }
        self.shared.set_status(ChannelStatus::Disconnected);
    }
}

impl Shared {
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

    fn dispatch(&self, event: &StreamEvent) {
        // Fan-out, not either/or: category handlers and generic handlers
        // both see the event. Clone the set out so handlers run unlocked.
        let named = self.categories.lock().get(&event.category).cloned();
        if let Some(set) = named {
            set.emit(event);
        }
        self.generic.emit(event);
    }

    async fn run(shared: Arc<Self>, cancel: CancellationToken) {
        loop {
            let connecting = shared.connector.connect(&shared.url);
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connecting => result,
            };

            match result {
                Ok(mut stream) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    shared.state.lock().failures = 0;
                    shared.set_status(ChannelStatus::Connected);
                    info!(url = %shared.url, "event stream open");

                    loop {
                        let item = tokio::select! {
                            _ = cancel.cancelled() => return,
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(event)) => shared.dispatch(&event),
                            Some(Err(e)) => {
                                warn!(url = %shared.url, error = %e, "event stream error");
                                break;
                            }
                            None => {
                                debug!(url = %shared.url, "event stream closed by server");
                                break;
                            }
                        }
                    }
                    shared.set_status(ChannelStatus::Disconnected);
                }
                Err(e) => {
                    warn!(url = %shared.url, error = %e, "event stream connect failed");
                    shared.set_status(ChannelStatus::Error);
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            let failures = {
                let mut state = shared.state.lock();
                state.failures += 1;
                state.failures
            };
            if failures >= shared.cfg.failure_ceiling {
                warn!(
                    url = %shared.url,
                    failures,
                    "event stream failure ceiling reached, giving up"
                );
                shared.state.lock().cancel = None;
                shared.set_status(ChannelStatus::Disconnected);
                return;
            }

            debug!(url = %shared.url, failures, "event stream retrying");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(shared.cfg.retry_delay()) => {}
            }
            shared.set_status(ChannelStatus::Connecting);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;

    fn event(category: &str, data: &str) -> StreamEvent {
        StreamEvent {
            category: category.to_string(),
            data: data.to_string(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn events_fan_out_to_category_and_generic_handlers() {
        let (channel, mut fake) =
            channel_with_script(StreamConfig::default(), vec![Attempt::OpenLive]);

        let named: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let any: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let named_sink = named.clone();
        let any_sink = any.clone();
        let _n = channel.on_category("vitals", move |ev| named_sink.lock().push(ev.data.clone()));
        let _a = channel.on_any(move |ev| any_sink.lock().push(ev.category.clone()));

        channel.connect();
        settle().await;
        assert_eq!(channel.status(), ChannelStatus::Connected);

        let tx = fake.live.recv().await.unwrap();
        tx.send(Ok(event("vitals", "{\"bpm\":70}"))).unwrap();
        tx.send(Ok(event("wallet", "{}"))).unwrap();
        settle().await;

        // The named handler saw only its category; the generic one saw both.
        assert_eq!(*named.lock(), vec!["{\"bpm\":70}".to_string()]);
        assert_eq!(*any.lock(), vec!["vitals".to_string(), "wallet".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_ceiling_terminates_the_channel() {
        let cfg = StreamConfig {
            failure_ceiling: 5,
            retry_delay_ms: 3_000,
        };
        let (channel, fake) = channel_with_script(cfg, vec![]);
        channel.connect();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fake.calls(), 5);
        assert_eq!(channel.status(), ChannelStatus::Disconnected);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fake.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_the_failure_counter() {
        let cfg = StreamConfig {
            failure_ceiling: 3,
            retry_delay_ms: 1_000,
        };
        // Two refusals, one good open, then refusals until the ceiling.
        let (channel, fake) = channel_with_script(
            cfg,
            vec![
                Attempt::Refuse,
                Attempt::Refuse,
                Attempt::Open(vec![Ok(event("vitals", "{}"))]),
            ],
        );
        channel.connect();

        tokio::time::sleep(Duration::from_secs(60)).await;
        // 2 failures, an open that reset the counter, then 3 more failures
        // (the drained stream counts as the first) to reach the ceiling.
        assert_eq!(fake.calls(), 5);
        assert_eq!(channel.status(), ChannelStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_retrying() {
        let (channel, fake) = channel_with_script(StreamConfig::default(), vec![]);
        channel.connect();
        settle().await;
        assert_eq!(fake.calls(), 1);

        channel.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fake.calls(), 1);
        assert_eq!(channel.status(), ChannelStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn gated_endpoint_never_opens() {
        let (live_hand, _live) = mpsc::unbounded_channel();
        let inner = Arc::new(FakeInner {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            live_hand,
        });
        let channel = EventStreamChannel::with_connector(
            "https://portal.netlify.app/events",
            StreamConfig::default(),
            &EnvironmentGate::default(),
            Arc::new(FakeConnector {
                inner: inner.clone(),
            }),
        );

        channel.connect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(channel.status(), ChannelStatus::Disconnected);
    }
}
