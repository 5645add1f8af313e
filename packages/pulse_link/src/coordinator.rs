//! Transport coordinator: explicit session-scoped ownership of the channels
//! plus the derived connectivity signal.
//!
//! Owns one socket channel, one poll registry, and optionally one
//! event-stream channel. Derives `is_connected` as the OR of child liveness,
//! recomputed on every child transition and broadcast only on value changes.
//! Routes socket messages by type to domain refresh callbacks; it has no idea
//! what "vitals" or "wallet" mean.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::RealtimeConfig;
use crate::event_stream::EventStreamChannel;
use crate::gate::EnvironmentGate;
use crate::handlers::{HandlerSet, Subscription};
use crate::message::WireMessage;
use crate::poll::{PollCallback, PollRegistry};
use crate::socket::SocketChannel;

/// Where the session's push transports point. `stream: None` means the
/// deployment has no event-stream endpoint at all (distinct from one the
/// environment gate disables).
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub socket: String,
    pub stream: Option<String>,
}

/// Invoked for every socket message whose `type` it was registered under.
pub type RouteCallback = Arc<dyn Fn(&WireMessage) + Send + Sync>;

#[derive(Clone)]
pub struct TransportCoordinator {
    socket: SocketChannel,
    stream: Option<EventStreamChannel>,
    polls: PollRegistry,
    shared: Arc<Shared>,
    /// Keeps the liveness/routing wiring attached for the session.
    _wiring: Arc<Vec<Subscription>>,
}

struct Shared {
    connected: Mutex<bool>,
    connectivity: HandlerSet<bool>,
    routes: Mutex<HashMap<String, Vec<RouteCallback>>>,
}

impl TransportCoordinator {
    /// Build a session with production connectors. Each push channel runs
    /// its endpoint through the gate exactly once, here.
    pub fn new(endpoints: Endpoints, cfg: RealtimeConfig, gate: &EnvironmentGate) -> Self {
        let socket = SocketChannel::new(endpoints.socket, cfg.socket, gate);
        let stream = endpoints
            .stream
            .map(|url| EventStreamChannel::new(url, cfg.stream, gate));
        Self::from_channels(socket, stream)
    }

    /// Assemble from pre-built channels (the test seam, and the hook for
    /// custom connectors).
    pub fn from_channels(socket: SocketChannel, stream: Option<EventStreamChannel>) -> Self {
        let polls = PollRegistry::new();
        let shared = Arc::new(Shared {
            connected: Mutex::new(false),
            connectivity: HandlerSet::new(),
            routes: Mutex::new(HashMap::new()),
        });

        let recompute: Arc<dyn Fn() + Send + Sync> = {
            let shared = shared.clone();
            let socket = socket.clone();
            let stream = stream.clone();
            let polls = polls.clone();
            Arc::new(move || {
                let live = socket.status().is_connected()
                    || stream.as_ref().is_some_and(|s| s.status().is_connected())
                    || polls.active();
                shared.broadcast_if_changed(live);
            })
        };

        let mut wiring = Vec::new();
        wiring.push(socket.on_status_change({
            let recompute = recompute.clone();
            move |_| recompute()
        }));
        if let Some(stream) = &stream {
            wiring.push(stream.on_status_change({
                let recompute = recompute.clone();
                move |_| recompute()
            }));
        }
        wiring.push(polls.on_active_change({
            let recompute = recompute.clone();
            move |_| recompute()
        }));
        wiring.push(socket.on_message({
            let shared = shared.clone();
            move |msg| shared.dispatch_route(msg)
        }));

        Self {
            socket,
            stream,
            polls,
            shared,
            _wiring: Arc::new(wiring),
        }
    }

    /// Kick off every push transport. Gate-disabled channels stay silent
    /// without affecting the others.
    pub fn connect(&self) {
        self.socket.connect();
        if let Some(stream) = &self.stream {
            stream.connect();
        }
    }

    /// Tear down the session: close both push channels and stop every poll
    /// timer. The aggregate signal settles at `false`.
    pub fn shutdown(&self) {
        self.socket.disconnect();
        if let Some(stream) = &self.stream {
            stream.disconnect();
        }
        self.polls.stop_all();
    }

    /// The derived liveness signal: true iff any owned channel is live.
    pub fn is_connected(&self) -> bool {
        *self.shared.connected.lock()
    }

    /// Edge-triggered: fires only when the aggregate value changes.
    pub fn on_connectivity_change(
        &self,
        handler: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.connectivity.subscribe(handler)
    }

    /// Route socket messages of `kind` to a cache-invalidation callback.
    /// Multiple routes per kind all fire.
    pub fn route(&self, kind: &str, callback: impl Fn(&WireMessage) + Send + Sync + 'static) {
        self.shared
            .routes
            .lock()
            .entry(kind.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Start a domain refresh loop under `key` with its own interval.
    pub fn start_poll(&self, key: &str, interval: Duration, callback: PollCallback) {
        self.polls.start(key, interval, callback);
    }

    pub fn stop_poll(&self, key: &str) {
        self.polls.stop(key);
    }

    pub fn is_polling(&self, key: &str) -> bool {
        self.polls.is_polling(key)
    }

    /// Direct access for callers that need `send`/`on_message`.
    pub fn socket(&self) -> &SocketChannel {
        &self.socket
    }

    pub fn stream(&self) -> Option<&EventStreamChannel> {
        self.stream.as_ref()
    }

    pub fn polls(&self) -> &PollRegistry {
        &self.polls
    }
}

impl Shared {
    fn broadcast_if_changed(&self, live: bool) {
        let changed = {
            let mut connected = self.connected.lock();
            if *connected == live {
                false
            } else {
                *connected = live;
                true
            }
        };
        if changed {
            self.connectivity.emit(&live);
        }
    }

    fn dispatch_route(&self, msg: &WireMessage) {
        let matching: Vec<RouteCallback> = self
            .routes
            .lock()
            .get(&msg.kind)
            .cloned()
            .unwrap_or_default();
        if matching.is_empty() {
            debug!(kind = %msg.kind, "no route for realtime message");
            return;
        }
        for callback in matching {
            callback(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::{SocketConfig, StreamConfig};
    use crate::event_stream::testing as stream_testing;
    use crate::socket::testing as socket_testing;
    use crate::status::ChannelStatus;

    fn quiet_socket() -> SocketConfig {
        SocketConfig {
            heartbeat_interval_ms: 600_000,
            ..SocketConfig::default()
        }
    }

    fn idle_callback() -> PollCallback {
        Arc::new(|| Box::pin(async { Ok(()) }))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn socket_connectivity_drives_the_aggregate() {
        let (socket, mut fake) = socket_testing::channel_with_fake(quiet_socket(), 0);
        let coordinator = TransportCoordinator::from_channels(socket, None);
        assert!(!coordinator.is_connected());

        coordinator.connect();
        settle().await;
        let _server = fake.servers.recv().await.unwrap();
        assert!(coordinator.is_connected());

        coordinator.shutdown();
        assert!(!coordinator.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_is_an_or_over_all_children() {
        let (socket, mut fake) = socket_testing::channel_with_fake(quiet_socket(), 0);
        let coordinator = TransportCoordinator::from_channels(socket, None);

        // Polling alone keeps the session live...
        coordinator.start_poll("vitals", Duration::from_secs(30), idle_callback());
        assert!(coordinator.is_connected());

        coordinator.connect();
        settle().await;
        let _server = fake.servers.recv().await.unwrap();

        // ...so dropping the socket while a poll runs must not flip it.
        coordinator.socket().disconnect();
        assert!(coordinator.is_connected());

        coordinator.stop_poll("vitals");
        assert!(!coordinator.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_broadcasts_only_on_edges() {
        let (socket, mut fake) = socket_testing::channel_with_fake(quiet_socket(), 0);
        let coordinator = TransportCoordinator::from_channels(socket, None);

        let edges: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = edges.clone();
        let _sub = coordinator.on_connectivity_change(move |v| sink.lock().push(*v));

        coordinator.start_poll("vitals", Duration::from_secs(30), idle_callback());
        coordinator.start_poll("wallet", Duration::from_secs(60), idle_callback());
        coordinator.connect();
        settle().await;
        let _server = fake.servers.recv().await.unwrap();
        coordinator.shutdown();

        // true once when the first poll started, false once at shutdown —
        // the socket connecting while already live stayed silent.
        assert_eq!(*edges.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn event_stream_counts_toward_liveness() {
        let (socket, _fake) = socket_testing::channel_with_fake(quiet_socket(), u32::MAX);
        let (stream, mut stream_fake) = stream_testing::channel_with_script(
            StreamConfig::default(),
            vec![stream_testing::Attempt::OpenLive],
        );
        let coordinator = TransportCoordinator::from_channels(socket, Some(stream));

        coordinator.connect();
        settle().await;
        let _tx = stream_fake.live.recv().await.unwrap();
        assert_eq!(
            coordinator.stream().unwrap().status(),
            ChannelStatus::Connected
        );
        assert!(coordinator.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn routes_messages_by_type() {
        let (socket, mut fake) = socket_testing::channel_with_fake(quiet_socket(), 0);
        let coordinator = TransportCoordinator::from_channels(socket, None);

        let vitals_hits = Arc::new(AtomicUsize::new(0));
        let wallet_hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = vitals_hits.clone();
            coordinator.route("vitals.updated", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let hits = wallet_hits.clone();
            coordinator.route("wallet.updated", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        coordinator.connect();
        settle().await;
        let server = fake.servers.recv().await.unwrap();
        for kind in ["vitals.updated", "vitals.updated", "rewards.granted"] {
            server
                .inbound
                .send(Ok(WireMessage::new(kind, serde_json::Value::Null).to_frame()))
                .unwrap();
        }
        settle().await;

        assert_eq!(vitals_hits.load(Ordering::SeqCst), 2);
        assert_eq!(wallet_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_socket_leaves_polling_untouched() {
        let coordinator = TransportCoordinator::new(
            Endpoints {
                socket: "wss://portal.vercel.app/ws".to_string(),
                stream: None,
            },
            RealtimeConfig::default(),
            &EnvironmentGate::default(),
        );

        coordinator.connect();
        settle().await;
        assert!(!coordinator.is_connected());

        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        coordinator.start_poll(
            "vitals",
            Duration::from_secs(1),
            Arc::new(move || {
                let inner = inner.clone();
                Box::pin(async move {
                    inner.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        assert!(coordinator.is_connected());
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_polls_and_settles_disconnected() {
        let (socket, mut fake) = socket_testing::channel_with_fake(quiet_socket(), 0);
        let coordinator = TransportCoordinator::from_channels(socket, None);

        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        coordinator.start_poll(
            "wallet",
            Duration::from_secs(1),
            Arc::new(move || {
                let inner = inner.clone();
                Box::pin(async move {
                    inner.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        coordinator.connect();
        settle().await;
        let _server = fake.servers.recv().await.unwrap();

        coordinator.shutdown();
        let after = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!coordinator.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), after);
        assert_eq!(coordinator.socket().status(), ChannelStatus::Disconnected);
    }
}
