//! Keyed polling: the fallback transport that always works.
//!
//! Each key owns one timer driving an async refresh callback. A failed
//! refresh is logged and retried on the next tick without backoff — the
//! interval itself bounds the request rate. Liveness for aggregation is
//! simply "at least one key is running", broadcast on edges only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handlers::{HandlerSet, Subscription};

/// A zero-argument async refresh. The return value is only used for
/// logging; an `Err` never stops the timer.
pub type PollCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct PollRegistry {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    timers: Mutex<HashMap<String, CancellationToken>>,
    /// Fired with `true` when the first timer starts, `false` when the last
    /// one stops. Never fired for intermediate key-count changes.
    active_changes: HandlerSet<bool>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) polling under `key`. Any timer already running
    /// under the key is cancelled first, so one key never drives duplicate
    /// concurrent timers.
    pub fn start(&self, key: &str, interval: Duration, callback: PollCallback) {
        let token = CancellationToken::new();
        let (went_active, previous) = {
            let mut timers = self.shared.timers.lock();
            let was_idle = timers.is_empty();
            let previous = timers.insert(key.to_string(), token.clone());
            (was_idle && previous.is_none(), previous)
        };
        if let Some(previous) = previous {
            previous.cancel();
            debug!(key = %key, "poll timer restarted");
        } else {
            debug!(key = %key, interval_ms = interval.as_millis() as u64, "poll timer started");
        }
        tokio::spawn(Self::run(key.to_string(), interval, callback, token));
        if went_active {
            self.shared.active_changes.emit(&true);
        }
    }

    /// Stop polling under `key`. No-op for unknown keys.
    pub fn stop(&self, key: &str) {
        let (token, went_idle) = {
            let mut timers = self.shared.timers.lock();
            let token = timers.remove(key);
            (token, timers.is_empty())
        };
        let Some(token) = token else { return };
        token.cancel();
        debug!(key = %key, "poll timer stopped");
        if went_idle {
            self.shared.active_changes.emit(&false);
        }
    }

    /// Stop every timer.
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.shared.timers.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        for (key, token) in drained {
            token.cancel();
            debug!(key = %key, "poll timer stopped");
        }
        self.shared.active_changes.emit(&false);
    }

    pub fn is_polling(&self, key: &str) -> bool {
        self.shared.timers.lock().contains_key(key)
    }

    /// True while any key has a running timer.
    pub fn active(&self) -> bool {
        !self.shared.timers.lock().is_empty()
    }

    pub fn on_active_change(&self, handler: impl Fn(&bool) + Send + Sync + 'static) -> Subscription {
        self.shared.active_changes.subscribe(handler)
    }

    async fn run(key: String, interval: Duration, callback: PollCallback, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first refresh happens one full interval after start, not
        // immediately — callers that want data now fetch it themselves.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let refresh = callback();
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = refresh => {
                    if let Err(e) = result {
                        warn!(key = %key, error = %e, "poll refresh failed");
                    }
                }
            }
        }
    }
}
