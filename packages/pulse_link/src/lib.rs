//! Realtime delivery layer for cached client state.
//!
//! Keeps application caches (vitals, wallet balance, notifications — the
//! crate does not care which) synchronized with server state across
//! deployment targets where no single transport is guaranteed to exist:
//!
//! - [`SocketChannel`] — persistent bidirectional socket with exponential
//!   backoff reconnection and a message-layer heartbeat
//! - [`EventStreamChannel`] — one-way server push with native fixed-delay
//!   retry and a consecutive-failure ceiling
//! - [`PollRegistry`] — keyed timed re-fetch, the fallback that always works
//! - [`TransportCoordinator`] — owns the channels for one session and
//!   derives a single edge-triggered `is_connected` signal
//! - [`EnvironmentGate`] — disables long-lived transports up front on
//!   hosting targets known not to support them
//!
//! Connectivity is the only thing that surfaces: no public method returns an
//! error, and transport failures degrade the session to whichever channels
//! remain viable.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod event_stream;
pub mod gate;
pub mod handlers;
pub mod message;
pub mod poll;
pub mod socket;
pub mod status;

pub use config::{RealtimeConfig, SocketConfig, StreamConfig};
pub use coordinator::{Endpoints, RouteCallback, TransportCoordinator};
pub use error::TransportError;
pub use event_stream::{EventStreamChannel, EventStreamConnector, SseConnector, StreamEvent};
pub use gate::EnvironmentGate;
pub use handlers::{HandlerSet, Subscription};
pub use message::WireMessage;
pub use poll::{PollCallback, PollRegistry};
pub use socket::{SocketChannel, SocketConnector, WsConnector};
pub use status::ChannelStatus;
