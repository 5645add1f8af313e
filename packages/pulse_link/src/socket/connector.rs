//! The socket channel's transport seam.
//!
//! `SocketChannel` speaks text frames over an abstract sink/stream pair so
//! the reconnect, heartbeat and dispatch logic can be exercised against
//! channel-backed fakes. `WsConnector` is the production implementation on
//! top of tokio-tungstenite.

use std::pin::Pin;

use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

/// Outbound half of one socket connection: UTF-8 text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of one socket connection. `None` means the peer closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Dials one connection. The channel owns all retry policy; a connector only
/// ever makes a single attempt per call.
pub trait SocketConnector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), TransportError>>;
}

/// WebSocket connector. Binary, protocol-level ping/pong and close frames are
/// not surfaced: keepalive runs at the message layer (see `message::PING`),
/// and a close simply ends the frame stream.
pub struct WsConnector;

impl SocketConnector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws, _response) = connect_async(&url).await?;
            let (sink, stream) = ws.split();

            let sink: FrameSink = Box::pin(
                sink.with(|text: String| future::ready(Ok::<_, TransportError>(Message::text(text)))),
            );
            let stream: FrameStream = Box::pin(stream.filter_map(|item| {
                future::ready(match item {
                    Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::from(e))),
                })
            }));

            Ok((sink, stream))
        })
    }
}
