//! Transport seam between [`Connection`](crate::connection::Connection) and
//! the socket implementation.
//!
//! A [`Connector`] opens one text-frame duplex per call. Production code
//! uses [`WsConnector`] (tokio-tungstenite); tests substitute an in-memory
//! connector so lifecycle behavior can run under paused time.

use std::pin::Pin;

use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(Box<tungstenite::Error>),
    #[error("websocket error: {0}")]
    Socket(Box<tungstenite::Error>),
    #[error("websocket closed")]
    Closed,
}

/// Outbound half: accepts encoded JSON frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
/// Inbound half: yields JSON text frames until the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Opens text-frame transports.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the handshake fails.
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError>;
}

/// WebSocket connector over tokio-tungstenite (`ws://` and `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|error| TransportError::Connect(Box::new(error)))?;
        let (write, read) = socket.split();

        let sink = write
            .sink_map_err(|error| TransportError::Socket(Box::new(error)))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::text(text))));

        // Control frames are answered by tungstenite itself; binary frames are
        // not part of this protocol.
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(_) => None,
                Err(error) => Some(Err(TransportError::Socket(Box::new(error)))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
