//! Text-frame transports carrying handshake JSON and compact envelopes.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

use crate::error::{GateStreamError, Result};

/// A bidirectional stream of UTF-8 text frames.
///
/// `recv` returning `Ok(None)` means the peer went away cleanly.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> Result<()>;
    async fn recv(&mut self) -> Result<Option<String>>;
    async fn close(&mut self) -> Result<()>;
}

/// In-process transport over a pair of unbounded channels.
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelTransport {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { tx: Some(a_tx), rx: b_rx },
            Self { tx: Some(b_tx), rx: a_rx },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| GateStreamError::SessionClosed),
            None => Err(GateStreamError::SessionClosed),
        }
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

/// WebSocket transport. Only text frames carry protocol data.
pub struct WsTransport<S> {
    ws: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: String) -> Result<()> {
        self.ws.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                // tungstenite queues the pong itself.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                    trace!("control frame");
                    continue;
                }
                Some(Ok(Message::Binary(_))) => {
                    return Err(GateStreamError::Protocol("binary frames are not accepted".into()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.ws.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
