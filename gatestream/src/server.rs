//! WebSocket endpoint for the gateway.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::transport::WsTransport;

/// Bind the configured address.
pub async fn bind(config: &GatewayConfig) -> Result<TcpListener> {
    Ok(TcpListener::bind(config.bind_addr()).await?)
}

/// Accept connections forever, one task each.
pub async fn run(gateway: Arc<Gateway>, listener: TcpListener) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, path = %gateway.config().path, "gateway listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let gateway = gateway.clone();
        tokio::spawn(async move {
            let ws = match upgrade(stream, gateway.config()).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "upgrade refused");
                    return;
                }
            };
            debug!(peer = %peer, "connection upgraded");
            if let Err(e) = gateway.accept(WsTransport::new(ws)).await {
                debug!(peer = %peer, error = %e, "connection ended with error");
            }
        });
    }
}

/// WebSocket upgrade that only accepts the secure path.
pub async fn upgrade(stream: TcpStream, config: &GatewayConfig) -> Result<WebSocketStream<TcpStream>> {
    let expected = config.path.clone();
    let callback = move |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        if request.uri().path() == expected {
            return Ok(response);
        }
        let mut refusal = ErrorResponse::new(Some("not found".into()));
        *refusal.status_mut() = StatusCode::NOT_FOUND;
        Err(refusal)
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_frame_bytes);
    ws_config.max_frame_size = Some(config.max_frame_bytes);

    Ok(tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?)
}
