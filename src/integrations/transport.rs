//! Streaming transport used by the live communicators
//!
//! The communicator only ever sees text frames; the websocket details
//! (TLS, upgrade headers, ping/pong, close frames) stay in this module.

use super::error::ApiError;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// An open bidirectional text connection
#[async_trait]
pub trait StreamTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ApiError>;

    /// Next inbound text frame; `None` once the peer closed the connection
    async fn next_text(&mut self) -> Option<Result<String, ApiError>>;

    async fn close(&mut self);
}

/// Opens new transports; one call per connection attempt
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, ApiError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket connector with optional extra upgrade headers
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    headers: Vec<(String, String)>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, ApiError> {
        let mut request = self.url.as_str().into_client_request()?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ApiError::Protocol(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ApiError::Protocol(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(request).await?;
        let (write, read) = stream.split();
        Ok(Box::new(WsTransport { write, read }))
    }
}

struct WsTransport {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ApiError> {
        self.write.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, ApiError>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => return Some(Err(ApiError::Protocol(e.to_string()))),
                },
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.write.send(Message::Pong(payload)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!("Peer closed websocket: {:?}", frame);
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.send(Message::Close(None)).await {
            tracing::debug!("Failed to send websocket close: {}", e);
        }
    }
}
