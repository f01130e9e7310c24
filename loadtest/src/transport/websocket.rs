use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::trace;

use super::{Connection, FrameSink, FrameStream, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport: one `ws://`/`wss://` connection per agent, with the
/// target key passed as a query parameter named after the route key field.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    route_key_field: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, route_key_field: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            route_key_field: route_key_field.into(),
        }
    }

    /// Build the connection URL for a target key
    pub fn url_for(&self, target_key: &str) -> Result<Url, TransportError> {
        Url::parse_with_params(&self.url, &[(self.route_key_field.as_str(), target_key)])
            .map_err(|e| TransportError::Connect(format!("invalid url {}: {}", self.url, e)))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, target_key: &str) -> Result<Connection, TransportError> {
        let url = self.url_for(target_key)?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();
        Ok(Connection {
            sink: Box::new(WsSink(sink)),
            stream: Box::new(WsFrames(stream)),
        })
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

struct WsFrames(SplitStream<WsStream>);

#[async_trait]
impl FrameStream for WsFrames {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Ok(Message::Close(frame)) => {
                    trace!("Peer sent close frame: {:?}", frame);
                    return None;
                }
                // Ping/Pong are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Recv(e.to_string()))),
            }
        }
    }
}
