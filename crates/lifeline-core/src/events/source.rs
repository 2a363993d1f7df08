//! Where live events come from

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::{ChannelError, ServerEvent};

/// Stream of events from one connection; it ends when the peer closes
pub type EventStream = BoxStream<'static, Result<ServerEvent, ChannelError>>;

/// Opens push connections
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self, token: Option<String>) -> Result<EventStream, ChannelError>;
}

/// WebSocket event source carrying JSON text or binary frames
#[derive(Debug, Clone)]
pub struct WebSocketSource {
    url: String,
}

impl WebSocketSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl EventSource for WebSocketSource {
    async fn open(&self, token: Option<String>) -> Result<EventStream, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ChannelError::Connect(e.to_string()))?;
            request.headers_mut().insert("authorization", value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        debug!("WebSocket connected to {}", self.url);

        let events = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(ServerEvent::decode(&text)),
                Ok(Message::Binary(data)) => Some(ServerEvent::decode_bytes(&data)),
                // Pings are answered by tungstenite; a close frame ends the stream
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Stream(e.to_string()))),
            }
        });

        Ok(events.boxed())
    }
}
