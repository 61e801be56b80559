use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{ConnectTarget, Connector, WireConnection};

/// Connects over a (secure) WebSocket using tokio-tungstenite.
#[derive(Debug, Default)]
pub struct WebSocketConnector {
    _private: (),
}

impl WebSocketConnector {
    pub fn new() -> Self {
        // Ignored when a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self { _private: () }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<WireConnection> {
        let mut request = target
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(format!("invalid url: {e}")))?;

        for (name, value) in &target.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
            request.headers_mut().insert(header, value);
        }

        info!(url = %target.url, connect_id = %target.connect_id, "connecting websocket");
        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect {
                url: target.url.clone(),
                reason: e.to_string(),
            })?;
        debug!(status = %response.status(), "websocket upgraded");

        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
            .with(|data: Bytes| future::ready(Ok::<_, TransportError>(Message::Binary(data))));

        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => {
                    warn!(len = text.len(), "ignoring text message");
                    None
                }
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(frame) => (
                            Some(u16::from(frame.code)),
                            frame.reason.as_str().to_string(),
                        ),
                        None => (None, String::new()),
                    };
                    Some(Err(TransportError::RemoteClosed { code, reason }))
                }
                // Ping/pong are answered by tungstenite.
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
            })
        });

        Ok(WireConnection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_invalid_url() {
        let connector = WebSocketConnector::new();
        let target = ConnectTarget::new("not a url", "c-1");
        let err = connector.connect(&target).await.err().expect("should fail");
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_rejects_invalid_header_value() {
        let connector = WebSocketConnector::new();
        let target = ConnectTarget::new("ws://127.0.0.1:9/dialog", "c-1")
            .with_header("X-Api-App-Key", "bad\nvalue");
        let err = connector.connect(&target).await.err().expect("should fail");
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }
}
