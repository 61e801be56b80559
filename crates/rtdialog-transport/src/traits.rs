use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, Stream};

use crate::error::{Result, TransportError};

/// Outbound half of a connection: accepts whole binary messages.
pub type WireSink = Pin<Box<dyn Sink<Bytes, Error = TransportError> + Send>>;

/// Inbound half of a connection: yields whole binary messages.
///
/// A remote close is reported as [`TransportError::RemoteClosed`]; the
/// stream ends after it.
pub type WireStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An established, message-oriented connection.
pub struct WireConnection {
    pub sink: WireSink,
    pub stream: WireStream,
}

/// Where and how to connect.
#[derive(Clone)]
pub struct ConnectTarget {
    /// Endpoint URL.
    pub url: String,
    /// Caller-supplied identifier, unique per attempt.
    pub connect_id: String,
    /// Request headers sent with the upgrade. Values may hold credentials.
    pub headers: Vec<(String, String)>,
}

impl ConnectTarget {
    pub fn new(url: impl Into<String>, connect_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_id: connect_id.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.headers.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("ConnectTarget")
            .field("url", &self.url)
            .field("connect_id", &self.connect_id)
            .field("headers", &names)
            .finish()
    }
}

/// Opens connections. Implemented by the WebSocket connector and the
/// in-memory connector.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, target: &ConnectTarget) -> Result<WireConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_header_values() {
        let target = ConnectTarget::new("wss://example.invalid/dialog", "c-1")
            .with_header("X-Api-Access-Key", "super-secret");
        let rendered = format!("{target:?}");
        assert!(rendered.contains("X-Api-Access-Key"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let target = ConnectTarget::new("wss://example.invalid", "c-1")
            .with_header("X-Api-Connect-Id", "c-1");
        assert_eq!(target.header("x-api-connect-id"), Some("c-1"));
        assert_eq!(target.header("missing"), None);
    }
}
