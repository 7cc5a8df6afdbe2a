//! # Upstream Connection
//!
//! The network seam of the gateway. [`SpeechGateway`](super::SpeechGateway) only
//! talks to these traits, so tests can script the upstream in memory and the
//! production path uses a TLS WebSocket via tokio-tungstenite.

use super::error::SpeechError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// One open session with the recognizer.
#[async_trait]
pub trait UpstreamConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SpeechError>;

    /// Next inbound text message. `None` once the peer has closed.
    async fn next_text(&mut self) -> Option<Result<String, SpeechError>>;

    /// Close the session. Errors are logged, not returned.
    async fn close(&mut self);
}

/// Opens sessions against a signed URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Box<dyn UpstreamConnection>, SpeechError>;
}

/// Production connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Box<dyn UpstreamConnection>, SpeechError> {
        let attempt = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| SpeechError::Connection {
                status: None,
                reason: format!("handshake timed out after {}s", timeout.as_secs()),
            })?;

        match attempt {
            Ok((stream, response)) => {
                debug!(status = response.status().as_u16(), "upstream handshake accepted");
                Ok(Box::new(WebSocketConnection { stream }))
            }
            Err(err) => Err(handshake_error(err)),
        }
    }
}

/// Map a failed upgrade to a `Connection` error carrying the remote status and reason.
fn handshake_error(err: WsError) -> SpeechError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            let header_reason = response
                .headers()
                .get("error")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body_reason = response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).trim().to_string())
                .filter(|text| !text.is_empty());

            let reason = header_reason
                .or(body_reason)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("handshake rejected").to_string());

            SpeechError::Connection {
                status: Some(status.as_u16()),
                reason,
            }
        }
        other => SpeechError::Connection {
            status: None,
            reason: other.to_string(),
        },
    }
}

pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl UpstreamConnection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> Result<(), SpeechError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| SpeechError::Transport(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, SpeechError>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "upstream closed the session");
                    return None;
                }
                // Ping/pong are answered by tungstenite itself
                Ok(_) => continue,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(err) => return Some(Err(SpeechError::Transport(err.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            debug!(error = %err, "closing upstream session failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::Response;

    #[test]
    fn test_handshake_rejection_prefers_error_header() {
        let response = Response::builder()
            .status(401)
            .header("error", "HMAC signature does not match")
            .body(Some(b"{\"message\":\"Unauthorized\"}".to_vec()))
            .unwrap();

        match handshake_error(WsError::Http(response)) {
            SpeechError::Connection { status, reason } => {
                assert_eq!(status, Some(401));
                assert_eq!(reason, "HMAC signature does not match");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_handshake_rejection_falls_back_to_body() {
        let response = Response::builder()
            .status(403)
            .body(Some(b" {\"message\":\"HMAC clock skew\"} ".to_vec()))
            .unwrap();

        let err = handshake_error(WsError::Http(response));
        assert_eq!(
            err,
            SpeechError::Connection {
                status: Some(403),
                reason: "{\"message\":\"HMAC clock skew\"}".to_string()
            }
        );
    }

    #[test]
    fn test_handshake_rejection_without_details() {
        let response = Response::builder().status(403).body(None).unwrap();
        let err = handshake_error(WsError::Http(response));
        assert!(err.to_string().contains("403 - Forbidden"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let result = WebSocketConnector
            .connect("ws://127.0.0.1:1/v2/iat", Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(SpeechError::Connection { status: None, .. })));
    }
}

/// In-memory upstream for gateway and handler tests.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Replays canned replies once all frames are sent.
    #[derive(Clone, Default)]
    pub struct ScriptedConnector {
        pub replies: Vec<String>,
        /// Never answer after the replies run out (exercises the receive timeout).
        pub hang: bool,
        /// Fail the send with this index.
        pub fail_send_at: Option<usize>,
        /// Reject the handshake with this error.
        pub reject: Option<SpeechError>,
        pub connects: Arc<AtomicUsize>,
        pub urls: Arc<Mutex<Vec<String>>>,
        pub sent: Arc<Mutex<Vec<String>>>,
        pub closed: Arc<AtomicBool>,
    }

    impl ScriptedConnector {
        pub fn replying(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn sent_messages(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|text| serde_json::from_str(text).unwrap())
                .collect()
        }

        pub fn was_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            url: &str,
            _timeout: Duration,
        ) -> Result<Box<dyn UpstreamConnection>, SpeechError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());

            if let Some(err) = &self.reject {
                return Err(err.clone());
            }

            Ok(Box::new(ScriptedConnection {
                replies: self.replies.iter().cloned().collect(),
                hang: self.hang,
                fail_send_at: self.fail_send_at,
                sent: Arc::clone(&self.sent),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    struct ScriptedConnection {
        replies: VecDeque<String>,
        hang: bool,
        fail_send_at: Option<usize>,
        sent: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl UpstreamConnection for ScriptedConnection {
        async fn send_text(&mut self, text: String) -> Result<(), SpeechError> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_send_at == Some(sent.len()) {
                return Err(SpeechError::Transport("connection reset by peer".to_string()));
            }
            sent.push(text);
            Ok(())
        }

        async fn next_text(&mut self) -> Option<Result<String, SpeechError>> {
            match self.replies.pop_front() {
                Some(reply) => Some(Ok(reply)),
                None if self.hang => std::future::pending().await,
                None => None,
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
