//! WebSocket transport using `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] opens a [`WebSocketTransport`] per connection
//! attempt. Both `ws://` and `wss://` URLs work; TLS is handled by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream). A known session id
//! is passed to the server as the `session` query parameter.
//!
//! Only available with the `transport-websocket` feature (on by default).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message as Frame;
use tracing::{debug, info, warn};

use crate::error::NetplayError;
use crate::transport::{Connector, Transport};

/// The underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn io_error(err: tokio_tungstenite::tungstenite::Error) -> NetplayError {
    let kind = match &err {
        tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
        _ => std::io::ErrorKind::Other,
    };
    NetplayError::Io(std::io::Error::new(kind, err))
}

/// A [`Transport`] over one WebSocket connection.
///
/// Text frames carry messages. Control frames are handled by tungstenite;
/// binary frames are skipped. [`recv`](Transport::recv) is cancel-safe.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::Io`] if the URL is invalid or the handshake
    /// fails. I/O error kinds are preserved.
    pub async fn connect(url: &str) -> Result<Self, NetplayError> {
        debug!(url = %url, "opening WebSocket");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(io_error)?;
        info!(url = %url, "WebSocket open");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established stream, for custom TLS or headers.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), NetplayError> {
        if self.closed {
            return Err(NetplayError::TransportClosed);
        }
        self.stream
            .send(Frame::Text(message.into()))
            .await
            .map_err(|e| NetplayError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, NetplayError>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Frame::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Frame::Close(close)) => {
                    debug!(?close, "WebSocket closed by peer");
                    return None;
                }
                Ok(Frame::Binary(bytes)) => {
                    warn!(len = bytes.len(), "skipping binary WebSocket frame");
                }
                // ping/pong are answered by tungstenite; raw frames never surface on read
                Ok(Frame::Ping(_) | Frame::Pong(_) | Frame::Frame(_)) => {}
                Err(e) => return Some(Err(NetplayError::TransportReceive(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), NetplayError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.stream
            .close(None)
            .await
            .map_err(|e| NetplayError::TransportSend(e.to_string()))
    }
}

/// Opens a [`WebSocketTransport`] to a fixed URL for every connection
/// attempt.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The URL to open for a given session id.
    pub fn session_url(&self, session_id: Option<&str>) -> String {
        match session_id {
            Some(id) if !id.is_empty() => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                let id: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
                format!("{}{separator}session={id}", self.url)
            }
            _ => self.url.clone(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        session_id: Option<String>,
    ) -> Result<Box<dyn Transport>, NetplayError> {
        let url = self.session_url(session_id.as_deref());
        Ok(Box::new(WebSocketTransport::connect(&url).await?))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    type ServerStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Accept one WebSocket connection on a local port and hand it to `script`.
    async fn serve_once<F, Fut>(script: F) -> String
    where
        F: FnOnce(ServerStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            script(ws).await;
        });
        format!("ws://{addr}")
    }

    async fn drain(mut ws: ServerStream) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    #[test]
    fn session_url_appends_query_parameter() {
        let plain = WebSocketConnector::new("ws://host/netplay");
        assert_eq!(plain.session_url(None), "ws://host/netplay");
        assert_eq!(plain.session_url(Some("")), "ws://host/netplay");
        assert_eq!(
            plain.session_url(Some("s1")),
            "ws://host/netplay?session=s1"
        );

        let with_query = WebSocketConnector::new("ws://host/netplay?v=2");
        assert_eq!(
            with_query.session_url(Some("s1")),
            "ws://host/netplay?v=2&session=s1"
        );
    }

    #[test]
    fn session_id_is_percent_encoded() {
        let connector = WebSocketConnector::new("ws://host/netplay");
        assert_eq!(
            connector.session_url(Some("a&b #c/d")),
            "ws://host/netplay?session=a%26b+%23c%2Fd"
        );
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_io_error() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, NetplayError::Io(_)));
    }

    #[tokio::test]
    async fn invalid_url_is_io_error() {
        let err = WebSocketConnector::new("definitely not a url")
            .connect(None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NetplayError::Io(_)));
    }

    #[tokio::test]
    async fn text_frames_arrive_and_binary_is_skipped() {
        let url = serve_once(|mut ws| async move {
            ws.send(Frame::Binary(vec![1, 2, 3].into())).await.unwrap();
            ws.send(Frame::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), r#"{"type":"ping"}"#);
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn connector_round_trips_through_boxed_transport() {
        let url = serve_once(|mut ws| async move {
            if let Some(Ok(Frame::Text(text))) = ws.next().await {
                ws.send(Frame::Text(text)).await.unwrap();
            }
            drain(ws).await;
        })
        .await;

        let mut transport = WebSocketConnector::new(url).connect(None).await.unwrap();
        transport.send("echo".into()).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "echo");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_after_close_fails_and_close_is_idempotent() {
        let url = serve_once(drain).await;
        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        let err = transport.send("late".into()).await.unwrap_err();
        assert!(matches!(err, NetplayError::TransportClosed));
    }
}
