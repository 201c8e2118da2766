//! # Backend Link
//!
//! One outbound WebSocket to the conversational backend, owned by exactly one
//! session. The link attaches the device-authentication headers at handshake
//! time, and re-establishes itself with bounded exponential backoff when the
//! backend drops.
//!
//! ## Handshake Headers:
//! - `Device-Id`: device MAC address (or configured id)
//! - `Client-Id`: per-install client id
//! - `Protocol-Version`: backend protocol revision
//! - `Authorization: Bearer <token>`: only when token auth is enabled
//!
//! The write half stays inside [`BackendLink`]; the read half is handed out as a
//! [`BackendReceiver`] so the backend-to-browser direction can run on its own task.

use crate::config::{BackendConfig, ReconnectConfig};
use crate::error::{ProxyError, ProxyResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on waiting for the close handshake of a dead link.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state of a single backend link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Pre-validated handshake request shared by every session.
#[derive(Debug, Clone)]
pub struct BackendHandshake {
    url: String,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl BackendHandshake {
    pub fn from_config(config: &BackendConfig) -> ProxyResult<Self> {
        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| ProxyError::Connect(format!("invalid header value: {}", e)))
        };

        let mut headers = vec![
            (HeaderName::from_static("device-id"), header(&config.device_id)?),
            (HeaderName::from_static("client-id"), header(&config.client_id)?),
            (
                HeaderName::from_static("protocol-version"),
                header(&config.protocol_version)?,
            ),
        ];
        if config.enable_token {
            headers.push((AUTHORIZATION, header(&format!("Bearer {}", config.token))?));
        }

        // Fail at startup rather than on the first browser connection.
        config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ProxyError::Connect(format!("invalid backend url: {}", e)))?;

        Ok(Self {
            url: config.url.clone(),
            headers,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn request(&self) -> ProxyResult<Request<()>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ProxyError::Connect(e.to_string()))?;
        for (name, value) in &self.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(request)
    }
}

/// Bounded exponential backoff: `initial * multiplier^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;

        let base = self.config.initial_delay_ms as f64;
        let delay = base * self.config.multiplier.powi(self.attempt as i32 - 1);
        let delay = delay.min(self.config.max_delay_ms as f64);
        Some(Duration::from_millis(delay as u64))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// How long a link must stay up before the attempt count starts over.
    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.config.stable_after_ms)
    }
}

/// Read half of a live backend connection.
pub struct BackendReceiver {
    stream: SplitStream<BackendSocket>,
}

impl BackendReceiver {
    /// Next text or binary message; `None` once the backend closed or errored.
    pub async fn receive(&mut self) -> Option<Message> {
        while let Some(next) = self.stream.next().await {
            match next {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => return Some(msg),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Backend sent close frame");
                    return None;
                }
                // Ping replies are queued by tungstenite and flushed with the next write.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(err) => {
                    warn!("Backend read error: {}", err);
                    return None;
                }
            }
        }
        None
    }
}

/// Outbound connection to the backend for a single session.
pub struct BackendLink {
    handshake: BackendHandshake,
    connect_timeout: Duration,
    state: LinkState,
    sink: Option<SplitSink<BackendSocket, Message>>,
    backoff: Backoff,
    connected_at: Option<Instant>,
}

impl BackendLink {
    pub fn new(handshake: BackendHandshake, connect_timeout: Duration, reconnect: ReconnectConfig) -> Self {
        Self {
            handshake,
            connect_timeout,
            state: LinkState::Disconnected,
            sink: None,
            backoff: Backoff::new(reconnect),
            connected_at: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.backoff.attempt()
    }

    /// Open a fresh connection, tearing down any previous one first.
    pub async fn connect(&mut self) -> ProxyResult<BackendReceiver> {
        self.close().await;
        self.state = LinkState::Connecting;

        let request = self.handshake.request()?;
        let result = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await;

        let socket = match result {
            Ok(Ok((socket, response))) => {
                debug!(status = %response.status(), "Backend handshake completed");
                socket
            }
            Ok(Err(err)) => {
                self.state = LinkState::Disconnected;
                return Err(ProxyError::Connect(err.to_string()));
            }
            Err(_) => {
                self.state = LinkState::Disconnected;
                return Err(ProxyError::Connect(format!(
                    "timed out after {}ms",
                    self.connect_timeout.as_millis()
                )));
            }
        };

        let (sink, stream) = socket.split();
        self.sink = Some(sink);
        self.state = LinkState::Connected;
        self.connected_at = Some(Instant::now());
        info!(url = %self.handshake.url(), "Connected to backend");

        Ok(BackendReceiver { stream })
    }

    /// First connection of a session: one immediate attempt, then backoff retries.
    ///
    /// Returns `Ok(None)` when `cancel` fires before a connection is made.
    pub async fn connect_with_retry(
        &mut self,
        cancel: &CancellationToken,
    ) -> ProxyResult<Option<BackendReceiver>> {
        let first = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = self.connect() => result,
        };

        match first {
            Ok(receiver) => Ok(Some(receiver)),
            Err(err) => {
                warn!("Initial backend connect failed: {}", err);
                self.reconnect(cancel).await
            }
        }
    }

    /// Retry until connected, cancelled, or out of attempts.
    ///
    /// Attempts count across links that drop soon after the handshake, so a
    /// backend that keeps accepting and closing still exhausts the retries.
    /// Returns `Err(ProxyError::Connect)` once every retry has failed and
    /// `Ok(None)` when `cancel` fires during a delay or an attempt.
    pub async fn reconnect(
        &mut self,
        cancel: &CancellationToken,
    ) -> ProxyResult<Option<BackendReceiver>> {
        self.close().await;
        let stable_after = self.backoff.stable_after();
        if let Some(uptime) = self.connected_at.take().map(|at| at.elapsed()) {
            if uptime >= stable_after {
                debug!(uptime_ms = uptime.as_millis() as u64, "Backend link was stable, resetting backoff");
                self.backoff.reset();
            }
        }
        let mut last_error = String::from("backend closed the connection");

        while let Some(delay) = self.backoff.next_delay() {
            let attempt = self.backoff.attempt();
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling backend reconnect");

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.state = LinkState::Disconnected;
                    return Ok(None);
                }
                result = self.connect() => result,
            };

            match result {
                Ok(receiver) => {
                    info!(attempt, "Backend link re-established");
                    return Ok(Some(receiver));
                }
                Err(err) => {
                    warn!(attempt, "Backend reconnect failed: {}", err);
                    last_error = err.to_string();
                }
            }
        }

        Err(ProxyError::Connect(format!(
            "giving up after {} attempts: {}",
            self.backoff.attempt(),
            last_error
        )))
    }

    /// Send a control message or audio frame to the backend.
    pub async fn send(&mut self, message: Message) -> ProxyResult<()> {
        let sink = match (self.state, self.sink.as_mut()) {
            (LinkState::Connected, Some(sink)) => sink,
            _ => return Err(ProxyError::LinkClosed),
        };

        if let Err(err) = sink.send(message).await {
            debug!("Backend write failed: {}", err);
            self.mark_down();
            return Err(ProxyError::LinkClosed);
        }
        Ok(())
    }

    /// Record an unexpected closure observed on the read half.
    pub fn mark_down(&mut self) {
        self.sink = None;
        self.state = LinkState::Disconnected;
    }

    /// Release the connection. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            self.state = LinkState::Closing;
            if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                debug!("Backend close handshake timed out");
            }
        }
        self.state = LinkState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tokio::net::TcpListener;

    fn reconnect_config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 40,
            multiplier: 2.0,
            stable_after_ms: 10_000,
        }
    }

    fn handshake(url: &str) -> BackendHandshake {
        let mut config = AppConfig::default().backend;
        config.url = url.to_string();
        config.device_id = "aa:bb:cc:dd:ee:ff".to_string();
        config.client_id = "client-1".to_string();
        config.token = "secret".to_string();
        BackendHandshake::from_config(&config).unwrap()
    }

    /// Port that refuses connections: bind, read the address, drop the listener.
    async fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(reconnect_config(5));
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 40, 40]);
        assert_eq!(backoff.attempt(), 5);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_handshake_headers() {
        let request = handshake("ws://127.0.0.1:9005/xiaozhi/v1/").request().unwrap();
        let headers = request.headers();
        assert_eq!(headers["device-id"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(headers["client-id"], "client-1");
        assert_eq!(headers["protocol-version"], "1");
        assert_eq!(headers[AUTHORIZATION], "Bearer secret");
    }

    #[test]
    fn test_token_header_is_optional() {
        let mut config = AppConfig::default().backend;
        config.device_id = "aa:bb:cc:dd:ee:ff".to_string();
        config.client_id = "c".to_string();
        config.enable_token = false;
        let request = BackendHandshake::from_config(&config).unwrap().request().unwrap();
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_invalid_header_value_is_rejected() {
        let mut config = AppConfig::default().backend;
        config.device_id = "bad\nvalue".to_string();
        config.client_id = "c".to_string();
        assert!(BackendHandshake::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_send_on_disconnected_link_fails() {
        let mut link = BackendLink::new(
            handshake("ws://127.0.0.1:9"),
            Duration::from_millis(200),
            reconnect_config(1),
        );
        assert!(matches!(
            link.send(Message::Text("{}".into())).await,
            Err(ProxyError::LinkClosed)
        ));
        link.close().await;
        link.close().await;
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let url = closed_port_url().await;
        let mut link = BackendLink::new(handshake(&url), Duration::from_millis(200), reconnect_config(3));
        let cancel = CancellationToken::new();

        let result = link.reconnect(&cancel).await;
        assert!(matches!(result, Err(ProxyError::Connect(_))));
        assert_eq!(link.retry_count(), 3);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancel_stops_retry_loop() {
        let url = closed_port_url().await;
        let config = ReconnectConfig {
            max_attempts: 10,
            initial_delay_ms: 5_000,
            max_delay_ms: 5_000,
            multiplier: 1.0,
            stable_after_ms: 10_000,
        };
        let mut link = BackendLink::new(handshake(&url), Duration::from_millis(200), config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), link.reconnect(&cancel)).await;
        assert!(matches!(result, Ok(Ok(None))));
    }

    /// Backend that completes every handshake and hangs up straight away.
    async fn flapping_backend_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    drop(ws);
                }
            }
        });
        url
    }

    #[tokio::test]
    async fn test_short_lived_links_keep_counting_attempts() {
        let url = flapping_backend_url().await;
        let mut link = BackendLink::new(handshake(&url), Duration::from_secs(2), reconnect_config(2));
        let cancel = CancellationToken::new();

        link.connect().await.unwrap();
        assert!(link.reconnect(&cancel).await.unwrap().is_some());
        assert_eq!(link.retry_count(), 1);
        assert!(link.reconnect(&cancel).await.unwrap().is_some());
        assert_eq!(link.retry_count(), 2);
        assert!(matches!(link.reconnect(&cancel).await, Err(ProxyError::Connect(_))));
    }

    #[tokio::test]
    async fn test_stable_link_resets_attempts() {
        let url = flapping_backend_url().await;
        let mut config = reconnect_config(2);
        config.stable_after_ms = 0;
        let mut link = BackendLink::new(handshake(&url), Duration::from_secs(2), config);
        let cancel = CancellationToken::new();

        link.connect().await.unwrap();
        for _ in 0..4 {
            assert!(link.reconnect(&cancel).await.unwrap().is_some());
            assert_eq!(link.retry_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_connect_sends_headers_and_receives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut seen = None;
            let mut ws = tokio_tungstenite::accept_hdr_async(
                stream,
                |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                 resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
                    seen = req
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    Ok(resp)
                },
            )
            .await
            .unwrap();
            ws.send(Message::Text(r#"{"type":"hello"}"#.into())).await.unwrap();
            let echoed = ws.next().await.unwrap().unwrap();
            (seen, echoed)
        });

        let mut link = BackendLink::new(handshake(&url), Duration::from_secs(2), reconnect_config(1));
        let mut receiver = link.connect().await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);

        let hello = receiver.receive().await.unwrap();
        assert_eq!(hello, Message::Text(r#"{"type":"hello"}"#.into()));
        link.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

        let (auth, echoed) = server.await.unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer secret"));
        assert_eq!(echoed, Message::Binary(vec![1, 2, 3]));

        link.close().await;
        assert_eq!(link.state(), LinkState::Disconnected);
    }
}
