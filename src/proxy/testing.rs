//! Loopback fixtures for relay tests: a scriptable mock backend and a proxy
//! listener wired to it with the tagging test codec.

use crate::audio::codec::testing::TaggingCodecFactory;
use crate::audio::SharedCodecFactory;
use crate::config::{AppConfig, PlaybackFormat, ReconnectConfig};
use crate::proxy::backend::BackendHandshake;
use crate::proxy::registry::SessionRegistry;
use crate::proxy::server::ProxyServer;
use crate::proxy::session::SessionState;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const FRAME_SAMPLES: usize = 4;
const WAIT: Duration = Duration::from_secs(5);

pub type BrowserSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One accepted backend-side connection.
pub struct BackendConn {
    pub ws: WebSocketStream<TcpStream>,
    pub headers: HeaderMap,
}

pub struct MockBackend {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<BackendConn>,
    task: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut headers = HeaderMap::new();
                let accepted = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
                    headers = req.headers().clone();
                    Ok(resp)
                })
                .await;
                if let Ok(ws) = accepted {
                    let _ = tx.send(BackendConn { ws, headers });
                }
            }
        });

        Self { addr, connections, task }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/xiaozhi/v1/", self.addr)
    }

    pub async fn accept(&mut self) -> BackendConn {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for backend connection")
            .expect("mock backend stopped")
    }

    /// Stop listening; later connection attempts are refused.
    pub async fn stop(&mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

/// A running proxy in front of a [`MockBackend`].
pub struct Harness {
    pub backend: MockBackend,
    pub registry: Arc<SessionRegistry>,
    pub shutdown: CancellationToken,
    proxy_addr: SocketAddr,
}

impl Harness {
    pub async fn start(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let backend = MockBackend::start().await;

        let mut config = AppConfig::default();
        config.proxy.host = "127.0.0.1".to_string();
        config.proxy.port = 0;
        config.backend.url = backend.url();
        config.backend.device_id = "aa:bb:cc:dd:ee:ff".to_string();
        config.backend.client_id = "test-client".to_string();
        config.backend.connect_timeout_ms = 1000;
        config.reconnect = ReconnectConfig {
            max_attempts: 3,
            initial_delay_ms: 20,
            max_delay_ms: 80,
            multiplier: 2.0,
            stable_after_ms: 10_000,
        };
        config.audio.frame_samples = FRAME_SAMPLES;
        config.audio.playback_format = PlaybackFormat::Pcm;
        customize(&mut config);

        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new(config.proxy.max_sessions));
        let codecs: SharedCodecFactory = Arc::new(TaggingCodecFactory {
            frame_samples: config.audio.frame_samples,
        });
        let handshake = BackendHandshake::from_config(&config.backend).unwrap();

        let server = ProxyServer::bind(config, handshake, codecs, registry.clone())
            .await
            .unwrap();
        let proxy_addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));

        Self {
            backend,
            registry,
            shutdown,
            proxy_addr,
        }
    }

    pub async fn browser(&self) -> BrowserSocket {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", self.proxy_addr))
            .await
            .unwrap();
        ws
    }

    pub async fn wait_for_sessions(&self, count: usize) {
        self.wait_until(|registry| registry.active_count() == count).await;
    }

    pub async fn wait_for_state(&self, state: SessionState) {
        self.wait_until(|registry| {
            registry
                .summary()
                .state_counts
                .get(state.as_str())
                .copied()
                .unwrap_or(0)
                > 0
        })
        .await;
    }

    async fn wait_until(&self, condition: impl Fn(&SessionRegistry) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !condition(&self.registry) {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Next data or close message, skipping pings and pongs.
pub async fn next_message<S>(ws: &mut WebSocketStream<S>) -> Option<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for message");
        match next {
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(message)) => return Some(message),
            Some(Err(_)) | None => return None,
        }
    }
}

pub async fn next_text<S>(ws: &mut WebSocketStream<S>) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match next_message(ws).await {
        Some(Message::Text(text)) => text,
        other => panic!("expected text message, got {:?}", other),
    }
}

pub async fn next_binary<S>(ws: &mut WebSocketStream<S>) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match next_message(ws).await {
        Some(Message::Binary(data)) => data,
        other => panic!("expected binary message, got {:?}", other),
    }
}

/// What the tagging encoder produces for a PCM frame.
pub fn tagged(pcm: &[i16]) -> Vec<u8> {
    let mut out = crate::audio::codec::testing::TAG.to_vec();
    out.extend(pcm.iter().flat_map(|s| s.to_le_bytes()));
    out
}

pub fn pcm_bytes(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().flat_map(|s| s.to_le_bytes()).collect()
}
