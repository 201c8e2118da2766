//! # Proxy Listener
//!
//! Accepts browser WebSocket connections on the proxy port and gives each one
//! its own [`Session`]. Connections beyond `max_sessions` complete the
//! handshake, receive a `capacity_exceeded` error and are closed with 1013
//! ("try again later"); sessions already running are untouched.

use crate::audio::SharedCodecFactory;
use crate::config::AppConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::backend::BackendHandshake;
use crate::proxy::messages::{ErrorCode, ProxyMessage};
use crate::proxy::registry::{SessionHandle, SessionRegistry};
use crate::proxy::session::{Session, SessionContext, SessionState};
use futures_util::SinkExt;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pause after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    registry: Arc<SessionRegistry>,
}

impl ProxyServer {
    /// Bind the browser-facing listener on `proxy.host:proxy.port`.
    pub async fn bind(
        config: Arc<AppConfig>,
        handshake: BackendHandshake,
        codecs: SharedCodecFactory,
        registry: Arc<SessionRegistry>,
    ) -> ProxyResult<Self> {
        let addr = format!("{}:{}", config.proxy.host, config.proxy.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            addr = %listener.local_addr()?,
            backend = %handshake.url(),
            max_sessions = config.proxy.max_sessions,
            "WebSocket proxy listening"
        );

        Ok(Self {
            listener,
            ctx: Arc::new(SessionContext {
                config,
                handshake,
                codecs,
            }),
            registry,
        })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Every session runs under a child of `shutdown`, so cancelling it also
    /// closes all live sessions.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let ctx = self.ctx.clone();
                    let registry = self.registry.clone();
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        on_browser_connect(ctx, registry, stream, peer, cancel).await;
                    });
                }
                Err(err) => {
                    error!("Failed to accept browser connection: {}", err);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        info!(
            live_sessions = self.registry.active_count(),
            "WebSocket proxy stopped accepting connections"
        );
    }
}

fn websocket_config(config: &AppConfig) -> WebSocketConfig {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.proxy.max_message_size);
    ws_config.max_frame_size = Some(config.proxy.max_message_size);
    ws_config
}

/// Handshake, register, relay, deregister.
async fn on_browser_connect(
    ctx: Arc<SessionContext>,
    registry: Arc<SessionRegistry>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, "Could not set TCP_NODELAY: {}", err);
    }

    let config = websocket_config(&ctx.config);
    let browser = match tokio_tungstenite::accept_async_with_config(stream, Some(config)).await {
        Ok(browser) => browser,
        Err(err) => {
            warn!(%peer, "Browser WebSocket handshake failed: {}", err);
            return;
        }
    };

    let session_id = Uuid::new_v4().to_string();
    let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
    let handle = Arc::new(SessionHandle::new(session_id.clone(), state_rx));

    if let Err(err) = registry.try_register(handle.clone()) {
        warn!(%peer, "Rejecting browser connection: {}", err);
        reject(browser, err).await;
        return;
    }
    info!(
        %peer,
        session_id = %session_id,
        live_sessions = registry.active_count(),
        "Browser connected"
    );

    let session = Session::new(ctx, handle, state_tx, cancel);
    let final_state = session.run(browser).await;

    registry.remove(&session_id);
    info!(
        %peer,
        session_id = %session_id,
        state = final_state.as_str(),
        live_sessions = registry.active_count(),
        "Browser disconnected"
    );
}

async fn reject(mut browser: WebSocketStream<TcpStream>, err: ProxyError) {
    let error = ProxyMessage::error(ErrorCode::CapacityExceeded, err.to_string(), None);
    if browser.send(Message::Text(error.to_json())).await.is_err() {
        return;
    }
    let close = CloseFrame {
        code: CloseCode::Again,
        reason: Cow::Borrowed("server at capacity"),
    };
    if let Err(err) = browser.close(Some(close)).await {
        debug!("Close after rejection failed: {}", err);
    }
}
