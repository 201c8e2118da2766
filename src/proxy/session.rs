//! # Relay Session
//!
//! Pairs one browser connection with one [`BackendLink`] and relays traffic in
//! both directions until either side goes away.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: backend handshake in progress (with retries)
//! 2. **Active**: bidirectional forwarding
//! 3. **Reconnecting**: backend dropped, browser held open, input queued (bounded)
//! 4. **Closing**: one side closed, tearing down the other
//! 5. **Closed**: both sockets released
//! 6. **Failed**: backend unreachable after retries; browser told why, then closed
//!
//! ## Tasks per Session:
//! - **browser reader**: browser → backend (framing + Opus encode), feeds the uplink queue
//! - **browser writer**: sole owner of the browser write half
//! - **downlink**: backend → browser (Opus decode + playback chunks), one per live link
//! - **supervisor**: the caller of [`Session::run`]; owns the link and the state machine
//!
//! The two directions never wait on each other: the reader only touches the
//! uplink queue and the downlink only touches the browser writer's queue.

use crate::audio::{AudioFramer, FrameDecoder, FrameEncoder, PlaybackEncoder, SharedCodecFactory};
use crate::config::AppConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::backend::{BackendHandshake, BackendLink, BackendReceiver, LinkState};
use crate::proxy::messages::{
    classify_backend_text, classify_browser_text, BackendEvent, BrowserCommand, ErrorCode, ProxyMessage,
};
use crate::proxy::registry::{SessionHandle, SessionStats};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Messages queued towards the browser writer.
const BROWSER_QUEUE: usize = 64;

/// How long teardown waits for queued browser messages to be written.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Reconnecting,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

/// Everything a session needs from the server; built once at startup.
pub struct SessionContext {
    pub config: Arc<AppConfig>,
    pub handshake: BackendHandshake,
    pub codecs: SharedCodecFactory,
}

/// Browser input on its way to the backend.
#[derive(Debug)]
enum Outbound {
    Control(String),
    Audio(Vec<u8>),
}

impl Outbound {
    fn into_message(self) -> Message {
        match self {
            Outbound::Control(text) => Message::Text(text),
            Outbound::Audio(frame) => Message::Binary(frame),
        }
    }
}

/// Why the browser reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderExit {
    BrowserClosed,
    MessageTooLarge,
    ProtocolViolation,
    Cancelled,
}

/// Why a downlink task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownlinkExit {
    BackendClosed,
    BrowserClosed,
}

/// Why the active forwarding phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveExit {
    LinkDown,
    BrowserGone,
    Cancelled,
    Idle,
}

fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

/// One browser ↔ backend pairing.
pub struct Session {
    ctx: Arc<SessionContext>,
    handle: Arc<SessionHandle>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    link: BackendLink,
}

impl Session {
    pub fn new(
        ctx: Arc<SessionContext>,
        handle: Arc<SessionHandle>,
        state: watch::Sender<SessionState>,
        cancel: CancellationToken,
    ) -> Self {
        let link = BackendLink::new(
            ctx.handshake.clone(),
            ctx.config.connect_timeout(),
            ctx.config.reconnect.clone(),
        );
        Self {
            ctx,
            handle,
            state,
            cancel,
            link,
        }
    }

    pub fn id(&self) -> &str {
        &self.handle.session_id
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                session_id = %self.handle.session_id,
                from = previous.as_str(),
                to = next.as_str(),
                "Session state changed"
            );
        }
    }

    /// Relay until either side closes; returns the terminal state.
    ///
    /// Both sockets are released on every exit path.
    pub async fn run<S>(mut self, browser: WebSocketStream<S>) -> SessionState
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (browser_sink, browser_stream) = browser.split();
        let (browser_tx, browser_rx) = mpsc::channel(BROWSER_QUEUE);
        let mut writer = tokio::spawn(browser_writer(browser_sink, browser_rx));

        let proxy_config = &self.ctx.config.proxy;
        let (uplink_tx, uplink_rx) = mpsc::channel(proxy_config.reconnect_queue_capacity);

        let final_state = match self.ctx.codecs.encoder() {
            Ok(encoder) => {
                let reader = BrowserReader {
                    framer: AudioFramer::new(encoder.frame_samples()),
                    encoder,
                    queue: uplink_tx,
                    browser: browser_tx.clone(),
                    state: self.state.subscribe(),
                    handle: self.handle.clone(),
                    max_message_size: proxy_config.max_message_size,
                    max_protocol_errors: proxy_config.max_protocol_errors,
                    protocol_errors: 0,
                };
                let reader = tokio::spawn(reader.run(browser_stream, self.cancel.clone()));

                let outcome = self.supervise(uplink_rx, &browser_tx).await;

                // Stop the reader before its queue and browser sender are dropped.
                self.cancel.cancel();
                match reader.await {
                    Ok(exit) => debug!(session_id = %self.id(), ?exit, "Browser reader stopped"),
                    Err(err) => warn!(session_id = %self.id(), "Browser reader task failed: {}", err),
                }
                outcome
            }
            Err(err) => {
                warn!(session_id = %self.id(), "Codec unavailable: {}", err);
                self.notify_failure(&browser_tx, ErrorCode::Internal, &err.to_string())
                    .await;
                SessionState::Failed
            }
        };

        self.link.close().await;

        if final_state != SessionState::Failed {
            let close = browser_tx.send(close_message(CloseCode::Normal, "session closed"));
            let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, close).await;
        }
        drop(browser_tx);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            debug!(session_id = %self.id(), "Browser writer did not drain in time");
            writer.abort();
        }

        let terminal = if final_state == SessionState::Failed {
            SessionState::Failed
        } else {
            SessionState::Closed
        };
        self.set_state(terminal);
        terminal
    }

    /// The lifecycle state machine. Returns `Failed` or `Closing`.
    async fn supervise(
        &mut self,
        mut uplink: mpsc::Receiver<Outbound>,
        browser: &mpsc::Sender<Message>,
    ) -> SessionState {
        self.set_state(SessionState::Connecting);
        let receiver = match self.link.connect_with_retry(&self.cancel).await {
            Ok(Some(receiver)) => receiver,
            Ok(None) => {
                self.set_state(SessionState::Closing);
                return SessionState::Closing;
            }
            Err(err) => return self.fail(browser, err).await,
        };

        let mut downlink = match self.spawn_downlink(receiver, browser.clone()) {
            Ok(task) => task,
            Err(err) => return self.fail(browser, err).await,
        };
        self.set_state(SessionState::Active);

        loop {
            match self.forward_uplink(&mut uplink, downlink).await {
                ActiveExit::LinkDown => {
                    self.set_state(SessionState::Reconnecting);
                    SessionStats::bump(&self.handle.stats.reconnects);
                    warn!(session_id = %self.id(), "Backend link lost, reconnecting");

                    let receiver = match self.link.reconnect(&self.cancel).await {
                        Ok(Some(receiver)) => receiver,
                        Ok(None) => {
                            self.set_state(SessionState::Closing);
                            discard_queued(&mut uplink);
                            return SessionState::Closing;
                        }
                        Err(err) => {
                            discard_queued(&mut uplink);
                            return self.fail(browser, err).await;
                        }
                    };

                    if let Err(err) = self.replay_queued_control(&mut uplink).await {
                        debug!(session_id = %self.id(), "Replaying control messages failed: {}", err);
                    }
                    downlink = match self.spawn_downlink(receiver, browser.clone()) {
                        Ok(task) => task,
                        Err(err) => return self.fail(browser, err).await,
                    };
                    self.set_state(SessionState::Active);
                }
                exit => {
                    info!(session_id = %self.id(), ?exit, "Closing session");
                    self.set_state(SessionState::Closing);
                    if exit != ActiveExit::Idle {
                        self.flush_queued(&mut uplink).await;
                    }
                    return SessionState::Closing;
                }
            }
        }
    }

    /// Active phase: pump the uplink queue into the backend while the downlink runs.
    ///
    /// The downlink task is always finished when this returns.
    async fn forward_uplink(
        &mut self,
        uplink: &mut mpsc::Receiver<Outbound>,
        mut downlink: JoinHandle<DownlinkExit>,
    ) -> ActiveExit {
        let idle_timeout = match self.ctx.config.proxy.idle_timeout_secs {
            0 => None,
            secs => Some(chrono::Duration::seconds(secs as i64)),
        };
        let mut idle_check = tokio::time::interval(Duration::from_secs(1));
        let mut downlink_done = false;

        let exit = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break ActiveExit::Cancelled,

                result = &mut downlink => {
                    downlink_done = true;
                    break match result {
                        Ok(DownlinkExit::BrowserClosed) => ActiveExit::BrowserGone,
                        Ok(DownlinkExit::BackendClosed) => ActiveExit::LinkDown,
                        Err(err) => {
                            warn!(session_id = %self.handle.session_id, "Downlink task failed: {}", err);
                            ActiveExit::LinkDown
                        }
                    };
                }

                next = uplink.recv() => match next {
                    Some(outbound) => {
                        let is_audio = matches!(outbound, Outbound::Audio(_));
                        match self.link.send(outbound.into_message()).await {
                            Ok(()) if is_audio => SessionStats::bump(&self.handle.stats.frames_to_backend),
                            Ok(()) => SessionStats::bump(&self.handle.stats.control_to_backend),
                            Err(_) => break ActiveExit::LinkDown,
                        }
                    }
                    None => break ActiveExit::BrowserGone,
                },

                _ = idle_check.tick(), if idle_timeout.is_some() => {
                    if let Some(limit) = idle_timeout {
                        if self.handle.idle_for() > limit {
                            break ActiveExit::Idle;
                        }
                    }
                }
            }
        };

        if !downlink_done {
            downlink.abort();
            let _ = downlink.await;
        }
        exit
    }

    fn spawn_downlink(
        &self,
        receiver: BackendReceiver,
        browser: mpsc::Sender<Message>,
    ) -> ProxyResult<JoinHandle<DownlinkExit>> {
        let audio = &self.ctx.config.audio;
        let downlink = Downlink {
            receiver,
            decoder: self.ctx.codecs.decoder()?,
            codecs: self.ctx.codecs.clone(),
            playback: PlaybackEncoder::new(audio.playback_format, audio.sample_rate, audio.channels),
            browser,
            handle: self.handle.clone(),
        };
        Ok(tokio::spawn(downlink.run()))
    }

    /// After a reconnect: stale audio from the outage is dropped, queued control
    /// messages go out first, in their original order.
    async fn replay_queued_control(&mut self, uplink: &mut mpsc::Receiver<Outbound>) -> ProxyResult<()> {
        let mut discarded = 0u64;
        let mut controls = Vec::new();
        while let Ok(outbound) = uplink.try_recv() {
            match outbound {
                Outbound::Control(text) => controls.push(text),
                Outbound::Audio(_) => discarded += 1,
            }
        }
        if discarded > 0 {
            info!(session_id = %self.id(), discarded, "Discarded audio queued during outage");
        }

        for text in controls {
            self.link.send(Message::Text(text)).await?;
            SessionStats::bump(&self.handle.stats.control_to_backend);
        }
        Ok(())
    }

    /// Best-effort delivery of whatever the browser sent right before closing.
    async fn flush_queued(&mut self, uplink: &mut mpsc::Receiver<Outbound>) {
        if self.link.state() != LinkState::Connected {
            return;
        }
        while let Ok(outbound) = uplink.try_recv() {
            if self.link.send(outbound.into_message()).await.is_err() {
                break;
            }
        }
    }

    async fn fail(&mut self, browser: &mpsc::Sender<Message>, err: ProxyError) -> SessionState {
        warn!(
            session_id = %self.id(),
            attempts = self.link.retry_count(),
            "Session failed: {}", err
        );
        let code = match err {
            ProxyError::Codec(_) => ErrorCode::Internal,
            _ => ErrorCode::BackendUnavailable,
        };
        self.notify_failure(browser, code, &err.to_string()).await;
        SessionState::Failed
    }

    /// Tell the browser why the session is ending, then close it.
    async fn notify_failure(&self, browser: &mpsc::Sender<Message>, code: ErrorCode, message: &str) {
        self.set_state(SessionState::Failed);
        let error = ProxyMessage::error(code, message, Some(self.id()));
        let reason = match code {
            ErrorCode::BackendUnavailable => "backend unavailable",
            _ => "internal error",
        };
        let notify = async {
            browser.send(Message::Text(error.to_json())).await?;
            browser.send(close_message(CloseCode::Error, reason)).await?;
            Ok::<(), mpsc::error::SendError<Message>>(())
        };
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, notify).await.is_err() {
            debug!(session_id = %self.id(), "Browser did not accept the failure notice in time");
        }
    }
}

fn discard_queued(uplink: &mut mpsc::Receiver<Outbound>) {
    uplink.close();
    while uplink.try_recv().is_ok() {}
}

/// Sole writer to the browser socket. Stops after sending a close frame.
async fn browser_writer<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut queue: mpsc::Receiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = queue.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            debug!("Browser write failed: {}", err);
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Browser → backend direction.
struct BrowserReader {
    framer: AudioFramer,
    encoder: Box<dyn FrameEncoder>,
    queue: mpsc::Sender<Outbound>,
    browser: mpsc::Sender<Message>,
    state: watch::Receiver<SessionState>,
    handle: Arc<SessionHandle>,
    max_message_size: usize,
    max_protocol_errors: u32,
    protocol_errors: u32,
}

impl BrowserReader {
    async fn run<S>(mut self, mut stream: SplitStream<WebSocketStream<S>>, cancel: CancellationToken) -> ReaderExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exit = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break ReaderExit::Cancelled,
                next = stream.next() => next,
            };

            let message = match next {
                None => break ReaderExit::BrowserClosed,
                Some(Ok(message)) => message,
                Some(Err(WsError::Capacity(err))) => {
                    self.reject(ErrorCode::MessageTooLarge, &err.to_string(), CloseCode::Size)
                        .await;
                    break ReaderExit::MessageTooLarge;
                }
                Some(Err(err)) => {
                    debug!(session_id = %self.handle.session_id, "Browser read error: {}", err);
                    break ReaderExit::BrowserClosed;
                }
            };

            let handled = tokio::select! {
                _ = cancel.cancelled() => break ReaderExit::Cancelled,
                handled = self.handle_message(message) => handled,
            };
            if let Some(exit) = handled {
                break exit;
            }
        };

        if exit != ReaderExit::Cancelled {
            // Browser side is gone or misbehaving; the supervisor closes the rest.
            cancel.cancel();
        }
        if self.framer.pending_samples() > 0 {
            debug!(
                session_id = %self.handle.session_id,
                samples = self.framer.pending_samples(),
                "Discarding partial audio frame"
            );
        }
        exit
    }

    async fn handle_message(&mut self, message: Message) -> Option<ReaderExit> {
        self.handle.touch();

        let size = match &message {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
            _ => 0,
        };
        if size > self.max_message_size {
            let detail = format!("message of {} bytes exceeds limit of {}", size, self.max_message_size);
            self.reject(ErrorCode::MessageTooLarge, &detail, CloseCode::Size).await;
            return Some(ReaderExit::MessageTooLarge);
        }

        match message {
            Message::Text(text) => self.handle_text(text).await,
            Message::Binary(data) => {
                for frame in self.framer.push(&data) {
                    if let Some(exit) = self.encode_and_queue(&frame).await {
                        return Some(exit);
                    }
                }
                None
            }
            Message::Close(frame) => {
                debug!(session_id = %self.handle.session_id, ?frame, "Browser closed connection");
                Some(ReaderExit::BrowserClosed)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        }
    }

    async fn handle_text(&mut self, text: String) -> Option<ReaderExit> {
        let command = match classify_browser_text(&text) {
            Ok(command) => command,
            Err(err) => {
                self.protocol_errors += 1;
                warn!(
                    session_id = %self.handle.session_id,
                    consecutive = self.protocol_errors,
                    "Dropping browser message: {}", err
                );
                if self.protocol_errors >= self.max_protocol_errors {
                    self.reject(ErrorCode::ProtocolError, &err.to_string(), CloseCode::Policy)
                        .await;
                    return Some(ReaderExit::ProtocolViolation);
                }
                return None;
            }
        };
        self.protocol_errors = 0;

        match command {
            BrowserCommand::Reset => {
                debug!(session_id = %self.handle.session_id, "Audio buffer reset");
                self.framer.reset();
                None
            }
            BrowserCommand::FlushLastData => {
                if let Some(frame) = self.framer.flush() {
                    if let Some(exit) = self.encode_and_queue(&frame).await {
                        return Some(exit);
                    }
                }
                // Must not block on the browser queue, which the downlink shares.
                let ack = ProxyMessage::LastData.to_json();
                match self.browser.try_send(Message::Text(ack)) {
                    Ok(()) => None,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(session_id = %self.handle.session_id, "Browser queue full, dropping lastData ack");
                        None
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => Some(ReaderExit::BrowserClosed),
                }
            }
            BrowserCommand::Forward => self.enqueue(Outbound::Control(text)).await,
        }
    }

    async fn encode_and_queue(&mut self, frame: &[i16]) -> Option<ReaderExit> {
        match self.encoder.encode(frame) {
            Ok(encoded) => self.enqueue(Outbound::Audio(encoded)).await,
            Err(err) => {
                SessionStats::bump(&self.handle.stats.codec_errors);
                warn!(session_id = %self.handle.session_id, "Dropping audio frame: {}", err);
                None
            }
        }
    }

    /// Queue towards the backend.
    ///
    /// While `Active` this waits for room; in any other state the queue is a
    /// bounded holding area and the newest message is dropped when it is full.
    async fn enqueue(&mut self, outbound: Outbound) -> Option<ReaderExit> {
        loop {
            if *self.state.borrow() != SessionState::Active {
                return match self.queue.try_send(outbound) {
                    Ok(()) => None,
                    Err(mpsc::error::TrySendError::Full(dropped)) => {
                        SessionStats::bump(&self.handle.stats.dropped_messages);
                        warn!(
                            session_id = %self.handle.session_id,
                            audio = matches!(dropped, Outbound::Audio(_)),
                            "Backend unavailable and queue full, dropping message"
                        );
                        None
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => Some(ReaderExit::Cancelled),
                };
            }

            tokio::select! {
                permit = self.queue.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(outbound);
                            None
                        }
                        Err(_) => Some(ReaderExit::Cancelled),
                    };
                }
                changed = self.state.changed() => {
                    if changed.is_err() {
                        return Some(ReaderExit::Cancelled);
                    }
                }
            }
        }
    }

    /// Send an explanatory error and a close frame to the browser.
    ///
    /// Bounded by [`WRITER_DRAIN_TIMEOUT`]; the reader exits right after.
    async fn reject(&mut self, code: ErrorCode, message: &str, close: CloseCode) {
        warn!(session_id = %self.handle.session_id, ?code, "Closing browser connection: {}", message);
        let error = ProxyMessage::error(code, message, Some(&self.handle.session_id));
        let reason = match code {
            ErrorCode::MessageTooLarge => "message too large",
            _ => "protocol error",
        };
        let browser = self.browser.clone();
        let notify = async move {
            browser.send(Message::Text(error.to_json())).await?;
            browser.send(close_message(close, reason)).await?;
            Ok::<(), mpsc::error::SendError<Message>>(())
        };
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, notify).await.is_err() {
            debug!(session_id = %self.handle.session_id, "Browser did not accept the close notice in time");
        }
    }
}

/// Backend → browser direction for one live link.
struct Downlink {
    receiver: BackendReceiver,
    decoder: Box<dyn FrameDecoder>,
    codecs: SharedCodecFactory,
    playback: PlaybackEncoder,
    browser: mpsc::Sender<Message>,
    handle: Arc<SessionHandle>,
}

impl Downlink {
    async fn run(mut self) -> DownlinkExit {
        while let Some(message) = self.receiver.receive().await {
            self.handle.touch();
            let outgoing = match message {
                Message::Text(text) => {
                    if !self.accept_text(&text) {
                        continue;
                    }
                    SessionStats::bump(&self.handle.stats.control_to_browser);
                    Message::Text(text)
                }
                Message::Binary(frame) => match self.decoder.decode(&frame) {
                    Ok(pcm) => {
                        SessionStats::bump(&self.handle.stats.frames_to_browser);
                        Message::Binary(self.playback.chunk(&pcm))
                    }
                    Err(err) => {
                        SessionStats::bump(&self.handle.stats.codec_errors);
                        warn!(
                            session_id = %self.handle.session_id,
                            bytes = frame.len(),
                            "Dropping backend audio frame: {}", err
                        );
                        continue;
                    }
                },
                _ => continue,
            };

            if self.browser.send(outgoing).await.is_err() {
                return DownlinkExit::BrowserClosed;
            }
        }
        DownlinkExit::BackendClosed
    }

    /// Returns false when the message must not reach the browser.
    fn accept_text(&mut self, text: &str) -> bool {
        match classify_backend_text(text) {
            Ok(BackendEvent::SpeechStart) => {
                match self.codecs.decoder() {
                    Ok(decoder) => self.decoder = decoder,
                    Err(err) => warn!(session_id = %self.handle.session_id, "Decoder reset failed: {}", err),
                }
                true
            }
            Ok(BackendEvent::Forward) => true,
            Err(err) => {
                warn!(session_id = %self.handle.session_id, "Dropping backend message: {}", err);
                false
            }
        }
    }
}
