use async_trait::async_trait;
use futures_util::{ SinkExt, StreamExt };
use log::{ debug, error, info, warn };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex, PoisonError };
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{ connect_async, MaybeTlsStream, WebSocketStream };
use url::Url;

use crate::cli::Args;
use crate::error::{ ChatError, Result };
use crate::models::realtime::{ chat_topic, InboundEvent, RealtimeFrame, HEARTBEAT_TOPIC };
use crate::models::Message;
use super::{ ChangeFeed, FeedCallback, FeedEvent, FeedSubscription, ReconnectPolicy };

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PROTOCOL_VERSION: &str = "1.0.0";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub url: String,
    pub api_key: String,
    pub table: String,
    pub heartbeat: Duration,
    pub join_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl RealtimeConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let url = match &args.realtime_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => derive_realtime_url(&args.store_url)?,
        };
        Ok(Self {
            url,
            api_key: args.store_api_key.clone(),
            table: args.messages_table.clone(),
            heartbeat: Duration::from_secs(args.feed_heartbeat_secs.max(1)),
            join_timeout: Duration::from_secs(args.feed_join_timeout_secs.max(1)),
            reconnect: ReconnectPolicy {
                enabled: args.feed_reconnect,
                initial_backoff: Duration::from_millis(args.feed_backoff_initial_ms),
                max_backoff: Duration::from_millis(args.feed_backoff_max_ms),
            },
        })
    }

    fn socket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        {
            let mut query = url.query_pairs_mut();
            if !self.api_key.is_empty() {
                query.append_pair("apikey", &self.api_key);
            }
            query.append_pair("vsn", PROTOCOL_VERSION);
        }
        Ok(url)
    }

    fn access_token(&self) -> Option<&str> {
        Some(self.api_key.as_str()).filter(|k| !k.is_empty())
    }
}

/// `http(s)://host/...` of the store becomes `ws(s)://host/realtime/v1/websocket`.
pub fn derive_realtime_url(store_url: &str) -> Result<String> {
    let mut url = Url::parse(store_url)?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url
        .set_scheme(scheme)
        .map_err(|_| ChatError::Transport(format!("cannot derive realtime URL from {}", store_url)))?;
    url.set_path("/realtime/v1/websocket");
    url.set_query(None);
    Ok(url.to_string())
}

pub struct RealtimeFeed {
    config: RealtimeConfig,
}

impl RealtimeFeed {
    pub fn new(config: RealtimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(
        &self,
        conversation_id: &str,
        on_event: FeedCallback
    ) -> Result<Box<dyn FeedSubscription>> {
        let topic = chat_topic(conversation_id);
        let mut refs = 0;
        let socket = connect_and_join(&self.config, &topic, conversation_id, &mut refs).await?;
        info!("Joined realtime channel {}", topic);

        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = ChannelSession {
            config: self.config.clone(),
            conversation_id: conversation_id.to_string(),
            topic,
            refs,
            on_event,
            closed: closed.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(session.run(socket));

        Ok(Box::new(RealtimeSubscription {
            closed,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }))
    }
}

fn next_ref(refs: &mut u64) -> String {
    *refs += 1;
    refs.to_string()
}

async fn send_frame(socket: &mut Socket, frame: &RealtimeFrame) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    socket.send(WsMessage::Text(json)).await?;
    Ok(())
}

async fn connect_and_join(
    config: &RealtimeConfig,
    topic: &str,
    conversation_id: &str,
    refs: &mut u64
) -> Result<Socket> {
    let url = config.socket_url()?;
    let (mut socket, _) = connect_async(url.as_str()).await?;

    let join_ref = next_ref(refs);
    let join = RealtimeFrame::join(
        topic,
        &config.table,
        conversation_id,
        config.access_token(),
        join_ref.clone()
    );
    send_frame(&mut socket, &join).await?;

    match tokio::time::timeout(config.join_timeout, await_join_ack(&mut socket, &join_ref)).await {
        Ok(Ok(())) => Ok(socket),
        Ok(Err(e)) => Err(e),
        Err(_) =>
            Err(
                ChatError::Transport(
                    format!("join of {} not acknowledged within {:?}", topic, config.join_timeout)
                )
            ),
    }
}

async fn await_join_ack(socket: &mut Socket, join_ref: &str) -> Result<()> {
    while let Some(message) = socket.next().await {
        match message? {
            WsMessage::Text(text) => {
                let frame: RealtimeFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Ignoring unparseable frame while joining: {}", e);
                        continue;
                    }
                };
                if let InboundEvent::Reply { reference: Some(reference), ok, response } = frame.classify() {
                    if reference == join_ref {
                        return if ok {
                            Ok(())
                        } else {
                            Err(ChatError::Transport(format!("join rejected: {}", response)))
                        };
                    }
                }
            }
            WsMessage::Ping(data) => {
                socket.send(WsMessage::Pong(data)).await?;
            }
            WsMessage::Close(_) => {
                return Err(ChatError::Transport("connection closed during join".to_string()));
            }
            _ => {}
        }
    }
    Err(ChatError::Transport("connection ended before join was acknowledged".to_string()))
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

struct ChannelSession {
    config: RealtimeConfig,
    conversation_id: String,
    topic: String,
    refs: u64,
    on_event: FeedCallback,
    closed: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl ChannelSession {
    async fn run(mut self, mut socket: Socket) {
        loop {
            match self.pump(&mut socket).await {
                SessionEnd::Shutdown => {
                    self.leave(&mut socket).await;
                    info!("Left realtime channel {}", self.topic);
                    return;
                }
                SessionEnd::Dropped(reason) => {
                    warn!("Realtime channel {} dropped: {}", self.topic, reason);
                    if !self.config.reconnect.enabled {
                        self.emit(FeedEvent::Lost(reason));
                        return;
                    }
                    match self.reconnect().await {
                        Some(fresh) => {
                            socket = fresh;
                            info!("Realtime channel {} resumed", self.topic);
                            self.emit(FeedEvent::Resumed);
                        }
                        None => {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || *self.shutdown.borrow()
    }

    fn emit(&self, event: FeedEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            (self.on_event)(event);
        }
    }

    async fn pump(&mut self, socket: &mut Socket) -> SessionEnd {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.tick().await;

        loop {
            if self.shutdown_requested() {
                return SessionEnd::Shutdown;
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }
                _ = heartbeat.tick() => {
                    let frame = RealtimeFrame::heartbeat(next_ref(&mut self.refs));
                    if let Err(e) = send_frame(socket, &frame).await {
                        return SessionEnd::Dropped(format!("heartbeat failed: {}", e));
                    }
                }
                incoming = socket.next() => {
                    match incoming {
                        None => {
                            return SessionEnd::Dropped("connection ended".to_string());
                        }
                        Some(Ok(message)) => {
                            match message {
                                WsMessage::Text(text) => {
                                    if let Some(end) = self.handle_text(&text) {
                                        return end;
                                    }
                                }
                                WsMessage::Ping(data) => {
                                    if socket.send(WsMessage::Pong(data)).await.is_err() {
                                        return SessionEnd::Dropped("failed to answer ping".to_string());
                                    }
                                }
                                WsMessage::Pong(_) => {}
                                WsMessage::Binary(_) => {
                                    warn!("Ignoring binary frame on {}", self.topic);
                                }
                                WsMessage::Close(_) => {
                                    return SessionEnd::Dropped("server closed the connection".to_string());
                                }
                                WsMessage::Frame(_) => {}
                            }
                        }
                        Some(Err(e)) => {
                            return SessionEnd::Dropped(describe_socket_error(&e));
                        }
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) -> Option<SessionEnd> {
        let frame: RealtimeFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Ignoring unparseable frame on {}: {}", self.topic, e);
                return None;
            }
        };
        if frame.topic != self.topic && frame.topic != HEARTBEAT_TOPIC {
            debug!("Ignoring frame for foreign topic {}", frame.topic);
            return None;
        }

        match frame.classify() {
            InboundEvent::Change(data) => {
                if !data.is_insert_into(&self.config.table) {
                    debug!("Ignoring {} on {}", data.change_type, data.table);
                    return None;
                }
                match serde_json::from_value::<Message>(data.record) {
                    Ok(message) if message.conversation_id == self.conversation_id => {
                        self.emit(FeedEvent::Inserted(message));
                    }
                    Ok(message) => {
                        warn!(
                            "Dropping row {} for conversation {} delivered on {}",
                            message.id,
                            message.conversation_id,
                            self.topic
                        );
                    }
                    Err(e) => {
                        error!("Error parsing change record on {}: {}", self.topic, e);
                    }
                }
            }
            InboundEvent::Reply { ok: false, response, .. } => {
                warn!("Realtime request rejected on {}: {}", self.topic, response);
            }
            InboundEvent::Reply { .. } => {}
            InboundEvent::ChannelError(detail) => {
                return Some(SessionEnd::Dropped(format!("channel error: {}", detail)));
            }
            InboundEvent::ChannelClosed => {
                return Some(SessionEnd::Dropped("channel closed by server".to_string()));
            }
            InboundEvent::Malformed(e) => {
                error!("Malformed change payload on {}: {}", self.topic, e);
            }
            InboundEvent::Other(event) => {
                debug!("Ignoring {} on {}", event, self.topic);
            }
        }
        None
    }

    /// Retries until joined again; `None` if shut down meanwhile.
    async fn reconnect(&mut self) -> Option<Socket> {
        let mut attempt = 0u32;
        loop {
            let delay = self.config.reconnect.delay_for(attempt);
            info!("Reconnecting {} in {:?} (attempt {})", self.topic, delay, attempt + 1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
            if self.shutdown_requested() {
                return None;
            }
            match
                connect_and_join(
                    &self.config,
                    &self.topic,
                    &self.conversation_id,
                    &mut self.refs
                ).await
            {
                Ok(socket) => {
                    return Some(socket);
                }
                Err(e) => {
                    warn!("Reconnect of {} failed: {}", self.topic, e);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn leave(&mut self, socket: &mut Socket) {
        let frame = RealtimeFrame::leave(&self.topic, next_ref(&mut self.refs));
        if let Err(e) = send_frame(socket, &frame).await {
            debug!("Leave frame for {} not sent: {}", self.topic, e);
        }
        let _ = socket.close(None).await;
    }
}

fn describe_socket_error(e: &tokio_tungstenite::tungstenite::Error) -> String {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => "connection closed".to_string(),
        WsError::Io(io_err) if io_err.kind() == std::io::ErrorKind::ConnectionReset => {
            "connection reset by peer".to_string()
        }
        WsError::Protocol(p) => format!("protocol error: {}", p),
        other => other.to_string(),
    }
}

struct RealtimeSubscription {
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl FeedSubscription for RealtimeSubscription {
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("Realtime channel did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                task.abort();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }
}
