//! WebSocket transport in front of the room registry.
//!
//! ```text
//! TCP accept ─▶ upgrade (doc id + credentials → Identity) ─▶ Connection
//!                                                             │
//!          ┌──────────── read pump ◀── socket ──▶ write pump ◀┘ outbound queue
//!          ▼
//!      RoomHandle (bounded event queue)
//! ```
//!
//! URL: `/collab/{docId}` or `/{docId}` (`?docId=` as a fallback), with
//! `?token=` or, in development mode, `X-User-ID` / `?userId=`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{Authenticator, Credentials, Identity};
use crate::config::ServerConfig;
use crate::connection::{Connection, Outbound};
use crate::error::{AuthError, ServerError};
use crate::protocol::{
    encode_message, ClientMessage, ConnectedInfo, ErrorInfo, MessageKind, SyncInfo,
};
use crate::registry::RoomRegistry;
use crate::room::RoomHandle;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub binary_frames: u64,
    pub text_frames: u64,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    binary_frames: AtomicU64,
    text_frames: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.rejected_handshakes.load(Ordering::Relaxed),
            binary_frames: self.binary_frames.load(Ordering::Relaxed),
            text_frames: self.text_frames.load(Ordering::Relaxed),
        }
    }
}

/// Accepted upgrade: which document, and who.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub doc_id: Uuid,
    pub identity: Identity,
}

/// Collaboration WebSocket server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    pub fn new(config: ServerConfig, registry: Arc<RoomRegistry>, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            config,
            registry,
            auth,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and accept connections forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, std::future::pending::<()>()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    log::info!("Collaboration server stopped accepting connections");
                    return Ok(());
                }
            };
            log::debug!("New TCP connection from {addr}");

            let session = Session {
                config: self.config.clone(),
                registry: self.registry.clone(),
                auth: self.auth.clone(),
                stats: self.stats.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = session.handle(stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Everything one connection task needs.
struct Session {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<AtomicServerStats>,
}

impl Session {
    async fn handle(self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.config.max_message_size))
            .max_frame_size(Some(self.config.max_message_size));

        let mut accepted: Option<Handshake> = None;
        let auth = self.auth.clone();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match authorize(request, auth.as_ref()) {
                Ok(handshake) => {
                    accepted = Some(handshake);
                    Ok(response)
                }
                Err((status, message)) => {
                    log::info!("Rejected upgrade for {}: {}", request.uri(), message);
                    let mut rejection = ErrorResponse::new(Some(message));
                    *rejection.status_mut() = status;
                    Err(rejection)
                }
            }
        };

        let ws_stream =
            match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
                Ok(ws) => ws,
                Err(e) => {
                    self.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                    return Err(e.into());
                }
            };
        let Some(Handshake { doc_id, identity }) = accepted else {
            return Ok(());
        };

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "WebSocket connection from {addr}: user {} on document {}",
            identity.user_id,
            doc_id
        );

        let result = self.run_connection(ws_stream, doc_id, identity).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn run_connection(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        doc_id: Uuid,
        identity: Identity,
    ) -> Result<(), ServerError> {
        let (connection, outbound) = Connection::new(doc_id, identity, self.config.outbound_capacity);
        connection.send_message(
            MessageKind::Connected,
            &ConnectedInfo {
                user_id: connection.user_id(),
                permission: connection.permission(),
                doc_id,
                connection_id: connection.id(),
            },
        );

        let room = self.join(connection.clone()).await?;

        let (sink, source) = ws_stream.split();
        let mut writer = tokio::spawn(write_pump(
            sink,
            outbound,
            connection.closing(),
            self.config.write_timeout,
            self.config.ping_interval,
        ));

        let writer_done = self.read_pump(source, &connection, &room, &mut writer).await;

        let _ = room.unregister(connection.id()).await;
        connection.close();
        if !writer_done {
            match time::timeout(self.config.write_timeout, &mut writer).await {
                Ok(Ok(Err(e))) => log::debug!("Write pump for {} ended: {}", connection.id(), e),
                Ok(_) => {}
                Err(_) => writer.abort(),
            }
        }
        log::info!(
            "Connection {} of user {} on document {} closed",
            connection.id(),
            connection.user_id(),
            doc_id
        );
        Ok(())
    }

    /// Register with the document's room, retrying once if it was draining.
    async fn join(&self, connection: Arc<Connection>) -> Result<RoomHandle, ServerError> {
        let doc_id = connection.doc_id();
        let room = self.registry.get_or_create(doc_id).await;
        if room.register(connection.clone()).await.is_ok() {
            return Ok(room);
        }
        let room = self.registry.get_or_create(doc_id).await;
        room.register(connection).await?;
        Ok(room)
    }

    /// Returns whether the write pump already finished.
    async fn read_pump(
        &self,
        mut source: WsSource,
        connection: &Arc<Connection>,
        room: &RoomHandle,
        writer: &mut tokio::task::JoinHandle<Result<(), ServerError>>,
    ) -> bool {
        loop {
            let frame = tokio::select! {
                frame = time::timeout(self.config.pong_wait, source.next()) => frame,
                _ = &mut *writer => return true,
            };

            let message = match frame {
                Err(_) => {
                    log::info!("Connection {} timed out waiting for frames", connection.id());
                    return false;
                }
                Ok(None) => return false,
                Ok(Some(Err(e))) => {
                    log::debug!("Connection {} read error: {}", connection.id(), e);
                    return false;
                }
                Ok(Some(Ok(message))) => message,
            };

            let delivered = match message {
                Message::Binary(data) => {
                    self.stats.binary_frames.fetch_add(1, Ordering::Relaxed);
                    if data.len() > self.config.max_message_size {
                        log::info!("Connection {} sent an oversized frame", connection.id());
                        return false;
                    }
                    room.apply_update(connection.id(), Vec::from(data)).await
                }
                Message::Text(text) => {
                    self.stats.text_frames.fetch_add(1, Ordering::Relaxed);
                    match ClientMessage::decode(text.as_str()) {
                        Ok(ClientMessage::Update(blob)) => room.apply_update(connection.id(), blob).await,
                        Ok(ClientMessage::Presence(presence)) => {
                            room.update_presence(connection.id(), presence).await
                        }
                        Ok(ClientMessage::Sync) => room.request_sync(connection.id()).await,
                        Ok(ClientMessage::Disconnect) => return false,
                        Err(e) => {
                            log::debug!("Bad message from connection {}: {}", connection.id(), e);
                            connection.send_message(MessageKind::Error, &ErrorInfo { message: e.to_string() });
                            Ok(())
                        }
                    }
                }
                Message::Close(_) => return false,
                // tungstenite queues the pong reply itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(()),
            };

            if delivered.is_err() {
                log::debug!("Room for connection {} is gone", connection.id());
                return false;
            }
        }
    }
}

/// Drain the outbound queue onto the socket until closed.
async fn write_pump(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Outbound>,
    mut closing: watch::Receiver<bool>,
    write_timeout: Duration,
    ping_interval: Duration,
) -> Result<(), ServerError> {
    let mut ping = time::interval_at(time::Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Close) | None => break Ok(()),
                Some(item) => {
                    if let Err(e) = write_item(&mut sink, item, write_timeout).await {
                        break Err(e);
                    }
                }
            },
            _ = async { let _ = closing.wait_for(|closing| *closing).await; } => {
                // Flush what was queued before the close request
                let mut flushed = Ok(());
                while let Ok(item) = outbound.try_recv() {
                    if item == Outbound::Close {
                        break;
                    }
                    flushed = write_item(&mut sink, item, write_timeout).await;
                    if flushed.is_err() {
                        break;
                    }
                }
                break flushed;
            }
            _ = ping.tick() => {
                if let Err(e) = send_frame(&mut sink, Message::Ping(Vec::new().into()), write_timeout).await {
                    break Err(e);
                }
            }
        }
    };

    let _ = time::timeout(write_timeout, sink.send(Message::Close(None))).await;
    let _ = time::timeout(write_timeout, sink.close()).await;
    result
}

async fn write_item(sink: &mut WsSink, item: Outbound, timeout: Duration) -> Result<(), ServerError> {
    match item {
        Outbound::Binary(blob) => send_frame(sink, Message::binary(blob.to_vec()), timeout).await,
        Outbound::Text(text) => send_frame(sink, Message::text(text.to_string()), timeout).await,
        Outbound::Replay { frames, version } => {
            for frame in &frames {
                send_frame(sink, Message::binary(frame.to_vec()), timeout).await?;
            }
            let sync = encode_message(
                MessageKind::Sync,
                &SyncInfo {
                    version,
                    frames: frames.len(),
                },
            )?;
            send_frame(sink, Message::text(sync), timeout).await
        }
        Outbound::Close => Ok(()),
    }
}

async fn send_frame(sink: &mut WsSink, message: Message, timeout: Duration) -> Result<(), ServerError> {
    match time::timeout(timeout, sink.send(message)).await {
        Ok(result) => result.map_err(ServerError::from),
        Err(_) => Err(ServerError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "websocket write timed out",
        ))),
    }
}

/// Credential and document parameters accepted on the upgrade URL.
#[derive(Debug, Default, Deserialize)]
struct HandshakeQuery {
    token: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "docId")]
    doc_id: Option<String>,
}

impl HandshakeQuery {
    fn parse(query: Option<&str>) -> Result<Self, serde_urlencoded::de::Error> {
        serde_urlencoded::from_str(query.unwrap_or(""))
    }
}

/// Resolve document and identity from the upgrade request.
fn authorize(request: &Request, auth: &dyn Authenticator) -> Result<Handshake, (StatusCode, String)> {
    let query = HandshakeQuery::parse(request.uri().query())
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid query string: {e}")))?;
    let doc_id = document_id(request.uri().path(), query.doc_id.as_deref())
        .ok_or((StatusCode::BAD_REQUEST, "Invalid document ID".to_string()))?;

    let header_user = request
        .headers()
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let credentials = Credentials {
        token: query.token,
        user_id: header_user.or(query.user_id),
    };

    let identity = auth.authenticate(doc_id, &credentials).map_err(|e| {
        let status = match e {
            AuthError::Forbidden { .. } => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        };
        (status, e.to_string())
    })?;
    Ok(Handshake { doc_id, identity })
}

/// `/collab/{id}`, `/{id}`, else the `docId` query parameter.
fn document_id(path: &str, query_doc: Option<&str>) -> Option<Uuid> {
    let trimmed = path.trim_matches('/');
    let candidate = trimmed.strip_prefix("collab").unwrap_or(trimmed).trim_matches('/');
    let raw = if candidate.is_empty() {
        query_doc.unwrap_or("")
    } else {
        candidate
    };
    Uuid::parse_str(raw).ok()
}
