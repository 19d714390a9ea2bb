//! WebSocket server routing editor requests to per-file actors.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── FileActor (notes.txt) ── SessionFile
//!            ├── FileRegistry ────────┤
//! Client B ──┘        │               └── FileActor (main.rs) ─── SessionFile
//!    ▲                │                          │
//!    │                ▼                          │
//!    └──────────── PeerHub ◄─────────────────────┘
//! ```
//!
//! Each connection:
//! - must open with `Hello { username }`; the name is its identity
//! - forwards file requests to the registry and turns failures into `Error`
//! - drains its hub queue into the socket
//! - on close, force-leaves every file it joined

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{HubStats, PeerHub};
use crate::error::CoordinatorError;
use crate::file_actor::FileRequest;
use crate::protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};
use crate::registry::FileRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Directory all file paths are relative to
    pub root_dir: PathBuf,
    /// Frames buffered per connection before it counts as lagging
    pub outbound_capacity: usize,
    /// Requests buffered per open file
    pub file_queue_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            root_dir: PathBuf::from("file_root"),
            outbound_capacity: 256,
            file_queue_capacity: 64,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, small queues, the given root.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            root_dir: root.into(),
            outbound_capacity: 64,
            file_queue_capacity: 16,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub open_files: usize,
    pub hub: HubStats,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// The file server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<PeerHub>,
    registry: Arc<FileRegistry>,
    stats: Arc<AtomicServerStats>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(PeerHub::new(config.outbound_capacity));
        let registry = Arc::new(FileRegistry::new(
            config.root_dir.clone(),
            hub.clone(),
            config.file_queue_capacity,
        ));
        Self {
            config,
            hub,
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until an accept fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!(
            "File server listening on {} (root {})",
            listener.local_addr()?,
            self.config.root_dir.display()
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                hub: self.hub.clone(),
                registry: self.registry.clone(),
                stats: self.stats.clone(),
                heartbeat: Duration::from_secs(self.config.heartbeat_interval_secs.max(1)),
            };
            tokio::spawn(async move {
                if let Err(e) = connection.run(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            open_files: self.registry.open_files().await,
            hub: self.hub.stats().await,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<PeerHub> {
        &self.hub
    }
}

/// State shared by one connection task.
struct Connection {
    hub: Arc<PeerHub>,
    registry: Arc<FileRegistry>,
    stats: Arc<AtomicServerStats>,
    heartbeat: Duration,
}

impl Connection {
    async fn run(self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Handshake: the first data frame names the user.
        let username = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => match ClientMessage::decode(&data) {
                    Ok(ClientMessage::Hello { username }) if !username.is_empty() => break username,
                    _ => {
                        let reply = ServerMessage::error(ErrorCode::WrongMessage, "Expected Hello");
                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                        return Err(ProtocolError::HandshakeRequired.into());
                    }
                },
                Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            }
        };

        let Some(mut outbound) = self.hub.register(&username).await else {
            log::warn!("Rejected {addr}: {username} is already connected");
            let reply = ServerMessage::error(ErrorCode::WrongMessage, "Username already connected");
            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
            return Ok(());
        };

        let welcome = ServerMessage::Welcome {
            username: username.clone(),
        };
        ws_sender.send(Message::Binary(welcome.encode()?.into())).await?;

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("{username} connected from {addr}");

        let mut joined: BTreeSet<PathBuf> = BTreeSet::new();
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        let outcome: Result<(), BoxError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            self.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                            let result = match ClientMessage::decode(&data) {
                                Ok(request) => self.handle_message(&username, request, &mut joined).await,
                                Err(e) => Err(CoordinatorError::WrongMessage(e.to_string())),
                            };
                            if let Err(e) = result {
                                log::warn!("Request from {username} refused: {e}");
                                let reply = ServerMessage::error(e.code(), e.to_string());
                                if let Err(e) = self.hub.reply(&username, &reply).await {
                                    break Err(e.into());
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                    }
                }

                frame = outbound.recv() => {
                    let Some(frame) = frame else { break Ok(()) };
                    if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                        break Err(e.into());
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        // Cleanup: leave every joined file, then free the name.
        self.registry.disconnect(&username, &joined).await;
        self.hub.unregister(&username).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("{username} disconnected");
        outcome
    }

    async fn handle_message(
        &self,
        user: &str,
        msg: ClientMessage,
        joined: &mut BTreeSet<PathBuf>,
    ) -> Result<(), CoordinatorError> {
        let (file_path, request) = match msg {
            ClientMessage::Hello { .. } => {
                return Err(CoordinatorError::WrongMessage("Hello after handshake".to_string()));
            }
            ClientMessage::Ping => {
                self.hub
                    .reply(user, &ServerMessage::Pong)
                    .await
                    .map_err(|e| CoordinatorError::WrongMessage(e.to_string()))?;
                return Ok(());
            }
            ClientMessage::Join { file_path } => (file_path, FileRequest::Join),
            ClientMessage::Leave { file_path, force } => (file_path, FileRequest::Leave { force }),
            ClientMessage::ContentRequest { file_path } => (file_path, FileRequest::Content),
            ClientMessage::Lock {
                file_path,
                piece_id,
                offset,
                length,
            } => (
                file_path,
                FileRequest::Lock {
                    piece_id,
                    offset,
                    length,
                },
            ),
            ClientMessage::LockInsert { file_path, after } => (file_path, FileRequest::LockInsert { after }),
            ClientMessage::Unlock { file_path, lock_id } => (file_path, FileRequest::Unlock { lock_id }),
            ClientMessage::Edit {
                file_path,
                piece_id,
                lines,
            } => (file_path, FileRequest::Edit { piece_id, lines }),
            ClientMessage::CursorMove {
                file_path,
                piece_id,
                offset,
                column,
            } => (
                file_path,
                FileRequest::CursorMove {
                    piece_id,
                    offset,
                    column,
                },
            ),
            ClientMessage::CursorListRequest { file_path } => (file_path, FileRequest::CursorList),
            ClientMessage::Save { file_path } => (file_path, FileRequest::Save),
        };

        let path = self.registry.resolve(&file_path)?;
        let is_join = request == FileRequest::Join;
        let is_leave = matches!(request, FileRequest::Leave { .. });

        self.registry.dispatch(user, &path, request).await?;
        if is_join {
            joined.insert(path);
        } else if is_leave {
            joined.remove(&path);
        }
        Ok(())
    }
}
