//! One task per open file.
//!
//! ```text
//!  connection A ──┐                       ┌──► PeerHub ──► A, B, ...
//!                 ├─► mpsc ─► FileActor ──┤
//!  connection B ──┘          (SessionFile)└──► oneshot reply
//! ```
//!
//! The actor owns its [`SessionFile`] outright and handles requests strictly
//! in arrival order, so the table never sees two mutations at once. Once the
//! last user has left (or the table is found broken) it closes its queue,
//! answers whatever was still queued with [`CoordinatorError::ActorGone`]
//! and exits.

use std::sync::Arc;
use tessel_core::{BlockId, PieceId, SessionError, SessionFile, TableError};
use tokio::sync::{mpsc, oneshot};

use crate::broadcast::PeerHub;
use crate::error::CoordinatorError;
use crate::protocol::{BlockContent, ServerMessage};

/// A request routed to a file, minus the path.
#[derive(Debug, Clone, PartialEq)]
pub enum FileRequest {
    Join,
    Leave { force: bool },
    Content,
    Lock { piece_id: PieceId, offset: usize, length: usize },
    LockInsert { after: Option<PieceId> },
    Unlock { lock_id: PieceId },
    Edit { piece_id: PieceId, lines: Vec<String> },
    CursorMove { piece_id: PieceId, offset: usize, column: usize },
    CursorList,
    Save,
}

struct FileCommand {
    user: String,
    request: FileRequest,
    reply: oneshot::Sender<Result<(), CoordinatorError>>,
}

/// Cloneable address of a running actor.
#[derive(Clone)]
pub struct FileHandle {
    id: u64,
    tx: mpsc::Sender<FileCommand>,
}

impl FileHandle {
    /// Identity of the actor behind this handle, unique per registry.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the actor has stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send a request and wait for the actor to finish it.
    pub async fn request(&self, user: &str, request: FileRequest) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        let command = FileCommand {
            user: user.to_string(),
            request,
            reply,
        };
        self.tx.send(command).await.map_err(|_| CoordinatorError::ActorGone)?;
        rx.await.map_err(|_| CoordinatorError::ActorGone)?
    }
}

pub struct FileActor {
    session: SessionFile,
    file_path: String,
    hub: Arc<PeerHub>,
    rx: mpsc::Receiver<FileCommand>,
}

impl FileActor {
    /// Spawn an actor owning `session` and return its handle.
    pub fn spawn(id: u64, session: SessionFile, hub: Arc<PeerHub>, queue_capacity: usize) -> FileHandle {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let actor = FileActor {
            file_path: session.path().to_string_lossy().into_owned(),
            session,
            hub,
            rx,
        };
        tokio::spawn(actor.run());
        FileHandle { id, tx }
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            let result = self.handle(&command.user, command.request).await;

            let stop = if matches!(&result, Err(e) if e.is_fatal()) {
                log::error!(
                    "Piece table of {} is inconsistent, evicting:\n{}",
                    self.file_path,
                    self.session.table()
                );
                true
            } else {
                self.session.client_count() == 0
            };
            // Close before replying so the caller already sees a closed handle.
            if stop {
                self.rx.close();
            }
            let _ = command.reply.send(result);
            if stop {
                break;
            }
        }

        while let Some(command) = self.rx.recv().await {
            let _ = command.reply.send(Err(CoordinatorError::ActorGone));
        }
        log::info!("Closed {}", self.file_path);
    }

    async fn handle(&mut self, user: &str, request: FileRequest) -> Result<(), CoordinatorError> {
        if request != FileRequest::Join && !self.session.is_joined(user) {
            return Err(CoordinatorError::FileNotJoined(self.file_path.clone()));
        }

        match request {
            FileRequest::Join => {
                self.session.join(user);
                log::info!("{user} joined {}", self.file_path);
                let joined = ServerMessage::JoinBroadcast {
                    file_path: self.file_path.clone(),
                    username: user.to_string(),
                };
                self.send_others(user, &joined).await;
                self.reply(user, &self.content()).await;
                self.send_all(user, &self.cursor_list()).await;
            }

            FileRequest::Leave { force } => {
                if self.session.client_count() == 1 && !self.session.is_saved() && !force {
                    return Err(CoordinatorError::FileNotSaved(self.file_path.clone()));
                }
                let released = self.session.leave(user)?;
                let removed = self.session.reconcile()?;
                log::info!(
                    "{user} left {} ({} locks released)",
                    self.file_path,
                    released.len()
                );

                let left = ServerMessage::LeaveBroadcast {
                    file_path: self.file_path.clone(),
                    username: user.to_string(),
                };
                self.reply(user, &left).await;
                if self.session.client_count() > 0 {
                    self.send_all(user, &left).await;
                    self.send_all(user, &self.table_change(&[BlockId::ORIG], removed)).await;
                    self.send_all(user, &self.cursor_list()).await;
                }
            }

            FileRequest::Content => {
                self.reply(user, &self.content()).await;
            }

            FileRequest::Lock {
                piece_id,
                offset,
                length,
            } => {
                let result = self.session.lock(user, piece_id, offset, length);
                self.finish_lock(user, result).await?;
            }

            FileRequest::LockInsert { after } => {
                let result = self.session.lock_after(user, after);
                self.finish_lock(user, result).await?;
            }

            FileRequest::Unlock { lock_id } => {
                self.session.unlock_as(user, lock_id)?;
                let removed = self.session.reconcile()?;
                log::debug!("{user} unlocked {lock_id} in {}", self.file_path);
                self.send_all(user, &self.table_change(&[BlockId::ORIG], removed)).await;
                self.send_all(user, &self.cursor_list()).await;
            }

            FileRequest::Edit { piece_id, lines } => {
                match self.session.edit(user, piece_id, lines.clone()) {
                    Ok(()) => {
                        let edit = ServerMessage::EditBroadcast {
                            file_path: self.file_path.clone(),
                            username: user.to_string(),
                            piece_id,
                            lines,
                        };
                        self.send_others(user, &edit).await;
                    }
                    Err(SessionError::Table(TableError::NotLocked(id))) => {
                        // Hand back the real content so the client can roll back.
                        if let Ok(real) = self.session.table().piece_content(id) {
                            let rollback = ServerMessage::EditBroadcast {
                                file_path: self.file_path.clone(),
                                username: user.to_string(),
                                piece_id: id,
                                lines: real,
                            };
                            self.reply(user, &rollback).await;
                        }
                        return Err(TableError::NotLocked(id).into());
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            FileRequest::CursorMove {
                piece_id,
                offset,
                column,
            } => {
                if let Some(cursor) = self.session.move_cursor(user, piece_id, offset, column) {
                    log::trace!("{user} moved to {piece_id}:{} in {}", cursor.offset, self.file_path);
                    let moved = ServerMessage::CursorMove {
                        file_path: self.file_path.clone(),
                        username: user.to_string(),
                        cursor,
                    };
                    self.send_others(user, &moved).await;
                }
            }

            FileRequest::CursorList => {
                self.reply(user, &self.cursor_list()).await;
            }

            FileRequest::Save => {
                let contents = self.session.contents()?;
                tokio::fs::write(self.session.full_path(), contents)
                    .await
                    .map_err(SessionError::from)?;
                self.session.mark_saved();
                let saved = ServerMessage::SaveBroadcast {
                    file_path: self.file_path.clone(),
                    username: user.to_string(),
                };
                self.send_all(user, &saved).await;
            }
        }
        Ok(())
    }

    async fn finish_lock(
        &mut self,
        user: &str,
        result: Result<PieceId, SessionError>,
    ) -> Result<(), CoordinatorError> {
        match result {
            Ok(lock_id) => {
                log::debug!("{user} locked {lock_id} in {}", self.file_path);
                let block = self.session.table().piece(lock_id)?.block_id();
                let removed = self.session.collect_garbage();
                let response = ServerMessage::LockResponse {
                    file_path: self.file_path.clone(),
                    success: true,
                    lock_id: Some(lock_id),
                };
                self.reply(user, &response).await;
                self.send_all(user, &self.table_change(&[block], removed)).await;
                self.send_all(user, &self.cursor_list()).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("Lock by {user} in {} refused: {e}", self.file_path);
                let response = ServerMessage::LockResponse {
                    file_path: self.file_path.clone(),
                    success: false,
                    lock_id: None,
                };
                self.reply(user, &response).await;
                Err(e.into())
            }
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Message builders
    // ───────────────────────────────────────────────────────────────

    fn content(&self) -> ServerMessage {
        let table = self.session.table();
        ServerMessage::Content {
            file_path: self.file_path.clone(),
            pieces: table.pieces().to_vec(),
            blocks: table.blocks().iter().map(|(id, lines)| (id, lines.to_vec())).collect(),
        }
    }

    fn table_change(&self, changed: &[BlockId], removed: Vec<BlockId>) -> ServerMessage {
        let table = self.session.table();
        let changed_blocks: Vec<BlockContent> = changed
            .iter()
            .filter_map(|id| table.block(*id).map(|lines| (*id, lines.to_vec())))
            .collect();
        ServerMessage::PieceTableChange {
            file_path: self.file_path.clone(),
            pieces: table.pieces().to_vec(),
            changed_blocks,
            removed_blocks: removed,
        }
    }

    fn cursor_list(&self) -> ServerMessage {
        ServerMessage::CursorList {
            file_path: self.file_path.clone(),
            cursors: self
                .session
                .cursors()
                .iter()
                .map(|(user, cursor)| (user.clone(), *cursor))
                .collect(),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Delivery
    // ───────────────────────────────────────────────────────────────

    // Anything addressed to the requesting user goes out reliably; copies
    // for everyone else may be dropped if their connection lags.

    async fn reply(&self, user: &str, msg: &ServerMessage) {
        if let Err(e) = self.hub.reply(user, msg).await {
            log::error!("Failed to encode message for {}: {e}", self.file_path);
        }
    }

    async fn send_others(&self, user: &str, msg: &ServerMessage) {
        if let Err(e) = self.hub.send_to(&self.session.clients(Some(user)), msg).await {
            log::error!("Failed to encode message for {}: {e}", self.file_path);
        }
    }

    async fn send_all(&self, user: &str, msg: &ServerMessage) {
        if let Err(e) = self.hub.publish(user, &self.session.clients(None), msg).await {
            log::error!("Failed to encode message for {}: {e}", self.file_path);
        }
    }
}
