//! Per-file session: one piece table plus the cursors of everyone editing it.
//!
//! Structural table mutations replace piece ids, so every such call goes
//! through the same cursor discipline: snapshot each cursor as an absolute
//! row, mutate, then map the rows back onto the new pieces.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::error::{SessionError, TableError};
use crate::piece::PieceId;
use crate::piece_table::{split_lines, PieceTable};

/// A user's position: a line inside a piece, and a column inside that line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub piece_id: PieceId,
    pub offset: usize,
    pub column: usize,
}

/// Live in-memory state of one open file.
#[derive(Debug)]
pub struct SessionFile {
    table: PieceTable,
    cursors: IndexMap<String, Cursor>,
    root: PathBuf,
    path: PathBuf,
    saved: bool,
}

impl SessionFile {
    /// Load `root/path` from disk.
    pub fn open(root: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let root = root.into();
        let path = path.into();
        let text = std::fs::read_to_string(root.join(&path))?;
        Ok(Self::from_disk_text(root, path, &text))
    }

    /// Build a session over text just read from `root/path`. The file counts as saved.
    pub fn from_disk_text(root: impl Into<PathBuf>, path: impl Into<PathBuf>, text: &str) -> Self {
        let mut file = Self::from_text(root, path, text);
        file.saved = true;
        log::info!("Loaded {} ({} lines)", file.path.display(), file.table.len());
        file
    }

    /// Build a session over in-memory text. The file counts as unsaved.
    pub fn from_text(root: impl Into<PathBuf>, path: impl Into<PathBuf>, text: &str) -> Self {
        Self {
            table: PieceTable::from_text(text),
            cursors: IndexMap::new(),
            root: root.into(),
            path: path.into(),
            saved: false,
        }
    }

    /// Replace the table with the file's current disk content.
    ///
    /// Every cursor is reset to the top of the file.
    pub fn load_from_disk(&mut self) -> Result<(), SessionError> {
        let text = std::fs::read_to_string(self.full_path())?;
        self.table = PieceTable::new(split_lines(&text));
        let top = self.top();
        for cursor in self.cursors.values_mut() {
            *cursor = top;
        }
        self.saved = true;
        log::info!("Loaded {} ({} lines)", self.path.display(), self.table.len());
        Ok(())
    }

    /// Write the stitched file verbatim. Locks are kept.
    pub fn save_to_disk(&mut self) -> Result<(), SessionError> {
        std::fs::write(self.full_path(), self.contents()?)?;
        self.mark_saved();
        Ok(())
    }

    /// The stitched file as one string, exactly as it would be saved.
    pub fn contents(&self) -> Result<String, SessionError> {
        Ok(self.table.read_all()?.concat())
    }

    /// Record that [`contents`](Self::contents) has been written out.
    pub fn mark_saved(&mut self) {
        self.saved = true;
        log::info!("Saved {}", self.path.display());
    }

    // ───────────────────────────────────────────────────────────────
    // Clients
    // ───────────────────────────────────────────────────────────────

    /// Attach `user` with a cursor at the top of the file.
    pub fn join(&mut self, user: &str) {
        let top = self.top();
        self.cursors.insert(user.to_string(), top);
    }

    /// Detach `user`, releasing (without merging) every piece they own.
    pub fn leave(&mut self, user: &str) -> Result<Vec<PieceId>, SessionError> {
        self.require_joined(user)?;
        let owned: Vec<PieceId> = self
            .table
            .pieces()
            .iter()
            .filter(|p| p.owner() == Some(user))
            .map(|p| p.id())
            .collect();
        for id in &owned {
            self.table.unlock(*id)?;
        }
        self.cursors.shift_remove(user);
        Ok(owned)
    }

    /// Joined users in join order, optionally leaving one out.
    pub fn clients(&self, exclude: Option<&str>) -> Vec<String> {
        self.cursors
            .keys()
            .filter(|user| Some(user.as_str()) != exclude)
            .cloned()
            .collect()
    }

    pub fn is_joined(&self, user: &str) -> bool {
        self.cursors.contains_key(user)
    }

    pub fn client_count(&self) -> usize {
        self.cursors.len()
    }

    // ───────────────────────────────────────────────────────────────
    // Locks
    // ───────────────────────────────────────────────────────────────

    pub fn lock(
        &mut self,
        user: &str,
        piece_id: PieceId,
        offset: usize,
        length: usize,
    ) -> Result<PieceId, SessionError> {
        self.require_joined(user)?;
        self.with_cursors(|table| table.lock(piece_id, offset, length, user), |row| row)
    }

    /// Lock a new empty line after `after`, or at the top of the file.
    pub fn lock_after(&mut self, user: &str, after: Option<PieceId>) -> Result<PieceId, SessionError> {
        self.require_joined(user)?;
        let inserted_row = match after {
            Some(id) => self.table.piece_to_row(id)? + self.table.piece(id)?.len(),
            None => 0,
        };
        self.with_cursors(
            |table| table.lock_after(after, user),
            |row| if row >= inserted_row { row + 1 } else { row },
        )
    }

    pub fn unlock(&mut self, lock_id: PieceId) -> Result<(), SessionError> {
        self.with_cursors(|table| table.unlock(lock_id), |row| row)
    }

    /// Unlock on behalf of `user`, who must own the piece.
    pub fn unlock_as(&mut self, user: &str, lock_id: PieceId) -> Result<(), SessionError> {
        if self.table.piece(lock_id)?.owner() != Some(user) {
            return Err(TableError::NotLocked(lock_id).into());
        }
        self.unlock(lock_id)
    }

    pub fn change_lock_owner(&mut self, lock_id: PieceId, user: &str) -> Result<PieceId, SessionError> {
        self.with_cursors(|table| table.transfer(lock_id, user), |row| row)
    }

    /// Fold unlocked pieces into block 0 and drop dead blocks.
    pub fn reconcile(&mut self) -> Result<Vec<BlockId>, SessionError> {
        self.with_cursors(
            |table| {
                table.merge_unlocked()?;
                Ok(table.garbage_collect())
            },
            |row| row,
        )
    }

    /// Drop blocks no piece references any more, e.g. after a lock merged
    /// its neighbours. Pieces are untouched so cursors stay valid.
    pub fn collect_garbage(&mut self) -> Vec<BlockId> {
        self.table.garbage_collect()
    }

    // ───────────────────────────────────────────────────────────────
    // Cursors and content
    // ───────────────────────────────────────────────────────────────

    /// Move `user`'s cursor, clamping `offset` into the piece.
    ///
    /// Returns `None` if the user has not joined or the piece is unknown.
    pub fn move_cursor(
        &mut self,
        user: &str,
        piece_id: PieceId,
        offset: usize,
        column: usize,
    ) -> Option<Cursor> {
        let length = self.table.piece(piece_id).ok()?.len();
        let cursor = self.cursors.get_mut(user)?;
        *cursor = Cursor {
            piece_id,
            offset: offset.min(length.saturating_sub(1)),
            column,
        };
        Some(*cursor)
    }

    pub fn cursors(&self) -> &IndexMap<String, Cursor> {
        &self.cursors
    }

    pub fn cursor(&self, user: &str) -> Option<&Cursor> {
        self.cursors.get(user)
    }

    /// Replace the content of a piece `user` has locked.
    pub fn edit(&mut self, user: &str, piece_id: PieceId, lines: Vec<String>) -> Result<(), SessionError> {
        if self.table.piece(piece_id)?.owner() != Some(user) {
            return Err(TableError::NotLocked(piece_id).into());
        }
        self.table.set_content(piece_id, lines)?;

        let last = self.table.piece(piece_id)?.len().saturating_sub(1);
        for cursor in self.cursors.values_mut().filter(|c| c.piece_id == piece_id) {
            cursor.offset = cursor.offset.min(last);
        }
        self.saved = false;
        log::debug!("{user} edited piece {piece_id} in {}", self.path.display());
        Ok(())
    }

    /// The whole stitched file.
    pub fn read(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.table.read_all()?)
    }

    pub fn table(&self) -> &PieceTable {
        &self.table
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// Where the file lives on disk.
    pub fn full_path(&self) -> PathBuf {
        self.root.join(&self.path)
    }

    // ───────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────

    fn top(&self) -> Cursor {
        Cursor {
            piece_id: self.table.pieces()[0].id(),
            offset: 0,
            column: 0,
        }
    }

    fn require_joined(&self, user: &str) -> Result<(), SessionError> {
        if self.is_joined(user) {
            Ok(())
        } else {
            Err(SessionError::NotJoined(user.to_string()))
        }
    }

    /// Run a structural mutation, carrying every cursor across it by row.
    ///
    /// `shift` maps a row from before the mutation to the same line after it.
    fn with_cursors<T>(
        &mut self,
        mutate: impl FnOnce(&mut PieceTable) -> Result<T, TableError>,
        shift: impl Fn(usize) -> usize,
    ) -> Result<T, SessionError> {
        let rows: Vec<usize> = self
            .cursors
            .iter()
            .map(|(user, cursor)| match self.table.piece_to_row(cursor.piece_id) {
                Ok(row) => row + cursor.offset,
                Err(_) => {
                    log::warn!("Cursor of {user} points at a missing piece, resetting");
                    0
                }
            })
            .collect();

        let result = mutate(&mut self.table)?;

        let len = self.table.len();
        let top = self.top();
        for (cursor, row) in self.cursors.values_mut().zip(rows) {
            let placed = if len == 0 {
                None
            } else {
                self.table.row_to_piece(shift(row).min(len - 1)).ok()
            };
            *cursor = match placed {
                Some((piece_id, offset)) => Cursor {
                    piece_id,
                    offset,
                    column: cursor.column,
                },
                None => Cursor {
                    column: cursor.column,
                    ..top
                },
            };
        }
        Ok(result)
    }
}
