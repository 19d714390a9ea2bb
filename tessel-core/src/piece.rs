use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::block::BlockId;

/// Opaque identity of a piece.
///
/// A fresh id is minted whenever a piece's `(block, start, length)` changes,
/// so an id held across a structural mutation must be re-validated with
/// [`PieceTable::locate`](crate::PieceTable::locate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceId(Uuid);

impl PieceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PieceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PieceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PieceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous run of lines `[start, start + length)` of one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub(crate) id: PieceId,
    pub(crate) block_id: BlockId,
    pub(crate) start: usize,
    pub(crate) length: usize,
    pub(crate) owner: Option<String>,
}

impl Piece {
    pub(crate) fn new(block_id: BlockId, start: usize, length: usize, owner: Option<String>) -> Self {
        Self {
            id: PieceId::new(),
            block_id,
            start,
            length,
            owner,
        }
    }

    pub fn id(&self) -> PieceId {
        self.id
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The user holding the lock, `None` when unlocked.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub(crate) fn is_owned_by(&self, user: &str) -> bool {
        self.owner.as_deref() == Some(user)
    }

    /// The sub-range `[from, from + length)` of this piece, with a new id.
    pub(crate) fn slice(&self, from: usize, length: usize) -> Piece {
        Piece::new(self.block_id, self.start + from, length, self.owner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_mints_new_id() {
        let piece = Piece::new(BlockId(3), 2, 6, Some("alice".to_string()));
        let tail = piece.slice(4, 2);
        assert_ne!(tail.id(), piece.id());
        assert_eq!(tail.block_id(), BlockId(3));
        assert_eq!(tail.start(), 6);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.owner(), Some("alice"));
    }

    #[test]
    fn test_ownership() {
        let unlocked = Piece::new(BlockId::ORIG, 0, 1, None);
        assert!(!unlocked.is_locked());
        assert!(!unlocked.is_owned_by(""));

        let locked = Piece::new(BlockId(1), 0, 1, Some("bob".to_string()));
        assert!(locked.is_owned_by("bob"));
        assert!(!locked.is_owned_by("alice"));
    }
}
