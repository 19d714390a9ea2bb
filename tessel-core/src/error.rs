//! Error taxonomy for the piece table and the session layer.
//!
//! `TableError` separates expected rejections (a region is locked, a piece id
//! went stale) from the one bug-class failure, `InvalidBlockReference`.

use crate::block::BlockId;
use crate::piece::PieceId;

/// Errors raised by [`PieceTable`](crate::PieceTable) operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// A line or offset argument falls outside the piece or the file.
    OutOfRange {
        /// The offending line index (or end of range).
        index: usize,
        /// The length it was checked against.
        len: usize,
    },
    /// The requested range overlaps a piece locked by another user.
    RegionLocked {
        piece_id: PieceId,
        owner: String,
    },
    /// The piece id is not (or no longer) in the table.
    UnknownPiece(PieceId),
    /// The piece has no owner, or is owned by someone else.
    NotLocked(PieceId),
    /// A piece points at a block that does not exist, or a locked piece does
    /// not own its block from offset 0.
    InvalidBlockReference(BlockId),
}

impl TableError {
    /// Whether the error indicates a broken table rather than a rejected request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TableError::InvalidBlockReference(_))
    }
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableError::OutOfRange { index, len } => {
                write!(f, "Line {index} out of range (length {len})")
            }
            TableError::RegionLocked { piece_id, owner } => {
                write!(f, "Region locked: piece {piece_id} is owned by {owner}")
            }
            TableError::UnknownPiece(id) => write!(f, "Unknown piece: {id}"),
            TableError::NotLocked(id) => write!(f, "Piece {id} is not locked by this user"),
            TableError::InvalidBlockReference(id) => {
                write!(f, "Invalid block reference: {id}")
            }
        }
    }
}

impl std::error::Error for TableError {}

/// Errors raised by [`SessionFile`](crate::SessionFile) operations.
#[derive(Debug)]
pub enum SessionError {
    /// Piece table rejected the operation.
    Table(TableError),
    /// The user has not joined this file.
    NotJoined(String),
    /// Reading or writing the backing file failed.
    Io(std::io::Error),
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Table(e) if e.is_fatal())
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Table(e) => write!(f, "{e}"),
            SessionError::NotJoined(user) => write!(f, "User {user} has not joined this file"),
            SessionError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Table(e) => Some(e),
            SessionError::Io(e) => Some(e),
            SessionError::NotJoined(_) => None,
        }
    }
}

impl From<TableError> for SessionError {
    fn from(e: TableError) -> Self {
        SessionError::Table(e)
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_block_reference_is_fatal() {
        let id = PieceId::new();
        assert!(!TableError::UnknownPiece(id).is_fatal());
        assert!(!TableError::NotLocked(id).is_fatal());
        assert!(!TableError::OutOfRange { index: 3, len: 2 }.is_fatal());
        assert!(TableError::InvalidBlockReference(BlockId(4)).is_fatal());

        let session: SessionError = TableError::InvalidBlockReference(BlockId(4)).into();
        assert!(session.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = TableError::RegionLocked {
            piece_id: PieceId::new(),
            owner: "alice".to_string(),
        };
        assert!(err.to_string().contains("alice"));

        let err = SessionError::NotJoined("bob".to_string());
        assert_eq!(err.to_string(), "User bob has not joined this file");
    }
}
