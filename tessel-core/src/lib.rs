//! Tessel core: the piece-table text engine behind collaborative editing.
//!
//! ```text
//!   SessionFile ── cursors (user → piece, offset, column)
//!        │
//!        ▼
//!   PieceTable ─── pieces: [Piece][Piece][Piece] ...
//!        │                   │      │      │
//!        ▼                   ▼      ▼      ▼
//!   BlockStore ─── 0: committed lines, 1..: lock working copies
//! ```
//!
//! Users lock line ranges, edit only what they hold, and release. Unlocked
//! regions are reconciled back into block 0 on demand. Nothing here is
//! thread-safe on its own: a caller owns each [`SessionFile`] exclusively and
//! applies operations one at a time.

pub mod block;
pub mod error;
pub mod piece;
pub mod piece_table;
pub mod session;

pub use block::{BlockId, BlockStore};
pub use error::{SessionError, TableError};
pub use piece::{Piece, PieceId};
pub use piece_table::{split_lines, PieceTable, EMPTY_LINE};
pub use session::{Cursor, SessionFile};
