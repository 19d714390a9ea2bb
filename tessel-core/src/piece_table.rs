//! Piece table: the logical file as an ordered list of pieces.
//!
//! ```text
//!   pieces:  [ orig 0..2 ][ blk 1 0..3 (alice) ][ orig 5..8 ]
//!                 │               │                  │
//!   blocks:  0 ───┴───────────────┼──────────────────┘
//!            1 ───────────────────┘
//! ```
//!
//! Locking copies the requested lines into a fresh block owned by the locker
//! and splits the surrounding pieces around it. Same-owner neighbours are
//! folded together right away; unlocked runs are only folded back into
//! block 0 by an explicit [`PieceTable::merge_unlocked`].
//!
//! Nothing here is internally synchronized. Callers serialize all mutations
//! of one table (see the per-file actor in `tessel-collab`).

use std::collections::BTreeSet;

use crate::block::{BlockId, BlockStore};
use crate::error::TableError;
use crate::piece::{Piece, PieceId};

/// Line content of a freshly inserted line and of an empty file.
pub const EMPTY_LINE: &str = "\n";

/// Split text into lines, each keeping its terminator.
///
/// The last line has no terminator if the text does not end with one.
pub fn split_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

/// Ordered pieces over an owned block store.
#[derive(Debug, Clone)]
pub struct PieceTable {
    blocks: BlockStore,
    pieces: Vec<Piece>,
}

impl PieceTable {
    /// Build a table with a single unlocked piece spanning `lines`.
    ///
    /// An empty file is stored as one empty line.
    pub fn new(mut lines: Vec<String>) -> Self {
        if lines.is_empty() {
            lines.push(EMPTY_LINE.to_string());
        }
        let length = lines.len();
        Self {
            blocks: BlockStore::new(lines),
            pieces: vec![Piece::new(BlockId::ORIG, 0, length, None)],
        }
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(split_lines(text))
    }

    // ───────────────────────────────────────────────────────────────
    // Inspection
    // ───────────────────────────────────────────────────────────────

    /// Total number of lines in the stitched file.
    pub fn len(&self) -> usize {
        self.pieces.iter().map(|p| p.length).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&[String]> {
        self.blocks.get(id)
    }

    /// Index of `id` in table order.
    pub fn locate(&self, id: PieceId) -> Result<usize, TableError> {
        self.pieces
            .iter()
            .position(|p| p.id == id)
            .ok_or(TableError::UnknownPiece(id))
    }

    pub fn piece(&self, id: PieceId) -> Result<&Piece, TableError> {
        self.locate(id).map(|index| &self.pieces[index])
    }

    /// Lines referenced by one piece.
    pub fn piece_content(&self, id: PieceId) -> Result<Vec<String>, TableError> {
        let piece = self.piece(id)?;
        Ok(self.piece_lines(piece)?.to_vec())
    }

    /// Read `length` lines (all remaining if `None`) starting `offset` lines
    /// into `start` (the first piece if `None`).
    pub fn read(
        &self,
        start: Option<PieceId>,
        offset: usize,
        length: Option<usize>,
    ) -> Result<Vec<String>, TableError> {
        let index = match start {
            Some(id) => self.locate(id)?,
            None => 0,
        };
        let first = &self.pieces[index];
        if offset != 0 && offset >= first.length {
            return Err(TableError::OutOfRange {
                index: offset,
                len: first.length,
            });
        }

        let remaining = self.len() - (self.row_of(index) + offset);
        let wanted = length.map_or(remaining, |l| l.min(remaining));

        let mut lines = Vec::with_capacity(wanted);
        let mut skip = offset;
        for piece in &self.pieces[index..] {
            if lines.len() == wanted {
                break;
            }
            let content = self.piece_lines(piece)?;
            let take = (piece.length - skip).min(wanted - lines.len());
            lines.extend_from_slice(&content[skip..skip + take]);
            skip = 0;
        }
        Ok(lines)
    }

    /// The whole stitched file.
    pub fn read_all(&self) -> Result<Vec<String>, TableError> {
        self.read(None, 0, None)
    }

    /// Absolute row of the first line of a piece.
    pub fn piece_to_row(&self, id: PieceId) -> Result<usize, TableError> {
        self.locate(id).map(|index| self.row_of(index))
    }

    /// The piece holding absolute `row`, and the offset of the row within it.
    pub fn row_to_piece(&self, row: usize) -> Result<(PieceId, usize), TableError> {
        let mut start = 0;
        for piece in &self.pieces {
            if row < start + piece.length {
                return Ok((piece.id, row - start));
            }
            start += piece.length;
        }
        Err(TableError::OutOfRange {
            index: row,
            len: start,
        })
    }

    /// Check that every piece references an existing block range.
    pub fn validate(&self) -> Result<(), TableError> {
        if self.pieces.is_empty() {
            return Err(TableError::InvalidBlockReference(BlockId::ORIG));
        }
        for piece in &self.pieces {
            self.piece_lines(piece)?;
            if piece.is_locked() && (piece.start != 0 || piece.block_id == BlockId::ORIG) {
                return Err(TableError::InvalidBlockReference(piece.block_id));
            }
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────
    // Locking
    // ───────────────────────────────────────────────────────────────

    /// Lock `length` lines starting `offset` lines into piece `start` for `owner`.
    ///
    /// Returns the id of the locked piece, which may have absorbed adjacent
    /// pieces of the same owner. A zero-length lock changes nothing and
    /// returns `start`. On error the table is left untouched.
    pub fn lock(
        &mut self,
        start: PieceId,
        offset: usize,
        length: usize,
        owner: &str,
    ) -> Result<PieceId, TableError> {
        let index = self.locate(start)?;
        let first_len = self.pieces[index].length;
        if offset >= first_len {
            return Err(TableError::OutOfRange {
                index: offset,
                len: first_len,
            });
        }

        let total = self.len();
        let piece_row = self.row_of(index);
        let row_start = piece_row + offset;
        let row_end = row_start + length;
        if row_end > total {
            return Err(TableError::OutOfRange {
                index: row_end,
                len: total,
            });
        }

        // Last piece touched by the range, and the row just past it.
        let mut last = index;
        let mut last_end = piece_row + first_len;
        while last_end < row_end {
            last += 1;
            last_end += self.pieces[last].length;
        }

        for piece in &self.pieces[index..=last] {
            match piece.owner.as_deref() {
                Some(other) if other != owner => {
                    return Err(TableError::RegionLocked {
                        piece_id: piece.id,
                        owner: other.to_string(),
                    });
                }
                _ => {}
            }
        }

        if length == 0 {
            return Ok(start);
        }

        let lines = self.read(Some(start), offset, Some(length))?;
        let block_id = self.blocks.insert_block(lines);
        let locked = Piece::new(block_id, 0, length, Some(owner.to_string()));
        let locked_id = locked.id;

        let mut replacement = Vec::with_capacity(3);
        if offset > 0 {
            replacement.push(self.pieces[index].slice(0, offset));
        }
        replacement.push(locked);
        let tail = last_end - row_end;
        if tail > 0 {
            let source = &self.pieces[last];
            replacement.push(source.slice(source.length - tail, tail));
        }
        self.pieces.splice(index..=last, replacement);

        let id = self.merge_owner_neighbours(locked_id)?;
        log::debug!("Locked rows {row_start}..{row_end} for {owner} as piece {id}");
        Ok(id)
    }

    /// Insert a fresh one-line piece locked by `owner` right after `after`,
    /// or at the top of the file when `after` is `None`.
    pub fn lock_after(&mut self, after: Option<PieceId>, owner: &str) -> Result<PieceId, TableError> {
        let index = match after {
            Some(id) => self.locate(id)? + 1,
            None => 0,
        };
        let block_id = self.blocks.insert_block(vec![EMPTY_LINE.to_string()]);
        let piece = Piece::new(block_id, 0, 1, Some(owner.to_string()));
        let id = piece.id;
        self.pieces.insert(index, piece);
        self.merge_owner_neighbours(id)
    }

    /// Clear the owner of a piece. Neither merges nor collects.
    pub fn unlock(&mut self, id: PieceId) -> Result<(), TableError> {
        let index = self.locate(id)?;
        self.pieces[index].owner = None;
        Ok(())
    }

    /// Hand a locked piece to `new_owner`, folding it into any adjacent
    /// piece `new_owner` already holds.
    pub fn transfer(&mut self, id: PieceId, new_owner: &str) -> Result<PieceId, TableError> {
        let index = self.locate(id)?;
        let piece = &mut self.pieces[index];
        if !piece.is_locked() {
            return Err(TableError::NotLocked(id));
        }
        piece.owner = Some(new_owner.to_string());
        self.merge_owner_neighbours(id)
    }

    /// Replace the content of a locked piece.
    ///
    /// The piece keeps its id: it is the lock handle its owner edits through.
    pub fn set_content(&mut self, id: PieceId, lines: Vec<String>) -> Result<(), TableError> {
        let index = self.locate(id)?;
        let piece = &self.pieces[index];
        if !piece.is_locked() {
            return Err(TableError::NotLocked(id));
        }
        let block_id = piece.block_id;
        if piece.start != 0 || block_id == BlockId::ORIG {
            return Err(TableError::InvalidBlockReference(block_id));
        }

        let length = lines.len();
        if !self.blocks.replace(block_id, lines) {
            return Err(TableError::InvalidBlockReference(block_id));
        }
        self.pieces[index].length = length;
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────
    // Reconciliation
    // ───────────────────────────────────────────────────────────────

    /// Rewrite block 0 as the stitched file and collapse every maximal run
    /// of unlocked pieces into one piece over it.
    ///
    /// Locked pieces stay put, except that two of one owner left adjacent by
    /// a vanished empty run are folded into one.
    pub fn merge_unlocked(&mut self) -> Result<(), TableError> {
        let stitched = self.read_all()?;

        let mut rebuilt = Vec::with_capacity(self.pieces.len());
        let mut run: Vec<Piece> = Vec::new();
        let mut run_row = 0;
        let mut row = 0;

        for piece in self.pieces.drain(..) {
            if piece.is_locked() {
                flush_run(&mut rebuilt, &mut run, run_row);
                row += piece.length;
                rebuilt.push(piece);
                run_row = row;
            } else {
                row += piece.length;
                run.push(piece);
            }
        }
        flush_run(&mut rebuilt, &mut run, run_row);

        if rebuilt.is_empty() {
            self.blocks.replace(BlockId::ORIG, vec![EMPTY_LINE.to_string()]);
            rebuilt.push(Piece::new(BlockId::ORIG, 0, 1, None));
        } else {
            self.blocks.replace(BlockId::ORIG, stitched);
        }
        self.pieces = rebuilt;

        // Dropping an empty run can bring two pieces of one owner together.
        let mut index = 1;
        while index < self.pieces.len() {
            let shared = match (self.pieces[index - 1].owner(), self.pieces[index].owner()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
            if shared {
                self.merge_owner_neighbours(self.pieces[index].id)?;
            } else {
                index += 1;
            }
        }
        Ok(())
    }

    /// Remove blocks that no piece references. Block 0 always stays.
    pub fn garbage_collect(&mut self) -> Vec<BlockId> {
        let referenced: BTreeSet<BlockId> = self.pieces.iter().map(|p| p.block_id).collect();
        let removed = self.blocks.garbage_collect(&referenced);
        if !removed.is_empty() {
            log::debug!("Collected {} unreferenced blocks", removed.len());
        }
        removed
    }

    // ───────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────

    fn row_of(&self, index: usize) -> usize {
        self.pieces[..index].iter().map(|p| p.length).sum()
    }

    fn piece_lines(&self, piece: &Piece) -> Result<&[String], TableError> {
        self.blocks
            .get(piece.block_id)
            .and_then(|lines| lines.get(piece.start..piece.start + piece.length))
            .ok_or(TableError::InvalidBlockReference(piece.block_id))
    }

    /// Fold the locked piece `id` together with every directly adjacent
    /// piece of the same owner into a single piece over a new block.
    fn merge_owner_neighbours(&mut self, id: PieceId) -> Result<PieceId, TableError> {
        let index = self.locate(id)?;
        let owner = match &self.pieces[index].owner {
            Some(owner) => owner.clone(),
            None => return Ok(id),
        };

        let mut lo = index;
        while lo > 0 && self.pieces[lo - 1].is_owned_by(&owner) {
            lo -= 1;
        }
        let mut hi = index;
        while hi + 1 < self.pieces.len() && self.pieces[hi + 1].is_owned_by(&owner) {
            hi += 1;
        }
        if lo == hi {
            return Ok(id);
        }

        let mut lines = Vec::new();
        for piece in &self.pieces[lo..=hi] {
            lines.extend_from_slice(self.piece_lines(piece)?);
        }
        let length = lines.len();
        let block_id = self.blocks.insert_block(lines);
        let merged = Piece::new(block_id, 0, length, Some(owner));
        let merged_id = merged.id;
        self.pieces.splice(lo..=hi, [merged]);
        Ok(merged_id)
    }
}

/// Emit one block-0 piece for a run of unlocked pieces starting at `row`.
///
/// A run that is already a single piece at the right place keeps its id.
fn flush_run(out: &mut Vec<Piece>, run: &mut Vec<Piece>, row: usize) {
    let length: usize = run.iter().map(|p| p.length).sum();
    if length == 0 {
        run.clear();
        return;
    }
    if run.len() == 1 && run[0].block_id == BlockId::ORIG && run[0].start == row {
        out.append(run);
        return;
    }
    run.clear();
    out.push(Piece::new(BlockId::ORIG, row, length, None));
}

impl std::fmt::Display for PieceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:>10}{:>10}{:>10}{:>12}", "Block ID", "Start", "Length", "Owner")?;
        for piece in &self.pieces {
            writeln!(
                f,
                "{:>10}{:>10}{:>10}{:>12}",
                piece.block_id,
                piece.start,
                piece.length,
                piece.owner().unwrap_or("-"),
            )?;
        }
        Ok(())
    }
}
