use proptest::prelude::*;
use tessel_core::{split_lines, PieceTable, TableError};

const USERS: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Debug, Clone)]
enum Op {
    Lock { row: usize, len: usize, user: usize },
    /// Lock starting at a piece picked by id, favouring emptied pieces.
    LockAt { pick: usize, offset: usize, len: usize, user: usize },
    Insert { after: usize, user: usize },
    Edit { pick: usize, lines: Vec<String> },
    Unlock { pick: usize },
    Reconcile,
}

fn arb_text() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{0,4}\n", 0..12).prop_map(|lines| lines.concat())
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (any::<usize>(), 0..6usize, 0..USERS.len())
            .prop_map(|(row, len, user)| Op::Lock { row, len, user }),
        2 => (any::<usize>(), any::<usize>(), 0..6usize, 0..USERS.len())
            .prop_map(|(pick, offset, len, user)| Op::LockAt { pick, offset, len, user }),
        1 => (any::<usize>(), 0..USERS.len()).prop_map(|(after, user)| Op::Insert { after, user }),
        2 => (any::<usize>(), prop::collection::vec("[a-z]{0,3}\n", 0..4))
            .prop_map(|(pick, lines)| Op::Edit { pick, lines }),
        2 => any::<usize>().prop_map(|pick| Op::Unlock { pick }),
        1 => Just(Op::Reconcile),
    ]
}

fn locked_ids(table: &PieceTable) -> Vec<tessel_core::PieceId> {
    table
        .pieces()
        .iter()
        .filter(|p| p.is_locked())
        .map(|p| p.id())
        .collect()
}

/// Apply `op` to both the table and a flat line buffer.
fn apply(table: &mut PieceTable, model: &mut Vec<String>, op: &Op) {
    match op {
        Op::Lock { row, len, user } => {
            let total = table.len();
            if total == 0 {
                return;
            }
            let row = row % total;
            let len = (*len).min(total - row);
            let (piece, offset) = table.row_to_piece(row).unwrap();
            match table.lock(piece, offset, len, USERS[*user]) {
                Ok(_) | Err(TableError::RegionLocked { .. }) => {}
                Err(e) => panic!("unexpected lock error: {e}"),
            }
        }
        Op::LockAt { pick, offset, len, user } => {
            let pieces = table.pieces();
            let empty: Vec<_> = pieces.iter().filter(|p| p.is_empty()).collect();
            let piece = if empty.is_empty() {
                &pieces[pick % pieces.len()]
            } else {
                empty[pick % empty.len()]
            };
            let (id, piece_len) = (piece.id(), piece.len());
            if piece_len == 0 {
                let result = table.lock(id, 0, *len, USERS[*user]);
                assert!(
                    matches!(result, Err(TableError::OutOfRange { index: 0, len: 0 })),
                    "lock at empty piece gave {result:?}"
                );
                return;
            }
            let offset = offset % piece_len;
            let row = table.piece_to_row(id).unwrap() + offset;
            let len = (*len).min(table.len() - row);
            match table.lock(id, offset, len, USERS[*user]) {
                Ok(_) | Err(TableError::RegionLocked { .. }) => {}
                Err(e) => panic!("unexpected lock error: {e}"),
            }
        }
        Op::Insert { after, user } => {
            let pieces = table.pieces();
            let choice = after % (pieces.len() + 1);
            let (after, row) = match pieces.get(choice) {
                Some(p) => (Some(p.id()), table.piece_to_row(p.id()).unwrap() + p.len()),
                None => (None, 0),
            };
            table.lock_after(after, USERS[*user]).unwrap();
            model.insert(row, "\n".to_string());
        }
        Op::Edit { pick, lines } => {
            let locked = locked_ids(table);
            if locked.is_empty() {
                return;
            }
            let id = locked[pick % locked.len()];
            let row = table.piece_to_row(id).unwrap();
            let old = table.piece(id).unwrap().len();
            table.set_content(id, lines.clone()).unwrap();
            model.splice(row..row + old, lines.iter().cloned());
        }
        Op::Unlock { pick } => {
            let locked = locked_ids(table);
            if locked.is_empty() {
                return;
            }
            table.unlock(locked[pick % locked.len()]).unwrap();
        }
        Op::Reconcile => {
            table.merge_unlocked().unwrap();
            table.garbage_collect();
            if model.is_empty() && table.pieces().iter().all(|p| !p.is_locked()) {
                model.push("\n".to_string());
            }
        }
    }
}

fn assert_no_adjacent_owners(table: &PieceTable) {
    for pair in table.pieces().windows(2) {
        if let (Some(a), Some(b)) = (pair[0].owner(), pair[1].owner()) {
            assert_ne!(a, b, "adjacent pieces share owner {a}\n{table}");
        }
    }
}

proptest! {
    #[test]
    fn read_matches_line_buffer(text in arb_text(), ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut table = PieceTable::from_text(&text);
        let mut model = table.read_all().unwrap();

        for op in &ops {
            apply(&mut table, &mut model, op);
            prop_assert_eq!(table.read_all().unwrap(), model.clone());
            prop_assert_eq!(table.len(), model.len());
            prop_assert!(table.validate().is_ok());
            assert_no_adjacent_owners(&table);
        }
    }

    #[test]
    fn lock_unlock_merge_preserves_content(
        text in arb_text(),
        row in any::<usize>(),
        len in 1..8usize,
    ) {
        let mut table = PieceTable::from_text(&text);
        let before = table.read_all().unwrap();
        let row = row % table.len();
        let len = len.min(table.len() - row);

        let (piece, offset) = table.row_to_piece(row).unwrap();
        let lock = table.lock(piece, offset, len, "alice").unwrap();
        prop_assert_eq!(table.piece_content(lock).unwrap(), before[row..row + len].to_vec());

        table.unlock(lock).unwrap();
        table.merge_unlocked().unwrap();
        table.garbage_collect();

        prop_assert_eq!(table.pieces().len(), 1);
        prop_assert_eq!(table.blocks().len(), 1);
        prop_assert_eq!(table.read_all().unwrap(), before);
    }

    #[test]
    fn merge_alone_is_identity(text in arb_text()) {
        let mut table = PieceTable::from_text(&text);
        let before = table.read_all().unwrap();
        let id = table.pieces()[0].id();

        table.merge_unlocked().unwrap();

        prop_assert_eq!(table.read_all().unwrap(), before);
        prop_assert_eq!(table.pieces()[0].id(), id);
    }
}

#[test]
fn foreign_lock_is_rejected_own_lock_is_not() {
    let mut table = PieceTable::new(split_lines("a\nb\nc\nd\ne\n"));
    let first = table.pieces()[0].id();
    let alice = table.lock(first, 1, 3, "alice").unwrap();

    assert!(matches!(
        table.lock(alice, 1, 1, "bob"),
        Err(TableError::RegionLocked { .. })
    ));
    let again = table.lock(alice, 1, 1, "alice").unwrap();
    assert_eq!(table.piece(again).unwrap().len(), 3);
    assert_eq!(table.read_all().unwrap().concat(), "a\nb\nc\nd\ne\n");
}
