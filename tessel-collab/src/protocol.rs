//! Binary protocol between editor clients and the file server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message
//! (standard config, serde). Clients send [`ClientMessage`]; the server
//! answers and broadcasts [`ServerMessage`].
//!
//! ```text
//!  client                       server
//!    │ ── Hello{username} ──────► │   first frame, mandatory
//!    │ ◄───────────── Welcome ─── │
//!    │ ── Join{file_path} ──────► │
//!    │ ◄───────────── Content ─── │   pieces + blocks
//!    │ ── Lock{..} ─────────────► │
//!    │ ◄──────── LockResponse ─── │
//!    │ ◄──── PieceTableChange ─── │   to every client of the file
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tessel_core::{BlockId, Cursor, Piece, PieceId};

/// Numeric error codes. Values are stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    /// Malformed frame, or a message that is not valid in this state
    WrongMessage = 1,
    /// The file is not open on the server
    FileNotLoaded = 2,
    /// The user has not joined the file
    FileNotJoined = 3,
    /// No such file under the server root
    FileNotPresent = 4,
    /// The requested region overlaps someone else's lock
    IllegalLock = 5,
    /// The piece is not locked by the requesting user
    NotLocked = 6,
    /// The piece id is unknown (or went stale)
    IllegalPieceId = 7,
    /// Refused to drop unsaved changes
    FileNotSaved = 8,
    /// A line or offset falls outside the piece or the file
    OutOfRange = 9,
    /// Server-side failure
    Internal = 10,
}

/// Block content as sent on the wire.
pub type BlockContent = (BlockId, Vec<String>);

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Hello {
        username: String,
    },
    Join {
        file_path: String,
    },
    Leave {
        file_path: String,
        /// Leave even if the last client would drop unsaved changes
        force: bool,
    },
    ContentRequest {
        file_path: String,
    },
    Lock {
        file_path: String,
        piece_id: PieceId,
        offset: usize,
        length: usize,
    },
    /// Lock a fresh empty line after `after` (`None` = top of file)
    LockInsert {
        file_path: String,
        after: Option<PieceId>,
    },
    Unlock {
        file_path: String,
        lock_id: PieceId,
    },
    Edit {
        file_path: String,
        piece_id: PieceId,
        lines: Vec<String>,
    },
    CursorMove {
        file_path: String,
        piece_id: PieceId,
        offset: usize,
        column: usize,
    },
    CursorListRequest {
        file_path: String,
    },
    Save {
        file_path: String,
    },
    Ping,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome {
        username: String,
    },
    JoinBroadcast {
        file_path: String,
        username: String,
    },
    LeaveBroadcast {
        file_path: String,
        username: String,
    },
    /// Full table state: every piece and every live block
    Content {
        file_path: String,
        pieces: Vec<Piece>,
        blocks: Vec<BlockContent>,
    },
    LockResponse {
        file_path: String,
        success: bool,
        lock_id: Option<PieceId>,
    },
    /// New piece list plus the blocks that appeared or changed and those
    /// that were collected
    PieceTableChange {
        file_path: String,
        pieces: Vec<Piece>,
        changed_blocks: Vec<BlockContent>,
        removed_blocks: Vec<BlockId>,
    },
    EditBroadcast {
        file_path: String,
        username: String,
        piece_id: PieceId,
        lines: Vec<String>,
    },
    CursorMove {
        file_path: String,
        username: String,
        cursor: Cursor,
    },
    CursorList {
        file_path: String,
        cursors: Vec<(String, Cursor)>,
    },
    SaveBroadcast {
        file_path: String,
        username: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }

    /// The file a request targets, if any.
    pub fn file_path(&self) -> Option<&str> {
        match self {
            Self::Hello { .. } | Self::Ping => None,
            Self::Join { file_path }
            | Self::Leave { file_path, .. }
            | Self::ContentRequest { file_path }
            | Self::Lock { file_path, .. }
            | Self::LockInsert { file_path, .. }
            | Self::Unlock { file_path, .. }
            | Self::Edit { file_path, .. }
            | Self::CursorMove { file_path, .. }
            | Self::CursorListRequest { file_path }
            | Self::Save { file_path } => Some(file_path),
        }
    }
}

impl ServerMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// The first frame of a connection was not `Hello`
    HandshakeRequired,
    /// The server refused the connection
    Rejected(String),
    Transport(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::HandshakeRequired => write!(f, "Expected Hello as first message"),
            Self::Rejected(reason) => write!(f, "Connection rejected: {reason}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::PieceTable;

    #[test]
    fn test_client_lock_roundtrip() {
        let piece_id = PieceId::new();
        let msg = ClientMessage::Lock {
            file_path: "src/main.rs".to_string(),
            piece_id,
            offset: 2,
            length: 3,
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.file_path(), Some("src/main.rs"));
    }

    #[test]
    fn test_client_edit_keeps_terminators() {
        let msg = ClientMessage::Edit {
            file_path: "a.txt".to_string(),
            piece_id: PieceId::new(),
            lines: vec!["one\r\n".to_string(), "two".to_string()],
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ClientMessage::Edit { lines, .. } => assert_eq!(lines, vec!["one\r\n", "two"]),
            other => panic!("Expected Edit, got {other:?}"),
        }
    }

    #[test]
    fn test_hello_and_ping_have_no_file() {
        let hello = ClientMessage::Hello {
            username: "alice".to_string(),
        };
        assert_eq!(hello.file_path(), None);
        assert_eq!(ClientMessage::Ping.file_path(), None);
        assert_eq!(
            ClientMessage::decode(&ClientMessage::Ping.encode().unwrap()).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn test_content_carries_table_state() {
        let mut table = PieceTable::from_text("a\nb\nc\n");
        let first = table.pieces()[0].id();
        let lock = table.lock(first, 1, 1, "alice").unwrap();

        let msg = ServerMessage::Content {
            file_path: "a.txt".to_string(),
            pieces: table.pieces().to_vec(),
            blocks: table.blocks().iter().map(|(id, l)| (id, l.to_vec())).collect(),
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();

        match decoded {
            ServerMessage::Content { pieces, blocks, .. } => {
                assert_eq!(pieces.len(), 3);
                assert_eq!(pieces[1].id(), lock);
                assert_eq!(pieces[1].owner(), Some("alice"));
                assert_eq!(blocks.len(), 2);
                assert_eq!(blocks[1], (BlockId(1), vec!["b\n".to_string()]));
            }
            other => panic!("Expected Content, got {other:?}"),
        }
    }

    #[test]
    fn test_cursor_list_roundtrip() {
        let cursor = Cursor {
            piece_id: PieceId::new(),
            offset: 4,
            column: 12,
        };
        let msg = ServerMessage::CursorList {
            file_path: "a.txt".to_string(),
            cursors: vec![("alice".to_string(), cursor)],
        };
        assert_eq!(ServerMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_error_roundtrip() {
        let msg = ServerMessage::error(ErrorCode::IllegalLock, "Region locked");
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            decoded,
            ServerMessage::Error {
                code: ErrorCode::IllegalLock,
                message: "Region locked".to_string(),
            }
        );
    }

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::WrongMessage as u8, 1);
        assert_eq!(ErrorCode::FileNotLoaded as u8, 2);
        assert_eq!(ErrorCode::FileNotJoined as u8, 3);
        assert_eq!(ErrorCode::FileNotPresent as u8, 4);
        assert_eq!(ErrorCode::IllegalLock as u8, 5);
        assert_eq!(ErrorCode::NotLocked as u8, 6);
        assert_eq!(ErrorCode::IllegalPieceId as u8, 7);
        assert_eq!(ErrorCode::FileNotSaved as u8, 8);
        assert_eq!(ErrorCode::OutOfRange as u8, 9);
        assert_eq!(ErrorCode::Internal as u8, 10);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ClientMessage::decode(&garbage).is_err());
        assert!(ServerMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_lock_frame_is_compact() {
        let msg = ClientMessage::Lock {
            file_path: "notes.txt".to_string(),
            piece_id: PieceId::new(),
            offset: 10,
            length: 5,
        };
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 64, "Encoded size {} too large", encoded.len());
    }
}
