use tessel_core::{SessionError, TableError};

use crate::protocol::ErrorCode;

/// Errors raised while routing a request to a file.
#[derive(Debug)]
pub enum CoordinatorError {
    /// Message not valid here (e.g. a second `Hello`)
    WrongMessage(String),
    /// No such file under the root, or the path escapes the root
    FileNotPresent(String),
    /// The file is not open
    FileNotLoaded(String),
    /// The user has not joined the file
    FileNotJoined(String),
    /// Last client tried to leave without saving
    FileNotSaved(String),
    Session(SessionError),
    /// The file's actor stopped before answering
    ActorGone,
}

impl CoordinatorError {
    /// Wire code sent back to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordinatorError::WrongMessage(_) => ErrorCode::WrongMessage,
            CoordinatorError::FileNotPresent(_) => ErrorCode::FileNotPresent,
            CoordinatorError::FileNotLoaded(_) | CoordinatorError::ActorGone => ErrorCode::FileNotLoaded,
            CoordinatorError::FileNotJoined(_) => ErrorCode::FileNotJoined,
            CoordinatorError::FileNotSaved(_) => ErrorCode::FileNotSaved,
            CoordinatorError::Session(SessionError::NotJoined(_)) => ErrorCode::FileNotJoined,
            CoordinatorError::Session(SessionError::Io(_)) => ErrorCode::Internal,
            CoordinatorError::Session(SessionError::Table(e)) => match e {
                TableError::OutOfRange { .. } => ErrorCode::OutOfRange,
                TableError::RegionLocked { .. } => ErrorCode::IllegalLock,
                TableError::UnknownPiece(_) => ErrorCode::IllegalPieceId,
                TableError::NotLocked(_) => ErrorCode::NotLocked,
                TableError::InvalidBlockReference(_) => ErrorCode::Internal,
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CoordinatorError::Session(e) if e.is_fatal())
    }
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::WrongMessage(what) => write!(f, "Unexpected message: {what}"),
            CoordinatorError::FileNotPresent(path) => write!(f, "File not present: {path}"),
            CoordinatorError::FileNotLoaded(path) => write!(f, "File not loaded: {path}"),
            CoordinatorError::FileNotJoined(path) => write!(f, "File not joined: {path}"),
            CoordinatorError::FileNotSaved(path) => write!(f, "File not saved: {path}"),
            CoordinatorError::Session(e) => write!(f, "{e}"),
            CoordinatorError::ActorGone => write!(f, "File closed while handling the request"),
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoordinatorError::Session(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SessionError> for CoordinatorError {
    fn from(e: SessionError) -> Self {
        CoordinatorError::Session(e)
    }
}

impl From<TableError> for CoordinatorError {
    fn from(e: TableError) -> Self {
        CoordinatorError::Session(SessionError::Table(e))
    }
}
