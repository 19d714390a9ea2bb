//! # tessel-collab: multi-user file sessions over WebSocket
//!
//! Serves [`tessel_core`] session files to many editors at once. Each open
//! file is owned by one actor task; connections talk to it through the
//! registry and hear back through the peer hub.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ EditClient  │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │    Binary Proto    │ (central)   │
//! └─────────────┘                    └──────┬──────┘
//!                                           │
//!                                   ┌───────┴───────┐
//!                                   │ FileRegistry  │
//!                                   └───────┬───────┘
//!                                           │ mpsc, one per file
//!                                   ┌───────┴───────┐
//!                                   │  FileActor    │──► PeerHub (fan-out)
//!                                   │ (SessionFile) │
//!                                   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire messages (bincode-encoded) and error codes
//! - [`broadcast`]: per-user outbound queues; broadcasts drop on lag, replies never do
//! - [`file_actor`]: the single writer of one open file
//! - [`registry`]: path resolution, open on join, evict on last leave
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client for tests and tools

pub mod broadcast;
pub mod client;
pub mod error;
pub mod file_actor;
pub mod protocol;
pub mod registry;
pub mod server;

pub use broadcast::{Frame, HubStats, PeerHub, PeerReceiver};
pub use client::EditClient;
pub use error::CoordinatorError;
pub use file_actor::{FileActor, FileHandle, FileRequest};
pub use protocol::{BlockContent, ClientMessage, ErrorCode, ProtocolError, ServerMessage};
pub use registry::FileRegistry;
pub use server::{ServerConfig, ServerStats, SyncServer};
