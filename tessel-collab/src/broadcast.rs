//! Fan-out of server messages to connected users.
//!
//! Every connection registers its username and gets a [`PeerReceiver`].
//! File actors address users by name; a message is encoded once and the
//! same `Arc` is queued for each target.
//!
//! Each peer has one ordered queue. Broadcasts respect `capacity`: once that
//! many frames are waiting the peer counts as lagging and further broadcasts
//! are dropped for it. Replies to the user whose request is being handled
//! are always queued. That user has at most one request in flight, so
//! replies stay bounded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{ProtocolError, ServerMessage};

/// Encoded frame shared between all its recipients.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring delivery health.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicHubStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct Peer {
    tx: mpsc::UnboundedSender<Frame>,
    pending: Arc<AtomicUsize>,
}

/// Receiving end of one user's queue.
pub struct PeerReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
    pending: Arc<AtomicUsize>,
}

impl PeerReceiver {
    pub async fn recv(&mut self) -> Option<Frame> {
        let frame = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }

    pub fn try_recv(&mut self) -> Result<Frame, mpsc::error::TryRecvError> {
        let frame = self.rx.try_recv()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(frame)
    }

    /// Frames queued and not yet received.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Username → outbound queue of that user's connection.
pub struct PeerHub {
    peers: RwLock<HashMap<String, Peer>>,
    /// Broadcast frames buffered per peer before it counts as lagging
    capacity: usize,
    atomic_stats: AtomicHubStats,
}

impl PeerHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicHubStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register a connected user.
    ///
    /// Returns `None` if the name is already taken by a live connection.
    pub async fn register(&self, username: &str) -> Option<PeerReceiver> {
        let mut peers = self.peers.write().await;
        if peers.get(username).is_some_and(|peer| !peer.tx.is_closed()) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        peers.insert(
            username.to_string(),
            Peer {
                tx,
                pending: pending.clone(),
            },
        );
        Some(PeerReceiver { rx, pending })
    }

    pub async fn unregister(&self, username: &str) -> bool {
        self.peers.write().await.remove(username).is_some()
    }

    /// Broadcast `msg` to every user in `targets`, dropping it for lagging peers.
    ///
    /// Returns how many queues accepted it. Unknown users are skipped.
    pub async fn send_to<S: AsRef<str>>(
        &self,
        targets: &[S],
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        self.fan_out(None, targets, msg).await
    }

    /// Queue `msg` for `user` regardless of how far behind they are.
    ///
    /// Returns `false` only if the user is not connected.
    pub async fn reply(&self, user: &str, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        Ok(self.fan_out(Some(user), &[user], msg).await? == 1)
    }

    /// Broadcast `msg` to `targets`; the copy for `requester` is never dropped.
    pub async fn publish<S: AsRef<str>>(
        &self,
        requester: &str,
        targets: &[S],
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        self.fan_out(Some(requester), targets, msg).await
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn fan_out<S: AsRef<str>>(
        &self,
        requester: Option<&str>,
        targets: &[S],
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        if targets.is_empty() {
            return Ok(0);
        }
        let frame = Arc::new(msg.encode()?);
        let peers = self.peers.read().await;

        let mut delivered = 0;
        for user in targets {
            let user = user.as_ref();
            let Some(peer) = peers.get(user) else {
                continue;
            };
            let reliable = requester == Some(user);
            if !reliable && peer.pending.load(Ordering::Acquire) >= self.capacity {
                log::warn!("Peer {user} is lagging, dropped a message");
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            peer.pending.fetch_add(1, Ordering::AcqRel);
            if peer.tx.send(frame.clone()).is_ok() {
                delivered += 1;
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            } else {
                peer.pending.fetch_sub(1, Ordering::AcqRel);
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved(user: &str) -> ServerMessage {
        ServerMessage::SaveBroadcast {
            file_path: "a.txt".to_string(),
            username: user.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let hub = PeerHub::new(16);
        let _rx = hub.register("alice").await.unwrap();
        assert_eq!(hub.peer_count().await, 1);

        assert!(hub.unregister("alice").await);
        assert_eq!(hub.peer_count().await, 0);
        assert!(!hub.unregister("alice").await);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_while_connected() {
        let hub = PeerHub::new(16);
        let rx = hub.register("alice").await.unwrap();
        assert!(hub.register("alice").await.is_none());

        drop(rx);
        assert!(hub.register("alice").await.is_some());
    }

    #[tokio::test]
    async fn test_send_reaches_only_targets() {
        let hub = PeerHub::new(16);
        let mut alice = hub.register("alice").await.unwrap();
        let mut bob = hub.register("bob").await.unwrap();
        let mut carol = hub.register("carol").await.unwrap();

        let count = hub.send_to(&["alice", "carol", "nobody"], &saved("bob")).await.unwrap();
        assert_eq!(count, 2);

        let frame = alice.recv().await.unwrap();
        assert_eq!(ServerMessage::decode(&frame).unwrap(), saved("bob"));
        assert!(carol.recv().await.is_some());
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_frame_shared_between_targets() {
        let hub = PeerHub::new(16);
        let mut alice = hub.register("alice").await.unwrap();
        let mut bob = hub.register("bob").await.unwrap();

        hub.send_to(&["alice", "bob"], &ServerMessage::Pong).await.unwrap();

        let a = alice.recv().await.unwrap();
        let b = bob.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_lagging_peer_drops() {
        let hub = PeerHub::new(2);
        let _slow = hub.register("slow").await.unwrap();

        for _ in 0..5 {
            hub.send_to(&["slow"], &ServerMessage::Pong).await.unwrap();
        }

        let stats = hub.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_send_to_nobody() {
        let hub = PeerHub::new(4);
        let none: [&str; 0] = [];
        assert_eq!(hub.send_to(&none, &ServerMessage::Pong).await.unwrap(), 0);
        assert!(!hub.reply("ghost", &ServerMessage::Pong).await.unwrap());
    }

    #[tokio::test]
    async fn test_reply_survives_lagging_queue() {
        let hub = PeerHub::new(2);
        let mut alice = hub.register("alice").await.unwrap();
        hub.send_to(&["alice"], &ServerMessage::Pong).await.unwrap();
        hub.send_to(&["alice"], &ServerMessage::Pong).await.unwrap();
        assert_eq!(alice.pending(), 2);

        let response = ServerMessage::LockResponse {
            file_path: "a.txt".to_string(),
            success: false,
            lock_id: None,
        };
        assert!(hub.reply("alice", &response).await.unwrap());
        assert_eq!(hub.send_to(&["alice"], &ServerMessage::Pong).await.unwrap(), 0);

        let stats = hub.stats().await;
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.messages_dropped, 1);

        alice.try_recv().unwrap();
        alice.try_recv().unwrap();
        let frame = alice.try_recv().unwrap();
        assert_eq!(ServerMessage::decode(&frame).unwrap(), response);
        assert!(alice.try_recv().is_err());
        assert_eq!(alice.pending(), 0);
    }

    #[tokio::test]
    async fn test_publish_keeps_requester_copy() {
        let hub = PeerHub::new(1);
        let mut alice = hub.register("alice").await.unwrap();
        let mut bob = hub.register("bob").await.unwrap();
        hub.send_to(&["alice", "bob"], &ServerMessage::Pong).await.unwrap();

        let saved = saved("alice");
        assert_eq!(hub.publish("alice", &["alice", "bob"], &saved).await.unwrap(), 1);

        alice.try_recv().unwrap();
        assert_eq!(ServerMessage::decode(&alice.try_recv().unwrap()).unwrap(), saved);
        bob.try_recv().unwrap();
        assert!(bob.try_recv().is_err());
    }
}
