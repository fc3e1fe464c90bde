//! Per-peer mailboxes of content handles waiting to be fetched.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use meshrelay_shared::types::PeerKey;

#[derive(Clone)]
pub struct Rendezvous {
    mailboxes: Arc<Mutex<HashMap<PeerKey, VecDeque<String>>>>,
    cap: usize,
}

impl Rendezvous {
    pub fn new(cap: usize) -> Self {
        Self {
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            cap: cap.max(1),
        }
    }

    /// Leave `handle` for `peer`. A handle already waiting is not added
    /// twice; a full mailbox drops its oldest entry.
    pub async fn notify(&self, peer: PeerKey, handle: String) {
        let mut mailboxes = self.mailboxes.lock().await;
        let mailbox = mailboxes.entry(peer).or_default();

        if mailbox.contains(&handle) {
            return;
        }
        if mailbox.len() >= self.cap {
            if let Some(dropped) = mailbox.pop_front() {
                warn!(peer = %peer.short(), handle = %dropped, "Mailbox full, dropped oldest handle");
            }
        }
        mailbox.push_back(handle);
        debug!(peer = %peer.short(), pending = mailbox.len(), "Handle queued");
    }

    /// Remove and return everything waiting for `peer`, oldest first.
    pub async fn drain(&self, peer: &PeerKey) -> Vec<String> {
        let mut mailboxes = self.mailboxes.lock().await;
        mailboxes
            .remove(peer)
            .map(Vec::from)
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn pending(&self, peer: &PeerKey) -> usize {
        self.mailboxes.lock().await.get(peer).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_returns_oldest_first_and_empties() {
        let rendezvous = Rendezvous::new(8);
        let peer = PeerKey([1u8; 32]);

        rendezvous.notify(peer, "a".into()).await;
        rendezvous.notify(peer, "b".into()).await;

        assert_eq!(rendezvous.drain(&peer).await, vec!["a", "b"]);
        assert!(rendezvous.drain(&peer).await.is_empty());
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_oldest() {
        let rendezvous = Rendezvous::new(2);
        let peer = PeerKey([2u8; 32]);

        for handle in ["a", "b", "c"] {
            rendezvous.notify(peer, handle.into()).await;
        }

        assert_eq!(rendezvous.drain(&peer).await, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_duplicate_handle_kept_once() {
        let rendezvous = Rendezvous::new(8);
        let peer = PeerKey([3u8; 32]);

        rendezvous.notify(peer, "a".into()).await;
        rendezvous.notify(peer, "a".into()).await;

        assert_eq!(rendezvous.pending(&peer).await, 1);
    }

    #[tokio::test]
    async fn test_mailboxes_are_per_peer() {
        let rendezvous = Rendezvous::new(8);
        let alice = PeerKey([4u8; 32]);
        let bob = PeerKey([5u8; 32]);

        rendezvous.notify(alice, "for-alice".into()).await;

        assert!(rendezvous.drain(&bob).await.is_empty());
        assert_eq!(rendezvous.pending(&alice).await, 1);
    }
}
