//! Session membership tracking for the relay
//!
//! This module handles the relay-side roster of a single session, including:
//! - Peer admission against the session capacity
//! - Seniority ordinals used to elect the authority peer
//! - Liveness monitoring and timeout cleanup
//!
//! Peer ids are handed in by the network layer, which assigns them once per
//! connection and never reuses them.

use log::info;
use shared::{PeerId, PeerInfo};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A peer admitted to a session
#[derive(Debug)]
pub struct SessionPeer {
    /// Relay-assigned identifier
    pub id: PeerId,
    /// Name shown to the other peers
    pub display_name: String,
    /// Join ordinal within the session, lower is more senior
    pub seniority: u64,
    /// Last time we received any packet from this peer
    pub last_seen: Instant,
}

impl SessionPeer {
    pub fn new(id: PeerId, display_name: String, seniority: u64) -> Self {
        Self {
            id,
            display_name,
            seniority,
            last_seen: Instant::now(),
        }
    }

    /// Checks if the peer has exceeded the liveness timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            display_name: self.display_name.clone(),
            seniority: self.seniority,
        }
    }
}

/// Roster of one session
///
/// Seniority ordinals are handed out in join order and never reused, so the
/// authority (lowest seniority) only changes when the current authority
/// leaves.
pub struct PeerManager {
    peers: HashMap<PeerId, SessionPeer>,
    next_seniority: u64,
    max_peers: usize,
}

impl PeerManager {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            next_seniority: 0,
            max_peers,
        }
    }

    /// Admits a peer, returning its roster entry.
    ///
    /// Returns None if the session is full or the id is already present.
    pub fn add_peer(&mut self, id: PeerId, display_name: &str) -> Option<PeerInfo> {
        if self.peers.len() >= self.max_peers || self.peers.contains_key(&id) {
            return None;
        }

        let seniority = self.next_seniority;
        self.next_seniority += 1;

        let peer = SessionPeer::new(id, display_name.to_string(), seniority);
        let info = peer.info();
        info!(
            "Peer {} ({}) joined with seniority {}",
            id, display_name, seniority
        );
        self.peers.insert(id, peer);

        Some(info)
    }

    /// Removes a peer. Returns true if it was present.
    pub fn remove_peer(&mut self, id: &PeerId) -> bool {
        if let Some(peer) = self.peers.remove(id) {
            info!("Peer {} ({}) left", peer.id, peer.display_name);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Refreshes the liveness timestamp of a peer
    pub fn touch(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.last_seen = Instant::now();
        }
    }

    /// The connected peer with the lowest seniority
    pub fn authority(&self) -> Option<PeerId> {
        self.peers
            .values()
            .min_by_key(|peer| peer.seniority)
            .map(|peer| peer.id)
    }

    /// Roster sorted by seniority
    pub fn roster(&self) -> Vec<PeerInfo> {
        let mut roster: Vec<PeerInfo> = self.peers.values().map(SessionPeer::info).collect();
        roster.sort_by_key(|peer| peer.seniority);
        roster
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.roster().into_iter().map(|peer| peer.id).collect()
    }

    /// Removes and returns every peer silent for longer than `timeout`
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<PeerId> {
        let timed_out: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &timed_out {
            self.remove_peer(id);
        }

        timed_out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_peer_creation() {
        let peer = SessionPeer::new(7, "alice".to_string(), 3);
        assert_eq!(peer.id, 7);
        assert_eq!(peer.seniority, 3);
        assert_eq!(peer.info().display_name, "alice");
    }

    #[test]
    fn test_session_peer_timeout() {
        let mut peer = SessionPeer::new(1, "alice".to_string(), 0);
        assert!(!peer.is_timed_out(Duration::from_secs(1)));

        peer.last_seen = Instant::now() - Duration::from_secs(2);

        assert!(peer.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_peer_assigns_increasing_seniority() {
        let mut manager = PeerManager::new(3);

        let a = manager.add_peer(10, "a").unwrap();
        let b = manager.add_peer(11, "b").unwrap();

        assert_eq!(a.seniority, 0);
        assert_eq!(b.seniority, 1);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_add_peer_max_capacity() {
        let mut manager = PeerManager::new(1);

        assert!(manager.add_peer(1, "a").is_some());
        assert!(manager.add_peer(2, "b").is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_add_duplicate_peer_rejected() {
        let mut manager = PeerManager::new(4);

        assert!(manager.add_peer(1, "a").is_some());
        assert!(manager.add_peer(1, "a again").is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_nonexistent_peer() {
        let mut manager = PeerManager::new(2);
        assert!(!manager.remove_peer(&999));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_authority_is_lowest_seniority() {
        let mut manager = PeerManager::new(4);
        // Peer ids deliberately out of seniority order
        manager.add_peer(30, "first");
        manager.add_peer(5, "second");
        manager.add_peer(17, "third");

        assert_eq!(manager.authority(), Some(30));

        manager.remove_peer(&30);
        assert_eq!(manager.authority(), Some(5));
    }

    #[test]
    fn test_seniority_not_reused_after_leave() {
        let mut manager = PeerManager::new(2);
        manager.add_peer(1, "a");
        manager.add_peer(2, "b");
        manager.remove_peer(&1);

        let c = manager.add_peer(3, "c").unwrap();
        assert_eq!(c.seniority, 2);
        assert_eq!(manager.authority(), Some(2));
    }

    #[test]
    fn test_roster_sorted_by_seniority() {
        let mut manager = PeerManager::new(4);
        manager.add_peer(9, "a");
        manager.add_peer(3, "b");
        manager.add_peer(6, "c");

        assert_eq!(manager.peer_ids(), vec![9, 3, 6]);
    }

    #[test]
    fn test_check_timeouts_removes_silent_peers() {
        let mut manager = PeerManager::new(3);
        manager.add_peer(1, "a");
        manager.add_peer(2, "b");

        if let Some(peer) = manager.peers.get_mut(&1) {
            peer.last_seen = Instant::now() - Duration::from_secs(10);
        }

        let removed = manager.check_timeouts(Duration::from_secs(5));
        assert_eq!(removed, vec![1]);
        assert!(!manager.contains(1));
        assert!(manager.contains(2));
    }
}
