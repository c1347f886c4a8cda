//! Authority election as seen by one peer.
//!
//! Every peer keeps the same roster (fed by the relay's join and leave
//! announcements) and applies the same rule: the connected peer with the
//! lowest seniority is the authority. No votes are exchanged.

use shared::{PeerId, PeerInfo};
use std::collections::HashMap;

/// "Am I the authority", consulted before every authoritative write.
pub trait AuthorityPredicate {
    fn is_authority(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct AuthorityElector {
    local: Option<PeerId>,
    seniority: HashMap<PeerId, u64>,
}

impl AuthorityElector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local(&mut self, peer_id: PeerId) {
        self.local = Some(peer_id);
    }

    pub fn local(&self) -> Option<PeerId> {
        self.local
    }

    pub fn add_peer(&mut self, peer: &PeerInfo) {
        self.seniority.insert(peer.id, peer.seniority);
    }

    pub fn remove_peer(&mut self, peer_id: PeerId) -> bool {
        self.seniority.remove(&peer_id).is_some()
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.seniority.contains_key(&peer_id)
    }

    pub fn authority(&self) -> Option<PeerId> {
        self.seniority
            .iter()
            .min_by_key(|(id, seniority)| (**seniority, **id))
            .map(|(id, _)| *id)
    }

    pub fn is_local_authority(&self) -> bool {
        self.local.is_some() && self.authority() == self.local
    }

    /// Connected peers, most senior first
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<(PeerId, u64)> =
            self.seniority.iter().map(|(id, s)| (*id, *s)).collect();
        peers.sort_by_key(|(id, seniority)| (*seniority, *id));
        peers.into_iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.seniority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seniority.is_empty()
    }

    pub fn clear(&mut self) {
        self.local = None;
        self.seniority.clear();
    }
}

impl AuthorityPredicate for AuthorityElector {
    fn is_authority(&self) -> bool {
        self.is_local_authority()
    }
}
