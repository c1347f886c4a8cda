//! Local mirror of the replicated property tables.
//!
//! Writes are never applied locally when they are issued: they go to the
//! relay, which rebroadcasts them to every peer including the writer, and the
//! mirror changes only when that echo arrives. Every reader therefore sees the
//! same sequence of values through the same notification path.
//!
//! Reads never block and never fail. A key that was never written yields the
//! default the caller passes in.

use crate::outbox::Outbox;
use log::debug;
use shared::{PeerId, PropertyBag, PropertyScope, PropertyValue, SessionSnapshot};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PropertyStore {
    session: PropertyBag,
    peers: HashMap<PeerId, PropertyBag>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole mirror with the relay's snapshot
    pub fn load_snapshot(&mut self, snapshot: &SessionSnapshot) {
        self.session = snapshot.session_props.clone();
        self.peers = snapshot.peer_props.clone();
        for peer in &snapshot.peers {
            self.peers.entry(peer.id).or_default();
        }
    }

    /// Queues a replicated write. The mirror is untouched until the relay
    /// echoes it back.
    pub fn set_properties(
        &self,
        outbox: &mut Outbox,
        scope: PropertyScope,
        props: Vec<(String, PropertyValue)>,
    ) {
        if props.is_empty() {
            return;
        }
        outbox.set_properties(scope, props);
    }

    /// Applies a rebroadcast write and returns the keys it carried.
    pub fn apply(&mut self, scope: PropertyScope, props: &[(String, PropertyValue)]) -> Vec<String> {
        let bag = match scope {
            PropertyScope::Session => &mut self.session,
            PropertyScope::Peer(owner) => self.peers.entry(owner).or_default(),
        };

        let mut changed = Vec::with_capacity(props.len());
        for (key, value) in props {
            debug!("{:?}: {} = {}", scope, key, value);
            bag.insert(key.clone(), value.clone());
            changed.push(key.clone());
        }
        changed
    }

    pub fn add_peer(&mut self, peer_id: PeerId) {
        self.peers.entry(peer_id).or_default();
    }

    pub fn remove_peer(&mut self, peer_id: PeerId) {
        self.peers.remove(&peer_id);
    }

    pub fn get(&self, scope: PropertyScope, key: &str) -> Option<&PropertyValue> {
        match scope {
            PropertyScope::Session => self.session.get(key),
            PropertyScope::Peer(owner) => self.peers.get(&owner).and_then(|bag| bag.get(key)),
        }
    }

    pub fn get_bool(&self, scope: PropertyScope, key: &str, default: bool) -> bool {
        self.get(scope, key)
            .and_then(PropertyValue::as_bool)
            .unwrap_or(default)
    }

    pub fn get_int(&self, scope: PropertyScope, key: &str, default: i64) -> i64 {
        self.get(scope, key)
            .and_then(PropertyValue::as_int)
            .unwrap_or(default)
    }

    pub fn get_float(&self, scope: PropertyScope, key: &str, default: f64) -> f64 {
        self.get(scope, key)
            .and_then(PropertyValue::as_float)
            .unwrap_or(default)
    }

    pub fn get_str<'a>(&'a self, scope: PropertyScope, key: &str, default: &'a str) -> &'a str {
        self.get(scope, key)
            .and_then(PropertyValue::as_str)
            .unwrap_or(default)
    }

    pub fn clear(&mut self) {
        self.session.clear();
        self.peers.clear();
    }
}
