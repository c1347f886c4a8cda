//! Which peer may move each interactive entity.
//!
//! An entity starts out owned by the peer that spawned it. Only the owner
//! drives its transform; everyone else accepts the owner's updates and
//! ignores anybody else's. When the owner leaves, ownership falls to the
//! authority, which continues from the last transform it received.

use log::{debug, info};
use shared::{EntityId, PeerId};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct OwnershipLedger {
    owners: BTreeMap<EntityId, PeerId>,
}

impl OwnershipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the spawner as first owner. Re-registering is a no-op.
    pub fn register(&mut self, entity: EntityId, owner: PeerId) {
        self.owners.entry(entity).or_insert(owner);
    }

    pub fn remove(&mut self, entity: EntityId) {
        self.owners.remove(&entity);
    }

    pub fn owner(&self, entity: EntityId) -> Option<PeerId> {
        self.owners.get(&entity).copied()
    }

    pub fn is_owned_by(&self, entity: EntityId, peer: PeerId) -> bool {
        self.owner(entity) == Some(peer)
    }

    pub fn is_owned_by_local_peer(&self, entity: EntityId, local: Option<PeerId>) -> bool {
        local.map_or(false, |local| self.is_owned_by(entity, local))
    }

    /// Returns true if the owner changed.
    pub fn transfer_ownership(&mut self, entity: EntityId, new_owner: PeerId) -> bool {
        match self.owners.get_mut(&entity) {
            Some(owner) if *owner != new_owner => {
                debug!("Entity {} owner {} -> {}", entity, owner, new_owner);
                *owner = new_owner;
                true
            }
            Some(_) => false,
            None => {
                debug!("Ownership transfer for unknown entity {}", entity);
                false
            }
        }
    }

    /// Whether a transform update from `sender` should be accepted
    pub fn accepts_update_from(&self, entity: EntityId, sender: PeerId) -> bool {
        self.is_owned_by(entity, sender)
    }

    /// Hands every entity of a departed peer to the authority
    pub fn reassign_departed(&mut self, departed: PeerId, authority: Option<PeerId>) -> Vec<EntityId> {
        let Some(authority) = authority else {
            return Vec::new();
        };

        let mut reassigned = Vec::new();
        for (entity, owner) in self.owners.iter_mut() {
            if *owner == departed {
                *owner = authority;
                reassigned.push(*entity);
            }
        }

        if !reassigned.is_empty() {
            info!(
                "Peer {} left, entities {:?} now owned by {}",
                departed, reassigned, authority
            );
        }
        reassigned
    }

    pub fn owned_by(&self, peer: PeerId) -> Vec<EntityId> {
        self.owners
            .iter()
            .filter(|(_, owner)| **owner == peer)
            .map(|(entity, _)| *entity)
            .collect()
    }

    pub fn clear(&mut self) {
        self.owners.clear();
    }
}
