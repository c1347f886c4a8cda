//! Transport-free routing core of a relay session.
//!
//! A `Room` keeps the relay's mirror of the session and per-peer property
//! bags, the buffered remote calls replayed to late joiners, and the roster.
//! Every operation returns the packets to deliver instead of sending them, so
//! the same logic runs behind the TCP server and inside in-memory test
//! harnesses.

use crate::peer_manager::PeerManager;
use log::{debug, info, warn};
use shared::{
    Action, Packet, PeerId, PropertyBag, PropertyScope, PropertyValue, RpcTarget,
    SessionSnapshot, SyncError,
};
use std::collections::HashMap;
use std::time::Duration;

/// One packet addressed to one peer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub to: PeerId,
    pub packet: Packet,
}

pub struct Room {
    name: String,
    peers: PeerManager,
    session_props: PropertyBag,
    peer_props: HashMap<PeerId, PropertyBag>,
    buffered: Vec<(PeerId, Action)>,
}

impl Room {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            peers: PeerManager::new(capacity.max(1)),
            session_props: PropertyBag::new(),
            peer_props: HashMap::new(),
            buffered: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn authority(&self) -> Option<PeerId> {
        self.peers.authority()
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.peers.contains(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn touch(&mut self, peer_id: PeerId) {
        self.peers.touch(peer_id);
    }

    pub fn session_property(&self, key: &str) -> Option<&PropertyValue> {
        self.session_props.get(key)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_name: self.name.clone(),
            peers: self.peers.roster(),
            session_props: self.session_props.clone(),
            peer_props: self.peer_props.clone(),
        }
    }

    /// Admits a peer. The joiner receives the snapshot followed by every
    /// buffered call; everyone else learns about the joiner.
    pub fn join(&mut self, peer_id: PeerId, display_name: &str) -> Result<Vec<Delivery>, SyncError> {
        let info = self
            .peers
            .add_peer(peer_id, display_name)
            .ok_or_else(|| SyncError::SessionFull {
                name: self.name.clone(),
                capacity: self.peers.capacity(),
            })?;

        self.peer_props.entry(peer_id).or_default();

        let mut deliveries = vec![Delivery {
            to: peer_id,
            packet: Packet::Connected {
                peer_id,
                snapshot: self.snapshot(),
            },
        }];

        for (sender, action) in &self.buffered {
            deliveries.push(Delivery {
                to: peer_id,
                packet: Packet::RemoteCall {
                    sender: *sender,
                    action: action.clone(),
                },
            });
        }

        for other in self.peers.peer_ids() {
            if other != peer_id {
                deliveries.push(Delivery {
                    to: other,
                    packet: Packet::PeerJoined { peer: info.clone() },
                });
            }
        }

        info!(
            "Session {}: peer {} joined ({} / {}), authority is {:?}",
            self.name,
            peer_id,
            self.peers.len(),
            self.peers.capacity(),
            self.peers.authority()
        );

        Ok(deliveries)
    }

    /// Removes a peer and drops its property bag. Its buffered calls stay,
    /// replayed on behalf of the new authority.
    pub fn leave(&mut self, peer_id: PeerId) -> Vec<Delivery> {
        if !self.peers.remove_peer(&peer_id) {
            return Vec::new();
        }
        self.peer_props.remove(&peer_id);
        self.reassign_buffered(peer_id);

        info!(
            "Session {}: peer {} left, authority is now {:?}",
            self.name,
            peer_id,
            self.peers.authority()
        );

        self.broadcast(Packet::PeerLeft { peer_id })
    }

    /// Applies a write to the mirror and rebroadcasts it to every peer,
    /// the writer included.
    pub fn set_properties(
        &mut self,
        writer: PeerId,
        scope: PropertyScope,
        props: Vec<(String, PropertyValue)>,
    ) -> Vec<Delivery> {
        if !self.peers.contains(writer) {
            warn!("Session {}: write from non-member {}", self.name, writer);
            return Vec::new();
        }
        if props.is_empty() {
            return Vec::new();
        }

        let bag = match scope {
            PropertyScope::Session => &mut self.session_props,
            PropertyScope::Peer(owner) => match self.peer_props.get_mut(&owner) {
                Some(bag) => bag,
                None => {
                    debug!(
                        "Session {}: dropping write to departed peer {} scope",
                        self.name, owner
                    );
                    return Vec::new();
                }
            },
        };

        for (key, value) in &props {
            bag.insert(key.clone(), value.clone());
        }

        self.broadcast(Packet::PropertiesChanged {
            scope,
            writer,
            props,
        })
    }

    /// Routes a remote call. Calls aimed at a peer that is not present are
    /// dropped without notice.
    pub fn invoke(&mut self, sender: PeerId, target: RpcTarget, action: Action) -> Vec<Delivery> {
        if !self.peers.contains(sender) {
            warn!("Session {}: call from non-member {}", self.name, sender);
            return Vec::new();
        }

        let packet = Packet::RemoteCall {
            sender,
            action: action.clone(),
        };

        match target {
            RpcTarget::AllPeers => self.broadcast(packet),
            RpcTarget::AllBuffered => {
                self.buffer(sender, action);
                self.broadcast(packet)
            }
            RpcTarget::AuthorityPeer => match self.peers.authority() {
                Some(authority) => vec![Delivery {
                    to: authority,
                    packet,
                }],
                None => Vec::new(),
            },
            RpcTarget::SpecificPeer(to) => {
                if self.peers.contains(to) {
                    vec![Delivery { to, packet }]
                } else {
                    debug!(
                        "Session {}: dropping {} for absent peer {}",
                        self.name,
                        action.name(),
                        to
                    );
                    Vec::new()
                }
            }
        }
    }

    /// Removes peers silent for longer than `timeout`.
    pub fn expire_idle(&mut self, timeout: Duration) -> (Vec<PeerId>, Vec<Delivery>) {
        let expired = self.peers.check_timeouts(timeout);
        let mut deliveries = Vec::new();

        for peer_id in &expired {
            self.peer_props.remove(peer_id);
            self.reassign_buffered(*peer_id);
            deliveries.extend(self.broadcast(Packet::PeerLeft { peer_id: *peer_id }));
        }

        (expired, deliveries)
    }

    pub fn buffered(&self) -> &[(PeerId, Action)] {
        &self.buffered
    }

    /// Keeps only what a late joiner still needs: the latest owner and the
    /// latest secured state per entity, and nothing at all for a despawned one.
    fn buffer(&mut self, sender: PeerId, action: Action) {
        if let Some(entity) = action.entity() {
            match action {
                Action::DespawnEntity { .. } => {
                    self.buffered
                        .retain(|(_, buffered)| buffered.entity() != Some(entity));
                    debug!("Session {}: entity {} left the buffer", self.name, entity);
                    return;
                }
                Action::TransferOwnership { .. } => self.buffered.retain(|(_, buffered)| {
                    !(buffered.entity() == Some(entity)
                        && matches!(buffered, Action::TransferOwnership { .. }))
                }),
                Action::SetSecured { .. } | Action::SetUnsecured { .. } => {
                    self.buffered.retain(|(_, buffered)| {
                        !(buffered.entity() == Some(entity)
                            && matches!(
                                buffered,
                                Action::SetSecured { .. } | Action::SetUnsecured { .. }
                            ))
                    })
                }
                _ => {}
            }
        }
        self.buffered.push((sender, action));
    }

    /// Buffered calls of a departed peer are replayed as the authority's, and
    /// ownership handed to it falls to the authority, as every peer in the
    /// session does on `PeerLeft`.
    fn reassign_buffered(&mut self, departed: PeerId) {
        let Some(authority) = self.peers.authority() else {
            self.buffered.clear();
            return;
        };

        for (sender, action) in self.buffered.iter_mut() {
            if *sender == departed {
                *sender = authority;
            }
            if let Action::TransferOwnership { new_owner, .. } = action {
                if *new_owner == departed {
                    *new_owner = authority;
                }
            }
        }
    }

    fn broadcast(&self, packet: Packet) -> Vec<Delivery> {
        self.peers
            .peer_ids()
            .into_iter()
            .map(|to| Delivery {
                to,
                packet: packet.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{keys, Subject, Vec3};

    fn recipients(deliveries: &[Delivery]) -> Vec<PeerId> {
        deliveries.iter().map(|d| d.to).collect()
    }

    fn room_with(peers: &[PeerId]) -> Room {
        let mut room = Room::new("Room1000", 4);
        for id in peers {
            room.join(*id, &format!("peer{}", id)).unwrap();
        }
        room
    }

    #[test]
    fn test_join_sends_snapshot_then_announces() {
        let mut room = room_with(&[1]);
        let deliveries = room.join(2, "bob").unwrap();

        assert_eq!(recipients(&deliveries), vec![2, 1]);
        match &deliveries[0].packet {
            Packet::Connected { peer_id, snapshot } => {
                assert_eq!(*peer_id, 2);
                assert_eq!(snapshot.peers.len(), 2);
                assert_eq!(snapshot.peers[0].id, 1);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
        assert!(matches!(deliveries[1].packet, Packet::PeerJoined { .. }));
    }

    #[test]
    fn test_join_full_session() {
        let mut room = Room::new("tiny", 1);
        room.join(1, "a").unwrap();

        match room.join(2, "b") {
            Err(SyncError::SessionFull { capacity, .. }) => assert_eq!(capacity, 1),
            other => panic!("expected SessionFull, got {:?}", other.map(|d| d.len())),
        }
    }

    #[test]
    fn test_property_write_echoes_to_writer() {
        let mut room = room_with(&[1, 2]);
        let deliveries = room.set_properties(
            2,
            PropertyScope::Peer(2),
            vec![(keys::IS_ALIVE.to_string(), PropertyValue::Bool(false))],
        );

        assert_eq!(recipients(&deliveries), vec![1, 2]);
        assert_eq!(room.snapshot().peer_props[&2][keys::IS_ALIVE], PropertyValue::Bool(false));
    }

    #[test]
    fn test_snapshot_carries_session_properties_to_late_joiner() {
        let mut room = room_with(&[1]);
        room.set_properties(
            1,
            PropertyScope::Session,
            vec![(keys::GAME_OVER.to_string(), PropertyValue::Bool(true))],
        );

        let deliveries = room.join(2, "late").unwrap();
        match &deliveries[0].packet {
            Packet::Connected { snapshot, .. } => {
                assert_eq!(
                    snapshot.session_props.get(keys::GAME_OVER),
                    Some(&PropertyValue::Bool(true))
                );
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_write_to_departed_peer_scope_dropped() {
        let mut room = room_with(&[1, 2]);
        room.leave(2);

        let deliveries = room.set_properties(
            1,
            PropertyScope::Peer(2),
            vec![(keys::IS_ALIVE.to_string(), PropertyValue::Bool(false))],
        );
        assert!(deliveries.is_empty());
    }

    #[test]
    fn test_invoke_authority_target() {
        let mut room = room_with(&[4, 2, 9]);
        let deliveries = room.invoke(9, RpcTarget::AuthorityPeer, Action::EnteredGoalZone { entity: 1 });

        assert_eq!(recipients(&deliveries), vec![4]);
    }

    #[test]
    fn test_invoke_absent_peer_dropped() {
        let mut room = room_with(&[1, 2]);
        let deliveries = room.invoke(
            1,
            RpcTarget::SpecificPeer(77),
            Action::ReleaseNotice {
                subject: Subject::Entity(1),
            },
        );

        assert!(deliveries.is_empty());
    }

    #[test]
    fn test_buffered_calls_replayed_to_late_joiner() {
        let mut room = room_with(&[1]);
        room.invoke(
            1,
            RpcTarget::AllBuffered,
            Action::SpawnEntity {
                entity: 1,
                position: Vec3::ZERO,
            },
        );
        room.invoke(1, RpcTarget::AllPeers, Action::GoDown { peer: 1 });

        let deliveries = room.join(2, "late").unwrap();
        let replayed: Vec<&Packet> = deliveries
            .iter()
            .filter(|d| d.to == 2)
            .map(|d| &d.packet)
            .collect();

        assert_eq!(replayed.len(), 2);
        assert!(matches!(
            replayed[1],
            Packet::RemoteCall {
                sender: 1,
                action: Action::SpawnEntity { entity: 1, .. }
            }
        ));
    }

    #[test]
    fn test_departed_peer_buffered_calls_reassigned() {
        let mut room = room_with(&[1, 2, 3]);
        room.invoke(
            1,
            RpcTarget::AllBuffered,
            Action::SpawnEntity {
                entity: 1,
                position: Vec3::ZERO,
            },
        );
        room.invoke(
            2,
            RpcTarget::AllBuffered,
            Action::TransferOwnership {
                entity: 1,
                new_owner: 3,
            },
        );

        room.leave(1);
        room.leave(3);

        let replayed: Vec<Packet> = room
            .join(4, "late")
            .unwrap()
            .into_iter()
            .filter(|d| d.to == 4)
            .skip(1)
            .map(|d| d.packet)
            .collect();
        assert_eq!(
            replayed,
            vec![
                Packet::RemoteCall {
                    sender: 2,
                    action: Action::SpawnEntity {
                        entity: 1,
                        position: Vec3::ZERO,
                    },
                },
                Packet::RemoteCall {
                    sender: 2,
                    action: Action::TransferOwnership {
                        entity: 1,
                        new_owner: 2,
                    },
                },
            ]
        );
    }

    #[test]
    fn test_buffer_keeps_latest_per_entity() {
        let mut room = room_with(&[1, 2]);
        for entity in [1, 2] {
            room.invoke(
                1,
                RpcTarget::AllBuffered,
                Action::SpawnEntity {
                    entity,
                    position: Vec3::ZERO,
                },
            );
        }
        for new_owner in [2, 1, 2] {
            room.invoke(
                new_owner,
                RpcTarget::AllBuffered,
                Action::TransferOwnership {
                    entity: 1,
                    new_owner,
                },
            );
        }
        room.invoke(1, RpcTarget::AllBuffered, Action::SetSecured { entity: 1 });
        room.invoke(1, RpcTarget::AllBuffered, Action::SetUnsecured { entity: 1 });
        assert_eq!(room.buffered().len(), 4);
        assert_eq!(
            room.buffered()[3],
            (1, Action::SetUnsecured { entity: 1 })
        );

        let deliveries = room.invoke(1, RpcTarget::AllBuffered, Action::DespawnEntity { entity: 1 });
        assert_eq!(recipients(&deliveries), vec![1, 2]);
        assert_eq!(
            room.buffered(),
            &[(
                1,
                Action::SpawnEntity {
                    entity: 2,
                    position: Vec3::ZERO,
                }
            )]
        );
    }

    #[test]
    fn test_last_peer_leaving_clears_buffer() {
        let mut room = room_with(&[1]);
        room.invoke(1, RpcTarget::AllBuffered, Action::SetSecured { entity: 1 });
        room.leave(1);
        assert!(room.buffered().is_empty());
    }

    #[test]
    fn test_leave_announces_and_reelects() {
        let mut room = room_with(&[1, 2, 3]);
        let deliveries = room.leave(1);

        assert_eq!(recipients(&deliveries), vec![2, 3]);
        assert_eq!(room.authority(), Some(2));
        assert!(room.leave(1).is_empty());
    }

    #[test]
    fn test_non_member_cannot_write() {
        let mut room = room_with(&[1]);
        let deliveries = room.set_properties(
            5,
            PropertyScope::Session,
            vec![(keys::GAME_OVER.to_string(), PropertyValue::Bool(true))],
        );
        assert!(deliveries.is_empty());
        assert!(room.session_property(keys::GAME_OVER).is_none());
    }
}
