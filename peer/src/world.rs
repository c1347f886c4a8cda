//! Arena storage for avatars and rescue targets.
//!
//! Relationships (carrier, owner) are stored as ids into these tables, never
//! as references between objects.

use shared::{EntityId, PeerId, SessionConfig, Subject, Transform, Vec3, Zone};
use std::collections::{BTreeMap, HashMap};

/// Where a carried subject sits relative to its controller
pub const CARRY_OFFSET: Vec3 = Vec3 {
    x: 0.0,
    y: 1.0,
    z: 1.5,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityState {
    Free,
    Carried { carrier: PeerId },
    Secured,
}

#[derive(Debug, Clone)]
pub struct RescueTarget {
    pub id: EntityId,
    pub transform: Transform,
    pub state: EntityState,
    /// Set while the entity counts toward the secured total, from the
    /// authority's `SetSecured` until its `SetUnsecured`
    pub finalized: bool,
    pub kinematic: bool,
}

impl RescueTarget {
    pub fn is_secured(&self) -> bool {
        self.state == EntityState::Secured
    }
}

#[derive(Debug, Clone)]
pub struct Avatar {
    pub peer: PeerId,
    pub transform: Transform,
    pub spawn_point: Vec3,
    pub kinematic: bool,
}

pub struct World {
    avatars: HashMap<PeerId, Avatar>,
    entities: BTreeMap<EntityId, RescueTarget>,
    goal_zone: Zone,
    spawn_area: Zone,
    kill_plane_y: f32,
}

impl World {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            avatars: HashMap::new(),
            entities: BTreeMap::new(),
            goal_zone: config.goal_zone,
            spawn_area: config.spawn_area,
            kill_plane_y: config.kill_plane_y,
        }
    }

    /// Deterministic spawn point so every peer agrees on it without a message
    pub fn spawn_point_for(&self, peer: PeerId) -> Vec3 {
        let min = self.spawn_area.min;
        let max = self.spawn_area.max;
        let width = (max.x - min.x).max(0.0);
        let x = min.x + ((peer % 8) as f32 * 2.0).min(width);
        Vec3::new(x, min.y, (min.z + max.z) / 2.0)
    }

    pub fn add_avatar(&mut self, peer: PeerId) {
        let spawn_point = self.spawn_point_for(peer);
        self.avatars.entry(peer).or_insert(Avatar {
            peer,
            transform: Transform::at(spawn_point),
            spawn_point,
            kinematic: false,
        });
    }

    pub fn remove_avatar(&mut self, peer: PeerId) -> Option<Avatar> {
        self.avatars.remove(&peer)
    }

    pub fn avatar(&self, peer: PeerId) -> Option<&Avatar> {
        self.avatars.get(&peer)
    }

    pub fn avatar_mut(&mut self, peer: PeerId) -> Option<&mut Avatar> {
        self.avatars.get_mut(&peer)
    }

    /// Returns false if the id is already taken.
    pub fn spawn_entity(&mut self, id: EntityId, position: Vec3) -> bool {
        if self.entities.contains_key(&id) {
            return false;
        }
        self.entities.insert(
            id,
            RescueTarget {
                id,
                transform: Transform::at(position),
                state: EntityState::Free,
                finalized: false,
                kinematic: false,
            },
        );
        true
    }

    pub fn despawn_entity(&mut self, id: EntityId) -> Option<RescueTarget> {
        self.entities.remove(&id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&RescueTarget> {
        self.entities.get(&id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut RescueTarget> {
        self.entities.get_mut(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &RescueTarget> {
        self.entities.values()
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn contains(&self, subject: Subject) -> bool {
        match subject {
            Subject::Avatar(peer) => self.avatars.contains_key(&peer),
            Subject::Entity(id) => self.entities.contains_key(&id),
        }
    }

    pub fn transform_of(&self, subject: Subject) -> Option<Transform> {
        match subject {
            Subject::Avatar(peer) => self.avatars.get(&peer).map(|a| a.transform),
            Subject::Entity(id) => self.entities.get(&id).map(|e| e.transform),
        }
    }

    pub fn set_transform(&mut self, subject: Subject, transform: Transform) {
        match subject {
            Subject::Avatar(peer) => {
                if let Some(avatar) = self.avatars.get_mut(&peer) {
                    avatar.transform = transform;
                }
            }
            Subject::Entity(id) => {
                if let Some(entity) = self.entities.get_mut(&id) {
                    entity.transform = transform;
                }
            }
        }
    }

    /// Returns true if the flag changed
    pub fn set_kinematic(&mut self, subject: Subject, kinematic: bool) -> bool {
        let flag = match subject {
            Subject::Avatar(peer) => self.avatars.get_mut(&peer).map(|a| &mut a.kinematic),
            Subject::Entity(id) => self.entities.get_mut(&id).map(|e| &mut e.kinematic),
        };
        match flag {
            Some(flag) if *flag != kinematic => {
                *flag = kinematic;
                true
            }
            _ => false,
        }
    }

    /// Slot a controller carries its subject in
    pub fn carry_slot(&self, controller: PeerId) -> Option<Transform> {
        self.avatars.get(&controller).map(|avatar| Transform {
            position: avatar.transform.position.add(CARRY_OFFSET),
            yaw: avatar.transform.yaw,
        })
    }

    pub fn in_goal_zone(&self, id: EntityId) -> bool {
        self.entities
            .get(&id)
            .map_or(false, |e| self.goal_zone.contains(e.transform.position))
    }

    pub fn below_kill_plane(&self, position: Vec3) -> bool {
        position.y < self.kill_plane_y
    }

    pub fn random_spawn_position<R: rand::Rng>(&self, rng: &mut R) -> Vec3 {
        let min = self.spawn_area.min;
        let max = self.spawn_area.max;
        Vec3::new(
            sample(rng, min.x, max.x),
            sample(rng, min.y, max.y),
            sample(rng, min.z, max.z),
        )
    }

    pub fn clear(&mut self) {
        self.avatars.clear();
        self.entities.clear();
    }
}

fn sample<R: rand::Rng>(rng: &mut R, a: f32, b: f32) -> f32 {
    if b > a {
        rng.gen_range(a..=b)
    } else {
        a
    }
}
