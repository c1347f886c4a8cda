//! Remote procedure vocabulary.
//!
//! Every action a peer can ask others to execute is a variant here, so the
//! receiving side dispatches through an exhaustive `match` instead of a
//! string lookup. Handlers must tolerate duplicate delivery.

use crate::{EntityId, PeerId, Transform, Vec3};
use serde::{Deserialize, Serialize};

/// Something that can be attached to a controller.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    Avatar(PeerId),
    Entity(EntityId),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Action {
    // Attachment
    GetConnected {
        subject: Subject,
        controller: PeerId,
        duration: f32,
    },
    ForceDetach {
        subject: Subject,
    },
    /// Sent to the controller only, after its subject was released by game logic.
    ReleaseNotice {
        subject: Subject,
    },

    // Ownership and transforms
    TransferOwnership {
        entity: EntityId,
        new_owner: PeerId,
    },
    TransformUpdate {
        subject: Subject,
        transform: Transform,
    },

    // Entity lifecycle
    SpawnEntity {
        entity: EntityId,
        position: Vec3,
    },
    DespawnEntity {
        entity: EntityId,
    },
    EnteredGoalZone {
        entity: EntityId,
    },
    SetSecured {
        entity: EntityId,
    },
    LeftGoalZone {
        entity: EntityId,
    },
    SetUnsecured {
        entity: EntityId,
    },

    // Vitality
    Damage {
        amount: f32,
    },
    GoDown {
        peer: PeerId,
    },
    Revive {
        peer: PeerId,
    },

    // Outcome
    GuardedObjectDestroyed,
}

impl Action {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Action::GetConnected { .. } => "GetConnected",
            Action::ForceDetach { .. } => "ForceDetach",
            Action::ReleaseNotice { .. } => "ReleaseNotice",
            Action::TransferOwnership { .. } => "TransferOwnership",
            Action::TransformUpdate { .. } => "TransformUpdate",
            Action::SpawnEntity { .. } => "SpawnEntity",
            Action::DespawnEntity { .. } => "DespawnEntity",
            Action::EnteredGoalZone { .. } => "EnteredGoalZone",
            Action::SetSecured { .. } => "SetSecured",
            Action::LeftGoalZone { .. } => "LeftGoalZone",
            Action::SetUnsecured { .. } => "SetUnsecured",
            Action::Damage { .. } => "Damage",
            Action::GoDown { .. } => "GoDown",
            Action::Revive { .. } => "Revive",
            Action::GuardedObjectDestroyed => "GuardedObjectDestroyed",
        }
    }

    /// The interactive entity a lifecycle or ownership call is about
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            Action::TransferOwnership { entity, .. }
            | Action::SpawnEntity { entity, .. }
            | Action::DespawnEntity { entity }
            | Action::EnteredGoalZone { entity }
            | Action::SetSecured { entity }
            | Action::LeftGoalZone { entity }
            | Action::SetUnsecured { entity } => Some(*entity),
            Action::GetConnected { subject, .. }
            | Action::ForceDetach { subject }
            | Action::ReleaseNotice { subject }
            | Action::TransformUpdate { subject, .. } => match subject {
                Subject::Entity(entity) => Some(*entity),
                Subject::Avatar(_) => None,
            },
            Action::Damage { .. }
            | Action::GoDown { .. }
            | Action::Revive { .. }
            | Action::GuardedObjectDestroyed => None,
        }
    }
}
