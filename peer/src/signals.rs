//! Boundary types between the session core and its collaborators.
//!
//! `Signal`s flow one way, from the core to presentation (rendering,
//! animation, UI). `Intent`s flow the other way, from the input layer into the
//! core. Neither side ever queries the other.

use crate::outcome::OutcomeReason;
use shared::{EntityId, PeerId, Subject, Transform, Vec3};

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    AuthorityChanged {
        authority: Option<PeerId>,
        is_local: bool,
    },
    Downed {
        peer: PeerId,
        downed: bool,
    },
    /// Local health, 0.0 to 1.0
    HealthPercent(f32),
    Teleported {
        peer: PeerId,
        position: Vec3,
    },
    ControlsLocked(bool),
    /// Whole seconds left while the local avatar is being carried
    CarriedCountdown(u32),
    Kinematic {
        subject: Subject,
        kinematic: bool,
    },
    EntityCarried {
        entity: EntityId,
        carrier: Option<PeerId>,
    },
    EntitySecured(EntityId),
    /// A secured entity was carried back out of the goal zone
    EntityUnsecured(EntityId),
    EntitySpawned {
        entity: EntityId,
        position: Vec3,
    },
    EntityDespawned(EntityId),
    InteractionAvailable(bool),
    ReadyChanged {
        peer: PeerId,
        ready: bool,
    },
    MatchStarted {
        required: u32,
    },
    SecuredProgress {
        secured: u32,
        required: u32,
    },
    /// Whole seconds left on the local match clock
    MatchClock(u32),
    Outcome {
        won: bool,
        reason: Option<OutcomeReason>,
        text: String,
    },
    Disconnected {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Attach to whatever the input layer's raycast picked
    Interact(Subject),
    CancelInteract,
    Revive(PeerId),
    Move(Transform),
    ToggleReady,
    StartMatch,
}
