//! Connect, carry and detach lifecycle.
//!
//! A link binds a controller peer to a subject (another peer's avatar or a
//! rescue target) for a bounded time. Links are keyed by subject, so a subject
//! has at most one link at any tick: attaching an already attached subject to
//! a new controller tears the old link down first.
//!
//! Every peer runs its own copy of each link's countdown and detaches locally
//! on expiry. Detaching is idempotent, so the expiry racing a forced release
//! or a duplicate `ForceDetach` leaves the same end state.

use crate::timer::Countdown;
use log::debug;
use shared::{PeerId, Subject};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentLink {
    pub subject: Subject,
    pub controller: PeerId,
    pub countdown: Countdown,
}

/// Why a link ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachCause {
    Expired,
    /// Explicit `ForceDetach`, from the controller cancelling or from game logic
    Released,
    /// The subject was attached to another controller
    Replaced,
    /// The subject or the controller went away, went down, or was secured
    Removed,
}

#[derive(Debug, PartialEq)]
pub enum AttachResult {
    Attached { torn_down: Vec<AttachmentLink> },
    /// Same subject, same controller: a duplicate delivery
    AlreadyAttached,
}

#[derive(Debug, Default)]
pub struct AttachmentProtocol {
    links: BTreeMap<Subject, AttachmentLink>,
    cooldown: Option<Countdown>,
}

impl AttachmentProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, subject: Subject, controller: PeerId, duration: f32) -> AttachResult {
        if let Some(existing) = self.links.get(&subject) {
            if existing.controller == controller {
                debug!("Duplicate attach of {:?} to {}", subject, controller);
                return AttachResult::AlreadyAttached;
            }
        }

        let mut torn_down = Vec::new();
        if let Some(old) = self.links.remove(&subject) {
            torn_down.push(old);
        }
        // A controller holds one subject at a time
        if let Some(previous) = self.controlled_by(controller) {
            if let Some(old) = self.links.remove(&previous) {
                torn_down.push(old);
            }
        }

        self.links.insert(
            subject,
            AttachmentLink {
                subject,
                controller,
                countdown: Countdown::new(duration),
            },
        );

        AttachResult::Attached { torn_down }
    }

    /// Removes the link on `subject`. Returns None if it was not attached.
    pub fn detach(&mut self, subject: Subject) -> Option<AttachmentLink> {
        self.links.remove(&subject)
    }

    /// Removes every link `peer` takes part in, as controller or as subject
    pub fn detach_peer(&mut self, peer: PeerId) -> Vec<AttachmentLink> {
        let subjects: Vec<Subject> = self
            .links
            .values()
            .filter(|link| link.controller == peer || link.subject == Subject::Avatar(peer))
            .map(|link| link.subject)
            .collect();

        subjects
            .into_iter()
            .filter_map(|subject| self.links.remove(&subject))
            .collect()
    }

    /// Advances every countdown and returns the links that expired.
    pub fn advance(&mut self, dt: f32) -> Vec<AttachmentLink> {
        let expired: Vec<Subject> = self
            .links
            .values_mut()
            .filter_map(|link| link.countdown.advance(dt).then_some(link.subject))
            .collect();

        expired
            .into_iter()
            .filter_map(|subject| self.links.remove(&subject))
            .collect()
    }

    pub fn link(&self, subject: Subject) -> Option<&AttachmentLink> {
        self.links.get(&subject)
    }

    pub fn is_attached(&self, subject: Subject) -> bool {
        self.links.contains_key(&subject)
    }

    pub fn controlled_by(&self, controller: PeerId) -> Option<Subject> {
        self.links
            .values()
            .find(|link| link.controller == controller)
            .map(|link| link.subject)
    }

    pub fn links(&self) -> impl Iterator<Item = &AttachmentLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn start_cooldown(&mut self, seconds: f32) {
        self.cooldown = Some(Countdown::new(seconds));
    }

    pub fn cooldown_active(&self) -> bool {
        self.cooldown.is_some()
    }

    /// Advances the local interaction cooldown. Returns true when it ends.
    pub fn advance_cooldown(&mut self, dt: f32) -> bool {
        let ended = match self.cooldown.as_mut() {
            Some(cooldown) => cooldown.advance(dt),
            None => false,
        };
        if ended {
            self.cooldown = None;
        }
        ended
    }

    pub fn clear(&mut self) {
        self.links.clear();
        self.cooldown = None;
    }
}
