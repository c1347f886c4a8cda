//! Alive/downed state per peer and the session's terminal outcome.
//!
//! Per peer: `Alive -> Downed -> Alive`. Only the local peer computes its own
//! health; entering Downed is announced with a `GoDown` broadcast plus an
//! `IsAlive = false` write to the peer's own property scope.
//!
//! Session-wide: only the authority writes `SecuredCount` and the terminal
//! keys (`GameOver`, `Won`, `GameOverReason`). The first matching condition
//! wins. The authority guards the terminal write with a local flag and with
//! the mirrored `GameOver`, so a re-delivered notification or a newly elected
//! authority never writes it twice.

use crate::outbox::Outbox;
use crate::property_store::PropertyStore;
use crate::timer::Countdown;
use log::{debug, info};
use shared::{keys, PeerId, PropertyScope, PropertyValue, SessionConfig};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeReason {
    TimedOut,
    GuardedObjectDestroyed,
    AllPlayersDowned,
}

impl OutcomeReason {
    /// Value stored under `GameOverReason`
    pub fn code(&self) -> &'static str {
        match self {
            OutcomeReason::TimedOut => "TIMED_OUT",
            OutcomeReason::GuardedObjectDestroyed => "GUARDED_OBJECT_DESTROYED",
            OutcomeReason::AllPlayersDowned => "ALL_DOWNED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "TIMED_OUT" => Some(OutcomeReason::TimedOut),
            "GUARDED_OBJECT_DESTROYED" => Some(OutcomeReason::GuardedObjectDestroyed),
            "ALL_DOWNED" => Some(OutcomeReason::AllPlayersDowned),
            _ => None,
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            OutcomeReason::TimedOut => "Time ran out before enough survivors were rescued",
            OutcomeReason::GuardedObjectDestroyed => "The village was destroyed",
            OutcomeReason::AllPlayersDowned => "Every player is down",
        }
    }
}

impl fmt::Display for OutcomeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Won,
    Lost(OutcomeReason),
}

/// Terminal outcome as observed through the mirror
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedOutcome {
    pub won: bool,
    pub reason: Option<OutcomeReason>,
}

impl ObservedOutcome {
    pub fn text(&self) -> String {
        match (self.won, self.reason) {
            (true, _) => "All required survivors secured".to_string(),
            (false, Some(reason)) => reason.text().to_string(),
            (false, None) => "Game over".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DamageResult {
    /// Already downed or down pending
    Ignored,
    Hurt { health_percent: f32 },
    WentDown,
}

pub struct OutcomeStateMachine {
    local: Option<PeerId>,
    max_health: f32,
    health: f32,
    down_requested: bool,
    downed: HashSet<PeerId>,

    terminal_written: bool,
    shown: Option<ObservedOutcome>,
    required: Option<u32>,
    secured: u32,

    match_clock: Option<Countdown>,
    last_clock_secs: Option<u32>,
    testing_mode: bool,
}

impl OutcomeStateMachine {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            local: None,
            max_health: config.max_health,
            health: config.max_health,
            down_requested: false,
            downed: HashSet::new(),
            terminal_written: false,
            shown: None,
            required: None,
            secured: 0,
            match_clock: None,
            last_clock_secs: None,
            testing_mode: config.testing_mode,
        }
    }

    pub fn set_local(&mut self, peer: PeerId) {
        self.local = Some(peer);
    }

    pub fn health(&self) -> f32 {
        self.health
    }

    pub fn health_percent(&self) -> f32 {
        self.health / self.max_health
    }

    pub fn is_downed(&self, peer: PeerId) -> bool {
        self.downed.contains(&peer)
    }

    fn local_down_or_pending(&self) -> bool {
        self.down_requested || self.local.map_or(false, |local| self.is_downed(local))
    }

    /// Applies damage to the local peer. Health never drops below zero.
    pub fn take_damage(&mut self, amount: f32) -> DamageResult {
        if self.local_down_or_pending() || amount <= 0.0 {
            return DamageResult::Ignored;
        }

        self.health = (self.health - amount).max(0.0);
        if self.health <= 0.0 {
            self.down_requested = true;
            DamageResult::WentDown
        } else {
            DamageResult::Hurt {
                health_percent: self.health_percent(),
            }
        }
    }

    /// Drops the local peer straight to zero health, e.g. below the kill plane.
    /// Returns true if this started a down.
    pub fn force_down(&mut self) -> bool {
        if self.local_down_or_pending() {
            return false;
        }
        self.health = 0.0;
        self.down_requested = true;
        true
    }

    /// Handles a `GoDown` broadcast. Returns true on the transition.
    pub fn apply_go_down(&mut self, peer: PeerId) -> bool {
        if !self.downed.insert(peer) {
            debug!("Peer {} already downed", peer);
            return false;
        }
        if Some(peer) == self.local {
            self.health = 0.0;
            self.down_requested = false;
        }
        info!("Peer {} is down", peer);
        true
    }

    /// Handles a `Revive` broadcast. Returns true on the transition.
    pub fn apply_revive(&mut self, peer: PeerId) -> bool {
        if !self.downed.remove(&peer) {
            debug!("Peer {} is not downed, ignoring revive", peer);
            return false;
        }
        if Some(peer) == self.local {
            self.health = self.max_health;
            self.down_requested = false;
        }
        info!("Peer {} revived", peer);
        true
    }

    pub fn forget_peer(&mut self, peer: PeerId) {
        self.downed.remove(&peer);
    }

    /// Whether the terminal outcome has been decided, by us or by an
    /// earlier authority
    pub fn terminal_decided(&self, store: &PropertyStore) -> bool {
        self.terminal_written || store.get_bool(PropertyScope::Session, keys::GAME_OVER, false)
    }

    /// Writes the terminal outcome if we are the authority and nobody has
    /// decided yet. Returns true if the write was issued.
    pub fn decide(
        &mut self,
        is_authority: bool,
        store: &PropertyStore,
        outbox: &mut Outbox,
        outcome: Outcome,
    ) -> bool {
        if !is_authority {
            debug!("Not the authority, leaving {:?} undecided", outcome);
            return false;
        }
        if self.terminal_decided(store) {
            debug!("Outcome already decided, ignoring {:?}", outcome);
            return false;
        }

        self.terminal_written = true;
        let won = outcome == Outcome::Won;

        store.set_properties(
            outbox,
            PropertyScope::Session,
            vec![
                (keys::GAME_OVER.to_string(), PropertyValue::Bool(true)),
                (keys::WON.to_string(), PropertyValue::Bool(won)),
            ],
        );
        if let Outcome::Lost(reason) = outcome {
            store.set_properties(
                outbox,
                PropertyScope::Session,
                vec![(
                    keys::GAME_OVER_REASON.to_string(),
                    PropertyValue::Str(reason.code().to_string()),
                )],
            );
        }

        info!("Deciding outcome {:?}", outcome);
        true
    }

    /// Every listed peer has `IsAlive == false`. Absent flags count as alive.
    pub fn all_downed(store: &PropertyStore, peers: &[PeerId]) -> bool {
        !peers.is_empty()
            && peers
                .iter()
                .all(|peer| !store.get_bool(PropertyScope::Peer(*peer), keys::IS_ALIVE, true))
    }

    pub fn check_all_downed(
        &mut self,
        is_authority: bool,
        store: &PropertyStore,
        peers: &[PeerId],
        outbox: &mut Outbox,
    ) -> bool {
        if !is_authority || !Self::all_downed(store, peers) {
            return false;
        }
        self.decide(
            is_authority,
            store,
            outbox,
            Outcome::Lost(OutcomeReason::AllPlayersDowned),
        )
    }

    /// Authority side of match start
    pub fn begin_match(&mut self, required: u32) {
        self.required = Some(required);
        self.secured = 0;
    }

    /// Counts one newly secured entity and checks the win condition.
    /// Returns the new count, or None if we are not the authority.
    pub fn record_secured(
        &mut self,
        is_authority: bool,
        store: &PropertyStore,
        outbox: &mut Outbox,
    ) -> Option<u32> {
        if !is_authority {
            return None;
        }

        self.secured += 1;
        store.set_properties(
            outbox,
            PropertyScope::Session,
            vec![(keys::SECURED_COUNT.to_string(), PropertyValue::from(self.secured))],
        );
        info!("Secured {} / {:?}", self.secured, self.required);

        if let Some(required) = self.required {
            if self.secured >= required {
                self.decide(is_authority, store, outbox, Outcome::Won);
            }
        }
        Some(self.secured)
    }

    /// Uncounts an entity that was carried back out of the goal zone.
    /// Returns the new count, or None if we are not the authority.
    pub fn record_unsecured(
        &mut self,
        is_authority: bool,
        store: &PropertyStore,
        outbox: &mut Outbox,
    ) -> Option<u32> {
        if !is_authority {
            return None;
        }

        self.secured = self.secured.saturating_sub(1);
        store.set_properties(
            outbox,
            PropertyScope::Session,
            vec![(keys::SECURED_COUNT.to_string(), PropertyValue::from(self.secured))],
        );
        info!("Secured {} / {:?} after a goal-zone exit", self.secured, self.required);
        Some(self.secured)
    }

    /// Rebuilds the authority-side counters from the mirror after an
    /// authority change. In-flight decisions of the previous authority are
    /// not replayed.
    pub fn adopt_from_mirror(&mut self, store: &PropertyStore) {
        self.secured = store
            .get_int(PropertyScope::Session, keys::SECURED_COUNT, 0)
            .max(0) as u32;
        if let Some(required) = store
            .get(PropertyScope::Session, keys::REQUIRED_SECURED)
            .and_then(PropertyValue::as_int)
        {
            self.required = Some(required.max(0) as u32);
        }
        if store.get_bool(PropertyScope::Session, keys::GAME_OVER, false) {
            self.terminal_written = true;
        }
    }

    pub fn secured(&self) -> u32 {
        self.secured
    }

    pub fn required(&self) -> Option<u32> {
        self.required
    }

    /// Reads the terminal keys from the mirror. Returns the outcome the
    /// first time it is seen, and again only if a reason arrives later.
    pub fn observe_terminal(&mut self, store: &PropertyStore) -> Option<ObservedOutcome> {
        if !store.get_bool(PropertyScope::Session, keys::GAME_OVER, false) {
            return None;
        }

        let observed = ObservedOutcome {
            won: store.get_bool(PropertyScope::Session, keys::WON, false),
            reason: store
                .get(PropertyScope::Session, keys::GAME_OVER_REASON)
                .and_then(PropertyValue::as_str)
                .and_then(OutcomeReason::from_code),
        };

        let show = match &self.shown {
            None => true,
            Some(shown) => shown.reason.is_none() && observed.reason.is_some(),
        };
        if !show {
            return None;
        }

        self.shown = Some(observed.clone());
        Some(observed)
    }

    pub fn shown(&self) -> Option<&ObservedOutcome> {
        self.shown.as_ref()
    }

    /// Starts the local match clock. Returns false if it was already running.
    pub fn start_clock(&mut self, duration_secs: f32, required: Option<u32>) -> bool {
        if self.match_clock.is_some() {
            return false;
        }
        if self.required.is_none() {
            self.required = required;
        }
        self.match_clock = Some(Countdown::new(duration_secs));
        self.last_clock_secs = None;
        true
    }

    pub fn clock_running(&self) -> bool {
        self.match_clock.is_some()
    }

    /// Advances the match clock. Returns the whole seconds left whenever that
    /// number changes. Once the clock has run out the authority decides
    /// `TimedOut`, unless testing mode is on.
    pub fn advance_clock(
        &mut self,
        dt: f32,
        is_authority: bool,
        store: &PropertyStore,
        outbox: &mut Outbox,
    ) -> Option<u32> {
        let clock = self.match_clock.as_mut()?;
        clock.advance(dt);
        let secs = clock.whole_seconds();
        let expired = clock.is_expired();

        if expired && !self.testing_mode && is_authority && !self.terminal_decided(store) {
            self.decide(
                is_authority,
                store,
                outbox,
                Outcome::Lost(OutcomeReason::TimedOut),
            );
        }

        if self.last_clock_secs != Some(secs) {
            self.last_clock_secs = Some(secs);
            Some(secs)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.health = self.max_health;
        self.down_requested = false;
        self.downed.clear();
        self.terminal_written = false;
        self.shown = None;
        self.required = None;
        self.secured = 0;
        self.match_clock = None;
        self.last_clock_secs = None;
    }
}
