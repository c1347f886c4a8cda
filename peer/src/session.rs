//! Session orchestrator owning every replicated-state component of one peer.
//!
//! `SessionContext` is a plain single-owner struct. The host loop feeds it
//! relay packets, input intents and ticks, then drains the packets it queued
//! for the relay and the signals it raised for presentation. Nothing in here
//! touches a socket or a clock.

use crate::attachment::{AttachResult, AttachmentLink, AttachmentProtocol, DetachCause};
use crate::authority::{AuthorityElector, AuthorityPredicate};
use crate::outbox::Outbox;
use crate::outcome::{DamageResult, Outcome, OutcomeReason, OutcomeStateMachine};
use crate::ownership::OwnershipLedger;
use crate::property_store::PropertyStore;
use crate::remote_call::RemoteCallRouter;
use crate::signals::{Intent, Signal};
use crate::timer::Countdown;
use crate::world::{EntityState, World};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    keys, Action, EntityId, Packet, PeerId, PeerInfo, PropertyScope, PropertyValue,
    RequiredSecured, RpcTarget, SessionConfig, SessionSnapshot, Subject, Transform,
    PROTOCOL_VERSION,
};
use std::collections::{HashMap, HashSet};

/// Goal-zone containment is polled this often by entity owners
pub const ZONE_POLL_INTERVAL_SECS: f32 = 0.2;
/// A goal-zone report with no answer is repeated after this long
pub const ZONE_REPORT_RETRY_SECS: f32 = 1.0;

pub struct SessionContext {
    config: SessionConfig,
    display_name: String,
    session_name: String,
    connected: bool,
    disconnect_reported: bool,

    elector: AuthorityElector,
    predicate: Option<Box<dyn AuthorityPredicate + Send>>,
    store: PropertyStore,
    router: RemoteCallRouter,
    ledger: OwnershipLedger,
    attachments: AttachmentProtocol,
    outcome: OutcomeStateMachine,
    world: World,

    outbox: Outbox,
    signals: Vec<Signal>,

    // Local controller state
    local_interaction: Option<Subject>,
    carried_secs: Option<u32>,

    // Owner-side goal-zone polling
    zone_poll: Countdown,
    zone_reports: HashMap<EntityId, Countdown>,

    // Authority-side bookkeeping
    counted: HashSet<EntityId>,
    despawn_requested: HashSet<EntityId>,
    last_authority: Option<PeerId>,
    was_authority: bool,
    next_entity_id: EntityId,
    rng: StdRng,
}

impl SessionContext {
    pub fn new(config: SessionConfig, display_name: &str, session_name: &str) -> Self {
        let config = config.sanitized();
        Self {
            world: World::new(&config),
            outcome: OutcomeStateMachine::new(&config),
            config,
            display_name: display_name.to_string(),
            session_name: session_name.to_string(),
            connected: false,
            disconnect_reported: false,
            elector: AuthorityElector::new(),
            predicate: None,
            store: PropertyStore::new(),
            router: RemoteCallRouter::new(),
            ledger: OwnershipLedger::new(),
            attachments: AttachmentProtocol::new(),
            outbox: Outbox::new(),
            signals: Vec::new(),
            local_interaction: None,
            carried_secs: None,
            zone_poll: Countdown::new(ZONE_POLL_INTERVAL_SECS),
            zone_reports: HashMap::new(),
            counted: HashSet::new(),
            despawn_requested: HashSet::new(),
            last_authority: None,
            was_authority: false,
            next_entity_id: 1,
            rng: StdRng::from_entropy(),
        }
    }

    /// Replaces the elector as the source of "am I the authority"
    pub fn with_authority_predicate(mut self, predicate: Box<dyn AuthorityPredicate + Send>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// First packet to send after the transport is up
    pub fn connect_packet(&self) -> Packet {
        Packet::Connect {
            client_version: PROTOCOL_VERSION,
            display_name: self.display_name.clone(),
            session_name: self.session_name.clone(),
            capacity: self.config.max_peers,
        }
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.elector.local()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_authority(&self) -> bool {
        match &self.predicate {
            Some(predicate) => predicate.is_authority(),
            None => self.elector.is_local_authority(),
        }
    }

    pub fn elector(&self) -> &AuthorityElector {
        &self.elector
    }

    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    pub fn ledger(&self) -> &OwnershipLedger {
        &self.ledger
    }

    pub fn attachments(&self) -> &AttachmentProtocol {
        &self.attachments
    }

    pub fn outcome(&self) -> &OutcomeStateMachine {
        &self.outcome
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn router(&self) -> &RemoteCallRouter {
        &self.router
    }

    pub fn local_interaction(&self) -> Option<Subject> {
        self.local_interaction
    }

    pub fn drain_outgoing(&mut self) -> Vec<Packet> {
        self.outbox.drain()
    }

    pub fn drain_signals(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.signals)
    }

    fn emit(&mut self, signal: Signal) {
        self.signals.push(signal);
    }

    fn invoke(&mut self, target: RpcTarget, action: Action) -> bool {
        self.router
            .invoke(&mut self.outbox, &self.elector, target, action)
    }

    fn write(&mut self, scope: PropertyScope, props: Vec<(String, PropertyValue)>) {
        self.store.set_properties(&mut self.outbox, scope, props);
    }

    // ------------------------------------------------------------------
    // Relay packets
    // ------------------------------------------------------------------

    pub fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Connected { peer_id, snapshot } => self.on_connected(peer_id, snapshot),
            Packet::PeerJoined { peer } => self.on_peer_joined(peer),
            Packet::PeerLeft { peer_id } => self.on_peer_left(peer_id),
            Packet::PropertiesChanged {
                scope,
                writer,
                props,
            } => self.on_properties_changed(scope, writer, props),
            Packet::RemoteCall { sender, action } => self.dispatch(sender, action),
            Packet::Disconnected { reason } => self.connection_lost(&reason),
            Packet::Connect { .. }
            | Packet::SetProperties { .. }
            | Packet::Invoke { .. }
            | Packet::Heartbeat
            | Packet::Disconnect => {
                warn!("Ignoring relay-bound packet received by a peer");
            }
        }
    }

    fn on_connected(&mut self, peer_id: PeerId, snapshot: SessionSnapshot) {
        self.elector.clear();
        self.store.clear();
        self.world.clear();
        self.ledger.clear();
        self.attachments.clear();
        self.outcome.reset();
        self.local_interaction = None;
        self.zone_reports.clear();
        self.counted.clear();
        self.despawn_requested.clear();
        self.last_authority = None;
        self.was_authority = false;

        self.elector.set_local(peer_id);
        self.outcome.set_local(peer_id);
        self.session_name = snapshot.session_name.clone();
        self.store.load_snapshot(&snapshot);
        self.connected = true;
        self.disconnect_reported = false;

        info!(
            "Joined session {} as peer {} with {} peer(s)",
            self.session_name,
            peer_id,
            snapshot.peers.len()
        );

        for peer in &snapshot.peers {
            self.elector.add_peer(peer);
            self.world.add_avatar(peer.id);
            if peer.id != peer_id {
                self.emit(Signal::PeerJoined(peer.id));
            }
            // GoDown is not buffered, the mirror is the only record for late joiners
            if !self
                .store
                .get_bool(PropertyScope::Peer(peer.id), keys::IS_ALIVE, true)
                && self.outcome.apply_go_down(peer.id)
            {
                self.emit(Signal::Downed {
                    peer: peer.id,
                    downed: true,
                });
            }
        }

        self.write(
            PropertyScope::Peer(peer_id),
            vec![
                (keys::IS_ALIVE.to_string(), PropertyValue::Bool(true)),
                (keys::IS_READY.to_string(), PropertyValue::Bool(false)),
            ],
        );
        self.emit(Signal::HealthPercent(self.outcome.health_percent()));
        self.emit(Signal::InteractionAvailable(true));

        if self
            .store
            .get_bool(PropertyScope::Session, keys::MATCH_STARTED, false)
        {
            self.on_match_started();
        }
        self.observe_terminal();
        self.check_authority();
    }

    fn on_peer_joined(&mut self, peer: PeerInfo) {
        if Some(peer.id) == self.local_peer() || self.elector.contains(peer.id) {
            return;
        }
        info!("Peer {} ({}) joined", peer.id, peer.display_name);

        self.elector.add_peer(&peer);
        self.store.add_peer(peer.id);
        self.world.add_avatar(peer.id);
        self.emit(Signal::PeerJoined(peer.id));
        self.check_authority();
    }

    fn on_peer_left(&mut self, peer_id: PeerId) {
        if !self.elector.remove_peer(peer_id) {
            debug!("Peer {} already gone", peer_id);
            return;
        }
        info!("Peer {} left", peer_id);

        for link in self.attachments.detach_peer(peer_id) {
            self.end_link(link, DetachCause::Removed);
        }
        self.store.remove_peer(peer_id);
        self.world.remove_avatar(peer_id);
        self.outcome.forget_peer(peer_id);
        self.emit(Signal::PeerLeft(peer_id));

        self.check_authority();
        self.ledger
            .reassign_departed(peer_id, self.elector.authority());
        self.check_all_downed();
    }

    fn on_properties_changed(
        &mut self,
        scope: PropertyScope,
        writer: PeerId,
        props: Vec<(String, PropertyValue)>,
    ) {
        let changed = self.store.apply(scope, &props);
        debug!("Peer {} wrote {:?} on {:?}", writer, changed, scope);

        match scope {
            PropertyScope::Peer(owner) => {
                for key in &changed {
                    match key.as_str() {
                        keys::IS_ALIVE => self.check_all_downed(),
                        keys::IS_READY => {
                            let ready = self.store.get_bool(scope, keys::IS_READY, false);
                            self.emit(Signal::ReadyChanged { peer: owner, ready });
                        }
                        _ => {}
                    }
                }
            }
            PropertyScope::Session => {
                let has = |key: &str| changed.iter().any(|k| k == key);

                if has(keys::MATCH_STARTED)
                    && self
                        .store
                        .get_bool(PropertyScope::Session, keys::MATCH_STARTED, false)
                {
                    self.on_match_started();
                }
                if has(keys::SECURED_COUNT) {
                    let secured = self
                        .store
                        .get_int(PropertyScope::Session, keys::SECURED_COUNT, 0)
                        .max(0) as u32;
                    let required = self.required_from_mirror().unwrap_or(0);
                    self.emit(Signal::SecuredProgress { secured, required });
                }
                if has(keys::GAME_OVER) || has(keys::GAME_OVER_REASON) {
                    self.observe_terminal();
                }
            }
        }
    }

    fn required_from_mirror(&self) -> Option<u32> {
        self.store
            .get(PropertyScope::Session, keys::REQUIRED_SECURED)
            .and_then(PropertyValue::as_int)
            .map(|n| n.max(0) as u32)
    }

    fn on_match_started(&mut self) {
        let required = self.required_from_mirror();
        let duration = self.store.get_float(
            PropertyScope::Session,
            keys::MATCH_DURATION,
            self.config.match_duration_secs as f64,
        ) as f32;

        if self.outcome.start_clock(duration, required) {
            info!("Match started, {:?} to secure in {}s", required, duration);
            self.emit(Signal::MatchStarted {
                required: required.unwrap_or(0),
            });
        }
    }

    fn observe_terminal(&mut self) {
        if let Some(observed) = self.outcome.observe_terminal(&self.store) {
            info!("Outcome: won={} reason={:?}", observed.won, observed.reason);
            let text = observed.text();
            self.emit(Signal::Outcome {
                won: observed.won,
                reason: observed.reason,
                text,
            });
        }
    }

    fn check_all_downed(&mut self) {
        let is_authority = self.is_authority();
        let peers = self.elector.peers();
        self.outcome
            .check_all_downed(is_authority, &self.store, &peers, &mut self.outbox);
    }

    fn check_authority(&mut self) {
        let authority = self.elector.authority();
        let is_authority = self.is_authority();

        if authority != self.last_authority {
            info!("Authority is now {:?}", authority);
            self.last_authority = authority;
            self.emit(Signal::AuthorityChanged {
                authority,
                is_local: is_authority,
            });
        }

        if is_authority && !self.was_authority {
            self.outcome.adopt_from_mirror(&self.store);
            self.counted = self
                .world
                .entities()
                .filter(|e| e.finalized)
                .map(|e| e.id)
                .collect();
            self.despawn_requested.clear();
            self.check_all_downed();
        }
        self.was_authority = is_authority;
    }

    /// Marks the session as lost and raises the disconnected screen once
    pub fn connection_lost(&mut self, reason: &str) {
        self.connected = false;
        self.local_interaction = None;
        if self.disconnect_reported {
            debug!("Already disconnected: {}", reason);
            return;
        }
        warn!("Disconnected: {}", reason);
        self.disconnect_reported = true;
        self.emit(Signal::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Leaves the session
    pub fn disconnect(&mut self) {
        if self.connected {
            self.outbox.push(Packet::Disconnect);
        }
        self.connected = false;
    }

    // ------------------------------------------------------------------
    // Remote calls
    // ------------------------------------------------------------------

    fn dispatch(&mut self, sender: PeerId, action: Action) {
        debug!("{} from peer {}", action.name(), sender);

        match action {
            Action::GetConnected {
                subject,
                controller,
                duration,
            } => self.on_get_connected(subject, controller, duration),

            Action::ForceDetach { subject } => match self.attachments.detach(subject) {
                Some(link) => self.end_link(link, DetachCause::Released),
                None => debug!("{:?} already detached", subject),
            },

            Action::ReleaseNotice { subject } => self.finish_local_interaction(subject),

            Action::TransferOwnership { entity, new_owner } => {
                let new_owner = self.present_or_authority(new_owner);
                self.ledger.transfer_ownership(entity, new_owner);
            }

            Action::TransformUpdate { subject, transform } => {
                self.on_transform_update(sender, subject, transform)
            }

            Action::SpawnEntity { entity, position } => {
                if self.world.spawn_entity(entity, position) {
                    let owner = self.present_or_authority(sender);
                    self.ledger.register(entity, owner);
                    self.next_entity_id = self.next_entity_id.max(entity + 1);
                    self.emit(Signal::EntitySpawned { entity, position });
                }
            }

            Action::DespawnEntity { entity } => {
                if let Some(link) = self.attachments.detach(Subject::Entity(entity)) {
                    self.end_link(link, DetachCause::Removed);
                }
                if self.world.despawn_entity(entity).is_some() {
                    self.ledger.remove(entity);
                    self.zone_reports.remove(&entity);
                    self.counted.remove(&entity);
                    self.emit(Signal::EntityDespawned(entity));
                }
            }

            Action::EnteredGoalZone { entity } => {
                if self.is_authority() {
                    self.finalize_secured(entity);
                } else {
                    debug!("Goal-zone report for {} reached a non-authority", entity);
                }
            }

            Action::SetSecured { entity } => self.on_set_secured(entity),

            Action::LeftGoalZone { entity } => {
                if self.is_authority() {
                    self.release_secured(entity);
                } else {
                    debug!("Goal-zone exit for {} reached a non-authority", entity);
                }
            }

            Action::SetUnsecured { entity } => self.on_set_unsecured(entity),

            Action::Damage { amount } => match self.outcome.take_damage(amount) {
                DamageResult::Ignored => debug!("Damage ignored while down"),
                DamageResult::Hurt { health_percent } => {
                    self.emit(Signal::HealthPercent(health_percent))
                }
                DamageResult::WentDown => {
                    self.emit(Signal::HealthPercent(0.0));
                    self.go_down_local();
                }
            },

            Action::GoDown { peer } => self.on_go_down(peer),

            Action::Revive { peer } => {
                if sender == peer {
                    warn!("Peer {} tried to revive itself", peer);
                    return;
                }
                self.on_revive(peer);
            }

            Action::GuardedObjectDestroyed => {
                let is_authority = self.is_authority();
                self.outcome.decide(
                    is_authority,
                    &self.store,
                    &mut self.outbox,
                    Outcome::Lost(OutcomeReason::GuardedObjectDestroyed),
                );
            }
        }
    }

    /// Replayed calls can name peers that have left since. Whatever they
    /// owned belongs to the authority now.
    fn present_or_authority(&self, peer: PeerId) -> PeerId {
        if self.elector.contains(peer) {
            return peer;
        }
        self.elector.authority().unwrap_or(peer)
    }

    /// Structural validity of an attach request. Range is the requester's call.
    fn attachment_allowed(&self, subject: Subject, controller: PeerId) -> bool {
        if !self.elector.contains(controller) || self.outcome.is_downed(controller) {
            return false;
        }
        match subject {
            Subject::Avatar(peer) => {
                peer != controller
                    && self.world.avatar(peer).is_some()
                    && !self.outcome.is_downed(peer)
            }
            Subject::Entity(id) => self.world.entity(id).is_some(),
        }
    }

    fn on_get_connected(&mut self, subject: Subject, controller: PeerId, duration: f32) {
        if !self.attachment_allowed(subject, controller) {
            debug!("Refusing attach of {:?} to {}", subject, controller);
            if Some(controller) == self.local_peer() {
                self.finish_local_interaction(subject);
            }
            return;
        }

        match self.attachments.attach(subject, controller, duration) {
            AttachResult::AlreadyAttached => {}
            AttachResult::Attached { torn_down } => {
                for link in torn_down {
                    self.end_link(link, DetachCause::Replaced);
                }
                self.begin_link(subject, controller);
            }
        }
    }

    fn begin_link(&mut self, subject: Subject, controller: PeerId) {
        info!("{:?} attached to peer {}", subject, controller);

        if self.world.set_kinematic(subject, true) {
            self.emit(Signal::Kinematic {
                subject,
                kinematic: true,
            });
        }
        if let Some(slot) = self.world.carry_slot(controller) {
            self.world.set_transform(subject, slot);
        }

        match subject {
            Subject::Entity(entity) => {
                if let Some(target) = self.world.entity_mut(entity) {
                    target.state = EntityState::Carried {
                        carrier: controller,
                    };
                }
                self.emit(Signal::EntityCarried {
                    entity,
                    carrier: Some(controller),
                });
            }
            Subject::Avatar(peer) => {
                if Some(peer) == self.local_peer() {
                    self.carried_secs = None;
                    self.emit(Signal::ControlsLocked(true));
                }
            }
        }
    }

    fn end_link(&mut self, link: AttachmentLink, cause: DetachCause) {
        debug!("{:?} detached from {} ({:?})", link.subject, link.controller, cause);
        let local = self.local_peer();

        if self.world.set_kinematic(link.subject, false) {
            self.emit(Signal::Kinematic {
                subject: link.subject,
                kinematic: false,
            });
        }

        match link.subject {
            Subject::Entity(entity) => {
                let was_carried = match self.world.entity_mut(entity) {
                    Some(target) if matches!(target.state, EntityState::Carried { .. }) => {
                        target.state = if target.finalized {
                            EntityState::Secured
                        } else {
                            EntityState::Free
                        };
                        true
                    }
                    _ => false,
                };
                if was_carried {
                    self.emit(Signal::EntityCarried {
                        entity,
                        carrier: None,
                    });
                }
                // The owner publishes where the entity was dropped
                if self.ledger.is_owned_by_local_peer(entity, local) {
                    if let Some(transform) = self.world.transform_of(link.subject) {
                        self.invoke(
                            RpcTarget::AllPeers,
                            Action::TransformUpdate {
                                subject: link.subject,
                                transform,
                            },
                        );
                    }
                }
            }
            Subject::Avatar(peer) => {
                if Some(peer) == local {
                    self.carried_secs = None;
                    if !self.outcome.is_downed(peer) {
                        self.emit(Signal::ControlsLocked(false));
                    }
                }
            }
        }

        // A forced release waits for the explicit notice
        if Some(link.controller) == local && cause != DetachCause::Released {
            self.finish_local_interaction(link.subject);
        }
    }

    /// Ends the local controller's interaction and starts its cooldown
    fn finish_local_interaction(&mut self, subject: Subject) {
        if self.local_interaction != Some(subject) {
            debug!("No local interaction with {:?} to finish", subject);
            return;
        }
        self.local_interaction = None;
        self.attachments
            .start_cooldown(self.config.interact_cooldown_secs);
    }

    fn on_transform_update(&mut self, sender: PeerId, subject: Subject, transform: Transform) {
        if Some(sender) == self.local_peer() || self.attachments.is_attached(subject) {
            return;
        }
        let accepted = match subject {
            Subject::Avatar(peer) => peer == sender,
            Subject::Entity(entity) => self.ledger.accepts_update_from(entity, sender),
        };
        if accepted {
            self.world.set_transform(subject, transform);
        } else {
            debug!("Ignoring transform of {:?} from non-owner {}", subject, sender);
        }
    }

    fn on_set_secured(&mut self, entity: EntityId) {
        match self.world.entity(entity) {
            Some(target) if !target.finalized => {}
            _ => return,
        }

        if let Some(link) = self.attachments.detach(Subject::Entity(entity)) {
            self.end_link(link, DetachCause::Removed);
        }
        if let Some(target) = self.world.entity_mut(entity) {
            target.state = EntityState::Secured;
            target.finalized = true;
        }
        self.zone_reports.remove(&entity);

        info!("Entity {} secured", entity);
        self.emit(Signal::EntitySecured(entity));
    }

    fn on_set_unsecured(&mut self, entity: EntityId) {
        let Some(target) = self.world.entity_mut(entity) else {
            return;
        };
        if !target.finalized {
            return;
        }
        target.finalized = false;
        if target.state == EntityState::Secured {
            target.state = EntityState::Free;
        }
        self.zone_reports.remove(&entity);

        info!("Entity {} left the goal zone", entity);
        self.emit(Signal::EntityUnsecured(entity));
    }

    /// Authority: counts a goal-zone entry exactly once
    fn finalize_secured(&mut self, entity: EntityId) {
        let carrier = match self.world.entity(entity) {
            Some(target) if !self.counted.contains(&entity) => match target.state {
                EntityState::Carried { carrier } => Some(carrier),
                _ => None,
            },
            Some(_) => {
                debug!("Entity {} already counted", entity);
                return;
            }
            None => {
                debug!("Goal-zone report for unknown entity {}", entity);
                return;
            }
        };
        self.counted.insert(entity);

        let is_authority = self.is_authority();
        self.outcome
            .record_secured(is_authority, &self.store, &mut self.outbox);

        let subject = Subject::Entity(entity);
        if let Some(carrier) = carrier {
            self.invoke(RpcTarget::AllPeers, Action::ForceDetach { subject });
            self.invoke(
                RpcTarget::SpecificPeer(carrier),
                Action::ReleaseNotice { subject },
            );
        }
        self.invoke(RpcTarget::AllBuffered, Action::SetSecured { entity });
    }

    /// Authority: uncounts a goal-zone exit exactly once
    fn release_secured(&mut self, entity: EntityId) {
        if !self.counted.remove(&entity) {
            debug!("Entity {} is not counted", entity);
            return;
        }

        let is_authority = self.is_authority();
        self.outcome
            .record_unsecured(is_authority, &self.store, &mut self.outbox);
        self.invoke(RpcTarget::AllBuffered, Action::SetUnsecured { entity });
    }

    fn go_down_local(&mut self) {
        let Some(local) = self.local_peer() else {
            return;
        };
        info!("Going down");
        self.invoke(RpcTarget::AllPeers, Action::GoDown { peer: local });
        self.write(
            PropertyScope::Peer(local),
            vec![(keys::IS_ALIVE.to_string(), PropertyValue::Bool(false))],
        );
    }

    fn on_go_down(&mut self, peer: PeerId) {
        if !self.outcome.apply_go_down(peer) {
            return;
        }
        self.emit(Signal::Downed { peer, downed: true });

        for link in self.attachments.detach_peer(peer) {
            self.end_link(link, DetachCause::Removed);
        }

        if Some(peer) == self.local_peer() {
            self.emit(Signal::HealthPercent(0.0));
            self.emit(Signal::ControlsLocked(true));
        }
    }

    fn on_revive(&mut self, peer: PeerId) {
        if !self.outcome.apply_revive(peer) {
            return;
        }

        if let Some(spawn) = self.world.avatar(peer).map(|avatar| avatar.spawn_point) {
            self.world
                .set_transform(Subject::Avatar(peer), Transform::at(spawn));
            self.emit(Signal::Teleported {
                peer,
                position: spawn,
            });
        }
        self.emit(Signal::Downed {
            peer,
            downed: false,
        });

        if Some(peer) == self.local_peer() {
            self.emit(Signal::HealthPercent(self.outcome.health_percent()));
            self.emit(Signal::ControlsLocked(false));
            self.write(
                PropertyScope::Peer(peer),
                vec![(keys::IS_ALIVE.to_string(), PropertyValue::Bool(true))],
            );
        }
    }

    // ------------------------------------------------------------------
    // Game logic entry points
    // ------------------------------------------------------------------

    /// Combat hit on `target`. Only the target computes its own health.
    pub fn deal_damage(&mut self, target: PeerId, amount: f32) -> bool {
        self.invoke(RpcTarget::SpecificPeer(target), Action::Damage { amount })
    }

    /// Replicated write on behalf of game logic, visible locally once echoed
    pub fn set_properties(&mut self, scope: PropertyScope, props: Vec<(String, PropertyValue)>) {
        self.write(scope, props);
    }

    pub fn report_guarded_object_destroyed(&mut self) -> bool {
        self.invoke(RpcTarget::AuthorityPeer, Action::GuardedObjectDestroyed)
    }

    // ------------------------------------------------------------------
    // Input intents
    // ------------------------------------------------------------------

    pub fn handle_intent(&mut self, intent: Intent) -> bool {
        if !self.connected {
            debug!("Ignoring {:?} while disconnected", intent);
            return false;
        }

        match intent {
            Intent::Interact(subject) => self.try_interact(subject),
            Intent::CancelInteract => self.cancel_interact(),
            Intent::Revive(peer) => self.try_revive(peer),
            Intent::Move(transform) => self.move_local(transform),
            Intent::ToggleReady => self.toggle_ready(),
            Intent::StartMatch => self.try_start_match(),
        }
    }

    fn try_interact(&mut self, subject: Subject) -> bool {
        let Some(local) = self.local_peer() else {
            return false;
        };

        if self.outcome.is_downed(local)
            || self.local_interaction.is_some()
            || self.attachments.cooldown_active()
            || self.attachments.is_attached(Subject::Avatar(local))
            || self.outcome.shown().is_some()
        {
            debug!("Interaction unavailable");
            return false;
        }
        if self.attachments.is_attached(subject) || !self.attachment_allowed(subject, local) {
            debug!("Cannot interact with {:?}", subject);
            return false;
        }

        self.local_interaction = Some(subject);
        self.emit(Signal::InteractionAvailable(false));

        // Buffered so late joiners agree on the owner
        if let Subject::Entity(entity) = subject {
            self.invoke(
                RpcTarget::AllBuffered,
                Action::TransferOwnership {
                    entity,
                    new_owner: local,
                },
            );
        }
        self.invoke(
            RpcTarget::AllPeers,
            Action::GetConnected {
                subject,
                controller: local,
                duration: self.config.connect_duration_secs,
            },
        )
    }

    fn cancel_interact(&mut self) -> bool {
        let Some(subject) = self.local_interaction.take() else {
            return false;
        };
        self.attachments
            .start_cooldown(self.config.interact_cooldown_secs);
        self.invoke(RpcTarget::AllPeers, Action::ForceDetach { subject })
    }

    fn try_revive(&mut self, peer: PeerId) -> bool {
        let Some(local) = self.local_peer() else {
            return false;
        };
        if peer == local || !self.outcome.is_downed(peer) || self.outcome.is_downed(local) {
            debug!("Cannot revive peer {}", peer);
            return false;
        }
        self.invoke(RpcTarget::AllPeers, Action::Revive { peer })
    }

    fn move_local(&mut self, transform: Transform) -> bool {
        let Some(local) = self.local_peer() else {
            return false;
        };
        let subject = Subject::Avatar(local);
        if self.outcome.is_downed(local) || self.attachments.is_attached(subject) {
            return false;
        }

        self.world.set_transform(subject, transform);
        self.invoke(
            RpcTarget::AllPeers,
            Action::TransformUpdate { subject, transform },
        );
        self.check_local_kill_plane();
        true
    }

    fn toggle_ready(&mut self) -> bool {
        let Some(local) = self.local_peer() else {
            return false;
        };
        if self.is_authority() {
            debug!("The authority starts the match instead of readying up");
            return false;
        }

        let scope = PropertyScope::Peer(local);
        let ready = !self.store.get_bool(scope, keys::IS_READY, false);
        self.write(scope, vec![(keys::IS_READY.to_string(), PropertyValue::Bool(ready))]);
        true
    }

    /// Every peer other than the authority has `IsReady == true`
    pub fn all_others_ready(&self) -> bool {
        let local = self.local_peer();
        self.elector
            .peers()
            .into_iter()
            .filter(|peer| Some(*peer) != local)
            .all(|peer| {
                self.store
                    .get_bool(PropertyScope::Peer(peer), keys::IS_READY, false)
            })
    }

    fn try_start_match(&mut self) -> bool {
        if !self.is_authority() {
            debug!("Only the authority can start the match");
            return false;
        }
        if self.outcome.clock_running()
            || self
                .store
                .get_bool(PropertyScope::Session, keys::MATCH_STARTED, false)
        {
            return false;
        }
        if !self.config.testing_mode && !self.all_others_ready() {
            info!("Not every peer is ready");
            return false;
        }

        let required = match self.config.required_secured {
            RequiredSecured::Fixed(n) => n,
            RequiredSecured::Range { min, max } => self.rng.gen_range(min..=max),
        };
        self.outcome.begin_match(required);

        self.write(
            PropertyScope::Session,
            vec![
                (keys::REQUIRED_SECURED.to_string(), PropertyValue::from(required)),
                (keys::SECURED_COUNT.to_string(), PropertyValue::Int(0)),
                (
                    keys::MATCH_DURATION.to_string(),
                    PropertyValue::Float(self.config.match_duration_secs as f64),
                ),
                (keys::MATCH_STARTED.to_string(), PropertyValue::Bool(true)),
            ],
        );

        for _ in 0..self.config.rescue_target_count {
            let entity = self.next_entity_id;
            self.next_entity_id += 1;
            let position = self.world.random_spawn_position(&mut self.rng);
            self.invoke(
                RpcTarget::AllBuffered,
                Action::SpawnEntity { entity, position },
            );
        }

        info!(
            "Starting match: {} of {} targets to secure",
            required, self.config.rescue_target_count
        );
        true
    }

    // ------------------------------------------------------------------
    // Simulation tick
    // ------------------------------------------------------------------

    /// Advances every local timer by `dt` seconds of simulated time
    pub fn tick(&mut self, dt: f32) {
        if !self.connected {
            return;
        }

        for link in self.attachments.advance(dt) {
            self.end_link(link, DetachCause::Expired);
        }
        if self.attachments.advance_cooldown(dt) && self.local_interaction.is_none() {
            self.emit(Signal::InteractionAvailable(true));
        }

        self.snap_attached();
        self.update_carried_countdown();
        self.poll_goal_zone(dt);

        if self.is_authority() {
            self.sweep_kill_plane();
        }
        self.check_local_kill_plane();

        let is_authority = self.is_authority();
        if let Some(secs) =
            self.outcome
                .advance_clock(dt, is_authority, &self.store, &mut self.outbox)
        {
            self.emit(Signal::MatchClock(secs));
        }
    }

    fn snap_attached(&mut self) {
        let links: Vec<(Subject, PeerId)> = self
            .attachments
            .links()
            .map(|link| (link.subject, link.controller))
            .collect();

        for (subject, controller) in links {
            if let Some(slot) = self.world.carry_slot(controller) {
                self.world.set_transform(subject, slot);
            }
        }
    }

    fn update_carried_countdown(&mut self) {
        let Some(local) = self.local_peer() else {
            return;
        };
        let Some(secs) = self
            .attachments
            .link(Subject::Avatar(local))
            .map(|link| link.countdown.whole_seconds())
        else {
            return;
        };

        if self.carried_secs != Some(secs) {
            self.carried_secs = Some(secs);
            self.emit(Signal::CarriedCountdown(secs));
        }
    }

    fn poll_goal_zone(&mut self, dt: f32) {
        self.zone_reports.retain(|_, retry| !retry.advance(dt));

        if !self.zone_poll.advance(dt) {
            return;
        }
        self.zone_poll.reset();

        let Some(local) = self.local_peer() else {
            return;
        };
        for entity in self.ledger.owned_by(local) {
            let Some(finalized) = self.world.entity(entity).map(|e| e.finalized) else {
                continue;
            };
            if self.zone_reports.contains_key(&entity) {
                continue;
            }

            let report = match (finalized, self.world.in_goal_zone(entity)) {
                (false, true) => Action::EnteredGoalZone { entity },
                (true, false) => Action::LeftGoalZone { entity },
                _ => continue,
            };
            debug!("Reporting {} for entity {}", report.name(), entity);
            self.invoke(RpcTarget::AuthorityPeer, report);
            self.zone_reports
                .insert(entity, Countdown::new(ZONE_REPORT_RETRY_SECS));
        }
    }

    fn sweep_kill_plane(&mut self) {
        let fallen: Vec<EntityId> = self
            .world
            .entities()
            .filter(|e| {
                self.world.below_kill_plane(e.transform.position)
                    && !self.despawn_requested.contains(&e.id)
            })
            .map(|e| e.id)
            .collect();

        for entity in fallen {
            info!("Entity {} fell out of the world", entity);
            if self.counted.remove(&entity) {
                let is_authority = self.is_authority();
                self.outcome
                    .record_unsecured(is_authority, &self.store, &mut self.outbox);
            }
            self.despawn_requested.insert(entity);
            self.invoke(RpcTarget::AllBuffered, Action::DespawnEntity { entity });
        }
    }

    fn check_local_kill_plane(&mut self) {
        let Some(local) = self.local_peer() else {
            return;
        };
        let below = self
            .world
            .avatar(local)
            .map_or(false, |a| self.world.below_kill_plane(a.transform.position));

        if below && self.outcome.force_down() {
            self.emit(Signal::HealthPercent(0.0));
            self.go_down_local();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Vec3;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn snapshot(peers: &[(PeerId, u64)]) -> SessionSnapshot {
        SessionSnapshot {
            session_name: "Room4242".to_string(),
            peers: peers
                .iter()
                .map(|(id, seniority)| PeerInfo {
                    id: *id,
                    display_name: format!("peer{}", id),
                    seniority: *seniority,
                })
                .collect(),
            ..SessionSnapshot::default()
        }
    }

    fn connected(local: PeerId, peers: &[(PeerId, u64)]) -> SessionContext {
        let mut session = SessionContext::new(SessionConfig::default(), "tester", "Room4242");
        session.handle_packet(Packet::Connected {
            peer_id: local,
            snapshot: snapshot(peers),
        });
        session.drain_outgoing();
        session.drain_signals();
        session
    }

    fn remote(sender: PeerId, action: Action) -> Packet {
        Packet::RemoteCall { sender, action }
    }

    #[test]
    fn test_connect_packet_carries_version_and_capacity() {
        let session = SessionContext::new(SessionConfig::default(), "alice", "Room1001");
        match session.connect_packet() {
            Packet::Connect {
                client_version,
                session_name,
                capacity,
                ..
            } => {
                assert_eq!(client_version, PROTOCOL_VERSION);
                assert_eq!(session_name, "Room1001");
                assert_eq!(capacity, 3);
            }
            _ => panic!("Wrong packet type"),
        }
    }

    #[test]
    fn test_join_writes_own_alive_flag() {
        let mut session = SessionContext::new(SessionConfig::default(), "tester", "Room4242");
        session.handle_packet(Packet::Connected {
            peer_id: 2,
            snapshot: snapshot(&[(1, 0), (2, 1)]),
        });

        let packets = session.drain_outgoing();
        match &packets[0] {
            Packet::SetProperties { scope, props } => {
                assert_eq!(*scope, PropertyScope::Peer(2));
                assert_eq!(props[0], (keys::IS_ALIVE.to_string(), PropertyValue::Bool(true)));
            }
            _ => panic!("Wrong packet type"),
        }
        assert!(!session.is_authority());
        assert!(session.drain_signals().contains(&Signal::PeerJoined(1)));
    }

    #[test]
    fn test_duplicate_go_down_emits_once() {
        let mut session = connected(1, &[(1, 0), (2, 1)]);

        session.handle_packet(remote(2, Action::GoDown { peer: 2 }));
        session.handle_packet(remote(2, Action::GoDown { peer: 2 }));

        let downed: Vec<Signal> = session
            .drain_signals()
            .into_iter()
            .filter(|s| matches!(s, Signal::Downed { .. }))
            .collect();
        assert_eq!(downed.len(), 1);
    }

    #[test]
    fn test_lethal_damage_goes_down_once() {
        let mut session = connected(2, &[(1, 0), (2, 1)]);

        session.handle_packet(remote(1, Action::Damage { amount: 150.0 }));
        session.handle_packet(remote(1, Action::Damage { amount: 150.0 }));

        let packets = session.drain_outgoing();
        let go_downs = packets
            .iter()
            .filter(|p| {
                matches!(
                    p,
                    Packet::Invoke {
                        action: Action::GoDown { peer: 2 },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(go_downs, 1);
        assert!(packets.iter().any(|p| matches!(
            p,
            Packet::SetProperties {
                scope: PropertyScope::Peer(2),
                ..
            }
        )));
    }

    #[test]
    fn test_cannot_interact_with_downed_avatar() {
        let mut session = connected(1, &[(1, 0), (2, 1)]);
        session.handle_packet(remote(2, Action::GoDown { peer: 2 }));
        session.drain_outgoing();

        assert!(!session.handle_intent(Intent::Interact(Subject::Avatar(2))));
        assert!(session.drain_outgoing().is_empty());
    }

    #[test]
    fn test_refused_attach_frees_local_interaction() {
        let mut session = connected(1, &[(1, 0), (2, 1)]);
        assert!(session.handle_intent(Intent::Interact(Subject::Avatar(2))));
        assert_eq!(session.local_interaction(), Some(Subject::Avatar(2)));
        assert!(!session.handle_intent(Intent::Interact(Subject::Avatar(2))));

        // The target goes down before our own request comes back
        session.handle_packet(remote(2, Action::GoDown { peer: 2 }));
        session.handle_packet(remote(
            1,
            Action::GetConnected {
                subject: Subject::Avatar(2),
                controller: 1,
                duration: 15.0,
            },
        ));

        assert_eq!(session.local_interaction(), None);
        assert!(!session.attachments().is_attached(Subject::Avatar(2)));
        assert!(session.attachments().cooldown_active());
        session.drain_signals();

        session.tick(5.1);
        assert!(session
            .drain_signals()
            .contains(&Signal::InteractionAvailable(true)));
    }

    #[test]
    fn test_refusal_of_remote_request_leaves_local_interaction() {
        let mut session = connected(1, &[(1, 0), (2, 1), (3, 2)]);
        assert!(session.handle_intent(Intent::Interact(Subject::Avatar(2))));

        session.handle_packet(remote(
            3,
            Action::GetConnected {
                subject: Subject::Avatar(3),
                controller: 3,
                duration: 15.0,
            },
        ));
        assert_eq!(session.local_interaction(), Some(Subject::Avatar(2)));
        assert!(!session.attachments().cooldown_active());
    }

    #[test]
    fn test_replayed_spawn_from_departed_peer_owned_by_authority() {
        let mut session = connected(3, &[(2, 1), (3, 2)]);
        session.handle_packet(remote(
            1,
            Action::SpawnEntity {
                entity: 1,
                position: Vec3::ZERO,
            },
        ));
        session.handle_packet(remote(
            2,
            Action::TransferOwnership {
                entity: 1,
                new_owner: 7,
            },
        ));

        assert_eq!(session.ledger().owner(1), Some(2));
    }

    #[test]
    fn test_cannot_revive_self_or_alive_peer() {
        let mut session = connected(1, &[(1, 0), (2, 1)]);

        assert!(!session.handle_intent(Intent::Revive(1)));
        assert!(!session.handle_intent(Intent::Revive(2)));

        session.handle_packet(remote(2, Action::GoDown { peer: 2 }));
        assert!(session.handle_intent(Intent::Revive(2)));
    }

    #[test]
    fn test_attach_expiry_unlocks_carried_peer() {
        let mut session = connected(2, &[(1, 0), (2, 1)]);
        session.handle_packet(remote(
            1,
            Action::GetConnected {
                subject: Subject::Avatar(2),
                controller: 1,
                duration: 2.0,
            },
        ));
        session.tick(0.1);

        let signals = session.drain_signals();
        assert!(signals.contains(&Signal::ControlsLocked(true)));
        assert!(signals.contains(&Signal::CarriedCountdown(2)));
        assert!(!session.handle_intent(Intent::Move(Transform::at(Vec3::ZERO))));

        session.tick(2.0);
        assert!(session.drain_signals().contains(&Signal::ControlsLocked(false)));
        assert!(!session.attachments().is_attached(Subject::Avatar(2)));
    }

    #[test]
    fn test_spawn_is_idempotent_and_owned_by_spawner() {
        let mut session = connected(2, &[(1, 0), (2, 1)]);
        let spawn = Action::SpawnEntity {
            entity: 5,
            position: Vec3::ZERO,
        };

        session.handle_packet(remote(1, spawn.clone()));
        session.handle_packet(remote(1, spawn));

        assert_eq!(session.ledger().owner(5), Some(1));
        let spawned = session
            .drain_signals()
            .into_iter()
            .filter(|s| matches!(s, Signal::EntitySpawned { .. }))
            .count();
        assert_eq!(spawned, 1);
    }

    #[test]
    fn test_transform_from_non_owner_ignored() {
        let mut session = connected(3, &[(1, 0), (2, 1), (3, 2)]);
        session.handle_packet(remote(
            1,
            Action::SpawnEntity {
                entity: 1,
                position: Vec3::ZERO,
            },
        ));

        let moved = Transform::at(Vec3::new(4.0, 0.0, 0.0));
        session.handle_packet(remote(
            2,
            Action::TransformUpdate {
                subject: Subject::Entity(1),
                transform: moved,
            },
        ));
        assert_eq!(session.world().transform_of(Subject::Entity(1)), Some(Transform::at(Vec3::ZERO)));

        session.handle_packet(remote(
            1,
            Action::TransformUpdate {
                subject: Subject::Entity(1),
                transform: moved,
            },
        ));
        assert_eq!(session.world().transform_of(Subject::Entity(1)), Some(moved));
    }

    #[test]
    fn test_authority_needs_everyone_ready() {
        let mut session = connected(1, &[(1, 0), (2, 1)]);

        assert!(!session.handle_intent(Intent::StartMatch));

        session.handle_packet(Packet::PropertiesChanged {
            scope: PropertyScope::Peer(2),
            writer: 2,
            props: vec![(keys::IS_READY.to_string(), PropertyValue::Bool(true))],
        });
        assert!(session.handle_intent(Intent::StartMatch));

        let spawns = session
            .drain_outgoing()
            .into_iter()
            .filter(|p| {
                matches!(
                    p,
                    Packet::Invoke {
                        target: RpcTarget::AllBuffered,
                        action: Action::SpawnEntity { .. }
                    }
                )
            })
            .count();
        assert_eq!(spawns, 4);
    }

    #[test]
    fn test_mock_predicate_blocks_authority_writes() {
        let flag = Arc::new(AtomicBool::new(false));

        struct Flag(Arc<AtomicBool>);
        impl AuthorityPredicate for Flag {
            fn is_authority(&self) -> bool {
                self.0.load(Ordering::SeqCst)
            }
        }

        let mut session = SessionContext::new(SessionConfig::default(), "solo", "Room1")
            .with_authority_predicate(Box::new(Flag(Arc::clone(&flag))));
        session.handle_packet(Packet::Connected {
            peer_id: 1,
            snapshot: snapshot(&[(1, 0)]),
        });
        session.drain_outgoing();

        let all_downed = Packet::PropertiesChanged {
            scope: PropertyScope::Peer(1),
            writer: 1,
            props: vec![(keys::IS_ALIVE.to_string(), PropertyValue::Bool(false))],
        };
        session.handle_packet(all_downed.clone());
        assert!(session.drain_outgoing().is_empty());

        flag.store(true, Ordering::SeqCst);
        session.handle_packet(all_downed);
        assert_eq!(session.drain_outgoing().len(), 2);
    }

    #[test]
    fn test_intents_ignored_while_disconnected() {
        let mut session = SessionContext::new(SessionConfig::default(), "x", "y");
        assert!(!session.handle_intent(Intent::ToggleReady));

        session.handle_packet(Packet::Disconnected {
            reason: "Timed out".into(),
        });
        session.connection_lost("Connection closed by relay");
        assert_eq!(
            session.drain_signals(),
            vec![Signal::Disconnected {
                reason: "Timed out".into()
            }]
        );
    }
}
