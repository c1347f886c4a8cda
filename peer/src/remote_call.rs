//! Outbound half of remote procedure calls.
//!
//! Inbound calls are dispatched by the session context through an exhaustive
//! match over [`Action`]. Every handler there is a state-guarded transition,
//! so a duplicate delivery is a no-op.

use crate::authority::AuthorityElector;
use crate::outbox::Outbox;
use log::debug;
use shared::{Action, RpcTarget};

#[derive(Debug, Default)]
pub struct RemoteCallRouter {
    sent: u64,
    dropped: u64,
}

impl RemoteCallRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a call. Calls to a specific peer that is not in the local
    /// roster are dropped, never queued for later.
    pub fn invoke(
        &mut self,
        outbox: &mut Outbox,
        roster: &AuthorityElector,
        target: RpcTarget,
        action: Action,
    ) -> bool {
        if let RpcTarget::SpecificPeer(peer_id) = target {
            if !roster.contains(peer_id) {
                debug!("Dropping {} for absent peer {}", action.name(), peer_id);
                self.dropped += 1;
                return false;
            }
        }

        debug!("Invoking {} on {:?}", action.name(), target);
        outbox.invoke(target, action);
        self.sent += 1;
        true
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Packet, PeerInfo, Subject};

    fn roster() -> AuthorityElector {
        let mut elector = AuthorityElector::new();
        elector.add_peer(&PeerInfo {
            id: 1,
            display_name: "a".into(),
            seniority: 0,
        });
        elector.set_local(1);
        elector
    }

    #[test]
    fn test_invoke_queues_call() {
        let mut router = RemoteCallRouter::new();
        let mut outbox = Outbox::new();

        assert!(router.invoke(&mut outbox, &roster(), RpcTarget::AllPeers, Action::Revive { peer: 2 }));
        match &outbox.packets()[0] {
            Packet::Invoke { target, action } => {
                assert_eq!(*target, RpcTarget::AllPeers);
                assert_eq!(*action, Action::Revive { peer: 2 });
            }
            _ => panic!("Wrong packet type queued"),
        }
    }

    #[test]
    fn test_invoke_to_absent_peer_dropped() {
        let mut router = RemoteCallRouter::new();
        let mut outbox = Outbox::new();

        let sent = router.invoke(
            &mut outbox,
            &roster(),
            RpcTarget::SpecificPeer(9),
            Action::ReleaseNotice {
                subject: Subject::Entity(1),
            },
        );

        assert!(!sent);
        assert!(outbox.is_empty());
        assert_eq!(router.dropped(), 1);
        assert_eq!(router.sent(), 0);
    }
}
