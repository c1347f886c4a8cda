use shared::{Action, Packet, PropertyScope, PropertyValue, RpcTarget};

/// Packets queued by the session core for the relay, in send order.
#[derive(Debug, Default)]
pub struct Outbox {
    packets: Vec<Packet>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    pub fn set_properties(&mut self, scope: PropertyScope, props: Vec<(String, PropertyValue)>) {
        self.packets.push(Packet::SetProperties { scope, props });
    }

    pub fn invoke(&mut self, target: RpcTarget, action: Action) {
        self.packets.push(Packet::Invoke { target, action });
    }

    pub fn drain(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.packets)
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let mut outbox = Outbox::new();
        outbox.invoke(RpcTarget::AllPeers, Action::GoDown { peer: 1 });
        outbox.set_properties(
            PropertyScope::Peer(1),
            vec![("IsAlive".to_string(), PropertyValue::Bool(false))],
        );

        let packets = outbox.drain();
        assert_eq!(packets.len(), 2);
        assert!(matches!(packets[0], Packet::Invoke { .. }));
        assert!(matches!(packets[1], Packet::SetProperties { .. }));
        assert!(outbox.is_empty());
    }
}
