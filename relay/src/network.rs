//! Relay network layer handling TCP connections and session routing

use crate::room::{Delivery, Room};
use log::{debug, error, info, warn};
use shared::codec::{read_packet, write_packet};
use shared::{Packet, PeerId, SyncError, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Messages sent from connection tasks to the main relay loop
#[derive(Debug)]
pub enum ServerMessage {
    Accepted {
        peer_id: PeerId,
        addr: SocketAddr,
        writer: mpsc::UnboundedSender<Packet>,
    },
    PacketReceived {
        peer_id: PeerId,
        packet: Packet,
    },
    ConnectionClosed {
        peer_id: PeerId,
    },
    Shutdown,
}

/// One accepted TCP connection
struct Connection {
    addr: SocketAddr,
    room: Option<String>,
    writer: mpsc::UnboundedSender<Packet>,
}

/// Relay hosting named sessions
pub struct Relay {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    rooms: HashMap<String, Room>,
    connections: HashMap<PeerId, Connection>,
    max_peers: usize,
    peer_timeout: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Relay {
    pub async fn bind(
        addr: &str,
        max_peers: usize,
        peer_timeout: Duration,
    ) -> Result<Self, SyncError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Relay listening on {}", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Relay {
            listener: Some(listener),
            local_addr,
            rooms: HashMap::new(),
            connections: HashMap::new(),
            max_peers: max_peers.max(1),
            peer_timeout,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sender into the main loop, used to request a shutdown
    pub fn handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that accepts connections and assigns peer ids
    fn spawn_acceptor(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            // Ids are never reused for the lifetime of the relay
            let mut next_peer_id: PeerId = 1;

            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }

                        let peer_id = next_peer_id;
                        next_peer_id += 1;

                        let (reader, writer) = stream.into_split();
                        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

                        if server_tx
                            .send(ServerMessage::Accepted {
                                peer_id,
                                addr,
                                writer: writer_tx,
                            })
                            .is_err()
                        {
                            break;
                        }

                        Self::spawn_connection_reader(peer_id, reader, server_tx.clone());
                        Self::spawn_connection_writer(peer_id, writer, writer_rx);
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that decodes frames from one connection
    fn spawn_connection_reader(
        peer_id: PeerId,
        mut reader: OwnedReadHalf,
        server_tx: mpsc::UnboundedSender<ServerMessage>,
    ) {
        tokio::spawn(async move {
            loop {
                match read_packet(&mut reader).await {
                    Ok(Some(packet)) => {
                        if server_tx
                            .send(ServerMessage::PacketReceived { peer_id, packet })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Dropping connection of peer {}: {}", peer_id, e);
                        break;
                    }
                }
            }

            let _ = server_tx.send(ServerMessage::ConnectionClosed { peer_id });
        });
    }

    /// Spawns task that writes queued packets to one connection
    fn spawn_connection_writer(
        peer_id: PeerId,
        mut writer: OwnedWriteHalf,
        mut writer_rx: mpsc::UnboundedReceiver<Packet>,
    ) {
        tokio::spawn(async move {
            while let Some(packet) = writer_rx.recv().await {
                if let Err(e) = write_packet(&mut writer, &packet).await {
                    error!("Failed to send to peer {}: {}", peer_id, e);
                    break;
                }
            }
        });
    }

    fn send_to(&self, peer_id: PeerId, packet: Packet) {
        if let Some(connection) = self.connections.get(&peer_id) {
            if connection.writer.send(packet).is_err() {
                debug!("Writer for peer {} already closed", peer_id);
            }
        }
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.send_to(delivery.to, delivery.packet);
        }
    }

    fn room_of(&self, peer_id: PeerId) -> Option<String> {
        self.connections
            .get(&peer_id)
            .and_then(|connection| connection.room.clone())
    }

    /// Removes a peer from its session, dropping the session once empty
    fn leave_room(&mut self, peer_id: PeerId) {
        let Some(name) = self.room_of(peer_id) else {
            return;
        };
        if let Some(connection) = self.connections.get_mut(&peer_id) {
            connection.room = None;
        }

        let mut deliveries = Vec::new();
        if let Some(room) = self.rooms.get_mut(&name) {
            deliveries = room.leave(peer_id);
            if room.is_empty() {
                info!("Session {} closed", name);
                self.rooms.remove(&name);
            }
        }
        self.deliver(deliveries);
    }

    fn handle_connect(
        &mut self,
        peer_id: PeerId,
        client_version: u32,
        display_name: String,
        session_name: String,
        capacity: usize,
    ) {
        if client_version != PROTOCOL_VERSION {
            let reason = SyncError::ProtocolMismatch {
                peer: client_version,
                relay: PROTOCOL_VERSION,
            }
            .to_string();
            warn!("Peer {}: {}", peer_id, reason);
            self.send_to(peer_id, Packet::Disconnected { reason });
            return;
        }

        if self.room_of(peer_id).is_some() {
            warn!("Peer {} is already in a session", peer_id);
            return;
        }

        let max_peers = self.max_peers;
        let room = self.rooms.entry(session_name.clone()).or_insert_with(|| {
            let capacity = capacity.clamp(1, max_peers);
            info!("Session {} created with capacity {}", session_name, capacity);
            Room::new(&session_name, capacity)
        });

        match room.join(peer_id, &display_name) {
            Ok(deliveries) => {
                if let Some(connection) = self.connections.get_mut(&peer_id) {
                    connection.room = Some(session_name);
                }
                self.deliver(deliveries);
            }
            Err(e) => {
                info!("Refusing peer {}: {}", peer_id, e);
                self.send_to(
                    peer_id,
                    Packet::Disconnected {
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    /// Routes one packet received from a peer
    fn handle_packet(&mut self, peer_id: PeerId, packet: Packet) {
        match packet {
            Packet::Connect {
                client_version,
                display_name,
                session_name,
                capacity,
            } => {
                self.handle_connect(peer_id, client_version, display_name, session_name, capacity);
            }

            Packet::SetProperties { scope, props } => {
                let Some(name) = self.room_of(peer_id) else {
                    warn!("Peer {} wrote properties outside a session", peer_id);
                    return;
                };
                if let Some(room) = self.rooms.get_mut(&name) {
                    room.touch(peer_id);
                    let deliveries = room.set_properties(peer_id, scope, props);
                    self.deliver(deliveries);
                }
            }

            Packet::Invoke { target, action } => {
                let Some(name) = self.room_of(peer_id) else {
                    warn!("Peer {} invoked {} outside a session", peer_id, action.name());
                    return;
                };
                if let Some(room) = self.rooms.get_mut(&name) {
                    room.touch(peer_id);
                    let deliveries = room.invoke(peer_id, target, action);
                    self.deliver(deliveries);
                }
            }

            Packet::Heartbeat => {
                if let Some(name) = self.room_of(peer_id) {
                    if let Some(room) = self.rooms.get_mut(&name) {
                        room.touch(peer_id);
                    }
                }
            }

            Packet::Disconnect => {
                self.leave_room(peer_id);
            }

            other => {
                warn!("Unexpected packet from peer {}: {:?}", peer_id, other);
            }
        }
    }

    /// Drops peers that stopped sending heartbeats
    fn sweep_timeouts(&mut self) {
        let mut expired_peers = Vec::new();
        let mut deliveries = Vec::new();

        for room in self.rooms.values_mut() {
            let (expired, announcements) = room.expire_idle(self.peer_timeout);
            expired_peers.extend(expired);
            deliveries.extend(announcements);
        }
        self.rooms.retain(|name, room| {
            if room.is_empty() {
                info!("Session {} closed", name);
            }
            !room.is_empty()
        });

        for peer_id in expired_peers {
            info!("Peer {} timed out", peer_id);
            self.send_to(
                peer_id,
                Packet::Disconnected {
                    reason: "Timed out".to_string(),
                },
            );
            self.connections.remove(&peer_id);
        }
        self.deliver(deliveries);
    }

    /// Main relay loop
    pub async fn run(&mut self) -> Result<(), SyncError> {
        self.spawn_acceptor();

        let mut sweep_interval = interval(Duration::from_secs(1));

        info!("Relay started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::Accepted { peer_id, addr, writer }) => {
                            debug!("Peer {} connected from {}", peer_id, addr);
                            self.connections.insert(peer_id, Connection { addr, room: None, writer });
                        },
                        Some(ServerMessage::PacketReceived { peer_id, packet }) => {
                            self.handle_packet(peer_id, packet);
                        },
                        Some(ServerMessage::ConnectionClosed { peer_id }) => {
                            self.leave_room(peer_id);
                            if let Some(connection) = self.connections.remove(&peer_id) {
                                debug!("Peer {} at {} closed its connection", peer_id, connection.addr);
                            }
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Relay shutting down");
                            break;
                        }
                    }
                },

                _ = sweep_interval.tick() => {
                    self.sweep_timeouts();
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpStream;

    #[test]
    fn test_server_message_creation() {
        let msg = ServerMessage::PacketReceived {
            peer_id: 3,
            packet: Packet::Heartbeat,
        };

        match msg {
            ServerMessage::PacketReceived { peer_id, packet } => {
                assert_eq!(peer_id, 3);
                assert!(matches!(packet, Packet::Heartbeat));
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[test]
    fn test_accepted_message_carries_writer() {
        let (writer, mut writer_rx) = mpsc::unbounded_channel();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
        let msg = ServerMessage::Accepted {
            peer_id: 1,
            addr,
            writer,
        };

        match msg {
            ServerMessage::Accepted { writer, addr: a, .. } => {
                assert_eq!(a, addr);
                writer.send(Packet::Heartbeat).unwrap();
                assert!(matches!(writer_rx.try_recv(), Ok(Packet::Heartbeat)));
            }
            _ => panic!("Unexpected message type"),
        }
    }

    async fn start_relay(max_peers: usize) -> (SocketAddr, mpsc::UnboundedSender<ServerMessage>) {
        let mut relay = Relay::bind("127.0.0.1:0", max_peers, Duration::from_secs(5))
            .await
            .unwrap();
        let addr = relay.local_addr();
        let handle = relay.handle();
        tokio::spawn(async move {
            let _ = relay.run().await;
        });
        (addr, handle)
    }

    fn connect_packet(version: u32, session: &str) -> Packet {
        Packet::Connect {
            client_version: version,
            display_name: "tester".to_string(),
            session_name: session.to_string(),
            capacity: 3,
        }
    }

    #[tokio::test]
    async fn test_connect_assigns_peer_id() {
        let (addr, handle) = start_relay(3).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        write_packet(&mut stream, &connect_packet(PROTOCOL_VERSION, "Room1234"))
            .await
            .unwrap();

        match read_packet(&mut stream).await.unwrap() {
            Some(Packet::Connected { peer_id, snapshot }) => {
                assert_eq!(peer_id, 1);
                assert_eq!(snapshot.session_name, "Room1234");
                assert_eq!(snapshot.peers.len(), 1);
            }
            other => panic!("Unexpected packet {:?}", other),
        }

        let _ = handle.send(ServerMessage::Shutdown);
    }

    #[tokio::test]
    async fn test_protocol_mismatch_rejected() {
        let (addr, handle) = start_relay(3).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        write_packet(&mut stream, &connect_packet(PROTOCOL_VERSION + 1, "Room1234"))
            .await
            .unwrap();

        match read_packet(&mut stream).await.unwrap() {
            Some(Packet::Disconnected { reason }) => {
                assert!(reason.contains("protocol"));
            }
            other => panic!("Unexpected packet {:?}", other),
        }

        let _ = handle.send(ServerMessage::Shutdown);
    }
}
