//! Peer network layer: one TCP connection to the relay driving a `SessionContext`

use crate::input::Command;
use crate::session::SessionContext;
use crate::signals::Signal;
use log::{debug, error, info};
use shared::codec::{read_packet, write_packet};
use shared::{Packet, SyncError, HEARTBEAT_INTERVAL_MS};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Simulation tick rate of the headless peer
pub const TICK_INTERVAL_MS: u64 = 50;

/// Events from the reader task to the client loop
#[derive(Debug)]
enum InboundEvent {
    Packet(Packet),
    Closed(String),
}

pub struct PeerClient {
    relay_addr: SocketAddr,
    writer: OwnedWriteHalf,
    inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
    session: SessionContext,
}

impl PeerClient {
    /// Opens the relay connection and sends the session's `Connect`
    pub async fn connect(relay_addr: &str, session: SessionContext) -> Result<Self, SyncError> {
        let stream = TcpStream::connect(relay_addr).await?;
        stream.set_nodelay(true)?;
        let relay_addr = stream.peer_addr()?;
        info!("Connected to relay at {}", relay_addr);

        let (reader, writer) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self::spawn_reader(reader, inbound_tx);

        let mut client = PeerClient {
            relay_addr,
            writer,
            inbound_rx,
            session,
        };

        let hello = client.session.connect_packet();
        write_packet(&mut client.writer, &hello).await?;
        Ok(client)
    }

    fn spawn_reader(mut reader: OwnedReadHalf, inbound_tx: mpsc::UnboundedSender<InboundEvent>) {
        tokio::spawn(async move {
            loop {
                let event = match read_packet(&mut reader).await {
                    Ok(Some(packet)) => InboundEvent::Packet(packet),
                    Ok(None) => InboundEvent::Closed("Connection closed by relay".to_string()),
                    Err(e) => {
                        error!("Error reading from relay: {}", e);
                        InboundEvent::Closed(e.to_string())
                    }
                };

                let closed = matches!(event, InboundEvent::Closed(_));
                if inbound_tx.send(event).is_err() || closed {
                    break;
                }
            }
        });
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionContext {
        &mut self.session
    }

    fn apply_command(&mut self, command: Command) -> bool {
        match command {
            Command::Intent(intent) => {
                self.session.handle_intent(intent);
            }
            Command::Damage { target, amount } => {
                self.session.deal_damage(target, amount);
            }
            Command::GuardedObjectDestroyed => {
                self.session.report_guarded_object_destroyed();
            }
            Command::Quit => {
                self.session.disconnect();
                return false;
            }
        }
        true
    }

    /// Writes every packet the session queued
    async fn flush(&mut self) -> Result<(), SyncError> {
        for packet in self.session.drain_outgoing() {
            write_packet(&mut self.writer, &packet).await?;
        }
        Ok(())
    }

    fn forward_signals(&mut self, signals: &mpsc::UnboundedSender<Signal>) {
        for signal in self.session.drain_signals() {
            debug!("Signal {:?}", signal);
            // Presentation may have gone away; the session keeps running
            let _ = signals.send(signal);
        }
    }

    /// Runs until the relay connection drops, the relay refuses or ends the
    /// session, or a `Quit` command arrives. Fails with `NotConnected` if the
    /// session was never joined.
    pub async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> Result<(), SyncError> {
        let mut tick_interval = interval(Duration::from_millis(TICK_INTERVAL_MS));
        let mut heartbeat_interval = interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        let mut last_tick = Instant::now();
        let mut commands_open = true;
        let mut joined = false;

        loop {
            let mut running = true;

            tokio::select! {
                event = self.inbound_rx.recv() => match event {
                    Some(InboundEvent::Packet(packet)) => {
                        let refused = matches!(packet, Packet::Disconnected { .. });
                        self.session.handle_packet(packet);
                        running = !refused;
                    }
                    Some(InboundEvent::Closed(reason)) => {
                        self.session.connection_lost(&reason);
                        running = false;
                    }
                    None => {
                        self.session.connection_lost("Relay reader stopped");
                        running = false;
                    }
                },

                command = commands.recv(), if commands_open => match command {
                    Some(command) => running = self.apply_command(command),
                    None => commands_open = false,
                },

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;
                    self.session.tick(dt);
                },

                _ = heartbeat_interval.tick() => {
                    if self.session.is_connected() {
                        if let Err(e) = write_packet(&mut self.writer, &Packet::Heartbeat).await {
                            error!("Error sending heartbeat: {}", e);
                        }
                    }
                },
            }

            if let Err(e) = self.flush().await {
                error!("Error writing to relay: {}", e);
                self.session.connection_lost(&e.to_string());
                self.forward_signals(&signals);
                return Err(e);
            }
            self.forward_signals(&signals);
            joined |= self.session.is_connected();

            if !running {
                break;
            }
        }

        info!("Peer loop stopped");
        if !joined {
            return Err(SyncError::NotConnected);
        }
        Ok(())
    }
}
