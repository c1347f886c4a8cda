use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod action;
pub mod codec;
pub mod config;
pub mod error;

pub use action::{Action, Subject};
pub use config::{RequiredSecured, SessionConfig, Zone};
pub use error::SyncError;

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const PEER_TIMEOUT_SECS: u64 = 5;

/// Replicated property keys.
pub mod keys {
    // Peer scope
    pub const IS_ALIVE: &str = "IsAlive";
    pub const IS_READY: &str = "IsReady";

    // Session scope, authority-written
    pub const MATCH_STARTED: &str = "MatchStarted";
    pub const MATCH_DURATION: &str = "MatchDuration";
    pub const REQUIRED_SECURED: &str = "RequiredSecured";
    pub const SECURED_COUNT: &str = "SecuredCount";
    pub const GAME_OVER: &str = "GameOver";
    pub const WON: &str = "Won";
    pub const GAME_OVER_REASON: &str = "GameOverReason";
}

/// Assigned by the relay once per session; never reused.
pub type PeerId = u32;

pub type EntityId = u32;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn add(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn distance(self, other: Vec3) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    pub position: Vec3,
    pub yaw: f32,
}

impl Transform {
    pub fn at(position: Vec3) -> Self {
        Self { position, yaw: 0.0 }
    }
}

/// A replicated property value. Values cross the relay untouched.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum PropertyValue {
    Int(i64),
    Bool(bool),
    Float(f64),
    Str(String),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(f) => Some(*f),
            PropertyValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Int(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

pub type PropertyBag = HashMap<String, PropertyValue>;

/// Which replicated table a write targets.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyScope {
    Session,
    Peer(PeerId),
}

/// Delivery target of a remote call.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RpcTarget {
    AllPeers,
    AuthorityPeer,
    SpecificPeer(PeerId),
    /// Like `AllPeers`, and replayed to peers that join later.
    AllBuffered,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub display_name: String,
    /// Join ordinal within the session; the lowest connected value is the authority.
    pub seniority: u64,
}

/// Everything a joining peer needs to mirror the session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub session_name: String,
    pub peers: Vec<PeerInfo>,
    pub session_props: PropertyBag,
    pub peer_props: HashMap<PeerId, PropertyBag>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    // Peer -> relay
    Connect {
        client_version: u32,
        display_name: String,
        session_name: String,
        capacity: usize,
    },
    SetProperties {
        scope: PropertyScope,
        props: Vec<(String, PropertyValue)>,
    },
    Invoke {
        target: RpcTarget,
        action: Action,
    },
    Heartbeat,
    Disconnect,

    // Relay -> peer
    Connected {
        peer_id: PeerId,
        snapshot: SessionSnapshot,
    },
    PeerJoined {
        peer: PeerInfo,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    PropertiesChanged {
        scope: PropertyScope,
        writer: PeerId,
        props: Vec<(String, PropertyValue)>,
    },
    RemoteCall {
        sender: PeerId,
        action: Action,
    },
    Disconnected {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_vec3_distance() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 4.0, 0.0);
        assert_approx_eq!(a.distance(b), 5.0, 0.0001);
        assert_eq!(a.add(b), b);
    }

    #[test]
    fn test_property_value_accessors() {
        assert_eq!(PropertyValue::from(true).as_bool(), Some(true));
        assert_eq!(PropertyValue::from(7u32).as_int(), Some(7));
        assert_eq!(PropertyValue::from("TIME_OUT").as_str(), Some("TIME_OUT"));
        assert_eq!(PropertyValue::Int(3).as_float(), Some(3.0));
        assert_eq!(PropertyValue::from(1.5).as_bool(), None);
        assert_eq!(PropertyValue::Bool(false).as_str(), None);
    }

    #[test]
    fn test_property_value_display() {
        assert_eq!(PropertyValue::Int(-4).to_string(), "-4");
        assert_eq!(PropertyValue::Bool(true).to_string(), "true");
        assert_eq!(PropertyValue::Str("a".into()).to_string(), "\"a\"");
    }

    #[test]
    fn test_packet_serialization_set_properties() {
        let packet = Packet::SetProperties {
            scope: PropertyScope::Peer(3),
            props: vec![
                (keys::IS_ALIVE.to_string(), PropertyValue::Bool(false)),
                ("Score".to_string(), PropertyValue::Float(12.25)),
            ],
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::SetProperties { scope, props } => {
                assert_eq!(scope, PropertyScope::Peer(3));
                assert_eq!(props.len(), 2);
                assert_eq!(props[0].1, PropertyValue::Bool(false));
                assert_eq!(props[1].1, PropertyValue::Float(12.25));
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_connected_snapshot() {
        let mut session_props = PropertyBag::new();
        session_props.insert(keys::GAME_OVER.to_string(), PropertyValue::Bool(true));

        let packet = Packet::Connected {
            peer_id: 9,
            snapshot: SessionSnapshot {
                session_name: "Room1234".to_string(),
                peers: vec![PeerInfo {
                    id: 9,
                    display_name: "alice".to_string(),
                    seniority: 0,
                }],
                session_props,
                peer_props: HashMap::new(),
            },
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Connected { peer_id, snapshot } => {
                assert_eq!(peer_id, 9);
                assert_eq!(snapshot.peers[0].display_name, "alice");
                assert_eq!(
                    snapshot.session_props.get(keys::GAME_OVER),
                    Some(&PropertyValue::Bool(true))
                );
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }
}
