use thiserror::Error;

/// Errors surfaced by the wire codec and the relay/peer plumbing.
///
/// Domain anomalies (duplicate remote calls, calls to departed peers, absent
/// properties) are not errors and never show up here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to encode packet: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode packet: {0}")]
    Decode(#[source] bincode::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol version mismatch: peer speaks {peer}, relay speaks {relay}")]
    ProtocolMismatch { peer: u32, relay: u32 },

    #[error("session {name} is full ({capacity} peers)")]
    SessionFull { name: String, capacity: usize },

    #[error("not connected to a session")]
    NotConnected,
}
