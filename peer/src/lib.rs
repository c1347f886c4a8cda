//! # Peer Session Library
//!
//! Client-side core of the co-op rescue game. Every peer runs the same code
//! and keeps a full replica of the session. One of them, the longest-connected
//! peer, is the authority and alone decides session-wide outcomes; everyone
//! else reacts to what the relay rebroadcasts.
//!
//! ## Replication Model
//!
//! ### Echo-applied properties
//! Property writes are sent to the relay and only land in the local mirror
//! when the relay echoes them back, so the writer and every reader observe the
//! same sequence through the same code path.
//!
//! ### Idempotent remote calls
//! Every handler behind a remote call is a guarded state transition. A call
//! delivered twice, or delivered after the state it targets has moved on,
//! changes nothing.
//!
//! ### Single writer
//! Terminal outcome keys, the secured count and match start are written by the
//! authority only. A newly elected authority rebuilds its guards from the
//! mirror and never replays decisions its predecessor had in flight.
//!
//! ## Module Organization
//!
//! - `session`: `SessionContext`, owner of every component below
//! - `property_store`, `remote_call`, `outbox`: replication plumbing
//! - `authority`, `ownership`: who decides, who moves what
//! - `attachment`, `outcome`, `world`, `timer`: game state machines
//! - `signals`, `input`: presentation and input boundary
//! - `network`: tokio TCP client loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use peer::network::PeerClient;
//! use peer::session::SessionContext;
//! use shared::SessionConfig;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = SessionContext::new(SessionConfig::default(), "alice", "Room1234");
//!     let mut client = PeerClient::connect("127.0.0.1:7777", session).await?;
//!
//!     let (_commands, command_rx) = mpsc::unbounded_channel();
//!     let (signal_tx, _signals) = mpsc::unbounded_channel();
//!     client.run(command_rx, signal_tx).await?;
//!     Ok(())
//! }
//! ```

pub mod attachment;
pub mod authority;
pub mod input;
pub mod network;
pub mod outbox;
pub mod outcome;
pub mod ownership;
pub mod property_store;
pub mod remote_call;
pub mod session;
pub mod signals;
pub mod timer;
pub mod world;
