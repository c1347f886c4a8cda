//! # Session Relay Library
//!
//! The relay is the pub/sub service every peer connects to. It hosts named
//! sessions, hands out peer ids and seniority ordinals, mirrors the replicated
//! property bags so late joiners can be brought up to date, and routes remote
//! calls. It makes no game-rule decisions: those belong to whichever peer is
//! currently the authority.
//!
//! ## Delivery Guarantees
//!
//! Every peer talks to the relay over one TCP stream and the main loop handles
//! packets one at a time, so traffic between any sender and receiver stays in
//! order. Across senders there is no ordering. Calls aimed at a peer that has
//! left are dropped without notice; anything that must survive a reconnect or
//! a late join goes through the property mirror or a buffered call.
//!
//! ## Module Organization
//!
//! ### Peer Manager Module (`peer_manager`)
//! Roster of one session:
//! - Admission against the session capacity
//! - Seniority ordinals and authority election
//! - Heartbeat timeout detection
//!
//! ### Room Module (`room`)
//! Transport-free routing of one session. Every operation returns the packets
//! to deliver, which lets tests drive a session without sockets.
//!
//! ### Network Module (`network`)
//! TCP accept loop, per-connection reader and writer tasks, and the main loop
//! that owns every room.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay::network::Relay;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut relay = Relay::bind("127.0.0.1:7777", 3, Duration::from_secs(5)).await?;
//!     relay.run().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod peer_manager;
pub mod room;
