//! # Arena Game Server Library
//!
//! The authoritative server for the box arena: it accepts TCP connections,
//! registers named players, runs a fixed-tick simulation of movement and
//! pairwise collision, and periodically broadcasts the world to every
//! connected client over a newline-delimited JSON protocol.
//!
//! ## Architecture
//!
//! All state authority lives here. Clients only send a username handshake and
//! keyboard bitmasks; positions, collisions, and deaths are decided by the
//! server and pushed out in periodic `update` messages. There is no client
//! prediction anywhere in the protocol.
//!
//! Concurrency is one tokio task per accepted connection (handshake plus the
//! input-reading loop), one task for the accept loop, and one task for the
//! combined tick/broadcast loop. The world's player map is the only shared
//! resource that needs a lock, and that lock is never held across network
//! I/O: the loop snapshots under the lock, releases it, and then writes.
//!
//! ## Module Organization
//!
//! ### Framing Module (`framing`)
//! Recovers whole JSON objects from the raw byte stream and writes frames
//! atomically with respect to concurrent writers. Knows nothing about the
//! game.
//!
//! ### Session Module (`session`)
//! Per-connection state and behavior: the username handshake, spawning,
//! movement from the keyboard bitmask, bounding-box collision, and the
//! input-reading loop with its kill signal.
//!
//! ### Game Module (`game`)
//! The world: a username-keyed player map mutated only through
//! `register`/`remove`/`tick`, and snapshotted for the broadcaster.
//!
//! ### Network Module (`network`)
//! The accept loop, the tick/broadcast loop with its achieved-rate window,
//! per-session update dispatch, and graceful shutdown.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use shared::WorldConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Arc::new(Server::new(
//!         "127.0.0.1:9042",
//!         WorldConfig::default(),
//!         Duration::from_millis(10),   // simulation tick
//!         Duration::from_millis(100),  // world broadcast
//!     ).await?);
//!
//!     let accept = Arc::clone(&server);
//!     tokio::spawn(async move { accept.accept_loop().await });
//!     server.game_loop().await;
//!     Ok(())
//! }
//! ```

pub mod framing;
pub mod game;
pub mod network;
pub mod session;
