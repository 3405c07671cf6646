//! # ethrex discv5
//!
//! Node discovery for the ethrex client, following the Ethereum
//! [discv5 wire protocol](https://github.com/ethereum/devp2p/blob/master/discv5/discv5-wire.md).
//!
//! ## Overview
//!
//! Nodes exchange signed [ENR records](https://github.com/ethereum/devp2p/blob/master/enr.md)
//! over UDP, authenticate each other through an ephemeral-key handshake and keep a
//! Kademlia routing table that answers `FINDNODE` queries and drives lookups.
//!
//! ```text
//!   datagram ─▶ codec (size check, unmask, parse header)
//!                  │
//!                  ▼
//!            packet handlers ──▶ sessions (LRU, per node-id + endpoint)
//!                  │                     │
//!                  ▼                     ▼
//!           message handler ◀──▶ request manager ──▶ routing table
//!                  │
//!                  ▼
//!        sealed replies ─▶ datagram
//! ```
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`packet`] | Static header, auth-data variants, header masking |
//! | [`crypto`] | ECDH, HKDF key schedule, id-signatures, AES-GCM |
//! | [`session`] | Per-peer session state machine and the LRU session manager |
//! | [`routing_table`] | 256 k-buckets with replacement caches and liveness |
//! | [`request_manager`] | Pending and cached requests, reply matching, timeouts |
//! | [`handlers`] | Ordinary / WHOAREYOU / Handshake packet handling |
//! | [`message_handler`] | PING, FINDNODE, TALKREQ responses and reply routing |
//! | [`server`] | UDP receive loop, background tasks and the public handle |
//! | [`lookup`] | Iterative lookups, liveness pings and bucket refresh |

pub mod base64;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod lookup;
pub mod message_handler;
pub mod messages;
pub mod packet;
pub mod request_manager;
pub mod rlp;
pub mod routing_table;
pub mod server;
pub mod session;
pub mod types;
pub mod utils;

pub use config::Discv5Config;
pub use error::DiscoveryError;
pub use server::{Discv5Handle, Discv5Server};
pub use types::{Node, NodeRecord};
