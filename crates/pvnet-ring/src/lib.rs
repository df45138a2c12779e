//! # pvnet-ring
//!
//! Transmit/receive ring engine and multi-channel management core for a
//! paravirtualized network device front-end.
//!
//! Outgoing packets are encapsulated into a small binary protocol, scheduled
//! onto independently flowing channels, and retired on completion. Inbound
//! channel traffic is decoded back into packets carrying offload and flow-hash
//! metadata.
//!
//! ## Crate structure
//!
//! - [`packet`] — Packet descriptor and per-packet offload metadata
//! - [`wire`] — Message header, metadata items, control messages
//! - [`codec`] — Packet encapsulation encode/decode
//! - [`pool`] — Fixed-size, refcounted transmit descriptor pool
//! - [`channel`] — Channel transport abstraction and shared receive region
//! - [`tx`] — Transmit ring (MPSC backlog, inline vs. scattered delivery)
//! - [`rx`] — Receive ring (decode, hash/checksum propagation, batched acks)
//! - [`rss`] — Indirection table and Toeplitz flow hash
//! - [`manager`] — Channel negotiation, ring binding, suspend/resume
//! - [`loopback`] — In-memory remote endpoint implementing the transport
//! - [`config`] — Device configuration (TOML)
//! - [`stats`] — Per-ring counters and serializable snapshots
//! - [`state`] — Ring lifecycle state
//! - [`error`] — Error types

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod loopback;
pub mod manager;
pub mod packet;
pub mod pool;
pub mod rss;
pub mod rx;
pub mod state;
pub mod stats;
pub mod tx;
pub mod wire;

pub use error::{DecodeError, EnqueueError, ManagerError, TransportBusy, TransportError};
pub use manager::{ActiveQueueCount, ChannelManager};
pub use packet::PacketDescriptor;
pub use state::RingState;
