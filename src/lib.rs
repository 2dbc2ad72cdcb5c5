//! FreakMesh: a flood-relay mesh messaging engine for LoRa radio nodes.
//!
//! A node listens on a shared channel, floods locally-originated text and
//! small media messages across the mesh with bounded TTL, relays what it
//! hears on behalf of other nodes (subject to a signal-strength gate so
//! only weak, presumably out-of-direct-range frames get relayed), and
//! optionally authenticates payloads with a pre-shared key. The pieces:
//!
//! - [`identity`]: node addressing.
//! - [`message`]: the in-memory representation of Data/Ack/Hello frames.
//! - [`codec`]: wire encode/decode for those frames.
//! - [`keychain`]: AES-CBC + HMAC-SHA256 payload encryption/authentication.
//! - [`duty_cycle`]: sliding-window airtime accounting against a regulatory cap.
//! - [`journal`]: crash-safe bounded message history.
//! - [`cache`]: bounded processed-message dedup.
//! - [`neighbors`]: directly-heard neighbor tracking.
//! - [`send_queue`]: the locally-originated/relay transmit queue.
//! - [`radio`]: the hardware abstraction a [`engine::MeshEngine`] drives.
//! - [`config`]: persisted user settings and the LoRa preset table.
//! - [`engine`]: the orchestrator tying all of the above together.
//! - [`command`]: the textual command surface (`!cmd`, `#key msg`, plain text).

pub mod cache;
pub mod codec;
pub mod command;
pub mod config;
pub mod duty_cycle;
pub mod engine;
pub mod error;
pub mod identity;
pub mod journal;
pub mod keychain;
pub mod log_macros;
pub mod message;
pub mod neighbors;
pub mod radio;
pub mod send_queue;
pub mod serial_radio;

pub use config::Settings;
pub use engine::{MeshEngine, Surfaced};
pub use error::FreakMeshError;
pub use identity::NodeId;
