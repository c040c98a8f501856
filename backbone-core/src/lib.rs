//! Shared primitives and runtime for the backbone relay: crypto, wire
//! codecs, identity storage, the handshake ceremony, the routing registry,
//! the per-connection handler, and the server supervisor. The
//! `backbone-server` and `backbone-client` binaries are thin CLI shells
//! over this crate.

pub mod client;
pub mod crypto;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod id;
pub mod identity;
pub mod message;
pub mod registry;
pub mod server;
pub mod settings;

pub use crypto::CryptoError;
pub use frame::FrameError;
pub use handshake::{ChallengeError, Identity};
pub use id::ClientId;
pub use identity::{IdentityError, IdentityStore};
pub use message::{C2SType, Message, S2SType, Timestamp};
pub use registry::Registry;
pub use server::Server;
pub use settings::{ConfigError, Settings};
