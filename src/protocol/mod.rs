//! PostgreSQL Wire Protocol (Pure, Sync)
//!
//! No async, no I/O, no tokio - framing, message codecs, and the SCRAM
//! handshake as plain computation over bytes.

pub mod auth;
pub mod framing;
pub mod reader;
pub mod wire;

pub use auth::{AuthPhase, AuthStep, Authenticator, SCRAM_SHA_256, ScramClient};
pub use framing::{Frame, FrameBuffer};
pub use reader::MessageReader;
pub use wire::*;
