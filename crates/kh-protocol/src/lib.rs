//! Wire protocol for KrakenHashes: the control-channel frame envelope
//! (§4.2, §6), its message payload schemas (§4.2), HTTP surface DTOs (§6),
//! and idempotency helpers (§4.2, §5).
//!
//! Frames are JSON: the control channel carries "Text frames carrying
//! UTF-8 JSON" (§6), so there is no reason to keep a binary envelope here.

pub mod defaults;
pub mod error;
pub mod frame;
pub mod http;
pub mod idempotency;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use frame::{Frame, MessageType};
pub use idempotency::IdempotencyWindow;
pub use messages::*;
