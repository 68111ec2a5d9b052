//! Credential and content-digest primitives for KrakenHashes.
//!
//! Provides:
//! - **digest**: SHA-256 content hashing for artifact identity.
//! - **secret**: claim-code / API-key generation and storage hashing.
//! - **credentials**: the `agent.key` credential file reader/writer.

pub mod credentials;
pub mod digest;
pub mod secret;

pub use credentials::{AgentCredentials, CredentialsError};
