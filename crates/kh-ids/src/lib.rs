//! Shared identifier wrappers for KrakenHashes.
//!
//! Per the standardization decision in DESIGN.md (Open Question c), every
//! entity that the scheduler reasons about uses a numeric id internally;
//! the stringified `agent_<N>` form exists only at the HTTP/log boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_u64_id {
    ($name:ident, $label:expr) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<u64>()
                    .map($name)
                    .map_err(|e| IdParseError::new(format!("Invalid {}: {}", $label, e)))
            }
        }
    };
}

macro_rules! define_uuid_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                Uuid::parse_str(value)
                    .map_err(|e| IdParseError::new(format!("Invalid {}: {}", $label, e)))?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

// Monotonic numeric ids (§3: "monotonic numeric ids for agents, jobs, tasks").
define_u64_id!(AgentId, "agent id");
define_u64_id!(JobId, "job execution id");
define_u64_id!(TaskId, "task id");
define_u64_id!(HashlistId, "hashlist id");
define_u64_id!(ClaimCodeId, "claim code id");
define_u64_id!(ClientId, "client id");

// UUID-backed ids (§3: "uuids for hashes and buffered messages").
define_uuid_id!(MessageId, "buffered message id");
define_uuid_id!(FrameId, "control channel frame id");

/// A content-address: the lowercase hex SHA-256 digest of an artifact's bytes.
///
/// Unlike the numeric/uuid ids above, this is derived data (not an
/// allocated identity) so it carries no `new()` constructor — callers
/// compute it via `kh_security::digest::sha256_hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactDigest(String);

impl ArtifactDigest {
    /// Wrap an already-computed hex digest. Validates length/charset only;
    /// does not recompute the hash.
    pub fn from_hex(value: impl Into<String>) -> Result<Self, IdParseError> {
        let value = value.into();
        if value.len() != 64 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdParseError::new(format!(
                "Invalid artifact digest (expected 64 hex chars): {}",
                value
            )));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two-character fan-out prefix used by the file store's on-disk
    /// layout (`{digest[0..2]}/{digest}`).
    pub fn fanout_prefix(&self) -> &str {
        &self.0[0..2]
    }
}

impl fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ArtifactDigest {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_id_roundtrip() {
        let id = AgentId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<AgentId>().unwrap(), id);
    }

    #[test]
    fn u64_id_rejects_garbage() {
        assert!("not-a-number".parse::<TaskId>().is_err());
    }

    #[test]
    fn uuid_id_roundtrip() {
        let id = MessageId::new();
        let parsed: MessageId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn artifact_digest_validates_length_and_charset() {
        let good = "a".repeat(64);
        assert!(ArtifactDigest::from_hex(good.clone()).is_ok());
        assert!(ArtifactDigest::from_hex("too-short").is_err());
        assert!(ArtifactDigest::from_hex("g".repeat(64)).is_err());

        let digest = ArtifactDigest::from_hex(good).unwrap();
        assert_eq!(digest.fanout_prefix(), "aa");
    }
}
