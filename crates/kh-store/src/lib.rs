//! Content-addressed file store and durable message buffer shared by the
//! KrakenHashes server and agent (§4.6, §4.7).

pub mod file_store;
pub mod message_buffer;

pub use file_store::{ArtifactKind, ByteRange, FileStore, FileStoreError, RangedBytes};
pub use message_buffer::{BufferedMessage, MessageBuffer, MessageBufferError};
