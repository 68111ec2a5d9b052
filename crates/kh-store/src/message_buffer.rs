//! Agent-side durable message buffer (§4.7).
//!
//! Critical outbound messages (`job_progress`, `hashcat_output`,
//! `benchmark_result`, `task_cracked`, `task_completed`) are appended here
//! before the agent attempts to send them over the control channel, and
//! removed only once the server's matching `ack` arrives. This is what
//! makes the control channel at-least-once across a disconnect: whatever
//! is still in the buffer on reconnect gets replayed, in order, before any
//! new critical message is produced.
//!
//! The whole buffer is a single JSON file, rewritten atomically
//! (write-to-temp, fsync, rename) on every mutation. At agent-local scale
//! (a handful of in-flight messages between acks) this is simpler and at
//! least as durable as a WAL-backed embedded queue, and it needs no
//! schema migration story of its own.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kh_ids::{AgentId, MessageId};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// The three critical message kinds buffered across disconnects plus
/// `task_cracked`/`task_completed`; kept as a string rather than an enum
/// tied to `kh-protocol`'s full message-type set so this crate doesn't
/// need to depend on it for what is, at this layer, an opaque tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferedMessage {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub agent_id: AgentId,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageBufferError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt buffer file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MessageBufferError>;

/// A bounded, on-disk FIFO of `BufferedMessage`s guarded by an in-process
/// mutex (the agent has exactly one control-channel writer, but
/// `append`/`remove_by_ids` can race against a concurrent maintenance
/// tick, so the lock avoids two rewrites clobbering each other).
pub struct MessageBuffer {
    path: PathBuf,
    messages: Mutex<Vec<BufferedMessage>>,
}

impl MessageBuffer {
    /// Load the buffer from `path`, or start empty if the file doesn't
    /// exist yet (first run).
    pub async fn load_on_start(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let messages = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            messages: Mutex::new(messages),
        })
    }

    pub async fn append(&self, message: BufferedMessage) -> Result<()> {
        let mut messages = self.messages.lock().await;
        messages.push(message);
        self.persist(&messages).await
    }

    /// Messages in original append order, for in-order replay on
    /// reconnect.
    pub async fn iterate(&self) -> Vec<BufferedMessage> {
        self.messages.lock().await.clone()
    }

    /// Remove acknowledged messages. The removed set need not be
    /// contiguous — acks can arrive out of order even though replay is
    /// sent in order.
    pub async fn remove_by_ids(&self, ids: &[MessageId]) -> Result<()> {
        let mut messages = self.messages.lock().await;
        messages.retain(|m| !ids.contains(&m.id));
        self.persist(&messages).await
    }

    pub async fn count(&self) -> usize {
        self.messages.lock().await.len()
    }

    async fn persist(&self, messages: &[BufferedMessage]) -> Result<()> {
        let encoded = serde_json::to_vec(messages)?;
        write_atomic(&self.path, &encoded).await?;
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(bytes).await?;
        tmp.sync_all().await?;
    }
    fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(agent_id: AgentId) -> BufferedMessage {
        BufferedMessage {
            id: MessageId::new(),
            kind: "task_progress".to_string(),
            payload: serde_json::json!({"processed": 400}),
            timestamp: Utc::now(),
            agent_id,
        }
    }

    #[tokio::test]
    async fn append_then_restart_round_trips_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        let agent_id = AgentId::new(7);

        let buffer = MessageBuffer::load_on_start(&path).await.unwrap();
        let message = sample(agent_id);
        buffer.append(message.clone()).await.unwrap();

        let reloaded = MessageBuffer::load_on_start(&path).await.unwrap();
        let all = reloaded.iterate().await;
        assert_eq!(all, vec![message]);
    }

    #[tokio::test]
    async fn remove_by_ids_drops_only_matching_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        let agent_id = AgentId::new(1);

        let buffer = MessageBuffer::load_on_start(&path).await.unwrap();
        let a = sample(agent_id);
        let b = sample(agent_id);
        buffer.append(a.clone()).await.unwrap();
        buffer.append(b.clone()).await.unwrap();

        buffer.remove_by_ids(&[a.id.clone()]).await.unwrap();

        let remaining = buffer.iterate().await;
        assert_eq!(remaining, vec![b]);
        assert_eq!(buffer.count().await, 1);
    }

    #[tokio::test]
    async fn non_contiguous_removal_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        let agent_id = AgentId::new(1);

        let buffer = MessageBuffer::load_on_start(&path).await.unwrap();
        let msgs: Vec<_> = (0..5).map(|_| sample(agent_id)).collect();
        for m in &msgs {
            buffer.append(m.clone()).await.unwrap();
        }

        buffer
            .remove_by_ids(&[msgs[1].id.clone(), msgs[3].id.clone()])
            .await
            .unwrap();

        let remaining = buffer.iterate().await;
        let remaining_ids: Vec<_> = remaining.iter().map(|m| m.id.clone()).collect();
        assert_eq!(
            remaining_ids,
            vec![msgs[0].id.clone(), msgs[2].id.clone(), msgs[4].id.clone()]
        );
    }
}
