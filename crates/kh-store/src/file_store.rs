//! Content-addressed file store (§4.6).
//!
//! Artifacts are immutable once ingested and named by the SHA-256 digest
//! of their bytes. On disk they live under `<root>/<kind>/<fanout>/<digest>`
//! where `fanout` is the digest's first two hex characters, matching
//! `ArtifactDigest::fanout_prefix` — this keeps any one directory from
//! holding more entries than a typical filesystem handles gracefully.
//!
//! Writes go through a temp file in the same directory, fsync'd and
//! renamed into place, so a crash mid-write never leaves a partial file
//! at the final path: readers either see nothing or the complete artifact.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use kh_ids::ArtifactDigest;
use kh_security::digest::StreamingDigest;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Artifact namespace, mirroring the server data directory subtrees of
/// §6 (`binaries/`, `wordlists/`, `rules/`, `hashlists/`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Binary,
    Wordlist,
    Rule,
    Hashlist,
}

impl ArtifactKind {
    fn subtree(&self) -> &'static str {
        match self {
            Self::Binary => "binaries",
            Self::Wordlist => "wordlists",
            Self::Rule => "rules",
            Self::Hashlist => "hashlists",
        }
    }

    /// Base artifacts (the hashcat binary) are pinned against eviction
    /// regardless of `retention_days` (§4.6).
    pub fn is_pinned(&self) -> bool {
        matches!(self, Self::Binary)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch {
        expected: ArtifactDigest,
        computed: String,
    },

    #[error("artifact not found: {0}")]
    NotFound(ArtifactDigest),

    #[error("invalid byte range")]
    InvalidRange,
}

pub type Result<T> = std::result::Result<T, FileStoreError>;

/// A byte range request, half-open on the upper bound (`end = None` means
/// "to the end of the file"), matching HTTP `Range: bytes=start-[end]`.
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

#[derive(Debug)]
pub struct RangedBytes {
    pub data: Vec<u8>,
    pub range_start: u64,
    pub total_size: u64,
}

pub struct FileStore {
    root: PathBuf,
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore").field("root", &self.root).finish()
    }
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for kind in [
            ArtifactKind::Binary,
            ArtifactKind::Wordlist,
            ArtifactKind::Rule,
            ArtifactKind::Hashlist,
        ] {
            fs::create_dir_all(root.join(kind.subtree())).await?;
        }
        Ok(Self { root })
    }

    fn final_path(&self, kind: ArtifactKind, digest: &ArtifactDigest) -> PathBuf {
        self.root
            .join(kind.subtree())
            .join(digest.fanout_prefix())
            .join(digest.as_str())
    }

    pub async fn exists(&self, kind: ArtifactKind, digest: &ArtifactDigest) -> bool {
        fs::metadata(self.final_path(kind, digest)).await.is_ok()
    }

    pub async fn size(&self, kind: ArtifactKind, digest: &ArtifactDigest) -> Result<u64> {
        let meta = fs::metadata(self.final_path(kind, digest))
            .await
            .map_err(|_| FileStoreError::NotFound(digest.clone()))?;
        Ok(meta.len())
    }

    /// Ingest `bytes`, verifying they hash to `digest`. Returns
    /// `DigestMismatch` (without writing anything permanent) if they don't.
    pub async fn put(
        &self,
        kind: ArtifactKind,
        digest: &ArtifactDigest,
        bytes: &[u8],
    ) -> Result<()> {
        let mut hasher = StreamingDigest::new();
        hasher.update(bytes);
        let computed = hasher.finish_hex();
        if computed != digest.as_str() {
            return Err(FileStoreError::DigestMismatch {
                expected: digest.clone(),
                computed,
            });
        }

        let final_path = self.final_path(kind, digest);
        let dir = final_path.parent().expect("final_path always has a parent");
        fs::create_dir_all(dir).await?;

        let tmp_path = dir.join(format!(".{}.tmp", digest.as_str()));
        {
            let mut tmp = fs::File::create(&tmp_path).await?;
            tmp.write_all(bytes).await?;
            tmp.sync_all().await?;
        }
        fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    /// Read a byte range of a stored artifact (server side of `GET
    /// /api/artifacts/{digest}` with `Range`, §6).
    pub async fn read_range(
        &self,
        kind: ArtifactKind,
        digest: &ArtifactDigest,
        range: Option<ByteRange>,
    ) -> Result<RangedBytes> {
        let path = self.final_path(kind, digest);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|_| FileStoreError::NotFound(digest.clone()))?;
        let total_size = file.metadata().await?.len();

        let (start, end) = match range {
            None => (0, total_size),
            Some(r) => {
                let end = r.end.map(|e| e + 1).unwrap_or(total_size);
                if r.start >= total_size || end > total_size || r.start >= end {
                    return Err(FileStoreError::InvalidRange);
                }
                (r.start, end)
            }
        };

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;

        Ok(RangedBytes {
            data: buf,
            range_start: start,
            total_size,
        })
    }

    /// Verify an already-stored artifact still matches its digest (used
    /// after an agent detects a corrupted cache entry before re-sync).
    pub async fn verify(&self, kind: ArtifactKind, digest: &ArtifactDigest) -> Result<bool> {
        let bytes = fs::read(self.final_path(kind, digest))
            .await
            .map_err(|_| FileStoreError::NotFound(digest.clone()))?;
        let mut hasher = StreamingDigest::new();
        hasher.update(&bytes);
        Ok(hasher.finish_hex() == digest.as_str())
    }

    /// Delete a cache entry, e.g. on digest mismatch before the agent's
    /// one retry (§4.6).
    pub async fn remove(&self, kind: ArtifactKind, digest: &ArtifactDigest) -> Result<()> {
        let path = self.final_path(kind, digest);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Evict non-pinned artifacts whose last access predates
    /// `retention_days`. Returns the digests removed. Called by the
    /// agent's periodic maintenance tick, never by the server (the
    /// server-side store has no retention policy — only agent caches do).
    pub async fn evict_stale(
        &self,
        kind: ArtifactKind,
        retention: std::time::Duration,
        referenced: &std::collections::HashSet<ArtifactDigest>,
    ) -> Result<Vec<ArtifactDigest>> {
        if kind.is_pinned() {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        let subtree = self.root.join(kind.subtree());
        let mut fanout_dirs = fs::read_dir(&subtree).await?;
        while let Some(fanout_entry) = fanout_dirs.next_entry().await? {
            if !fanout_entry.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(fanout_entry.path()).await?;
            while let Some(file_entry) = files.next_entry().await? {
                let file_name = file_entry.file_name();
                let Some(digest_str) = file_name.to_str() else {
                    continue;
                };
                if digest_str.starts_with('.') {
                    continue; // leftover temp file from an interrupted write
                }
                let Ok(digest) = ArtifactDigest::from_hex(digest_str) else {
                    continue;
                };
                if referenced.contains(&digest) {
                    continue;
                }
                let meta = file_entry.metadata().await?;
                let age = meta
                    .accessed()
                    .or_else(|_| meta.modified())
                    .unwrap_or(SystemTime::now())
                    .elapsed()
                    .unwrap_or_default();
                if age > retention {
                    fs::remove_file(file_entry.path()).await?;
                    removed.push(digest);
                }
            }
        }
        Ok(removed)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(bytes: &[u8]) -> ArtifactDigest {
        ArtifactDigest::from_hex(kh_security::digest::sha256_hex(bytes)).unwrap()
    }

    #[tokio::test]
    async fn put_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let bytes = b"password\nrockstar\n123456\n".to_vec();
        let digest = digest_of(&bytes);

        store.put(ArtifactKind::Wordlist, &digest, &bytes).await.unwrap();
        assert!(store.exists(ArtifactKind::Wordlist, &digest).await);

        let read = store.read_range(ArtifactKind::Wordlist, &digest, None).await.unwrap();
        assert_eq!(read.data, bytes);
        assert_eq!(read.total_size, bytes.len() as u64);
    }

    #[tokio::test]
    async fn put_rejects_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let wrong_digest = ArtifactDigest::from_hex("a".repeat(64)).unwrap();

        let result = store.put(ArtifactKind::Rule, &wrong_digest, b"best64.rule").await;
        assert!(matches!(result, Err(FileStoreError::DigestMismatch { .. })));
        assert!(!store.exists(ArtifactKind::Rule, &wrong_digest).await);
    }

    #[tokio::test]
    async fn partial_range_requests_cover_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let bytes: Vec<u8> = (0..200u32).map(|b| (b % 256) as u8).collect();
        let digest = digest_of(&bytes);
        store.put(ArtifactKind::Binary, &digest, &bytes).await.unwrap();

        let first = store
            .read_range(ArtifactKind::Binary, &digest, Some(ByteRange { start: 0, end: Some(99) }))
            .await
            .unwrap();
        let second = store
            .read_range(ArtifactKind::Binary, &digest, Some(ByteRange { start: 100, end: None }))
            .await
            .unwrap();

        let mut combined = first.data;
        combined.extend(second.data);
        assert_eq!(combined, bytes);
    }

    #[tokio::test]
    async fn eviction_skips_pinned_binaries_and_referenced_digests() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let bytes = b"hashcat binary bytes".to_vec();
        let digest = digest_of(&bytes);
        store.put(ArtifactKind::Binary, &digest, &bytes).await.unwrap();

        let removed = store
            .evict_stale(ArtifactKind::Binary, std::time::Duration::from_secs(0), &Default::default())
            .await
            .unwrap();
        assert!(removed.is_empty());
        assert!(store.exists(ArtifactKind::Binary, &digest).await);
    }
}
