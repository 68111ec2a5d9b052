//! Agent-side half of content-addressed file sync (§4.6): for each
//! artifact named by a `file_sync_required` frame, fetch it by digest from
//! `GET /api/artifacts/{digest}` if missing or mismatched, verify, retry
//! once on mismatch.

use kh_ids::ArtifactDigest;
use kh_protocol::{ArtifactRef, ArtifactRefKind};
use kh_store::{ArtifactKind, FileStore, FileStoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileSyncError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {0} for artifact {1}")]
    ServerError(u16, ArtifactDigest),
    #[error(transparent)]
    Store(#[from] FileStoreError),
    #[error("digest mismatch persisted after retry for {0}")]
    PersistentMismatch(ArtifactDigest),
}

impl FileSyncError {
    /// The artifact this failure is about, when known, so the caller can
    /// report it in a `file_sync_error` frame (§4.5).
    pub fn digest(&self) -> Option<&ArtifactDigest> {
        match self {
            Self::ServerError(_, digest) | Self::PersistentMismatch(digest) => Some(digest),
            Self::Request(_) | Self::Store(_) => None,
        }
    }
}

fn to_store_kind(kind: ArtifactRefKind) -> ArtifactKind {
    match kind {
        ArtifactRefKind::Binary => ArtifactKind::Binary,
        ArtifactRefKind::Wordlist => ArtifactKind::Wordlist,
        ArtifactRefKind::Rule => ArtifactKind::Rule,
        ArtifactRefKind::Hashlist => ArtifactKind::Hashlist,
    }
}

/// Ensure every artifact in `required` is present and verified in `store`,
/// fetching from `server_url` as needed. Returns once all artifacts are
/// ready, or the first unrecoverable error (the caller maps this to
/// `task_failed{fatal}` after `sync_max_attempts`, §4.5).
pub async fn ensure_synced(
    client: &reqwest::Client,
    server_url: &str,
    store: &FileStore,
    required: &[ArtifactRef],
) -> Result<(), FileSyncError> {
    for artifact in required {
        let kind = to_store_kind(artifact.kind);
        if store.exists(kind, &artifact.digest).await && store.verify(kind, &artifact.digest).await.unwrap_or(false) {
            continue;
        }
        fetch_with_retry(client, server_url, store, kind, &artifact.digest).await?;
    }
    Ok(())
}

async fn fetch_with_retry(
    client: &reqwest::Client,
    server_url: &str,
    store: &FileStore,
    kind: ArtifactKind,
    digest: &ArtifactDigest,
) -> Result<(), FileSyncError> {
    const ATTEMPTS: u32 = 2;
    let mut last_err = None;
    for _ in 0..ATTEMPTS {
        match fetch_once(client, server_url, store, kind, digest).await {
            Ok(()) => return Ok(()),
            Err(FileSyncError::Store(FileStoreError::DigestMismatch { .. })) => {
                let _ = store.remove(kind, digest).await;
                last_err = Some(FileSyncError::PersistentMismatch(digest.clone()));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| FileSyncError::PersistentMismatch(digest.clone())))
}

async fn fetch_once(
    client: &reqwest::Client,
    server_url: &str,
    store: &FileStore,
    kind: ArtifactKind,
    digest: &ArtifactDigest,
) -> Result<(), FileSyncError> {
    let response = client
        .get(format!("{server_url}/api/artifacts/{digest}"))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(FileSyncError::ServerError(response.status().as_u16(), digest.clone()));
    }

    let bytes = response.bytes().await?;
    store.put(kind, digest, &bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u8) -> ArtifactDigest {
        ArtifactDigest::from_hex(n.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn digest_is_known_for_server_and_mismatch_errors() {
        let d = digest(1);
        assert_eq!(FileSyncError::ServerError(404, d.clone()).digest(), Some(&d));
        assert_eq!(FileSyncError::PersistentMismatch(d.clone()).digest(), Some(&d));
    }

    #[test]
    fn digest_is_unknown_for_store_errors() {
        let err = FileSyncError::Store(FileStoreError::NotFound(digest(2)));
        assert_eq!(err.digest(), None);
    }
}
