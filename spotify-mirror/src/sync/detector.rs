use std::fmt;

use super::model::CollectionKey;
use super::store::{LibraryStore, StoreError};

/// What the remote currently reports for a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSummary {
    pub snapshot_token: Option<String>,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReason {
    NeverSynced,
    SnapshotChanged {
        stored: Option<String>,
        remote: String,
    },
    CountChanged {
        stored: i64,
        remote: u32,
    },
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncReason::NeverSynced => f.write_str("never synced"),
            SyncReason::SnapshotChanged { stored: None, .. } => {
                f.write_str("snapshot appeared")
            }
            SyncReason::SnapshotChanged {
                stored: Some(stored),
                remote,
            } => write!(f, "snapshot changed ({stored} -> {remote})"),
            SyncReason::CountChanged { stored, remote } => {
                write!(f, "count changed ({stored} -> {remote})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    Skip,
    MustSync(SyncReason),
}

/// Decides whether `key` has to be refetched. Never writes.
///
/// A snapshot token is authoritative when the remote provides one. Without
/// it the decision falls back to comparing counts, which misses edits that
/// keep the length unchanged (a swap, or one removal plus one addition).
pub async fn should_sync(
    store: &LibraryStore,
    key: &CollectionKey,
    remote: &RemoteSummary,
) -> Result<SyncDecision, StoreError> {
    let Some(checkpoint) = store.get_checkpoint(key).await? else {
        return Ok(SyncDecision::MustSync(SyncReason::NeverSynced));
    };

    if let CollectionKey::Playlist(_) = key {
        if let Some(token) = &remote.snapshot_token {
            return Ok(if checkpoint.snapshot_token.as_ref() == Some(token) {
                SyncDecision::Skip
            } else {
                SyncDecision::MustSync(SyncReason::SnapshotChanged {
                    stored: checkpoint.snapshot_token,
                    remote: token.clone(),
                })
            });
        }
    }

    let stored = match key {
        CollectionKey::SavedTracks => store.saved_track_count().await?,
        CollectionKey::Playlist(id) => store.playlist_link_count(id).await?,
    };
    if stored == i64::from(remote.total) {
        Ok(SyncDecision::Skip)
    } else {
        Ok(SyncDecision::MustSync(SyncReason::CountChanged {
            stored,
            remote: remote.total,
        }))
    }
}
