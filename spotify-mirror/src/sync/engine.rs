use std::fmt;
use std::future::Future;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::detector::{RemoteSummary, SyncDecision, should_sync};
use super::model::{
    Checkpoint, CollectionKey, PlaylistLink, PlaylistRecord, SavedEntry, TrackRecord, now_unix,
    parse_timestamp,
};
use super::remote::{Page, RawPlaylist, RemoteError, RemoteLibrary};
use super::store::{LibraryStore, StoreError};

/// Report key of the playlist listing itself.
pub const PLAYLIST_LISTING_KEY: &str = "playlists";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authorization expired during sync; re-run `auth`")]
    AuthExpired,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("playlist filter {filter:?} matches {} playlists", .candidates.len())]
    AmbiguousPlaylistSelection {
        filter: String,
        candidates: Vec<String>,
    },
    #[error("no playlist matches {filter:?}")]
    NoMatchingPlaylist { filter: String },
    #[error("playlist listing failed, cannot resolve filter: {0}")]
    ListingUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Full,
    Diff,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub mode: SyncMode,
    /// Empty the store before syncing.
    pub clear: bool,
    /// Case-insensitive substring of a playlist name.
    pub playlist_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionStatus {
    Synced,
    Skipped,
    Failed(String),
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionStatus::Synced => f.write_str("synced"),
            CollectionStatus::Skipped => f.write_str("skipped"),
            CollectionStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    pub key: String,
    pub name: String,
    pub status: CollectionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub collections: Vec<CollectionReport>,
    pub tracks_added: usize,
    pub links_replaced: usize,
}

impl SyncReport {
    pub fn status_of(&self, key: &str) -> Option<&CollectionStatus> {
        self.collections
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.status)
    }

    pub fn count(&self, wanted: fn(&CollectionStatus) -> bool) -> usize {
        self.collections
            .iter()
            .filter(|entry| wanted(&entry.status))
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.count(|status| matches!(status, CollectionStatus::Failed(_))) > 0
    }

    fn push(&mut self, key: impl Into<String>, name: impl Into<String>, status: CollectionStatus) {
        self.collections.push(CollectionReport {
            key: key.into(),
            name: name.into(),
            status,
        });
    }
}

/// Failure inside one collection, before it is classified as scoped or fatal.
#[derive(Debug)]
enum CollectionError {
    Remote(RemoteError),
    Store(StoreError),
}

impl From<RemoteError> for CollectionError {
    fn from(err: RemoteError) -> Self {
        CollectionError::Remote(err)
    }
}

impl From<StoreError> for CollectionError {
    fn from(err: StoreError) -> Self {
        CollectionError::Store(err)
    }
}

#[derive(Debug, Default)]
struct Applied {
    tracks_added: usize,
    links_replaced: usize,
}

enum Outcome {
    Applied(Applied),
    Skipped,
}

pub struct SyncEngine<R> {
    remote: R,
    store: LibraryStore,
}

impl<R: RemoteLibrary> SyncEngine<R> {
    pub fn new(remote: R, store: LibraryStore) -> Self {
        Self { remote, store }
    }

    pub fn store(&self) -> &LibraryStore {
        &self.store
    }

    pub async fn run_sync(&self, options: &SyncOptions) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        let listing = match collect_pages(|offset| self.remote.playlists_page(offset)).await {
            Ok((playlists, _)) => Ok(playlists),
            Err(RemoteError::AuthExpired) => return Err(SyncError::AuthExpired),
            Err(RemoteError::Fetch(reason)) => Err(reason),
        };

        let selected = match (&options.playlist_filter, &listing) {
            (Some(filter), Ok(playlists)) => Some(select_playlist(filter, playlists)?),
            (Some(_), Err(reason)) => return Err(SyncError::ListingUnavailable(reason.clone())),
            (None, _) => None,
        };

        if options.clear {
            info!("clearing local library before sync");
            self.store.clear_all().await?;
        }

        match &listing {
            Ok(playlists) => {
                debug!(playlists = playlists.len(), "fetched playlist listing");
                report.push(PLAYLIST_LISTING_KEY, "Playlists", CollectionStatus::Synced);
            }
            Err(reason) => {
                warn!(error = %reason, "playlist listing failed");
                report.push(
                    PLAYLIST_LISTING_KEY,
                    "Playlists",
                    CollectionStatus::Failed(reason.clone()),
                );
            }
        }

        match selected {
            Some(playlist) => {
                let result = self.sync_playlist(playlist, options.mode).await;
                self.settle(
                    &mut report,
                    CollectionKey::Playlist(playlist.id.clone()),
                    &playlist.name,
                    result,
                )?;
            }
            None => {
                let result = self.sync_saved_tracks(options.mode).await;
                self.settle(&mut report, CollectionKey::SavedTracks, "Liked Songs", result)?;

                for playlist in listing.as_deref().unwrap_or_default() {
                    let result = self.sync_playlist(playlist, options.mode).await;
                    self.settle(
                        &mut report,
                        CollectionKey::Playlist(playlist.id.clone()),
                        &playlist.name,
                        result,
                    )?;
                }
            }
        }

        info!(
            synced = report.count(|status| *status == CollectionStatus::Synced),
            skipped = report.count(|status| *status == CollectionStatus::Skipped),
            failed = report.count(|status| matches!(status, CollectionStatus::Failed(_))),
            tracks_added = report.tracks_added,
            links_replaced = report.links_replaced,
            "sync finished"
        );
        Ok(report)
    }

    /// Records the result of one collection. Errors that only concern this
    /// collection become `Failed`; the rest abort the run.
    fn settle(
        &self,
        report: &mut SyncReport,
        key: CollectionKey,
        name: &str,
        result: Result<Outcome, CollectionError>,
    ) -> Result<(), SyncError> {
        let status = match result {
            Ok(Outcome::Applied(applied)) => {
                report.tracks_added += applied.tracks_added;
                report.links_replaced += applied.links_replaced;
                info!(
                    collection = %key,
                    tracks_added = applied.tracks_added,
                    links = applied.links_replaced,
                    "collection synced"
                );
                CollectionStatus::Synced
            }
            Ok(Outcome::Skipped) => {
                debug!(collection = %key, "collection unchanged, skipped");
                CollectionStatus::Skipped
            }
            Err(CollectionError::Remote(RemoteError::AuthExpired)) => {
                return Err(SyncError::AuthExpired);
            }
            Err(CollectionError::Remote(RemoteError::Fetch(reason))) => {
                warn!(collection = %key, error = %reason, "collection fetch failed");
                CollectionStatus::Failed(reason)
            }
            Err(CollectionError::Store(err)) if err.is_constraint_violation() => {
                warn!(collection = %key, error = %err, "collection rejected by store");
                CollectionStatus::Failed(err.to_string())
            }
            Err(CollectionError::Store(err)) => return Err(SyncError::Store(err)),
        };
        report.push(key.as_key(), name, status);
        Ok(())
    }

    async fn sync_saved_tracks(&self, mode: SyncMode) -> Result<Outcome, CollectionError> {
        let key = CollectionKey::SavedTracks;
        if mode == SyncMode::Diff {
            let total = self.remote.saved_tracks_total().await?;
            let summary = RemoteSummary {
                snapshot_token: None,
                total,
            };
            match should_sync(&self.store, &key, &summary).await? {
                SyncDecision::Skip => return Ok(Outcome::Skipped),
                SyncDecision::MustSync(reason) => {
                    debug!(collection = %key, %reason, "collection changed");
                }
            }
        }

        let (items, total) = collect_pages(|offset| self.remote.saved_tracks_page(offset)).await?;
        let entries: Vec<SavedEntry> = items
            .into_iter()
            .filter_map(|item| {
                let track = item.track?;
                Some(SavedEntry {
                    track: TrackRecord::from_raw(&track),
                    added_at: parse_timestamp(item.added_at.as_deref()),
                })
            })
            .collect();

        let outcome = self.store.reconcile_saved_tracks(&entries).await?;
        debug!(
            added = outcome.added,
            removed = outcome.removed,
            unchanged = outcome.unchanged,
            "saved tracks reconciled"
        );
        self.store
            .set_checkpoint(
                &key,
                &Checkpoint {
                    snapshot_token: None,
                    observed_count: i64::from(total),
                    last_synced_at: now_unix(),
                },
            )
            .await?;

        Ok(Outcome::Applied(Applied {
            tracks_added: outcome.tracks_inserted,
            links_replaced: 0,
        }))
    }

    async fn sync_playlist(
        &self,
        playlist: &RawPlaylist,
        mode: SyncMode,
    ) -> Result<Outcome, CollectionError> {
        let key = CollectionKey::Playlist(playlist.id.clone());
        if mode == SyncMode::Diff {
            let summary = RemoteSummary {
                snapshot_token: playlist.snapshot_token.clone(),
                total: playlist.track_total,
            };
            match should_sync(&self.store, &key, &summary).await? {
                SyncDecision::Skip => return Ok(Outcome::Skipped),
                SyncDecision::MustSync(reason) => {
                    debug!(collection = %key, %reason, "collection changed");
                }
            }
        }

        let (items, total) =
            collect_pages(|offset| self.remote.playlist_tracks_page(&playlist.id, offset)).await?;
        let links: Vec<PlaylistLink> = items
            .into_iter()
            .filter_map(|item| {
                let track = item.track?;
                Some(PlaylistLink {
                    position: i64::from(item.position),
                    track: TrackRecord::from_raw(&track),
                    added_at: parse_timestamp(item.added_at.as_deref()),
                })
            })
            .collect();

        self.store
            .upsert_playlist(&PlaylistRecord::from_raw(playlist))
            .await?;
        let outcome = self
            .store
            .replace_playlist_links(&playlist.id, &links)
            .await?;
        self.store
            .set_checkpoint(
                &key,
                &Checkpoint {
                    snapshot_token: playlist.snapshot_token.clone(),
                    observed_count: i64::from(total),
                    last_synced_at: now_unix(),
                },
            )
            .await?;

        Ok(Outcome::Applied(Applied {
            tracks_added: outcome.tracks_inserted,
            links_replaced: outcome.links_written,
        }))
    }
}

/// Resolves a name filter to exactly one playlist.
fn select_playlist<'a>(
    filter: &str,
    playlists: &'a [RawPlaylist],
) -> Result<&'a RawPlaylist, SyncError> {
    let needle = filter.to_lowercase();
    let matches: Vec<&RawPlaylist> = playlists
        .iter()
        .filter(|playlist| playlist.name.to_lowercase().contains(&needle))
        .collect();
    match matches.as_slice() {
        [] => Err(SyncError::NoMatchingPlaylist {
            filter: filter.to_string(),
        }),
        [only] => Ok(*only),
        many => Err(SyncError::AmbiguousPlaylistSelection {
            filter: filter.to_string(),
            candidates: many.iter().map(|playlist| playlist.name.clone()).collect(),
        }),
    }
}

/// Follows `next_offset` until the remote stops, keeping delivery order.
/// Returns the items and the last reported total.
async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<(Vec<T>, u32), RemoteError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Page<T>, RemoteError>>,
{
    let mut items = Vec::new();
    let mut offset = 0u32;
    loop {
        let page = fetch(offset).await?;
        let total = page.total;
        items.extend(page.items);
        match page.next_offset {
            Some(next) if next > offset => offset = next,
            _ => return Ok((items, total)),
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
