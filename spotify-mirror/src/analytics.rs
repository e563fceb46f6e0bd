//! Read-only queries over the mirrored library. Nothing here touches the network.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::sync::model::TrackRecord;
use crate::sync::store::{LibraryStore, Membership, StoreError};

pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const DEFAULT_DUPLICATE_LIMIT: usize = 5;
pub const TOP_ARTIST_COUNT: usize = 5;
pub const LIKED_SONGS: &str = "Liked Songs";

/// Free-text query plus optional per-field filters. Empty strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub query: Option<String>,
    pub name: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl SearchQuery {
    pub fn text(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        [&self.query, &self.name, &self.artist, &self.album]
            .iter()
            .all(|value| normalized(value).is_none())
    }

    fn matcher(&self) -> Matcher {
        Matcher {
            query: normalized(&self.query),
            name: normalized(&self.name),
            artist: normalized(&self.artist),
            album: normalized(&self.album),
        }
    }
}

fn normalized(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_lowercase)
}

struct Matcher {
    query: Option<String>,
    name: Option<String>,
    artist: Option<String>,
    album: Option<String>,
}

impl Matcher {
    fn matches(&self, track: &TrackRecord) -> bool {
        let name = track.name.to_lowercase();
        let artist = track.artists.to_lowercase();
        let album = track.album.to_lowercase();

        let field = |needle: &Option<String>, haystack: &str| {
            needle
                .as_deref()
                .is_none_or(|needle| haystack.contains(needle))
        };
        let any = self.query.as_deref().is_none_or(|query| {
            name.contains(query) || artist.contains(query) || album.contains(query)
        });

        any && field(&self.name, &name)
            && field(&self.artist, &artist)
            && field(&self.album, &album)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults {
    pub tracks: Vec<TrackRecord>,
    /// More tracks matched than `limit` allowed.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistRef {
    pub id: String,
    pub name: String,
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Duplicate {
    pub track: TrackRecord,
    pub occurrences: i64,
    pub playlists: Vec<PlaylistRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtistCount {
    pub name: String,
    pub tracks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryStats {
    pub tracks: i64,
    pub saved_tracks: i64,
    pub playlists: i64,
    pub links: i64,
    pub total_duration_ms: i64,
    pub top_artists: Vec<ArtistCount>,
}

impl LibraryStats {
    pub fn total_hours(&self) -> f64 {
        self.total_duration_ms as f64 / 3_600_000.0
    }
}

/// A place a track lives in: a playlist, or the saved-tracks set
/// (`playlist_id` is `None` and `positions` empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPlacement {
    pub playlist_id: Option<String>,
    pub name: String,
    pub owner: String,
    pub external_url: Option<String>,
    pub positions: Vec<i64>,
}

impl TrackPlacement {
    pub fn is_liked_songs(&self) -> bool {
        self.playlist_id.is_none()
    }
}

#[derive(Clone)]
pub struct Analytics {
    store: LibraryStore,
}

impl Analytics {
    pub fn new(store: LibraryStore) -> Self {
        Self { store }
    }

    /// Case-insensitive substring search. A bare query matches name, artist or
    /// album; field filters must all match. Results keep store insertion order.
    pub async fn search(
        &self,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<SearchResults, StoreError> {
        let matcher = query.matcher();
        let mut tracks = self
            .store
            .find_tracks(|track| matcher.matches(track), limit.saturating_add(1))
            .await?;
        let truncated = tracks.len() > limit;
        tracks.truncate(limit);
        Ok(SearchResults { tracks, truncated })
    }

    /// Tracks linked from playlists more than once, most linked first.
    pub async fn find_duplicates(&self, limit: usize) -> Result<Vec<Duplicate>, StoreError> {
        let mut counted = self.store.count_links_by_track(2).await?;
        counted.sort_by(|(left, left_count), (right, right_count)| {
            right_count
                .cmp(left_count)
                .then_with(|| left.name.cmp(&right.name))
                .then_with(|| left.id.cmp(&right.id))
        });
        counted.truncate(limit);

        let ids: Vec<String> = counted.iter().map(|(track, _)| track.id.clone()).collect();
        let mut memberships = self.store.memberships_for_tracks(&ids).await?;
        Ok(counted
            .into_iter()
            .map(|(track, occurrences)| {
                let playlists = memberships
                    .remove(&track.id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|membership| PlaylistRef {
                        id: membership.playlist.id,
                        name: membership.playlist.name,
                        external_url: membership.playlist.external_url,
                    })
                    .collect();
                Duplicate {
                    track,
                    occurrences,
                    playlists,
                }
            })
            .collect())
    }

    pub async fn library_stats(&self) -> Result<LibraryStats, StoreError> {
        let counts = self.store.library_counts().await?;

        let mut per_artist: HashMap<String, usize> = HashMap::new();
        self.store
            .scan_tracks(|track| {
                for artist in track.artists.split(", ").filter(|name| !name.is_empty()) {
                    *per_artist.entry(artist.to_string()).or_default() += 1;
                }
            })
            .await?;
        let mut top_artists: Vec<ArtistCount> = per_artist
            .into_iter()
            .map(|(name, tracks)| ArtistCount { name, tracks })
            .collect();
        top_artists.sort_by_key(|artist| (Reverse(artist.tracks), artist.name.clone()));
        top_artists.truncate(TOP_ARTIST_COUNT);

        Ok(LibraryStats {
            tracks: counts.tracks,
            saved_tracks: counts.saved_tracks,
            playlists: counts.playlists,
            links: counts.links,
            total_duration_ms: counts.total_duration_ms,
            top_artists,
        })
    }

    /// Every playlist holding `track_id`, plus the saved-tracks set when the
    /// track is liked, ordered by name ignoring case.
    pub async fn playlists_for_track(
        &self,
        track_id: &str,
    ) -> Result<Vec<TrackPlacement>, StoreError> {
        let memberships = self.store.memberships_for_track(track_id).await?;
        let saved = self.store.is_saved(track_id).await?;
        Ok(placements(memberships, saved))
    }

    /// [`Analytics::playlists_for_track`] for a whole result list in two
    /// queries. Every requested id gets an entry, empty when it is nowhere.
    pub async fn placements_for_tracks(
        &self,
        track_ids: &[String],
    ) -> Result<HashMap<String, Vec<TrackPlacement>>, StoreError> {
        let mut memberships = self.store.memberships_for_tracks(track_ids).await?;
        let saved = self.store.saved_among(track_ids).await?;
        Ok(track_ids
            .iter()
            .map(|id| {
                let found = memberships.remove(id).unwrap_or_default();
                (id.clone(), placements(found, saved.contains(id)))
            })
            .collect())
    }
}

fn placements(memberships: Vec<Membership>, saved: bool) -> Vec<TrackPlacement> {
    let mut placements: Vec<TrackPlacement> = memberships
        .into_iter()
        .map(|membership| TrackPlacement {
            playlist_id: Some(membership.playlist.id),
            name: membership.playlist.name,
            owner: membership.playlist.owner,
            external_url: membership.playlist.external_url,
            positions: membership.positions,
        })
        .collect();

    if saved {
        placements.push(TrackPlacement {
            playlist_id: None,
            name: LIKED_SONGS.to_string(),
            owner: "You".to_string(),
            external_url: None,
            positions: Vec::new(),
        });
    }

    placements.sort_by_cached_key(|placement| placement.name.to_lowercase());
    placements
}
