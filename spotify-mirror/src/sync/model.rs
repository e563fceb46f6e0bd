use std::fmt;

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::remote::{RawPlaylist, RawTrack};

/// Prefix of synthetic ids; remote catalog ids are base-62 and never contain `:`.
pub const LOCAL_ID_PREFIX: &str = "local:";

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Stable identity for a track that has no catalog id.
pub fn local_track_id(name: &str, artist: &str, album: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(artist.as_bytes());
    hasher.update([0x1f]);
    hasher.update(album.as_bytes());
    let digest = hasher.finalize();
    let mut id = String::with_capacity(LOCAL_ID_PREFIX.len() + digest.len() * 2);
    id.push_str(LOCAL_ID_PREFIX);
    for byte in digest {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionKey {
    SavedTracks,
    Playlist(String),
}

impl CollectionKey {
    pub fn as_key(&self) -> String {
        match self {
            CollectionKey::SavedTracks => "saved".to_string(),
            CollectionKey::Playlist(id) => format!("playlist:{id}"),
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRecord {
    pub id: String,
    pub name: String,
    /// Primary (first credited) artist.
    pub artist: String,
    /// Full credit, comma separated.
    pub artists: String,
    pub album: String,
    pub duration_ms: i64,
    pub uri: Option<String>,
    pub external_url: Option<String>,
    pub is_local: bool,
}

impl TrackRecord {
    pub fn from_raw(raw: &RawTrack) -> Self {
        let artist = raw
            .artists
            .first()
            .cloned()
            .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
        let artists = if raw.artists.is_empty() {
            UNKNOWN_ARTIST.to_string()
        } else {
            raw.artists.join(", ")
        };
        let catalog_id = raw
            .id
            .as_deref()
            .filter(|id| !raw.is_local && !id.is_empty());
        let id = match catalog_id {
            Some(id) => id.to_string(),
            None => local_track_id(&raw.name, &artist, &raw.album),
        };
        let is_local = catalog_id.is_none();
        Self {
            id,
            name: raw.name.clone(),
            artist,
            artists,
            album: raw.album.clone(),
            duration_ms: i64::try_from(raw.duration_ms).unwrap_or(i64::MAX),
            uri: raw.uri.clone().filter(|uri| !uri.is_empty()),
            external_url: if is_local {
                None
            } else {
                raw.external_url.clone().filter(|url| !url.is_empty())
            },
            is_local,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistRecord {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub description: String,
    pub snapshot_token: Option<String>,
    pub track_count: i64,
    pub public: bool,
    pub collaborative: bool,
    pub external_url: Option<String>,
}

impl PlaylistRecord {
    pub fn from_raw(raw: &RawPlaylist) -> Self {
        Self {
            id: raw.id.clone(),
            name: raw.name.clone(),
            owner: raw.owner.clone(),
            description: raw.description.clone(),
            snapshot_token: raw.snapshot_token.clone(),
            track_count: i64::from(raw.track_total),
            public: raw.public,
            collaborative: raw.collaborative,
            external_url: raw.external_url.clone(),
        }
    }
}

/// One slot of a playlist as handed to the store for replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistLink {
    pub position: i64,
    pub track: TrackRecord,
    pub added_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub playlist_id: String,
    pub position: i64,
    pub track_id: String,
    pub added_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedEntry {
    pub track: TrackRecord,
    pub added_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub snapshot_token: Option<String>,
    pub observed_count: i64,
    pub last_synced_at: i64,
}

pub fn parse_timestamp(value: Option<&str>) -> Option<i64> {
    let value = value?;
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|parsed| parsed.unix_timestamp())
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
