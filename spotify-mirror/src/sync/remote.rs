use std::future::Future;

use spotify_core::{Paging, SpotifyClient, SpotifyError, Track};
use thiserror::Error;

use super::backoff::Backoff;

pub const SAVED_PAGE_SIZE: u32 = 50;
pub const PLAYLIST_PAGE_SIZE: u32 = 50;
pub const PLAYLIST_ITEM_PAGE_SIZE: u32 = 100;

const DEFAULT_MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("access token expired or was rejected")]
    AuthExpired,
    #[error("remote fetch failed: {0}")]
    Fetch(String),
}

/// Track as delivered by the remote, before identity is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTrack {
    pub id: Option<String>,
    pub name: String,
    pub artists: Vec<String>,
    pub album: String,
    pub duration_ms: u64,
    pub uri: Option<String>,
    pub external_url: Option<String>,
    pub is_local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSavedTrack {
    pub track: Option<RawTrack>,
    pub added_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPlaylistItem {
    /// Absolute position in the playlist; counts unavailable entries too.
    pub position: u32,
    pub track: Option<RawTrack>,
    pub added_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPlaylist {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub description: String,
    pub snapshot_token: Option<String>,
    pub track_total: u32,
    pub public: bool,
    pub collaborative: bool,
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u32,
    pub next_offset: Option<u32>,
}

/// Paged read access to a user's library.
pub trait RemoteLibrary: Send + Sync {
    fn saved_tracks_page(
        &self,
        offset: u32,
    ) -> impl Future<Output = Result<Page<RawSavedTrack>, RemoteError>> + Send;

    fn saved_tracks_total(&self) -> impl Future<Output = Result<u32, RemoteError>> + Send;

    fn playlists_page(
        &self,
        offset: u32,
    ) -> impl Future<Output = Result<Page<RawPlaylist>, RemoteError>> + Send;

    fn playlist_tracks_page(
        &self,
        playlist_id: &str,
        offset: u32,
    ) -> impl Future<Output = Result<Page<RawPlaylistItem>, RemoteError>> + Send;
}

/// [`RemoteLibrary`] backed by the Spotify Web API.
pub struct SpotifyRemote {
    client: SpotifyClient,
    backoff: Backoff,
    max_attempts: u32,
}

impl SpotifyRemote {
    pub fn new(client: SpotifyClient) -> Self {
        Self {
            client,
            backoff: Backoff::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff, max_attempts: u32) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, SpotifyError>> + Send,
    {
        let mut attempt = 0u32;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            // 403 refuses one resource; only 401 means the token itself is dead.
            if is_token_rejection(&err) {
                return Err(RemoteError::AuthExpired);
            }
            let retryable = err.is_retryable() || matches!(err, SpotifyError::Request(_));
            attempt += 1;
            if !retryable || attempt >= self.max_attempts {
                return Err(RemoteError::Fetch(format!("{what}: {err}")));
            }
            let delay = self.backoff.delay_honoring(attempt - 1, err.retry_after());
            tracing::warn!(
                request = what,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying remote request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_token_rejection(err: &SpotifyError) -> bool {
    matches!(err, SpotifyError::Api { status, .. } if status.as_u16() == 401)
}

impl RemoteLibrary for SpotifyRemote {
    async fn saved_tracks_page(&self, offset: u32) -> Result<Page<RawSavedTrack>, RemoteError> {
        let paging = self
            .with_retry("saved tracks", || {
                self.client.saved_tracks(SAVED_PAGE_SIZE, offset)
            })
            .await?;
        Ok(into_page(paging, offset, |_, item| RawSavedTrack {
            track: item.track.map(|track| raw_track(track, false)),
            added_at: item.added_at,
        }))
    }

    async fn saved_tracks_total(&self) -> Result<u32, RemoteError> {
        let paging = self
            .with_retry("saved tracks total", || self.client.saved_tracks(1, 0))
            .await?;
        Ok(paging.total)
    }

    async fn playlists_page(&self, offset: u32) -> Result<Page<RawPlaylist>, RemoteError> {
        let paging = self
            .with_retry("playlists", || {
                self.client.playlists(PLAYLIST_PAGE_SIZE, offset)
            })
            .await?;
        Ok(into_page(paging, offset, |_, playlist| {
            let owner = playlist
                .owner
                .map(|owner| owner.display_name.unwrap_or(owner.id))
                .unwrap_or_default();
            RawPlaylist {
                id: playlist.id,
                name: playlist.name,
                owner,
                description: playlist.description.unwrap_or_default(),
                snapshot_token: playlist.snapshot_id.filter(|token| !token.is_empty()),
                track_total: playlist.tracks.map(|tracks| tracks.total).unwrap_or(0),
                public: playlist.public.unwrap_or(false),
                collaborative: playlist.collaborative,
                external_url: playlist.external_urls.and_then(|urls| urls.spotify),
            }
        }))
    }

    async fn playlist_tracks_page(
        &self,
        playlist_id: &str,
        offset: u32,
    ) -> Result<Page<RawPlaylistItem>, RemoteError> {
        let what = format!("playlist {playlist_id}");
        let paging = self
            .with_retry(&what, || {
                self.client
                    .playlist_items(playlist_id, PLAYLIST_ITEM_PAGE_SIZE, offset)
            })
            .await?;
        Ok(into_page(paging, offset, |index, item| {
            let item_is_local = item.is_local;
            RawPlaylistItem {
                position: offset + index,
                track: item.track.map(|track| raw_track(track, item_is_local)),
                added_at: item.added_at,
            }
        }))
    }
}

fn into_page<S, T>(paging: Paging<S>, offset: u32, mut convert: impl FnMut(u32, S) -> T) -> Page<T> {
    let fetched = paging.items.len() as u32;
    let next_offset = match paging.next {
        Some(_) if fetched > 0 => Some(offset + fetched),
        _ => None,
    };
    Page {
        items: paging
            .items
            .into_iter()
            .enumerate()
            .map(|(index, item)| convert(index as u32, item))
            .collect(),
        total: paging.total,
        next_offset,
    }
}

fn raw_track(track: Track, item_is_local: bool) -> RawTrack {
    RawTrack {
        id: track.id.filter(|id| !id.is_empty()),
        name: track.name.unwrap_or_default(),
        artists: track
            .artists
            .unwrap_or_default()
            .into_iter()
            .filter_map(|artist| artist.name)
            .filter(|name| !name.is_empty())
            .collect(),
        album: track
            .album
            .and_then(|album| album.name)
            .unwrap_or_default(),
        duration_ms: track.duration_ms.unwrap_or(0),
        uri: track.uri,
        external_url: track.external_urls.and_then(|urls| urls.spotify),
        is_local: track.is_local || item_is_local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote(server: &MockServer) -> SpotifyRemote {
        let client = SpotifyClient::with_base_url(&server.uri(), "token").unwrap();
        SpotifyRemote::new(client).with_backoff(
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5), false),
            3,
        )
    }

    #[tokio::test]
    async fn playlist_items_get_absolute_positions_and_local_flag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/playlists/p1/tracks"))
            .and(query_param("offset", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 103,
                "next": null,
                "items": [
                    {
                        "added_at": "2024-01-01T00:00:00Z",
                        "is_local": true,
                        "track": {
                            "id": null,
                            "name": "Demo",
                            "artists": [{"name": "Me"}, {"name": ""}],
                            "album": {"name": "Tapes"},
                            "duration_ms": 1000
                        }
                    },
                    { "is_local": false, "track": null },
                    {
                        "is_local": false,
                        "track": {
                            "id": "t9",
                            "name": "Real",
                            "artists": [{"id": "a", "name": "Band"}],
                            "album": {"name": "LP"},
                            "duration_ms": 2000,
                            "external_urls": {"spotify": "https://open.spotify.com/track/t9"}
                        }
                    }
                ]
            })))
            .mount(&server)
            .await;

        let page = remote(&server).playlist_tracks_page("p1", 100).await.unwrap();

        assert_eq!(page.total, 103);
        assert_eq!(page.next_offset, None);
        let positions: Vec<u32> = page.items.iter().map(|item| item.position).collect();
        assert_eq!(positions, vec![100, 101, 102]);
        let local = page.items[0].track.as_ref().unwrap();
        assert!(local.is_local);
        assert_eq!(local.artists, vec!["Me".to_string()]);
        assert!(page.items[1].track.is_none());
        let real = page.items[2].track.as_ref().unwrap();
        assert_eq!(real.id.as_deref(), Some("t9"));
        assert_eq!(
            real.external_url.as_deref(),
            Some("https://open.spotify.com/track/t9")
        );
    }

    #[tokio::test]
    async fn next_offset_follows_delivered_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/me/playlists"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 3,
                "next": "https://api.spotify.com/v1/me/playlists?offset=2",
                "items": [
                    {
                        "id": "p1",
                        "name": "One",
                        "owner": {"id": "u1", "display_name": "User"},
                        "snapshot_id": "s1",
                        "tracks": {"total": 4}
                    },
                    { "id": "p2", "name": "Two", "owner": {"id": "u1"}, "snapshot_id": "" }
                ]
            })))
            .mount(&server)
            .await;

        let page = remote(&server).playlists_page(0).await.unwrap();

        assert_eq!(page.next_offset, Some(2));
        assert_eq!(page.items[0].owner, "User");
        assert_eq!(page.items[0].snapshot_token.as_deref(), Some("s1"));
        assert_eq!(page.items[0].track_total, 4);
        assert_eq!(page.items[1].owner, "u1");
        assert!(page.items[1].snapshot_token.is_none());
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/me/tracks"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/me/tracks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 7,
                "next": null,
                "items": []
            })))
            .mount(&server)
            .await;

        let total = remote(&server).saved_tracks_total().await.unwrap();
        assert_eq!(total, 7);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/me/tracks"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .expect(3)
            .mount(&server)
            .await;

        let err = remote(&server).saved_tracks_page(0).await.unwrap_err();
        assert!(matches!(err, RemoteError::Fetch(_)));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/playlists/gone/tracks"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .expect(1)
            .mount(&server)
            .await;

        let err = remote(&server)
            .playlist_tracks_page("gone", 0)
            .await
            .unwrap_err();
        match err {
            RemoteError::Fetch(message) => assert!(message.contains("playlist gone")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_token_maps_to_auth_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/me/playlists"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = remote(&server).playlists_page(0).await.unwrap_err();
        assert!(matches!(err, RemoteError::AuthExpired));
    }

    #[tokio::test]
    async fn forbidden_playlist_fails_only_that_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/playlists/editorial/tracks"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&server)
            .await;

        let err = remote(&server)
            .playlist_tracks_page("editorial", 0)
            .await
            .unwrap_err();
        match err {
            RemoteError::Fetch(message) => assert!(message.contains("playlist editorial")),
            other => panic!("403 should stay scoped to the playlist: {other:?}"),
        }
    }
}
