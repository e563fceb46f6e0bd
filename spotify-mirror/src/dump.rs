//! Unfiltered API JSON for one playlist or the whole playlist listing, for
//! inspecting what the service actually returns.

use std::future::Future;

use serde_json::{Map, Value};
use spotify_core::{Paging, Playlist, SpotifyClient, SpotifyError};
use thiserror::Error;

const LISTING_PAGE_SIZE: u32 = 50;
const ITEM_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error(transparent)]
    Api(#[from] SpotifyError),
    #[error("no playlist matched {0:?}")]
    NoMatch(String),
    #[error("{} playlists matched {name:?}", .candidates.len())]
    Ambiguous { name: String, candidates: Vec<String> },
}

/// Every playlist of the current user, as a JSON array.
pub async fn playlists(client: &SpotifyClient) -> Result<Value, DumpError> {
    let items = collect_pages(|offset| client.playlists_raw(LISTING_PAGE_SIZE, offset)).await?;
    Ok(Value::Array(items))
}

/// The playlist named `name` with all of its items inlined under
/// `tracks.items`. Names compare case-insensitively; with `contains` a
/// substring match is accepted when no name matches exactly.
pub async fn playlist(
    client: &SpotifyClient,
    name: &str,
    contains: bool,
) -> Result<Value, DumpError> {
    let listing = collect_pages(|offset| client.playlists(LISTING_PAGE_SIZE, offset)).await?;
    let selected = select(&listing, name, contains)?;

    let base = client.playlist_raw(&selected.id).await?;
    let items = collect_pages(|offset| {
        client.playlist_items_raw(&selected.id, ITEM_PAGE_SIZE, offset)
    })
    .await?;
    Ok(inline_items(base, items))
}

pub fn to_json(value: &Value, compact: bool) -> serde_json::Result<String> {
    if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
}

fn select<'a>(
    listing: &'a [Playlist],
    name: &str,
    contains: bool,
) -> Result<&'a Playlist, DumpError> {
    let needle = name.to_lowercase();
    let mut matches: Vec<&Playlist> = listing
        .iter()
        .filter(|playlist| playlist.name.to_lowercase() == needle)
        .collect();
    if matches.is_empty() && contains {
        matches = listing
            .iter()
            .filter(|playlist| playlist.name.to_lowercase().contains(&needle))
            .collect();
    }
    match matches.as_slice() {
        [] => Err(DumpError::NoMatch(name.to_string())),
        [only] => Ok(*only),
        several => Err(DumpError::Ambiguous {
            name: name.to_string(),
            candidates: several
                .iter()
                .map(|playlist| format!("{} (id={})", playlist.name, playlist.id))
                .collect(),
        }),
    }
}

fn inline_items(mut playlist: Value, items: Vec<Value>) -> Value {
    if let Value::Object(fields) = &mut playlist {
        let tracks = fields
            .entry("tracks")
            .or_insert_with(|| Value::Object(Map::new()));
        if !tracks.is_object() {
            *tracks = Value::Object(Map::new());
        }
        if let Value::Object(tracks) = tracks {
            tracks.insert("total".into(), Value::from(items.len()));
            tracks.insert("items".into(), Value::Array(items));
        }
    }
    playlist
}

async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, SpotifyError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Paging<T>, SpotifyError>>,
{
    let mut collected = Vec::new();
    let mut offset = 0u32;
    loop {
        let page = fetch(offset).await?;
        let delivered = u32::try_from(page.items.len()).unwrap_or(u32::MAX);
        collected.extend(page.items);
        if page.next.is_none() || delivered == 0 {
            return Ok(collected);
        }
        offset = offset.saturating_add(delivered);
    }
}
