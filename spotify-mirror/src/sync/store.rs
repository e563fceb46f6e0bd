use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures_util::TryStreamExt;
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::model::{
    Checkpoint, CollectionKey, LinkRecord, PlaylistLink, PlaylistRecord, SavedEntry, TrackRecord,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const TRACK_COLUMNS: &str =
    "t.id, t.name, t.artist, t.artists, t.album, t.duration_ms, t.uri, t.external_url, t.is_local";
/// Bound ids per `IN (...)` statement, well under SQLite's parameter limit.
const ID_BATCH: usize = 500;

const PLAYLIST_COLUMNS: &str = "p.id, p.name, p.owner, p.description, p.snapshot_token, p.track_count, p.public, p.collaborative, p.external_url";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("playlist not found: {0}")]
    MissingPlaylist(String),
}

impl StoreError {
    /// True when the write was rejected because of its input rather than
    /// because the database itself failed.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            StoreError::Sqlx(sqlx::Error::Database(db)) => matches!(
                db.kind(),
                ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation
            ),
            StoreError::MissingPlaylist(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceOutcome {
    pub links_written: usize,
    pub tracks_inserted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileOutcome {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub tracks_inserted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LibraryCounts {
    pub tracks: i64,
    pub playlists: i64,
    pub saved_tracks: i64,
    pub links: i64,
    pub total_duration_ms: i64,
}

/// A playlist containing a given track, with every position it occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub playlist: PlaylistRecord,
    pub positions: Vec<i64>,
}

#[derive(Default)]
struct CollectionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CollectionLocks {
    fn handle(&self, key: &CollectionKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(key.as_key()).or_default())
    }
}

/// Local mirror of the library. Cheap to clone; clones share the pool and the
/// per-collection write locks.
#[derive(Clone)]
pub struct LibraryStore {
    pool: SqlitePool,
    locks: Arc<CollectionLocks>,
}

impl LibraryStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(CollectionLocks::default()),
        }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Inserts or overwrites a track by id. Returns `true` when the id was new.
    pub async fn upsert_track(&self, track: &TrackRecord) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_track_in(&mut conn, track).await
    }

    pub async fn upsert_playlist(&self, playlist: &PlaylistRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO playlists (
                id, name, owner, description, snapshot_token, track_count, public, collaborative, external_url
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                owner = excluded.owner,
                description = excluded.description,
                snapshot_token = excluded.snapshot_token,
                track_count = excluded.track_count,
                public = excluded.public,
                collaborative = excluded.collaborative,
                external_url = excluded.external_url",
        )
        .bind(&playlist.id)
        .bind(&playlist.name)
        .bind(&playlist.owner)
        .bind(&playlist.description)
        .bind(&playlist.snapshot_token)
        .bind(playlist.track_count)
        .bind(if playlist.public { 1 } else { 0 })
        .bind(if playlist.collaborative { 1 } else { 0 })
        .bind(&playlist.external_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Swaps the whole link set of a playlist in one transaction. Member tracks
    /// are upserted inside the same transaction.
    pub async fn replace_playlist_links(
        &self,
        playlist_id: &str,
        links: &[PlaylistLink],
    ) -> Result<ReplaceOutcome, StoreError> {
        let lock = self
            .locks
            .handle(&CollectionKey::Playlist(playlist_id.to_string()));
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM playlists WHERE id = ?1")
            .bind(playlist_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::MissingPlaylist(playlist_id.to_string()));
        }

        let mut outcome = ReplaceOutcome::default();
        for link in links {
            if upsert_track_in(&mut tx, &link.track).await? {
                outcome.tracks_inserted += 1;
            }
        }

        sqlx::query("DELETE FROM playlist_tracks WHERE playlist_id = ?1")
            .bind(playlist_id)
            .execute(&mut *tx)
            .await?;
        for link in links {
            sqlx::query(
                "INSERT INTO playlist_tracks (playlist_id, position, track_id, added_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(playlist_id)
            .bind(link.position)
            .bind(&link.track.id)
            .bind(link.added_at)
            .execute(&mut *tx)
            .await?;
            outcome.links_written += 1;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Brings the saved set in line with `current`: additions are inserted,
    /// removals deleted, and entries present on both sides keep their stored row.
    pub async fn reconcile_saved_tracks(
        &self,
        current: &[SavedEntry],
    ) -> Result<ReconcileOutcome, StoreError> {
        let lock = self.locks.handle(&CollectionKey::SavedTracks);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let mut outcome = ReconcileOutcome::default();

        let stored: HashSet<String> = sqlx::query("SELECT track_id FROM saved_tracks")
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|row| row.try_get::<String, _>("track_id"))
            .collect::<Result<_, _>>()?;

        let mut seen = HashSet::with_capacity(current.len());
        for entry in current {
            if !seen.insert(entry.track.id.as_str()) {
                continue;
            }
            if upsert_track_in(&mut tx, &entry.track).await? {
                outcome.tracks_inserted += 1;
            }
            if stored.contains(&entry.track.id) {
                outcome.unchanged += 1;
                continue;
            }
            sqlx::query("INSERT INTO saved_tracks (track_id, added_at) VALUES (?1, ?2)")
                .bind(&entry.track.id)
                .bind(entry.added_at)
                .execute(&mut *tx)
                .await?;
            outcome.added += 1;
        }

        for track_id in stored.iter().filter(|id| !seen.contains(id.as_str())) {
            sqlx::query("DELETE FROM saved_tracks WHERE track_id = ?1")
                .bind(track_id)
                .execute(&mut *tx)
                .await?;
            outcome.removed += 1;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn get_checkpoint(
        &self,
        key: &CollectionKey,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            "SELECT snapshot_token, observed_count, last_synced_at FROM checkpoints WHERE collection_key = ?1",
        )
        .bind(key.as_key())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Checkpoint {
            snapshot_token: row.try_get("snapshot_token")?,
            observed_count: row.try_get("observed_count")?,
            last_synced_at: row.try_get("last_synced_at")?,
        }))
    }

    pub async fn set_checkpoint(
        &self,
        key: &CollectionKey,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO checkpoints (collection_key, snapshot_token, observed_count, last_synced_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection_key) DO UPDATE SET
                snapshot_token = excluded.snapshot_token,
                observed_count = excluded.observed_count,
                last_synced_at = excluded.last_synced_at",
        )
        .bind(key.as_key())
        .bind(&checkpoint.snapshot_token)
        .bind(checkpoint.observed_count)
        .bind(checkpoint.last_synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_track(&self, id: &str) -> Result<Option<TrackRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TRACK_COLUMNS} FROM tracks t WHERE t.id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(track_from_row).transpose()
    }

    /// Streams tracks in insertion order and keeps the first `limit` the
    /// predicate accepts. Never holds more than the result set in memory.
    pub async fn find_tracks<F>(
        &self,
        mut predicate: F,
        limit: usize,
    ) -> Result<Vec<TrackRecord>, StoreError>
    where
        F: FnMut(&TrackRecord) -> bool,
    {
        let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks t ORDER BY t.rowid ASC");
        let mut rows = sqlx::query(&sql).fetch(&self.pool);
        let mut out = Vec::new();
        while out.len() < limit {
            let Some(row) = rows.try_next().await? else {
                break;
            };
            let track = track_from_row(&row)?;
            if predicate(&track) {
                out.push(track);
            }
        }
        Ok(out)
    }

    /// Visits every track in insertion order.
    pub async fn scan_tracks<F>(&self, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(&TrackRecord),
    {
        let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks t ORDER BY t.rowid ASC");
        let mut rows = sqlx::query(&sql).fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            visit(&track_from_row(&row)?);
        }
        Ok(())
    }

    /// Tracks linked from playlists at least `min_count` times, with their
    /// link count. Unordered.
    pub async fn count_links_by_track(
        &self,
        min_count: i64,
    ) -> Result<Vec<(TrackRecord, i64)>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRACK_COLUMNS}, COUNT(*) AS occurrences
             FROM playlist_tracks l
             JOIN tracks t ON t.id = l.track_id
             GROUP BY l.track_id
             HAVING COUNT(*) >= ?1"
        ))
        .bind(min_count)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let occurrences: i64 = row.try_get("occurrences")?;
            out.push((track_from_row(&row)?, occurrences));
        }
        Ok(out)
    }

    pub async fn get_playlist(&self, id: &str) -> Result<Option<PlaylistRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PLAYLIST_COLUMNS} FROM playlists p WHERE p.id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(playlist_from_row).transpose()
    }

    pub async fn all_playlists(&self) -> Result<Vec<PlaylistRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PLAYLIST_COLUMNS} FROM playlists p ORDER BY p.rowid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(playlist_from_row).collect()
    }

    pub async fn links_for_playlist(&self, id: &str) -> Result<Vec<LinkRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT playlist_id, position, track_id, added_at
             FROM playlist_tracks
             WHERE playlist_id = ?1
             ORDER BY position ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(LinkRecord {
                playlist_id: row.try_get("playlist_id")?,
                position: row.try_get("position")?,
                track_id: row.try_get("track_id")?,
                added_at: row.try_get("added_at")?,
            });
        }
        Ok(out)
    }

    /// Tracks of a playlist in playlist order.
    pub async fn playlist_tracks(
        &self,
        id: &str,
    ) -> Result<Vec<(i64, TrackRecord)>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT l.position, {TRACK_COLUMNS}
             FROM playlist_tracks l
             JOIN tracks t ON t.id = l.track_id
             WHERE l.playlist_id = ?1
             ORDER BY l.position ASC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get("position")?, track_from_row(&row)?));
        }
        Ok(out)
    }

    pub async fn playlist_link_count(&self, id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM playlist_tracks WHERE playlist_id = ?1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn saved_track_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM saved_tracks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn is_saved(&self, track_id: &str) -> Result<bool, StoreError> {
        Ok(
            sqlx::query("SELECT 1 FROM saved_tracks WHERE track_id = ?1")
                .bind(track_id)
                .fetch_optional(&self.pool)
                .await?
                .is_some(),
        )
    }

    /// Saved tracks in insertion order with their `added_at`.
    pub async fn saved_tracks(&self) -> Result<Vec<(TrackRecord, Option<i64>)>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRACK_COLUMNS}, s.added_at AS saved_at
             FROM saved_tracks s
             JOIN tracks t ON t.id = s.track_id
             ORDER BY s.rowid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let saved_at: Option<i64> = row.try_get("saved_at")?;
            out.push((track_from_row(&row)?, saved_at));
        }
        Ok(out)
    }

    /// Playlists linking to `track_id`, in playlist insertion order.
    pub async fn memberships_for_track(
        &self,
        track_id: &str,
    ) -> Result<Vec<Membership>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PLAYLIST_COLUMNS}, l.position
             FROM playlist_tracks l
             JOIN playlists p ON p.id = l.playlist_id
             WHERE l.track_id = ?1
             ORDER BY p.rowid ASC, l.position ASC"
        ))
        .bind(track_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out: Vec<Membership> = Vec::new();
        for row in rows {
            let position: i64 = row.try_get("position")?;
            let playlist_id: String = row.try_get("id")?;
            match out.last_mut() {
                Some(last) if last.playlist.id == playlist_id => last.positions.push(position),
                _ => out.push(Membership {
                    playlist: playlist_from_row(&row)?,
                    positions: vec![position],
                }),
            }
        }
        Ok(out)
    }

    /// [`LibraryStore::memberships_for_track`] for many tracks at once, keyed by
    /// track id. Tracks linked from no playlist are absent from the map.
    pub async fn memberships_for_tracks(
        &self,
        track_ids: &[String],
    ) -> Result<HashMap<String, Vec<Membership>>, StoreError> {
        let mut out: HashMap<String, Vec<Membership>> = HashMap::new();
        for batch in track_ids.chunks(ID_BATCH) {
            let sql = format!(
                "SELECT {PLAYLIST_COLUMNS}, l.track_id, l.position
                 FROM playlist_tracks l
                 JOIN playlists p ON p.id = l.playlist_id
                 WHERE l.track_id IN ({})
                 ORDER BY p.rowid ASC, l.position ASC",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id.as_str());
            }
            for row in query.fetch_all(&self.pool).await? {
                let track_id: String = row.try_get("track_id")?;
                let position: i64 = row.try_get("position")?;
                let playlist_id: String = row.try_get("id")?;
                let memberships = out.entry(track_id).or_default();
                match memberships.last_mut() {
                    Some(last) if last.playlist.id == playlist_id => last.positions.push(position),
                    _ => memberships.push(Membership {
                        playlist: playlist_from_row(&row)?,
                        positions: vec![position],
                    }),
                }
            }
        }
        Ok(out)
    }

    /// The subset of `track_ids` present in the saved-tracks set.
    pub async fn saved_among(&self, track_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let mut saved = HashSet::new();
        for batch in track_ids.chunks(ID_BATCH) {
            let sql = format!(
                "SELECT track_id FROM saved_tracks WHERE track_id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id.as_str());
            }
            for row in query.fetch_all(&self.pool).await? {
                saved.insert(row.try_get::<String, _>("track_id")?);
            }
        }
        Ok(saved)
    }

    pub async fn library_counts(&self) -> Result<LibraryCounts, StoreError> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM tracks) AS tracks,
                (SELECT COUNT(*) FROM playlists) AS playlists,
                (SELECT COUNT(*) FROM saved_tracks) AS saved_tracks,
                (SELECT COUNT(*) FROM playlist_tracks) AS links,
                (SELECT COALESCE(SUM(duration_ms), 0) FROM tracks) AS total_duration_ms",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(LibraryCounts {
            tracks: row.try_get("tracks")?,
            playlists: row.try_get("playlists")?,
            saved_tracks: row.try_get("saved_tracks")?,
            links: row.try_get("links")?,
            total_duration_ms: row.try_get("total_duration_ms")?,
        })
    }

    /// Empties every table, checkpoints included, in one transaction.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "playlist_tracks",
            "saved_tracks",
            "checkpoints",
            "playlists",
            "tracks",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_track_in(
    conn: &mut SqliteConnection,
    track: &TrackRecord,
) -> Result<bool, StoreError> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO tracks (
            id, name, artist, artists, album, duration_ms, uri, external_url, is_local
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )
    .bind(&track.id)
    .bind(&track.name)
    .bind(&track.artist)
    .bind(&track.artists)
    .bind(&track.album)
    .bind(track.duration_ms)
    .bind(&track.uri)
    .bind(&track.external_url)
    .bind(if track.is_local { 1 } else { 0 })
    .execute(&mut *conn)
    .await?
    .rows_affected()
        == 1;
    if inserted {
        return Ok(true);
    }

    sqlx::query(
        "UPDATE tracks SET
            name = ?2,
            artist = ?3,
            artists = ?4,
            album = ?5,
            duration_ms = ?6,
            uri = ?7,
            external_url = ?8,
            is_local = ?9
         WHERE id = ?1",
    )
    .bind(&track.id)
    .bind(&track.name)
    .bind(&track.artist)
    .bind(&track.artists)
    .bind(&track.album)
    .bind(track.duration_ms)
    .bind(&track.uri)
    .bind(&track.external_url)
    .bind(if track.is_local { 1 } else { 0 })
    .execute(&mut *conn)
    .await?;
    Ok(false)
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn track_from_row(row: &SqliteRow) -> Result<TrackRecord, StoreError> {
    let is_local: i64 = row.try_get("is_local")?;
    Ok(TrackRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        artist: row.try_get("artist")?,
        artists: row.try_get("artists")?,
        album: row.try_get("album")?,
        duration_ms: row.try_get("duration_ms")?,
        uri: row.try_get("uri")?,
        external_url: row.try_get("external_url")?,
        is_local: is_local != 0,
    })
}

fn playlist_from_row(row: &SqliteRow) -> Result<PlaylistRecord, StoreError> {
    let public: i64 = row.try_get("public")?;
    let collaborative: i64 = row.try_get("collaborative")?;
    Ok(PlaylistRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner: row.try_get("owner")?,
        description: row.try_get("description")?,
        snapshot_token: row.try_get("snapshot_token")?,
        track_count: row.try_get("track_count")?,
        public: public != 0,
        collaborative: collaborative != 0,
        external_url: row.try_get("external_url")?,
    })
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
