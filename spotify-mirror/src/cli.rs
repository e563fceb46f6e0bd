use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::analytics::{
    DEFAULT_DUPLICATE_LIMIT, DEFAULT_SEARCH_LIMIT, Duplicate, LibraryStats, SearchQuery,
    TrackPlacement,
};
use crate::sync::engine::{CollectionStatus, SyncReport};
use crate::sync::model::{PlaylistRecord, TrackRecord};

#[derive(Parser, Debug)]
#[command(name = "spotify-mirror", version)]
#[command(about = "Mirror your Spotify library into a local database and query it offline")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Load settings from this env file (values override the environment)
    #[arg(long, global = true, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store Spotify app credentials in an env file (--env-file or ./.env)
    Setup,
    /// Authenticate with Spotify and show the current user
    Auth,
    /// Fetch every saved track and playlist
    Sync {
        /// Empty the local library first
        #[arg(long)]
        clear: bool,
        /// Only sync the playlist whose name contains NAME
        #[arg(long, value_name = "NAME")]
        playlist: Option<String>,
    },
    /// Sync only collections that changed since the last run
    SyncDiff {
        /// Only sync the playlist whose name contains NAME
        #[arg(long, value_name = "NAME")]
        playlist: Option<String>,
    },
    /// Search tracks in the local library
    Search {
        /// Matched against track name, artist and album
        query: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        artist: Option<String>,
        #[arg(long)]
        album: Option<String>,
        /// Maximum number of results to show
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// Tracks that appear in playlists more than once
    Duplicates {
        /// Maximum number of entries to show
        #[arg(long, default_value_t = DEFAULT_DUPLICATE_LIMIT)]
        limit: usize,
    },
    /// List playlists, or the tracks of one playlist
    List {
        #[arg(long, value_name = "NAME")]
        playlist: Option<String>,
    },
    /// Library statistics
    Stats,
    /// Remove the cached OAuth token
    ClearAuth {
        /// Show what would be removed without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Print unfiltered API JSON
    #[command(hide = true)]
    Dump {
        #[command(subcommand)]
        target: DumpTarget,
        /// Write to PATH instead of stdout
        #[arg(short, long, global = true, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Single-line JSON instead of pretty-printed
        #[arg(long, global = true)]
        compact: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DumpTarget {
    /// Every playlist of the current user
    Playlists,
    /// One playlist with all of its items
    Playlist {
        /// Playlist name, compared case-insensitively
        name: String,
        /// Accept a substring match when no name matches exactly
        #[arg(long)]
        contains: bool,
    },
}

impl Command {
    /// The search query carried by `search`, if this is that command.
    pub fn search_query(&self) -> Option<SearchQuery> {
        match self {
            Command::Search {
                query,
                name,
                artist,
                album,
                ..
            } => Some(SearchQuery {
                query: query.clone(),
                name: name.clone(),
                artist: artist.clone(),
                album: album.clone(),
            }),
            _ => None,
        }
    }
}

/// `m:ss`, truncating to whole seconds.
pub fn format_duration(duration_ms: i64) -> String {
    let seconds = duration_ms.max(0) / 1000;
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

fn plural(count: usize, one: &'static str, many: &'static str) -> &'static str {
    if count == 1 { one } else { many }
}

pub fn write_track<W: Write>(
    out: &mut W,
    track: &TrackRecord,
    occurrences: Option<i64>,
    placements: &[TrackPlacement],
) -> io::Result<()> {
    writeln!(out, "  {}", track.name)?;
    writeln!(out, "     artist:   {}", track.artists)?;
    writeln!(out, "     album:    {}", track.album)?;
    writeln!(out, "     duration: {}", format_duration(track.duration_ms))?;
    if track.is_local {
        writeln!(out, "     local file")?;
    }
    if let Some(url) = &track.external_url {
        writeln!(out, "     url:      {url}")?;
    }
    if let Some(count) = occurrences {
        let noun = plural(usize::try_from(count).unwrap_or(usize::MAX), "occurrence", "occurrences");
        writeln!(out, "     duplicates: {count} {noun}")?;
    }
    if !placements.is_empty() {
        writeln!(
            out,
            "     in {}:",
            plural(placements.len(), "playlist", "playlists")
        )?;
        for placement in placements {
            writeln!(out, "       - {}", placement.name)?;
            if let Some(url) = &placement.external_url {
                writeln!(out, "         {url}")?;
            }
        }
    }
    writeln!(out)
}

pub fn write_sync_report<W: Write>(out: &mut W, report: &SyncReport) -> io::Result<()> {
    for entry in &report.collections {
        let marker = match entry.status {
            CollectionStatus::Synced => "ok  ",
            CollectionStatus::Skipped => "skip",
            CollectionStatus::Failed(_) => "FAIL",
        };
        writeln!(out, "[{marker}] {} ({})", entry.name, entry.status)?;
    }
    let synced = report.count(|status| matches!(status, CollectionStatus::Synced));
    let skipped = report.count(|status| matches!(status, CollectionStatus::Skipped));
    let failed = report.count(|status| matches!(status, CollectionStatus::Failed(_)));
    writeln!(out)?;
    writeln!(
        out,
        "{synced} synced, {skipped} unchanged, {failed} failed; {} new tracks, {} links written",
        report.tracks_added, report.links_replaced
    )
}

pub fn write_playlists<W: Write>(out: &mut W, playlists: &[PlaylistRecord]) -> io::Result<()> {
    writeln!(out, "Your playlists ({} total)", playlists.len())?;
    writeln!(out)?;
    for (index, playlist) in playlists.iter().enumerate() {
        let visibility = if playlist.public { "public " } else { "private" };
        let collaborative = if playlist.collaborative {
            " [collaborative]"
        } else {
            ""
        };
        writeln!(
            out,
            "{:3}. [{visibility}] {}{collaborative}",
            index + 1,
            playlist.name
        )?;
        writeln!(
            out,
            "      by {}, {} tracks",
            playlist.owner, playlist.track_count
        )?;
    }
    Ok(())
}

pub fn write_playlist_tracks<W: Write>(
    out: &mut W,
    playlist: &PlaylistRecord,
    tracks: &[(i64, TrackRecord)],
) -> io::Result<()> {
    writeln!(out, "{}", playlist.name)?;
    if !playlist.description.is_empty() {
        writeln!(out, "   {}", playlist.description)?;
    }
    writeln!(out, "   by {}", playlist.owner)?;
    writeln!(out, "   {} tracks", playlist.track_count)?;
    writeln!(out)?;
    for (position, track) in tracks {
        writeln!(out, "{:3}. {} - {}", position + 1, track.name, track.artists)?;
    }
    Ok(())
}

pub fn write_duplicate<W: Write>(
    out: &mut W,
    index: usize,
    duplicate: &Duplicate,
    placements: &[TrackPlacement],
) -> io::Result<()> {
    writeln!(out, "{index}.")?;
    write_track(out, &duplicate.track, Some(duplicate.occurrences), placements)
}

pub fn write_stats<W: Write>(out: &mut W, stats: &LibraryStats) -> io::Result<()> {
    let rule = "=".repeat(50);
    writeln!(out, "{rule}")?;
    writeln!(out, "Library statistics")?;
    writeln!(out, "{rule}")?;
    writeln!(out, "  unique tracks:    {}", stats.tracks)?;
    writeln!(out, "  saved tracks:     {}", stats.saved_tracks)?;
    writeln!(out, "  playlists:        {}", stats.playlists)?;
    writeln!(out, "  playlist entries: {}", stats.links)?;
    writeln!(out, "  listening time:   {:.1} hours", stats.total_hours())?;
    writeln!(out, "{rule}")?;
    if !stats.top_artists.is_empty() {
        writeln!(out)?;
        writeln!(out, "  Top artists:")?;
        for artist in &stats.top_artists {
            writeln!(out, "     {}: {} tracks", artist.name, artist.tracks)?;
        }
    }
    Ok(())
}
