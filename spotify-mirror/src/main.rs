use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use spotify_core::{OAuthClient, SpotifyClient};
use tracing::{info, warn};

use spotify_mirror::analytics::{Analytics, SearchQuery};
use spotify_mirror::cli::{self, Cli, Command, DumpTarget};
use spotify_mirror::config::MirrorConfig;
use spotify_mirror::dump::{self, DumpError};
use spotify_mirror::logging;
use spotify_mirror::oauth_flow::OAuthFlow;
use spotify_mirror::setup::{self, AppCredentials};
use spotify_mirror::storage::{OAuthState, TokenCache};
use spotify_mirror::sync::engine::{SyncEngine, SyncError, SyncMode, SyncOptions};
use spotify_mirror::sync::remote::SpotifyRemote;
use spotify_mirror::sync::store::LibraryStore;
use spotify_mirror::token_provider::TokenProvider;

const EXIT_USAGE: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init(cli.verbose) {
        eprintln!("warning: {err:#}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let env_file = cli.env_file.as_deref();
    let load_config = || match env_file {
        Some(path) => MirrorConfig::from_env_file(path),
        None => MirrorConfig::from_env(),
    };

    let search_query = cli.command.search_query();
    match cli.command {
        Command::Setup => run_setup(env_file).await,
        Command::Auth => auth(&load_config()?).await,
        Command::Sync { clear, playlist } => {
            let options = SyncOptions {
                mode: SyncMode::Full,
                clear,
                playlist_filter: playlist,
            };
            sync(&load_config()?, options).await
        }
        Command::SyncDiff { playlist } => {
            let options = SyncOptions {
                mode: SyncMode::Diff,
                clear: false,
                playlist_filter: playlist,
            };
            sync(&load_config()?, options).await
        }
        Command::Search { limit, .. } => {
            let query = search_query.unwrap_or_default();
            if query.is_empty() {
                eprintln!("error: give a search query or at least one of --name, --artist, --album");
                return Ok(ExitCode::from(EXIT_USAGE));
            }
            search(&load_config()?, &query, limit).await
        }
        Command::Duplicates { limit } => duplicates(&load_config()?, limit).await,
        Command::List { playlist } => list(&load_config()?, playlist.as_deref()).await,
        Command::Stats => stats(&load_config()?).await,
        Command::ClearAuth { dry_run } => clear_auth(&load_config()?, dry_run).await,
        Command::Dump {
            target,
            output,
            compact,
        } => dump_json(&load_config()?, target, output.as_deref(), compact).await,
    }
}

/// Runs before any config is loaded: the env file it writes may not exist yet.
async fn run_setup(env_file: Option<&Path>) -> anyhow::Result<ExitCode> {
    let path = env_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(setup::DEFAULT_ENV_FILE));
    let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);

    let prompt_path = path.clone();
    let answered = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<AppCredentials>> {
        let mut input = std::io::stdin().lock();
        let mut out = std::io::stderr();
        if exists && !setup::confirm_overwrite(&mut input, &mut out, &prompt_path)? {
            return Ok(None);
        }
        let credentials = setup::prompt_credentials(&mut input, &mut out, |prompt| {
            rpassword::prompt_password(prompt)
        })?;
        Ok(Some(credentials))
    })
    .await
    .context("setup prompt did not finish")??;

    let Some(credentials) = answered else {
        println!("Setup cancelled; {} was left unchanged.", path.display());
        return Ok(ExitCode::SUCCESS);
    };
    setup::write_env_file(&path, &credentials).await?;
    info!(path = %path.display(), "credentials saved");
    println!("Saved credentials to {}.", path.display());
    println!("Next: run `spotify-mirror auth` to authorize access.");
    Ok(ExitCode::SUCCESS)
}

async fn open_store(config: &MirrorConfig) -> anyhow::Result<LibraryStore> {
    config.ensure_data_dir().await?;
    let path = config.database_path();
    LibraryStore::open(&path)
        .await
        .with_context(|| format!("failed to open library at {}", path.display()))
}

fn oauth_client(config: &MirrorConfig) -> anyhow::Result<OAuthClient> {
    let (client_id, client_secret) = config.credentials()?;
    let client = match &config.accounts_base_url {
        Some(base_url) => OAuthClient::with_base_url(base_url, client_id, client_secret)?,
        None => OAuthClient::new(client_id, client_secret)?,
    };
    Ok(client)
}

/// `SPOTIFY_TOKEN`, then the token cache (refreshing when due), then an
/// interactive authorization.
async fn access_token(config: &MirrorConfig) -> anyhow::Result<String> {
    if let Some(token) = &config.access_token {
        info!("using access token from SPOTIFY_TOKEN");
        return Ok(token.clone());
    }

    let oauth = oauth_client(config)?;
    let cache = TokenCache::new(config.token_cache_path());
    match cache.load().await {
        Ok(Some(state)) => {
            let mut provider =
                TokenProvider::new(state, Some(oauth.clone())).with_cache(cache.clone());
            match provider.valid_access_token().await {
                Ok(token) => return Ok(token),
                Err(err) => warn!(error = %err, "cached token is unusable, authorizing again"),
            }
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, path = %cache.path().display(), "ignoring token cache"),
    }

    let flow = OAuthFlow::new(oauth, config.redirect_uri.clone(), config.oauth_timeout);
    let token = flow.authenticate().await.context("authorization failed")?;
    let state = OAuthState::from_oauth_token(&token);
    cache
        .save(&state)
        .await
        .with_context(|| format!("failed to write {}", cache.path().display()))?;
    info!(path = %cache.path().display(), "token cached");
    Ok(state.access_token)
}

async fn spotify_client(config: &MirrorConfig) -> anyhow::Result<SpotifyClient> {
    let token = access_token(config).await?;
    let client = match &config.api_base_url {
        Some(base_url) => SpotifyClient::with_base_url(base_url, token)?,
        None => SpotifyClient::new(token)?,
    };
    Ok(client)
}

async fn auth(config: &MirrorConfig) -> anyhow::Result<ExitCode> {
    let client = spotify_client(config).await?;
    let user = client
        .current_user()
        .await
        .context("failed to fetch the current user")?;
    let name = user.display_name.as_deref().unwrap_or(&user.id);
    println!("Authenticated as {name} ({})", user.id);
    Ok(ExitCode::SUCCESS)
}

async fn sync(config: &MirrorConfig, options: SyncOptions) -> anyhow::Result<ExitCode> {
    let store = open_store(config).await?;
    let client = spotify_client(config).await?;
    let engine = SyncEngine::new(SpotifyRemote::new(client), store.clone());

    let result = tokio::select! {
        result = engine.run_sync(&options) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; collections finished so far are kept");
            store.close().await;
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
    };
    store.close().await;

    let report = match result {
        Ok(report) => report,
        Err(SyncError::AmbiguousPlaylistSelection { filter, candidates }) => {
            eprintln!("Playlist filter {filter:?} matches several playlists:");
            for candidate in &candidates {
                eprintln!("  - {candidate}");
            }
            eprintln!("Use a more specific name.");
            return Ok(ExitCode::from(EXIT_USAGE));
        }
        Err(err @ SyncError::NoMatchingPlaylist { .. }) => {
            eprintln!("{err}");
            return Ok(ExitCode::from(EXIT_USAGE));
        }
        Err(err) => return Err(err.into()),
    };

    let mut out = std::io::stdout().lock();
    cli::write_sync_report(&mut out, &report)?;
    out.flush()?;
    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn search(
    config: &MirrorConfig,
    query: &SearchQuery,
    limit: usize,
) -> anyhow::Result<ExitCode> {
    let analytics = Analytics::new(open_store(config).await?);
    let results = analytics.search(query, limit).await?;

    let mut out = std::io::stdout().lock();
    if results.tracks.is_empty() {
        writeln!(out, "No results found")?;
        return Ok(ExitCode::SUCCESS);
    }
    let ids: Vec<String> = results.tracks.iter().map(|track| track.id.clone()).collect();
    let placements = analytics.placements_for_tracks(&ids).await?;
    writeln!(out, "Found {} result(s)", results.tracks.len())?;
    writeln!(out)?;
    for (index, track) in results.tracks.iter().enumerate() {
        writeln!(out, "{}.", index + 1)?;
        let found = placements.get(&track.id).map(Vec::as_slice).unwrap_or_default();
        cli::write_track(&mut out, track, None, found)?;
    }
    if results.truncated {
        writeln!(out, "... more results not shown (raise --limit)")?;
    }
    Ok(ExitCode::SUCCESS)
}

async fn duplicates(config: &MirrorConfig, limit: usize) -> anyhow::Result<ExitCode> {
    let analytics = Analytics::new(open_store(config).await?);
    let duplicates = analytics.find_duplicates(limit).await?;

    let mut out = std::io::stdout().lock();
    if duplicates.is_empty() {
        writeln!(out, "No duplicates found across playlists")?;
        return Ok(ExitCode::SUCCESS);
    }
    writeln!(out, "Top duplicates (showing up to {limit}):")?;
    writeln!(out)?;
    let ids: Vec<String> = duplicates
        .iter()
        .map(|duplicate| duplicate.track.id.clone())
        .collect();
    let placements = analytics.placements_for_tracks(&ids).await?;
    for (index, duplicate) in duplicates.iter().enumerate() {
        let found = placements
            .get(&duplicate.track.id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        cli::write_duplicate(&mut out, index + 1, duplicate, found)?;
    }
    Ok(ExitCode::SUCCESS)
}

async fn list(config: &MirrorConfig, filter: Option<&str>) -> anyhow::Result<ExitCode> {
    let store = open_store(config).await?;
    let playlists = store.all_playlists().await?;
    let mut out = std::io::stdout().lock();

    let Some(filter) = filter else {
        if playlists.is_empty() {
            writeln!(out, "No playlists found. Run `sync` first.")?;
        } else {
            cli::write_playlists(&mut out, &playlists)?;
        }
        return Ok(ExitCode::SUCCESS);
    };

    let needle = filter.to_lowercase();
    let matching: Vec<_> = playlists
        .iter()
        .filter(|playlist| playlist.name.to_lowercase().contains(&needle))
        .collect();
    let playlist = match matching.as_slice() {
        [] => {
            eprintln!("No playlist found matching {filter:?}");
            return Ok(ExitCode::from(EXIT_USAGE));
        }
        [only] => *only,
        several => {
            eprintln!("Playlist filter {filter:?} matches several playlists:");
            for candidate in several {
                eprintln!("  - {} ({} tracks)", candidate.name, candidate.track_count);
            }
            return Ok(ExitCode::from(EXIT_USAGE));
        }
    };

    let tracks = store.playlist_tracks(&playlist.id).await?;
    cli::write_playlist_tracks(&mut out, playlist, &tracks)?;
    Ok(ExitCode::SUCCESS)
}

async fn stats(config: &MirrorConfig) -> anyhow::Result<ExitCode> {
    let stats = Analytics::new(open_store(config).await?)
        .library_stats()
        .await?;
    let mut out = std::io::stdout().lock();
    cli::write_stats(&mut out, &stats)?;
    Ok(ExitCode::SUCCESS)
}

async fn clear_auth(config: &MirrorConfig, dry_run: bool) -> anyhow::Result<ExitCode> {
    let cache = TokenCache::new(config.token_cache_path());
    if !cache.exists().await {
        println!("No cached token found.");
        return Ok(ExitCode::SUCCESS);
    }
    println!("Token cache: {}", cache.path().display());
    if dry_run {
        println!("Dry run: nothing was deleted.");
        return Ok(ExitCode::SUCCESS);
    }
    cache.delete().await?;
    println!("Token cache cleared.");
    Ok(ExitCode::SUCCESS)
}

async fn dump_json(
    config: &MirrorConfig,
    target: DumpTarget,
    output: Option<&Path>,
    compact: bool,
) -> anyhow::Result<ExitCode> {
    let client = spotify_client(config).await?;
    let value = match target {
        DumpTarget::Playlists => dump::playlists(&client).await?,
        DumpTarget::Playlist { name, contains } => {
            match dump::playlist(&client, &name, contains).await {
                Ok(value) => value,
                Err(DumpError::Ambiguous { name, candidates }) => {
                    eprintln!("Playlist name {name:?} matches several playlists:");
                    for candidate in &candidates {
                        eprintln!("  - {candidate}");
                    }
                    eprintln!("Use the exact name, or --contains with a more specific one.");
                    return Ok(ExitCode::from(EXIT_USAGE));
                }
                Err(err @ DumpError::NoMatch(_)) => {
                    eprintln!("{err}");
                    return Ok(ExitCode::from(EXIT_USAGE));
                }
                Err(err) => return Err(err.into()),
            }
        }
    };

    let text = dump::to_json(&value, compact)?;
    match output {
        Some(path) => tokio::fs::write(path, format!("{text}\n"))
            .await
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => {
            let mut out = std::io::stdout().lock();
            writeln!(out, "{text}")?;
            out.flush()?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
