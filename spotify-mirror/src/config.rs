use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8000/callback";
const DEFAULT_OAUTH_TIMEOUT_SECS: u64 = 180;
const DATA_DIR_NAME: &str = "spotify-mirror";
const DATABASE_FILE: &str = "library.db";
const TOKEN_CACHE_FILE: &str = "auth-cache.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub data_dir: PathBuf,
    /// Pre-issued access token; bypasses the token cache and OAuth entirely.
    pub access_token: Option<String>,
    pub api_base_url: Option<String>,
    pub accounts_base_url: Option<String>,
    pub oauth_timeout: Duration,
}

impl MirrorConfig {
    /// Reads the process environment, after loading `.env` from the working
    /// directory if one exists.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(|name| std::env::var(name).ok(), &home))
    }

    /// Like [`MirrorConfig::from_env`], but values in `path` take precedence
    /// over the process environment.
    pub fn from_env_file(path: &Path) -> anyhow::Result<Self> {
        let mut overrides = HashMap::new();
        for entry in dotenvy::from_path_iter(path)
            .with_context(|| format!("failed to read env file {}", path.display()))?
        {
            let (key, value) =
                entry.with_context(|| format!("malformed line in {}", path.display()))?;
            overrides.insert(key, value);
        }
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(
            |name| {
                overrides
                    .get(name)
                    .cloned()
                    .or_else(|| std::env::var(name).ok())
            },
            &home,
        ))
    }

    pub fn from_lookup<F>(lookup: F, home: &Path) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| lookup(name))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };

        let data_dir = read(&["SPOTIFY_DATA_DIR"])
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(default_data_dir);
        let oauth_timeout = read(&["SPOTIFY_OAUTH_TIMEOUT_SECS"])
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_OAUTH_TIMEOUT_SECS);

        Self {
            client_id: read(&["SPOTIFY_CLIENT_ID", "SPOTIPY_CLIENT_ID"]),
            client_secret: read(&["SPOTIFY_CLIENT_SECRET", "SPOTIPY_CLIENT_SECRET"]),
            redirect_uri: read(&["SPOTIFY_REDIRECT_URI", "SPOTIPY_REDIRECT_URI"])
                .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
            data_dir,
            access_token: read(&["SPOTIFY_TOKEN"]),
            api_base_url: read(&["SPOTIFY_API_BASE_URL"]),
            accounts_base_url: read(&["SPOTIFY_ACCOUNTS_BASE_URL"]),
            oauth_timeout: Duration::from_secs(oauth_timeout),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn token_cache_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_CACHE_FILE)
    }

    /// Client id and secret, or an error naming what is missing.
    pub fn credentials(&self) -> anyhow::Result<(&str, &str)> {
        let client_id = self
            .client_id
            .as_deref()
            .context("SPOTIFY_CLIENT_ID is not set; run `spotify-mirror setup`")?;
        let client_secret = self
            .client_secret
            .as_deref()
            .context("SPOTIFY_CLIENT_SECRET is not set; run `spotify-mirror setup`")?;
        Ok((client_id, client_secret))
    }

    pub async fn ensure_data_dir(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("failed to create data dir at {}", self.data_dir.display()))
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DATA_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_from(pairs: &[(&str, &str)]) -> MirrorConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        MirrorConfig::from_lookup(|name| vars.get(name).cloned(), Path::new("/home/tester"))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]);
        assert_eq!(config.redirect_uri, DEFAULT_REDIRECT_URI);
        assert_eq!(config.oauth_timeout, Duration::from_secs(180));
        assert!(config.client_id.is_none());
        assert!(config.access_token.is_none());
        assert!(config.data_dir.ends_with(DATA_DIR_NAME));
        let err = config.credentials().unwrap_err().to_string();
        assert!(err.contains("SPOTIFY_CLIENT_ID"));
        assert!(err.contains("spotify-mirror setup"));
    }

    #[test]
    fn legacy_variable_names_are_accepted() {
        let config = config_from(&[
            ("SPOTIPY_CLIENT_ID", "legacy-id"),
            ("SPOTIPY_CLIENT_SECRET", "legacy-secret"),
            ("SPOTIPY_REDIRECT_URI", "http://127.0.0.1:9090/cb"),
        ]);
        assert_eq!(config.credentials().unwrap(), ("legacy-id", "legacy-secret"));
        assert_eq!(config.redirect_uri, "http://127.0.0.1:9090/cb");
    }

    #[test]
    fn primary_names_win_over_legacy_ones() {
        let config = config_from(&[
            ("SPOTIFY_CLIENT_ID", "new-id"),
            ("SPOTIPY_CLIENT_ID", "old-id"),
            ("SPOTIFY_CLIENT_SECRET", "  "),
            ("SPOTIPY_CLIENT_SECRET", "old-secret"),
        ]);
        assert_eq!(config.client_id.as_deref(), Some("new-id"));
        assert_eq!(config.client_secret.as_deref(), Some("old-secret"));
    }

    #[test]
    fn data_dir_expands_home_and_derives_paths() {
        let config = config_from(&[("SPOTIFY_DATA_DIR", "~/music/mirror")]);
        assert_eq!(config.data_dir, PathBuf::from("/home/tester/music/mirror"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/home/tester/music/mirror/library.db")
        );
        assert_eq!(
            config.token_cache_path(),
            PathBuf::from("/home/tester/music/mirror/auth-cache.json")
        );
    }

    #[test]
    fn invalid_timeout_falls_back_to_default() {
        assert_eq!(
            config_from(&[("SPOTIFY_OAUTH_TIMEOUT_SECS", "0")]).oauth_timeout,
            Duration::from_secs(180)
        );
        assert_eq!(
            config_from(&[("SPOTIFY_OAUTH_TIMEOUT_SECS", "abc")]).oauth_timeout,
            Duration::from_secs(180)
        );
        assert_eq!(
            config_from(&[("SPOTIFY_OAUTH_TIMEOUT_SECS", "30")]).oauth_timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn env_file_values_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.env");
        let data_dir = dir.path().join("data");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "SPOTIFY_TOKEN=file-token").unwrap();
        writeln!(file, "SPOTIFY_DATA_DIR={}", data_dir.display()).unwrap();
        writeln!(file, "SPOTIFY_API_BASE_URL=http://127.0.0.1:1").unwrap();
        drop(file);

        let config = MirrorConfig::from_env_file(&path).unwrap();
        assert_eq!(config.access_token.as_deref(), Some("file-token"));
        assert_eq!(config.data_dir, data_dir);
        assert_eq!(config.api_base_url.as_deref(), Some("http://127.0.0.1:1"));
    }

    #[test]
    fn missing_env_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MirrorConfig::from_env_file(&dir.path().join("absent.env")).is_err());
    }

    #[tokio::test]
    async fn ensure_data_dir_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("a").join("b");
        let config = config_from(&[("SPOTIFY_DATA_DIR", data_dir.to_str().unwrap())]);
        config.ensure_data_dir().await.unwrap();
        assert!(data_dir.is_dir());
    }
}
