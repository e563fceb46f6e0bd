//! Interactive first-run configuration: asks for the Spotify app credentials
//! and stores them in a dotenv file the config loader reads back.

use std::ffi::OsString;
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use url::Url;

use crate::config::DEFAULT_REDIRECT_URI;
use crate::storage::restrict_permissions;

pub const DEFAULT_ENV_FILE: &str = ".env";
const DASHBOARD_URL: &str = "https://developer.spotify.com/dashboard";

/// Keys owned by setup, paired with the legacy spelling each one replaces.
const MANAGED_KEYS: [(&str, &str); 3] = [
    ("SPOTIFY_CLIENT_ID", "SPOTIPY_CLIENT_ID"),
    ("SPOTIFY_CLIENT_SECRET", "SPOTIPY_CLIENT_SECRET"),
    ("SPOTIFY_REDIRECT_URI", "SPOTIPY_REDIRECT_URI"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl AppCredentials {
    fn entries(&self) -> [(&'static str, &str); 3] {
        [
            (MANAGED_KEYS[0].0, &self.client_id),
            (MANAGED_KEYS[1].0, &self.client_secret),
            (MANAGED_KEYS[2].0, &self.redirect_uri),
        ]
    }
}

/// `true` only for an explicit yes; end of input counts as no.
pub fn confirm_overwrite<R: BufRead, W: Write>(
    input: &mut R,
    out: &mut W,
    path: &Path,
) -> io::Result<bool> {
    write!(
        out,
        "{} already exists. Replace its Spotify credentials? [y/N] ",
        path.display()
    )?;
    out.flush()?;
    let answer = read_answer(input)?.unwrap_or_default();
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Prompts on `out` and reads from `input`; the secret goes through
/// `read_secret` so the terminal can keep it hidden.
pub fn prompt_credentials<R, W, S>(
    input: &mut R,
    out: &mut W,
    read_secret: S,
) -> anyhow::Result<AppCredentials>
where
    R: BufRead,
    W: Write,
    S: FnOnce(&str) -> io::Result<String>,
{
    writeln!(out, "Create an app at {DASHBOARD_URL}")?;
    writeln!(out, "and register the redirect URI you enter below in its settings.")?;
    writeln!(out)?;

    write!(out, "Client ID: ")?;
    out.flush()?;
    let client_id = read_answer(input)?.context("input closed before the client id")?;
    if client_id.is_empty() {
        bail!("client id is required");
    }

    let client_secret = read_secret("Client secret: ")
        .context("failed to read the client secret")?
        .trim()
        .to_string();
    if client_secret.is_empty() {
        bail!("client secret is required");
    }

    write!(out, "Redirect URI [{DEFAULT_REDIRECT_URI}]: ")?;
    out.flush()?;
    let redirect_uri = match read_answer(input)?.filter(|answer| !answer.is_empty()) {
        None => DEFAULT_REDIRECT_URI.to_string(),
        Some(answer) => {
            Url::parse(&answer).with_context(|| format!("invalid redirect URI {answer:?}"))?;
            answer
        }
    };

    Ok(AppCredentials {
        client_id,
        client_secret,
        redirect_uri,
    })
}

/// Rewrites `existing` with the managed keys replaced by `credentials`;
/// every other line, comments included, is kept in place.
pub fn render_env_file(existing: &str, credentials: &AppCredentials) -> String {
    let mut rendered = String::with_capacity(existing.len() + 160);
    for line in existing.lines() {
        if line_key(line).is_some_and(is_managed) {
            continue;
        }
        rendered.push_str(line);
        rendered.push('\n');
    }
    for (key, value) in credentials.entries() {
        rendered.push_str(key);
        rendered.push('=');
        rendered.push_str(&quote_value(value));
        rendered.push('\n');
    }
    rendered
}

/// Merges `credentials` into the env file at `path`, creating it when
/// absent. The file is replaced atomically and left readable by the owner only.
pub async fn write_env_file(path: &Path, credentials: &AppCredentials) -> anyhow::Result<()> {
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp = sibling_tmp(path);
    tokio::fs::write(&tmp, render_env_file(&existing, credentials))
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    restrict_permissions(&tmp).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn read_answer<R: BufRead>(input: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn line_key(line: &str) -> Option<&str> {
    let line = line.trim_start();
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, _) = line.split_once('=')?;
    Some(key.trim())
}

fn is_managed(key: &str) -> bool {
    MANAGED_KEYS
        .iter()
        .any(|(primary, legacy)| key == *primary || key == *legacy)
}

/// Bare when the value is plain, otherwise double-quoted with the escapes
/// dotenv parsers understand.
fn quote_value(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@+,".contains(c));
    if plain {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' | '"' | '$' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn sibling_tmp(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use std::io::Cursor;

    fn credentials(secret: &str) -> AppCredentials {
        AppCredentials {
            client_id: "abc123".into(),
            client_secret: secret.into(),
            redirect_uri: "http://127.0.0.1:9090/callback".into(),
        }
    }

    fn prompt(input: &str, secret: &str) -> (anyhow::Result<AppCredentials>, String) {
        let mut out = Vec::new();
        let result = prompt_credentials(&mut Cursor::new(input), &mut out, |label| {
            assert_eq!(label, "Client secret: ");
            Ok(secret.to_string())
        });
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn blank_redirect_takes_the_default() {
        let (result, shown) = prompt("  my-id  \n\n", " s3cret ");
        assert_eq!(result.unwrap(), AppCredentials {
            client_id: "my-id".into(),
            client_secret: "s3cret".into(),
            redirect_uri: DEFAULT_REDIRECT_URI.into(),
        });
        assert!(shown.contains(DASHBOARD_URL));
        assert!(!shown.contains("s3cret"));
    }

    #[test]
    fn missing_or_invalid_answers_are_rejected() {
        assert!(prompt("\n", "s").0.is_err());
        assert!(prompt("", "s").0.is_err());
        assert!(prompt("id\n", "   ").0.is_err());
        let (result, _) = prompt("id\nnot a url\n", "s");
        assert!(result.unwrap_err().to_string().contains("invalid redirect URI"));
    }

    #[test]
    fn overwrite_needs_an_explicit_yes() {
        let path = Path::new(".env");
        let mut sink = Vec::new();
        assert!(confirm_overwrite(&mut Cursor::new("Y\n"), &mut sink, path).unwrap());
        assert!(confirm_overwrite(&mut Cursor::new("yes\n"), &mut sink, path).unwrap());
        assert!(!confirm_overwrite(&mut Cursor::new("\n"), &mut sink, path).unwrap());
        assert!(!confirm_overwrite(&mut Cursor::new("nope\n"), &mut sink, path).unwrap());
        assert!(!confirm_overwrite(&mut Cursor::new(""), &mut sink, path).unwrap());
    }

    #[test]
    fn rendering_replaces_managed_keys_and_keeps_the_rest() {
        let existing = "# mirror settings\nSPOTIFY_DATA_DIR=/srv/music\nSPOTIPY_CLIENT_ID=old\nexport SPOTIFY_CLIENT_SECRET=older\n\nSPOTIFY_REDIRECT_URI=http://x\n";
        let rendered = render_env_file(existing, &credentials("new-secret"));
        assert_eq!(
            rendered,
            "# mirror settings\nSPOTIFY_DATA_DIR=/srv/music\n\n\
             SPOTIFY_CLIENT_ID=abc123\n\
             SPOTIFY_CLIENT_SECRET=new-secret\n\
             SPOTIFY_REDIRECT_URI=http://127.0.0.1:9090/callback\n"
        );
    }

    #[test]
    fn unusual_values_are_quoted() {
        assert_eq!(quote_value("plain-value_1"), "plain-value_1");
        assert_eq!(quote_value("has space"), "\"has space\"");
        assert_eq!(quote_value("a\"b$c"), "\"a\\\"b\\$c\"");
        assert_eq!(quote_value(""), "\"\"");
    }

    #[tokio::test]
    async fn written_file_loads_back_through_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(".env");
        write_env_file(&path, &credentials("with space #hash")).await.unwrap();

        let config = MirrorConfig::from_env_file(&path).unwrap();
        assert_eq!(config.credentials().unwrap(), ("abc123", "with space #hash"));
        assert_eq!(config.redirect_uri, "http://127.0.0.1:9090/callback");
        assert!(!sibling_tmp(&path).exists());
    }

    #[tokio::test]
    async fn rewriting_keeps_unrelated_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.env");
        let data_dir = dir.path().join("data");
        std::fs::write(
            &path,
            format!("SPOTIFY_DATA_DIR={}\nSPOTIFY_CLIENT_ID=stale\n", data_dir.display()),
        )
        .unwrap();

        write_env_file(&path, &credentials("fresh")).await.unwrap();

        let config = MirrorConfig::from_env_file(&path).unwrap();
        assert_eq!(config.client_id.as_deref(), Some("abc123"));
        assert_eq!(config.client_secret.as_deref(), Some("fresh"));
        assert_eq!(config.data_dir, data_dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn env_file_is_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        write_env_file(&path, &credentials("s")).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
