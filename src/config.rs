//! Credentials store.
//!
//! Credentials live in a JSON file in the user's config directory
//! (`~/.config/concentriq/credentials.json` on Linux). Every key can be
//! overridden through a `CONCENTRIQ_*` environment variable, which is how
//! CI jobs usually provide them.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const ENV_API_URL: &str = "CONCENTRIQ_API_URL";
pub const ENV_USER: &str = "CONCENTRIQ_USER";
pub const ENV_PASSWORD: &str = "CONCENTRIQ_PASSWORD";
pub const ENV_SSL_CERTIFICATE: &str = "CONCENTRIQ_SSL_CERTIFICATE";
/// Overrides the location of the credentials file itself.
pub const ENV_CONFIG_PATH: &str = "CONCENTRIQ_CONFIG";

/// Resolved credentials needed to talk to a Concentriq instance.
///
/// The password is only exposed when it is sent as basic auth or written
/// back to the credentials file.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_url: String,
    pub user: String,
    pub password: SecretString,
    pub ssl_certificate: Option<PathBuf>,
}

/// Credentials as found on disk, possibly incomplete.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialCredentials {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "secret")]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub ssl_certificate: Option<PathBuf>,
}

fn secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

impl PartialCredentials {
    /// Read the credentials file. A missing file yields empty credentials.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no credentials file");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `CONCENTRIQ_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup, used with the process
    /// environment in production and with a map in tests.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_API_URL) {
            self.api_url = Some(v);
        }
        if let Some(v) = lookup(ENV_USER) {
            self.user = Some(v);
        }
        if let Some(v) = lookup(ENV_PASSWORD) {
            self.password = Some(SecretString::from(v));
        }
        if let Some(v) = lookup(ENV_SSL_CERTIFICATE) {
            self.ssl_certificate = Some(PathBuf::from(v));
        }
    }

    /// Turn into complete credentials, reporting the first missing key.
    pub fn resolve(self, path: &Path) -> Result<Credentials> {
        let missing = |key| Error::MissingConfig {
            key,
            path: path.to_path_buf(),
        };
        Ok(Credentials {
            api_url: self.api_url.ok_or_else(|| missing("api_url"))?,
            user: self.user.ok_or_else(|| missing("user"))?,
            password: self.password.ok_or_else(|| missing("password"))?,
            ssl_certificate: self.ssl_certificate,
        })
    }
}

impl Credentials {
    /// Load credentials from `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut partial = PartialCredentials::load(path)?;
        partial.apply_env();
        partial.resolve(path)
    }
}

/// Default location of the credentials file.
pub fn default_path() -> PathBuf {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        return PathBuf::from(p);
    }
    dirs::config_dir()
        .map(|d| d.join("concentriq").join("credentials.json"))
        .unwrap_or_else(|| {
            let dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            dir.join(".concentriq").join("credentials.json")
        })
}

/// Result of writing credentials to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Unchanged,
    Written { backup: Option<PathBuf> },
}

/// Merge `creds` into the file at `path`, keeping unrelated keys.
///
/// When the file already has content and `backup` is set, the previous
/// file is copied to `<name>.backup` first. An unreadable existing file is
/// treated as empty.
pub fn save(path: &Path, creds: &Credentials, backup: bool) -> Result<SaveOutcome> {
    let old: Map<String, Value> = fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default();

    let mut data = old.clone();
    data.insert("api_url".into(), Value::String(creds.api_url.clone()));
    data.insert("user".into(), Value::String(creds.user.clone()));
    data.insert("password".into(), Value::String(creds.password.expose_secret().to_owned()));
    if let Some(cert) = &creds.ssl_certificate {
        data.insert(
            "ssl_certificate".into(),
            Value::String(cert.to_string_lossy().into_owned()),
        );
    }

    if data == old {
        return Ok(SaveOutcome::Unchanged);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let backup_path = if !old.is_empty() && backup {
        let target = backup_path(path);
        fs::copy(path, &target)?;
        tracing::debug!(backup = %target.display(), "backed up credentials");
        Some(target)
    } else {
        None
    };

    let mut content = serde_json::to_string_pretty(&data)?;
    content.push('\n');
    fs::write(path, content)?;
    restrict_permissions(path)?;
    Ok(SaveOutcome::Written {
        backup: backup_path,
    })
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "credentials.json".into());
    name.push(".backup");
    path.with_file_name(name)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
