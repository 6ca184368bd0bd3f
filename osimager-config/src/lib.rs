//! The config module owns the definition and loading process for the OSImager
//! settings file, `osimager.conf`, found in the user directory.

use serde::Deserialize;
use snafu::ResultExt;
use std::fs;
use std::path::{Path, PathBuf};

const CONF_FILE: &str = "osimager.conf";
const DEFAULT_USER_DIR: &str = ".osimager";

/// Where secrets come from: a Vault server or a local secrets file.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum CredentialSource {
    vault,
    local,
}

impl Default for CredentialSource {
    fn default() -> Self {
        CredentialSource::local
    }
}

/// Settings for one OSImager installation, loaded from `<user_dir>/osimager.conf`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Directory holding the platform and spec library.
    pub data_dir: PathBuf,

    /// Per-user state: locations, secrets, the cached spec index.  Defaults to
    /// `~/.osimager` when not set in the file.
    #[serde(default = "default_user_dir")]
    pub user_dir: PathBuf,

    /// Root of the installer fragment tree; `files[*].sources` paths resolve
    /// against this, and Packer runs with it as the working directory.
    pub installer_dir: PathBuf,

    /// Where per-build workspaces are created.  Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,

    /// Directory searched for local ISO images.  Defaults to `<data_dir>/isos`.
    pub iso_dir: Option<PathBuf>,

    #[serde(default)]
    pub credential_source: CredentialSource,

    /// Vault server address, required when `credential_source = "vault"`.
    pub vault_addr: Option<String>,

    /// Path to a file holding the Vault bearer token.
    pub vault_token_path: Option<PathBuf>,

    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,

    /// Per-build timeout; no timeout when unset.
    pub build_timeout_secs: Option<u64>,

    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    #[serde(default = "default_log_ring_capacity")]
    pub log_ring_capacity: usize,

    /// How long terminated builds remain queryable.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_user_dir() -> PathBuf {
    home::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_USER_DIR)
}

fn default_max_concurrent_builds() -> usize {
    3
}

fn default_cancel_grace_secs() -> u64 {
    30
}

fn default_log_ring_capacity() -> usize {
    10_000
}

fn default_retention_secs() -> u64 {
    86_400
}

impl Settings {
    /// Deserializes Settings from the given path.
    pub fn from_path<P>(path: P) -> Result<Settings>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let settings_str = fs::read_to_string(path).context(error::FileSnafu { path })?;
        toml::from_str(&settings_str).context(error::InvalidTomlSnafu { path })
    }

    /// Loads Settings from `<user_dir>/osimager.conf`, checking the default
    /// user directory when no explicit path is given.
    pub fn from_user_dir() -> Result<Settings> {
        let path = default_user_dir().join(CONF_FILE);
        log::debug!("Loading settings from '{}'", path.display());
        Self::from_path(path)
    }

    /// The effective ISO search directory.
    pub fn iso_dir(&self) -> PathBuf {
        self.iso_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("isos"))
    }

    /// The effective workspace parent directory.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to read '{}': {}", path.display(), source))]
        File { path: PathBuf, source: io::Error },

        #[snafu(display("Invalid settings file at '{}': {}", path.display(), source))]
        InvalidToml {
            path: PathBuf,
            source: toml::de::Error,
        },
    }
}
pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;
