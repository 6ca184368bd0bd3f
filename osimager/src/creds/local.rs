//! The local secrets file: one record per non-blank, non-comment line, in
//! the form `path k1=v1 k2=v2 ...`.  Keys are unique per path and the last
//! definition of a path wins.  The file lives at `<user_dir>/secrets` and
//! must be readable only by its owner.

use super::{error, CredentialProvider, Result};
use snafu::ResultExt;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LocalProvider {
    secrets: HashMap<String, HashMap<String, String>>,
}

impl LocalProvider {
    /// Loads the secrets file once; lookups afterwards are pure map reads.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).context(error::SecretsFileReadSnafu { path })?;
        Ok(Self {
            secrets: parse(&contents),
        })
    }

    /// Writes a secrets file with owner-only permissions.
    pub fn write_file<P: AsRef<Path>>(path: P, contents: &str) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, contents).context(error::SecretsFileWriteSnafu { path })?;
        set_owner_only(path).context(error::SecretsFileWriteSnafu { path })
    }

    /// The conventional location under a user directory.
    pub fn default_path<P: AsRef<Path>>(user_dir: P) -> PathBuf {
        user_dir.as_ref().join("secrets")
    }
}

impl CredentialProvider for LocalProvider {
    fn get_secret(&self, path: &str, key: &str) -> Result<String> {
        self.secrets
            .get(path)
            .and_then(|record| record.get(key))
            .cloned()
            .ok_or_else(|| error::SecretUnavailableSnafu { path, key }.build())
    }
}

fn parse(contents: &str) -> HashMap<String, HashMap<String, String>> {
    let mut secrets = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let path = match fields.next() {
            Some(path) => path.to_string(),
            None => continue,
        };
        let mut record = HashMap::new();
        for field in fields {
            if let Some((key, value)) = field.split_once('=') {
                record.insert(key.to_string(), value.to_string());
            }
        }
        // last definition of a path wins
        secrets.insert(path, record);
    }
    secrets
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
