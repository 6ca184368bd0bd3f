/*!
Pluggable secret retrieval.

Secrets are addressed by `(path, key)`.  Two sources are supported, selected
by the `credential_source` setting: a Vault server reached over HTTP, and a
local line-oriented secrets file for installations without Vault.  Providers
also know how to inline the `{{vault `path` `key`}}` references that Packer
provisioners carry, for the local case where Packer itself has no Vault to
ask.
*/

mod local;
mod vault;

pub use local::LocalProvider;
pub use vault::VaultProvider;

use lazy_static::lazy_static;
use osimager_config::{CredentialSource, Settings};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

lazy_static! {
    /// The embedded reference form used by the downstream build tool:
    /// `{{vault `path` `key`}}`.
    static ref VAULT_REF: Regex =
        Regex::new(r"\{\{\s*vault\s+`([^`]+)`\s+`([^`]+)`\s*\}\}").unwrap();
}

/// A source of secrets.  Implementations are read-only after construction
/// and never cache values beyond their own lifetime.
pub trait CredentialProvider: Send + Sync {
    /// Looks up one secret value.  A path that has never been declared is an
    /// error; there is no silent substitution of empty values.
    fn get_secret(&self, path: &str, key: &str) -> Result<String>;

    /// True when the downstream tool can resolve `{{vault ...}}` references
    /// itself and they should be left in place.
    fn passes_references_downstream(&self) -> bool {
        false
    }
}

/// Replaces embedded `{{vault ...}}` references throughout a document tree
/// with actual values from the provider.  Used when the active source is
/// local, since Packer then has no Vault of its own to consult.
pub fn resolve_embedded_references(
    provider: &dyn CredentialProvider,
    document: &mut Value,
) -> Result<()> {
    match document {
        Value::String(s) => {
            if VAULT_REF.is_match(s) {
                let mut out = String::with_capacity(s.len());
                let mut last = 0;
                for caps in VAULT_REF.captures_iter(s) {
                    let whole = caps.get(0).unwrap();
                    out.push_str(&s[last..whole.start()]);
                    out.push_str(&provider.get_secret(&caps[1], &caps[2])?);
                    last = whole.end();
                }
                out.push_str(&s[last..]);
                *s = out;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                resolve_embedded_references(provider, item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (_key, value) in map.iter_mut() {
                resolve_embedded_references(provider, value)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Builds the provider the settings call for.  A missing local secrets file
/// yields no provider rather than an error: builds without secret markers
/// must pass silently, and ones with markers fail with a precise message
/// when the engine finds no source.
pub fn provider_from_settings(settings: &Settings) -> Result<Option<Arc<dyn CredentialProvider>>> {
    match settings.credential_source {
        CredentialSource::local => {
            let path = LocalProvider::default_path(&settings.user_dir);
            if !path.is_file() {
                log::debug!("No secrets file at '{}'", path.display());
                return Ok(None);
            }
            Ok(Some(Arc::new(LocalProvider::new(path)?)))
        }
        CredentialSource::vault => {
            let addr = settings.vault_addr.as_deref().ok_or_else(|| {
                error::SourceUnavailableSnafu {
                    detail: "credential_source is vault but vault_addr is not set".to_string(),
                }
                .build()
            })?;
            let token = match &settings.vault_token_path {
                Some(token_path) => std::fs::read_to_string(token_path)
                    .map_err(|e| {
                        error::AuthFailedSnafu {
                            detail: format!(
                                "cannot read vault token '{}': {}",
                                token_path.display(),
                                e
                            ),
                        }
                        .build()
                    })?,
                None => std::env::var("VAULT_TOKEN").unwrap_or_default(),
            };
            Ok(Some(Arc::new(VaultProvider::new(addr, &token)?)))
        }
    }
}

pub(crate) mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub enum Error {
        #[snafu(display("No secret at '{}' with key '{}'", path, key))]
        SecretUnavailable { path: String, key: String },

        #[snafu(display("Authentication to secret source failed: {}", detail))]
        AuthFailed { detail: String },

        #[snafu(display("Secret source unavailable: {}", detail))]
        SourceUnavailable { detail: String },

        #[snafu(display("Failed to read secrets file '{}': {}", path.display(), source))]
        SecretsFileRead {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to write secrets file '{}': {}", path.display(), source))]
        SecretsFileWrite {
            path: PathBuf,
            source: std::io::Error,
        },
    }
}
pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    struct FakeProvider;

    impl CredentialProvider for FakeProvider {
        fn get_secret(&self, path: &str, key: &str) -> Result<String> {
            if path == "osimager/build" && key == "root_pw" {
                Ok("hunter2".to_string())
            } else {
                error::SecretUnavailableSnafu { path, key }.fail()
            }
        }
    }

    #[test]
    fn embedded_references_resolve() {
        let mut doc = json!({
            "provisioners": [{
                "type": "shell",
                "inline": ["echo {{vault `osimager/build` `root_pw`}} | passwd --stdin root"]
            }]
        });
        resolve_embedded_references(&FakeProvider, &mut doc).unwrap();
        assert_eq!(
            doc["provisioners"][0]["inline"][0],
            json!("echo hunter2 | passwd --stdin root")
        );
    }

    #[test]
    fn unknown_reference_fails() {
        let mut doc = json!("{{vault `nope` `nothing`}}");
        let err = resolve_embedded_references(&FakeProvider, &mut doc).unwrap_err();
        assert!(matches!(err, Error::SecretUnavailable { .. }));
    }

    #[test]
    fn strings_without_references_untouched() {
        let mut doc = json!({"a": "plain {{user `var`}} text", "n": 5});
        resolve_embedded_references(&FakeProvider, &mut doc).unwrap();
        assert_eq!(doc["a"], json!("plain {{user `var`}} text"));
    }
}
