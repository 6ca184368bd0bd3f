//! Vault-backed secrets: one KV v2 read per lookup, authenticated by a
//! bearer token.  The token is verified lazily on first use so that builds
//! with no secret markers never touch the server.

use super::{error, CredentialProvider, Result};
use serde_json::Value;
use snafu::OptionExt;
use std::sync::Mutex;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct VaultProvider {
    client: reqwest::blocking::Client,
    addr: String,
    token: String,
    /// Set once the token has passed a lookup-self check.
    verified: Mutex<bool>,
}

impl VaultProvider {
    pub fn new(addr: &str, token: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                error::SourceUnavailableSnafu {
                    detail: e.to_string(),
                }
                .build()
            })?;
        Ok(Self {
            client,
            addr: addr.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
            verified: Mutex::new(false),
        })
    }

    /// Confirms the token is usable with a token lookup-self call.
    fn ensure_authenticated(&self) -> Result<()> {
        let mut verified = self.verified.lock().unwrap();
        if *verified {
            return Ok(());
        }

        let url = format!("{}/v1/auth/token/lookup-self", self.addr);
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .map_err(|e| {
                error::SourceUnavailableSnafu {
                    detail: e.to_string(),
                }
                .build()
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
            return error::AuthFailedSnafu {
                detail: format!("token rejected by {} ({})", self.addr, status),
            }
            .fail();
        }
        if !status.is_success() {
            return error::SourceUnavailableSnafu {
                detail: format!("{} returned {}", url, status),
            }
            .fail();
        }

        log::debug!("Vault token verified against {}", self.addr);
        *verified = true;
        Ok(())
    }

    /// Maps a logical secret path onto the KV v2 read endpoint: the first
    /// path segment is the mount, with `data` inserted after it.
    fn kv2_url(&self, path: &str) -> Result<String> {
        let path = path.trim_matches('/');
        let (mount, rest) = path.split_once('/').context(error::SecretUnavailableSnafu {
            path,
            key: String::new(),
        })?;
        Ok(format!("{}/v1/{}/data/{}", self.addr, mount, rest))
    }
}

impl CredentialProvider for VaultProvider {
    fn get_secret(&self, path: &str, key: &str) -> Result<String> {
        self.ensure_authenticated()?;

        let url = self.kv2_url(path)?;
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .map_err(|e| {
                error::SourceUnavailableSnafu {
                    detail: e.to_string(),
                }
                .build()
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
            return error::AuthFailedSnafu {
                detail: format!("read of '{}' denied ({})", path, status),
            }
            .fail();
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return error::SecretUnavailableSnafu { path, key }.fail();
        }
        if !status.is_success() {
            return error::SourceUnavailableSnafu {
                detail: format!("{} returned {}", url, status),
            }
            .fail();
        }

        let body: Value = response.json().map_err(|e| {
            error::SourceUnavailableSnafu {
                detail: e.to_string(),
            }
            .build()
        })?;

        // KV v2 nests the user's fields under data.data.
        body.get("data")
            .and_then(|d| d.get("data"))
            .and_then(|d| d.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
            .context(error::SecretUnavailableSnafu { path, key })
    }

    fn passes_references_downstream(&self) -> bool {
        // Packer receives VAULT_ADDR/VAULT_TOKEN and resolves its own
        // embedded references.
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kv2_path_mapping() {
        let provider = VaultProvider::new("https://vault.example.com:8200/", "tok").unwrap();
        assert_eq!(
            provider.kv2_url("secret/osimager/build").unwrap(),
            "https://vault.example.com:8200/v1/secret/data/osimager/build"
        );
    }

    #[test]
    fn pathless_secret_rejected() {
        let provider = VaultProvider::new("https://vault.example.com:8200", "tok").unwrap();
        assert!(provider.kv2_url("nomount").is_err());
    }
}
