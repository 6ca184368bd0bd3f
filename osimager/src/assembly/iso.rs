//! ISO resolution: find the installer image a build should boot from,
//! either on local disk or by probing the spec's candidate URLs.

use super::{error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// The outcome of ISO resolution, written into defs for the config layer's
/// markers to pick up.
#[derive(Clone, Debug, Default)]
pub struct IsoResolution {
    /// The usable URL, when probing found one.
    pub url: Option<String>,
    /// The local file, when one was found on disk.
    pub path: Option<PathBuf>,
    /// A published checksum for the image, when one could be fetched.
    pub checksum: Option<String>,
}

/// Candidate URLs from defs: `iso_url` (one) plus `iso_urls` (many), already
/// rendered by the caller.
pub(super) fn candidate_urls(defs: &serde_json::Map<String, Value>) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(Value::String(url)) = defs.get("iso_url") {
        urls.push(url.clone());
    }
    if let Some(Value::Array(more)) = defs.get("iso_urls") {
        urls.extend(more.iter().filter_map(Value::as_str).map(str::to_string));
    }
    urls
}

/// Resolves the ISO for a build.  In local-only mode the image must already
/// be on disk; otherwise each candidate URL is HEAD-probed in order and the
/// first usable one wins, with a best-effort checksum fetch alongside.
pub(super) fn resolve(
    urls: &[String],
    checksum_url: Option<&str>,
    iso_dir: &Path,
    local_only: bool,
) -> Result<IsoResolution> {
    if urls.is_empty() {
        // Specs without an ISO (e.g. reprovision-only) have nothing to do.
        return Ok(IsoResolution::default());
    }

    if local_only {
        for url in urls {
            if let Some(name) = url_basename(url) {
                let path = iso_dir.join(name);
                if path.is_file() {
                    log::info!("Using local ISO '{}'", path.display());
                    return Ok(IsoResolution {
                        url: None,
                        path: Some(path),
                        checksum: None,
                    });
                }
            }
        }
        return error::IsoNotLocalSnafu {
            dir: iso_dir.to_owned(),
            names: urls
                .iter()
                .filter_map(|u| url_basename(u))
                .collect::<Vec<_>>(),
        }
        .fail();
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| {
            error::IsoProbeSnafu {
                detail: e.to_string(),
            }
            .build()
        })?;

    for url in urls {
        match client.head(url).send() {
            Ok(response) if response.status().is_success() => {
                log::info!("ISO probe succeeded for '{}'", url);
                let checksum = checksum_url.and_then(|cu| {
                    fetch_checksum(&client, cu, &url_basename(url).unwrap_or_default())
                });
                return Ok(IsoResolution {
                    url: Some(url.clone()),
                    path: None,
                    checksum,
                });
            }
            Ok(response) => {
                log::debug!("ISO probe of '{}' returned {}", url, response.status());
            }
            Err(e) => {
                log::debug!("ISO probe of '{}' failed: {}", url, e);
            }
        }
    }

    // Fall back to a local copy before declaring defeat.
    for url in urls {
        if let Some(name) = url_basename(url) {
            let path = iso_dir.join(name);
            if path.is_file() {
                log::info!("No URL usable; using local ISO '{}'", path.display());
                return Ok(IsoResolution {
                    url: None,
                    path: Some(path),
                    checksum: None,
                });
            }
        }
    }

    error::IsoUnavailableSnafu { tried: urls.to_vec() }.fail()
}

/// Fetches a published checksum file and extracts the line for our image.
/// This is best-effort; a build can proceed without a checksum.
fn fetch_checksum(client: &reqwest::blocking::Client, url: &str, image_name: &str) -> Option<String> {
    if image_name.is_empty() {
        return None;
    }
    let body = client.get(url).send().ok()?.error_for_status().ok()?.text().ok()?;
    for line in body.lines() {
        if line.contains(image_name) {
            // Conventional checksum files are "<sum>  <name>" or
            // "SHA256 (<name>) = <sum>".
            if let Some((_, sum)) = line.rsplit_once('=') {
                return Some(sum.trim().to_string());
            }
            if let Some(sum) = line.split_whitespace().next() {
                return Some(sum.to_string());
            }
        }
    }
    None
}

fn url_basename(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .last()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidates_from_defs() {
        let defs = json!({
            "iso_url": "https://a.example/one.iso",
            "iso_urls": ["https://b.example/two.iso", "https://c.example/three.iso"],
        })
        .as_object()
        .unwrap()
        .clone();
        assert_eq!(
            candidate_urls(&defs),
            [
                "https://a.example/one.iso",
                "https://b.example/two.iso",
                "https://c.example/three.iso",
            ]
        );
    }

    #[test]
    fn local_only_finds_file() {
        let isos = tempfile::tempdir().unwrap();
        std::fs::write(isos.path().join("one.iso"), b"iso").unwrap();
        let urls = vec!["https://a.example/one.iso".to_string()];

        let resolution = resolve(&urls, None, isos.path(), true).unwrap();
        assert_eq!(resolution.path.unwrap(), isos.path().join("one.iso"));
        assert!(resolution.url.is_none());
    }

    #[test]
    fn local_only_missing_file_fails() {
        let isos = tempfile::tempdir().unwrap();
        let urls = vec!["https://a.example/one.iso".to_string()];
        assert!(matches!(
            resolve(&urls, None, isos.path(), true).unwrap_err(),
            error::Error::IsoNotLocal { .. }
        ));
    }

    #[test]
    fn no_urls_resolves_to_nothing() {
        let isos = tempfile::tempdir().unwrap();
        let resolution = resolve(&[], None, isos.path(), false).unwrap();
        assert!(resolution.url.is_none() && resolution.path.is_none());
    }

    #[test]
    fn url_basename_extraction() {
        assert_eq!(
            url_basename("https://mirror.example.com/pub/rhel-9.5.iso").as_deref(),
            Some("rhel-9.5.iso")
        );
        assert_eq!(
            url_basename("https://mirror.example.com/get?file=x.iso").as_deref(),
            Some("get")
        );
        assert_eq!(url_basename("https://mirror.example.com/"), None);
        assert_eq!(url_basename("not a url"), None);
    }
}
