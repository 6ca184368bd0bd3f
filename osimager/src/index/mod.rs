/*!
The spec index maps a build key like `rhel-9.5-x86_64` to the spec file that
can produce it.

The index is built by scanning every spec file in the library, expanding each
spec's `provides.versions` declarations (range and list syntax, §`expand`),
and crossing them with the declared architectures.  Keys sort in natural
(version-aware) order.  The result is cached at `<user_dir>/specs/index.json`
and rebuilt whenever any spec file is newer than the cache; rebuilds are
serialized by a coarse lock file while readers keep using the last committed
index.
*/

mod expand;
mod natural;

pub use expand::expand_versions;
pub use natural::natural_cmp;

use crate::config::Layer;
use crate::template::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snafu::ResultExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// A rebuild lock older than this is considered abandoned and taken over.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(60);

/// One buildable (dist, version, arch) tuple and the spec that provides it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IndexEntry {
    pub key: String,
    pub dist: String,
    pub version: String,
    pub arch: String,
    pub spec_path: PathBuf,
    /// Whether a referenced ISO is already present on local disk.
    pub iso_local: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SpecIndex {
    pub built_at: String,
    entries: Vec<IndexEntry>,
}

impl SpecIndex {
    /// Loads the cached index, rebuilding it first if any spec file on disk
    /// is newer than the cache.
    pub fn load_or_rebuild(data_dir: &Path, user_dir: &Path, iso_dir: &Path) -> Result<Self> {
        let cache_path = user_dir.join("specs").join("index.json");

        if cache_is_current(&cache_path, data_dir) {
            if let Some(index) = read_cache(&cache_path) {
                return Ok(index);
            }
        }

        let index = Self::build(data_dir, iso_dir)?;

        match LockGuard::acquire(&cache_path.with_extension("lock")) {
            Some(_guard) => {
                if let Some(parent) = cache_path.parent() {
                    fs::create_dir_all(parent).context(error::CacheWriteSnafu {
                        path: parent.to_owned(),
                    })?;
                }
                let rendered =
                    serde_json::to_string_pretty(&index).context(error::CacheSerializeSnafu)?;
                fs::write(&cache_path, rendered).context(error::CacheWriteSnafu {
                    path: cache_path.clone(),
                })?;
                log::info!(
                    "Spec index rebuilt with {} entries at '{}'",
                    index.entries.len(),
                    cache_path.display()
                );
            }
            None => {
                // Another process holds the rebuild lock; use our in-memory
                // build and let them commit the cache.
                log::debug!("Spec index lock busy; using uncached index");
            }
        }

        Ok(index)
    }

    /// Scans the spec library and builds a fresh index.
    pub fn build(data_dir: &Path, iso_dir: &Path) -> Result<Self> {
        let specs_dir = data_dir.join("specs");
        let mut entries = Vec::new();

        for spec_path in spec_files(&specs_dir) {
            let layer = match read_spec(&spec_path) {
                Ok(layer) => layer,
                Err(e) => {
                    // One malformed spec must not hide the rest of the library.
                    log::warn!("Skipping unreadable spec '{}': {}", spec_path.display(), e);
                    continue;
                }
            };
            let provides = match &layer.provides {
                Some(provides) => provides,
                None => continue,
            };

            for decl in &provides.versions {
                let versions =
                    expand_versions(decl.range()).context(error::VersionExpandSnafu {
                        spec: spec_path.clone(),
                    })?;
                let arches = decl.arches().unwrap_or(&provides.arches);

                for version in versions {
                    for arch in arches {
                        let key = format!("{}-{}-{}", provides.dist, version, arch);
                        let iso_local =
                            iso_is_local(&layer, &provides.dist, &version, arch, iso_dir);
                        entries.push(IndexEntry {
                            key,
                            dist: provides.dist.clone(),
                            version: version.clone(),
                            arch: arch.clone(),
                            spec_path: spec_path.clone(),
                            iso_local,
                        });
                    }
                }
            }
        }

        entries.sort_by(|a, b| natural_cmp(&a.key, &b.key));
        Ok(Self {
            built_at: Utc::now().to_rfc3339(),
            entries,
        })
    }

    pub fn lookup(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All candidate spec files under the library: `<specs>/<name>/spec.json`
/// plus bare `<specs>/<name>.json` layers.
fn spec_files(specs_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(specs_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    files.sort();
    files
}

fn read_spec(path: &Path) -> Result<Layer> {
    let contents = fs::read_to_string(path).context(error::SpecReadSnafu { path })?;
    let value: Value = serde_json::from_str(&contents).context(error::SpecParseSnafu { path })?;
    Layer::from_value(value).context(error::SpecParseSnafu { path })
}

/// Checks whether any ISO URL the spec references resolves to a file in the
/// local ISO directory.  URL markers are rendered against a minimal defs
/// set; a URL that needs more context than the index has simply counts as
/// not local.
fn iso_is_local(layer: &Layer, dist: &str, version: &str, arch: &str, iso_dir: &Path) -> bool {
    let mut urls = Vec::new();
    if let Some(url) = layer.defs.get("iso_url") {
        urls.push(url.clone());
    }
    if let Some(Value::Array(more)) = layer.defs.get("iso_urls") {
        urls.extend(more.iter().cloned());
    }
    if urls.is_empty() {
        return false;
    }

    let (major, minor) = split_version(version);
    let defs = json!({
        "dist": dist,
        "version": version,
        "version_major": major,
        "version_minor": minor,
        "arch": arch,
    });
    let defs = defs.as_object().unwrap().clone();
    let engine = Engine::new(&defs);

    for url in urls {
        let rendered = match &url {
            Value::String(s) => match engine.render_string(s) {
                Ok(Value::String(rendered)) => rendered,
                _ => continue,
            },
            _ => continue,
        };
        let name = match rendered.rsplit('/').next() {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        if iso_dir.join(name).is_file() {
            return true;
        }
    }
    false
}

/// Splits a version into its major and minor components.
pub fn split_version(version: &str) -> (String, String) {
    match version.split_once('.') {
        Some((major, minor)) => (major.to_string(), minor.to_string()),
        None => (version.to_string(), String::new()),
    }
}

fn cache_is_current(cache_path: &Path, data_dir: &Path) -> bool {
    let cache_mtime = match fs::metadata(cache_path).and_then(|m| m.modified()) {
        Ok(mtime) => mtime,
        Err(_) => return false,
    };
    // Directory mtimes are included so that removing a spec (which touches
    // its parent directory) also invalidates the cache.
    let newest_change = WalkDir::new(data_dir.join("specs"))
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter_map(|metadata| metadata.modified().ok())
        .max();
    match newest_change {
        Some(newest) => newest <= cache_mtime,
        // No spec library at all; an existing cache is as current as it gets.
        None => true,
    }
}

fn read_cache(cache_path: &Path) -> Option<SpecIndex> {
    let contents = fs::read_to_string(cache_path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(index) => Some(index),
        Err(e) => {
            log::warn!("Discarding unreadable index cache: {}", e);
            None
        }
    }
}

/// Coarse file lock around index rebuilds.  The guard removes the lock file
/// on drop; a lock left behind by a dead process is broken after a timeout.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(path: &Path) -> Option<Self> {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        for _attempt in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_file) => {
                    return Some(Self {
                        path: path.to_owned(),
                    })
                }
                Err(_exists) => {
                    let stale = fs::metadata(path)
                        .and_then(|m| m.modified())
                        .map(|mtime| {
                            SystemTime::now()
                                .duration_since(mtime)
                                .unwrap_or(Duration::ZERO)
                                > LOCK_STALE_AFTER
                        })
                        .unwrap_or(true);
                    if !stale {
                        return None;
                    }
                    log::warn!("Breaking stale index lock '{}'", path.display());
                    let _ = fs::remove_file(path);
                }
            }
        }
        None
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to read spec '{}': {}", path.display(), source))]
        SpecRead {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to parse spec '{}': {}", path.display(), source))]
        SpecParse {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("Bad version declaration in '{}': {}", spec.display(), source))]
        VersionExpand {
            spec: PathBuf,
            source: super::expand::Error,
        },

        #[snafu(display("Failed to write index cache '{}': {}", path.display(), source))]
        CacheWrite {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to serialize index cache: {}", source))]
        CacheSerialize { source: serde_json::Error },
    }
}
pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;

    fn write_spec(dir: &Path, name: &str, contents: &Value) {
        let spec_dir = dir.join("specs").join(name);
        fs::create_dir_all(&spec_dir).unwrap();
        fs::write(
            spec_dir.join("spec.json"),
            serde_json::to_string_pretty(contents).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn build_expands_versions_and_arches() {
        let data = tempfile::tempdir().unwrap();
        let isos = tempfile::tempdir().unwrap();
        write_spec(
            data.path(),
            "rhel",
            &json!({
                "provides": {
                    "dist": "rhel",
                    "versions": ["9.[4-5]", {"version": "8.10", "arches": ["x86_64"]}],
                    "arches": ["x86_64", "aarch64"]
                }
            }),
        );

        let index = SpecIndex::build(data.path(), isos.path()).unwrap();
        let keys: Vec<&str> = index.entries().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(
            keys,
            [
                // natural order: 8.10 before 9.4, narrowed to x86_64 only
                "rhel-8.10-x86_64",
                "rhel-9.4-aarch64",
                "rhel-9.4-x86_64",
                "rhel-9.5-aarch64",
                "rhel-9.5-x86_64",
            ]
        );
    }

    #[test]
    fn lookup_finds_spec_path() {
        let data = tempfile::tempdir().unwrap();
        let isos = tempfile::tempdir().unwrap();
        write_spec(
            data.path(),
            "debian",
            &json!({
                "provides": {"dist": "debian", "versions": ["12"], "arches": ["x86_64"]}
            }),
        );

        let index = SpecIndex::build(data.path(), isos.path()).unwrap();
        let entry = index.lookup("debian-12-x86_64").unwrap();
        assert!(entry.spec_path.ends_with("specs/debian/spec.json"));
        assert!(index.lookup("debian-13-x86_64").is_none());
    }

    #[test]
    fn iso_local_detection() {
        let data = tempfile::tempdir().unwrap();
        let isos = tempfile::tempdir().unwrap();
        write_spec(
            data.path(),
            "rhel",
            &json!({
                "defs": {
                    "iso_url": "https://mirror.example.com/isos/rhel->>version<<->>arch<<-dvd.iso"
                },
                "provides": {"dist": "rhel", "versions": ["9.5"], "arches": ["x86_64"]}
            }),
        );
        fs::write(isos.path().join("rhel-9.5-x86_64-dvd.iso"), b"not really an iso").unwrap();

        let index = SpecIndex::build(data.path(), isos.path()).unwrap();
        assert!(index.lookup("rhel-9.5-x86_64").unwrap().iso_local);
    }

    #[test]
    fn cache_round_trip_and_staleness() {
        let data = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        let isos = tempfile::tempdir().unwrap();
        write_spec(
            data.path(),
            "alma",
            &json!({
                "provides": {"dist": "alma", "versions": ["9.[3-4]"], "arches": ["x86_64"]}
            }),
        );

        let first = SpecIndex::load_or_rebuild(data.path(), user.path(), isos.path()).unwrap();
        assert_eq!(first.entries().len(), 2);
        assert!(user.path().join("specs/index.json").is_file());

        // A second load with nothing changed comes from the cache.
        let second = SpecIndex::load_or_rebuild(data.path(), user.path(), isos.path()).unwrap();
        assert_eq!(second.built_at, first.built_at);
    }

    #[test]
    fn version_split() {
        assert_eq!(split_version("9.5"), ("9".to_string(), "5".to_string()));
        assert_eq!(split_version("12"), ("12".to_string(), String::new()));
        assert_eq!(split_version("15.0.1"), ("15".to_string(), "0.1".to_string()));
    }
}
