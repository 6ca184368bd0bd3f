/*!
Hierarchical configuration resolution.

A build resolves three layers in order: the platform, the location, and the
spec.  Each layer is a JSON (or, for locations, TOML) file contributing to a
mutable [`Accumulator`].  Layers may `include` other layers of the same kind,
which are applied first, and may carry `*_specific` arrays whose entries are
applied conditionally when the current value of a match field (platform,
location, dist, version, arch, firmware) matches a pattern.
*/

mod layer;
mod loader;
mod merge;
mod specific;

pub use layer::{
    Accumulator, FileSpec, IncludeList, Layer, MergeMethod, Provides, RequiredFile, VersionDecl,
};
pub use loader::{Resolver, Where};
pub(crate) use layer::value_to_string;
pub(crate) use merge::merge_value;

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub enum Error {
        #[snafu(display("Failed to read config file '{}': {}", path.display(), source))]
        FileRead {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Malformed JSON in '{}': {}", path.display(), source))]
        JsonParse {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("Malformed TOML in '{}': {}", path.display(), source))]
        TomlParse {
            path: PathBuf,
            source: toml::de::Error,
        },

        #[snafu(display("Config layer in '{}' has invalid structure: {}", path.display(), source))]
        LayerStructure {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("No {} named '{}' under '{}'", what, name, dir.display()))]
        NotFound {
            what: &'static str,
            name: String,
            dir: PathBuf,
        },

        #[snafu(display("Include cycle detected: '{}' is already being loaded", path.display()))]
        IncludeCycle { path: PathBuf },

        #[snafu(display(
            "Location '{}' does not support platform '{}' (supports: {})",
            location_name,
            platform,
            supported.join(", ")
        ))]
        PlatformUnsupportedByLocation {
            location_name: String,
            platform: String,
            supported: Vec<String>,
        },

        #[snafu(display("Invalid pattern '{}' in {}: {}", pattern, section, source))]
        SpecificPattern {
            pattern: String,
            section: &'static str,
            source: regex::Error,
        },

        #[snafu(display("Entry in {} is missing its '{}' match pattern", section, field))]
        SpecificMissingPattern {
            section: &'static str,
            field: &'static str,
        },
    }
}
pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;
