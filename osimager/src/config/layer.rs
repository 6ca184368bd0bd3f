//! The shapes of one loaded config file (`Layer`) and of the merged state a
//! build resolves into (`Accumulator`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a layer combines its list-typed sections with what came before.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    #[default]
    Merge,
    Replace,
}

/// `include` accepts a single name or an ordered list of names.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum IncludeList {
    One(String),
    Many(Vec<String>),
}

impl IncludeList {
    pub fn names(&self) -> Vec<&str> {
        match self {
            IncludeList::One(name) => vec![name.as_str()],
            IncludeList::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// One entry of a spec's `files` section: installer fragments to concatenate
/// and the workspace-relative destination to write.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileSpec {
    pub sources: Vec<String>,
    pub dest: String,
}

/// A file the spec requires to exist on disk before a build can start,
/// with enough detail to tell the user how to get it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RequiredFile {
    pub file: String,
    pub description: String,
    pub url: String,
    pub location: Option<String>,
}

/// A spec's declaration of what it can build.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Provides {
    pub dist: String,
    pub versions: Vec<VersionDecl>,
    pub arches: Vec<String>,
}

/// A version declaration: either a bare range string, or a range string with
/// an architecture narrowing for the versions it expands to.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum VersionDecl {
    Plain(String),
    Narrowed { version: String, arches: Vec<String> },
}

impl VersionDecl {
    pub fn range(&self) -> &str {
        match self {
            VersionDecl::Plain(s) => s,
            VersionDecl::Narrowed { version, .. } => version,
        }
    }

    pub fn arches(&self) -> Option<&[String]> {
        match self {
            VersionDecl::Plain(_) => None,
            VersionDecl::Narrowed { arches, .. } => Some(arches),
        }
    }
}

/// One loaded config file's contents.
///
/// The nested structures here make it trivial to deserialize the JSON and
/// TOML files we expect to find in the data and user directories.  The six
/// `*_specific` arrays stay as raw objects; their match pattern is keyed by
/// the field name and the remainder of each entry is itself a layer.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Layer {
    pub include: Option<IncludeList>,

    #[serde(default)]
    pub method: MergeMethod,

    #[serde(default)]
    pub defs: Map<String, Value>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub evars: Map<String, Value>,

    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub pre_provisioners: Vec<Value>,
    #[serde(default)]
    pub provisioners: Vec<Value>,
    #[serde(default)]
    pub post_provisioners: Vec<Value>,

    #[serde(default)]
    pub platform_specific: Vec<Map<String, Value>>,
    #[serde(default)]
    pub location_specific: Vec<Map<String, Value>>,
    #[serde(default)]
    pub dist_specific: Vec<Map<String, Value>>,
    #[serde(default)]
    pub version_specific: Vec<Map<String, Value>>,
    #[serde(default)]
    pub arch_specific: Vec<Map<String, Value>>,
    #[serde(default)]
    pub firmware_specific: Vec<Map<String, Value>>,

    /// Platforms a location supports; a target outside this list is rejected.
    pub platforms: Option<Vec<String>>,
    /// Locations a platform is limited to, if any.
    pub locations: Option<Vec<String>>,
    pub arches: Option<Vec<String>>,
    pub flavor: Option<String>,
    pub venv: Option<String>,
    pub provides: Option<Provides>,
    #[serde(default)]
    pub required_files: Vec<RequiredFile>,
}

impl Layer {
    /// Builds a Layer from an already-parsed JSON value, as happens for the
    /// bodies of specific-override entries.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// True when the layer contributes nothing; merging it is a no-op.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
            && self.config.is_empty()
            && self.variables.is_empty()
            && self.evars.is_empty()
            && self.files.is_empty()
            && self.pre_provisioners.is_empty()
            && self.provisioners.is_empty()
            && self.post_provisioners.is_empty()
            && self.platform_specific.is_empty()
            && self.location_specific.is_empty()
            && self.dist_specific.is_empty()
            && self.version_specific.is_empty()
            && self.arch_specific.is_empty()
            && self.firmware_specific.is_empty()
            && self.include.is_none()
            && self.required_files.is_empty()
    }
}

/// The merged configuration state built up across layers.  Created once per
/// build, mutated only during resolution, then frozen before dispatch to the
/// orchestrator.
#[derive(Clone, Debug, Default)]
pub struct Accumulator {
    /// Resolved variables available for template substitution.
    pub defs: Map<String, Value>,
    /// The Packer builder under construction.
    pub config: Map<String, Value>,
    /// Packer user variables.
    pub variables: Map<String, Value>,
    /// Environment variables for the Packer process.
    pub evars: Map<String, Value>,

    pub files: Vec<FileSpec>,
    pub pre_provisioners: Vec<Value>,
    pub provisioners: Vec<Value>,
    pub post_provisioners: Vec<Value>,

    /// Platform gate declared by the most recent location layer.
    pub platforms: Option<Vec<String>>,
    pub flavor: Option<String>,
    pub venv: Option<String>,
    pub required_files: Vec<RequiredFile>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience accessor for a defs value rendered as a string, the form
    /// specific-override matching operates on.
    pub fn def_str(&self, key: &str) -> Option<String> {
        self.defs.get(key).map(value_to_string)
    }
}

/// Renders a JSON value the way it reads when spliced into a string: bare
/// strings lose their quotes, everything else keeps its JSON form.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
