/*!
Build assembly: the pipeline that turns a terse build target into a fully
resolved Packer input document.

The steps, in order: look the target up in the spec index; resolve platform,
location, and spec layers; compute derived defs (versions, names, network,
workspace); apply caller overrides; resolve the ISO; run the template engine
across every section; and assemble the final document.  Reprovision requests
swap the builder for a `null` builder at the end so provisioning runs against
an existing host.
*/

mod iso;
mod network;

pub use iso::IsoResolution;
pub use network::{parse_cidr, Network};

use crate::config::{value_to_string, Accumulator, FileSpec, RequiredFile, Resolver, Where};
use crate::creds::{self, CredentialProvider};
use crate::index::{split_version, SpecIndex};
use crate::template::Engine;
use osimager_config::Settings;
use serde_json::{json, Map, Value};
use snafu::{OptionExt, ResultExt};
use std::path::PathBuf;
use std::str::FromStr;

/// The delimiters whose presence means a build needs a secrets source.
const SECRET_OPENERS: [&str; 4] = ["|>", "1>", "5>", "6>"];
const VAULT_REF_TEXT: &str = "{{vault";

/// A `platform/location/spec` build target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildTarget {
    pub platform: String,
    pub location: String,
    pub spec_key: String,
}

impl FromStr for BuildTarget {
    type Err = Error;

    fn from_str(target: &str) -> Result<Self> {
        let mut parts = target.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(platform), Some(location), Some(spec_key), None)
                if !platform.is_empty() && !location.is_empty() && !spec_key.is_empty() =>
            {
                Ok(Self {
                    platform: platform.to_string(),
                    location: location.to_string(),
                    spec_key: spec_key.to_string(),
                })
            }
            _ => error::BadTargetSnafu { target }.fail(),
        }
    }
}

impl std::fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.platform, self.location, self.spec_key)
    }
}

/// Caller-supplied knobs for one assembly.
#[derive(Clone, Debug, Default)]
pub struct AssemblyOptions {
    /// Instance name; defaults to `<dist>-<version>-<arch>`.
    pub name: Option<String>,
    /// Instance address; resolved from DNS when not given.
    pub ip: Option<String>,
    /// `--define key=value` overrides; these always win over layers.
    pub defines: Vec<(String, String)>,
    /// `--set key=value` Packer user-variable overrides.
    pub variables: Vec<(String, String)>,
    pub fqdn: Option<String>,
    /// Only use ISOs already on local disk.
    pub local_only: bool,
    /// The per-build workspace; a path under the temp dir when not set.
    pub workspace: Option<PathBuf>,
    /// Reprovision an existing host instead of creating a VM.
    pub reprovision_host: Option<String>,
}

/// Everything the orchestrator needs to run one build.
#[derive(Clone, Debug)]
pub struct AssembledBuild {
    pub target: BuildTarget,
    /// The Packer input document.
    pub document: Value,
    /// Environment for the Packer process.
    pub evars: Vec<(String, String)>,
    /// Installer files to generate into the workspace.
    pub files: Vec<FileSpec>,
    pub required_files: Vec<RequiredFile>,
    /// The fully resolved defs, for diagnostics and dumps.
    pub defs: Map<String, Value>,
    pub workspace: PathBuf,
    /// Base name for the Packer input file in the workspace.
    pub name: String,
}

/// Resolves and assembles one build target end to end.
pub fn assemble(
    settings: &Settings,
    index: &SpecIndex,
    target: &BuildTarget,
    opts: &AssemblyOptions,
    creds: Option<&dyn CredentialProvider>,
) -> Result<AssembledBuild> {
    // Index lookup tells us what the spec key actually means.
    let entry = index
        .lookup(&target.spec_key)
        .context(error::SpecNotFoundSnafu {
            key: target.spec_key.clone(),
        })?;

    // Seed the resolver with the target tuple and the paths layers refer to.
    let mut resolver = Resolver::new(&settings.data_dir, &settings.user_dir);
    let (major, minor) = split_version(&entry.version);
    let seed = json!({
        "platform": target.platform,
        "location": target.location,
        "dist": entry.dist,
        "version": entry.version,
        "version_major": major,
        "version_minor": minor,
        "arch": entry.arch,
        "target": target.to_string(),
        "data_dir": settings.data_dir,
        "user_dir": settings.user_dir,
        "installer_dir": settings.installer_dir,
        "iso_dir": settings.iso_dir(),
    });
    resolver.acc.defs = seed.as_object().unwrap().clone();

    // Platform, then location, then spec; each merge may trigger specific
    // overrides against the defs seeded above.
    resolver
        .load(Where::Platforms, &target.platform)
        .context(error::ResolutionSnafu)?;
    resolver
        .load(Where::Locations, &target.location)
        .context(error::ResolutionSnafu)?;
    resolver
        .load_spec_file(&entry.spec_path)
        .context(error::ResolutionSnafu)?;

    let mut acc = resolver.acc;

    // Derived defs: instance identity and network decomposition.
    let name = opts
        .name
        .clone()
        .or_else(|| opts.reprovision_host.clone())
        .unwrap_or_else(|| format!("{}-{}-{}", entry.dist, entry.version, entry.arch));
    acc.defs.insert("name".to_string(), Value::String(name.clone()));

    let fqdn = opts.fqdn.clone().unwrap_or_else(|| {
        match acc.def_str("domain").filter(|d| !d.is_empty()) {
            Some(domain) => format!("{}.{}", name, domain),
            None => name.clone(),
        }
    });
    acc.defs.insert("fqdn".to_string(), Value::String(fqdn.clone()));

    network::derive(&mut acc.defs)?;

    let ip = network::resolve_instance_ip(&fqdn, opts.ip.as_deref());
    acc.defs.insert("ip".to_string(), Value::String(ip));

    let workspace = opts.workspace.clone().unwrap_or_else(|| {
        settings
            .temp_dir()
            .join(format!("osimager-{}", name))
    });
    acc.defs
        .insert("workspace".to_string(), Value::String(workspace.display().to_string()));

    // Caller --define overrides always win.
    for (key, value) in &opts.defines {
        acc.defs.insert(key.clone(), parse_scalar(value));
    }

    // ISO resolution happens against the current defs so URL markers work.
    // Reprovisioning boots nothing, so it skips the ISO entirely.
    if opts.reprovision_host.is_none() {
        let engine = Engine::new(&acc.defs);
        let urls = iso::candidate_urls(&acc.defs)
            .iter()
            .map(|url| match engine.render_string(url) {
                Ok(Value::String(rendered)) => Ok(rendered),
                Ok(other) => Ok(value_to_string(&other)),
                Err(e) => Err(e),
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .context(error::TemplateSnafu)?;
        let checksum_url = acc
            .def_str("iso_checksum_url")
            .map(|url| match Engine::new(&acc.defs).render_string(&url) {
                Ok(value) => Ok(value_to_string(&value)),
                Err(e) => Err(e),
            })
            .transpose()
            .context(error::TemplateSnafu)?;

        let resolution = iso::resolve(
            &urls,
            checksum_url.as_deref(),
            &settings.iso_dir(),
            opts.local_only,
        )?;
        if let Some(url) = &resolution.url {
            acc.defs.insert("iso_url".to_string(), Value::String(url.clone()));
        }
        if let Some(path) = &resolution.path {
            let rendered = path.display().to_string();
            acc.defs.insert("iso_path".to_string(), Value::String(rendered.clone()));
            // Builders take a URL; a local file is served as file://
            acc.defs
                .insert("iso_url".to_string(), Value::String(format!("file://{}", rendered)));
        }
        if let Some(checksum) = &resolution.checksum {
            acc.defs
                .insert("iso_checksum".to_string(), Value::String(checksum.clone()));
        }
    }

    // Secret markers without a provider must fail the build; sections with
    // no markers never touch the provider at all.
    if creds.is_none() && secrets_required(&acc) {
        log::debug!("Secret markers present with no credential source");
        // The engine produces the precise error naming the first marker.
    }

    let search_domains = search_domains(&acc.defs);

    // Template passes, in contract order: defs first (against themselves),
    // then every other section against the finished defs.
    let rendered_defs = render_defs(&acc.defs, creds, &search_domains)?;
    acc.defs = rendered_defs;

    let engine = Engine {
        defs: &acc.defs,
        creds,
        search_domains: &search_domains,
    };

    let evars = render_string_map(&engine, &acc.evars)?;
    let variables = render_string_map(&engine, &acc.variables)?;

    let mut files = Vec::with_capacity(acc.files.len());
    for file in &acc.files {
        files.push(FileSpec {
            sources: file
                .sources
                .iter()
                .map(|s| render_text(&engine, s))
                .collect::<Result<Vec<_>>>()?,
            dest: render_text(&engine, &file.dest)?,
        });
    }

    let pre = render_list(&engine, &acc.pre_provisioners)?;
    let main = render_list(&engine, &acc.provisioners)?;
    let post = render_list(&engine, &acc.post_provisioners)?;
    let config = engine.render_map(&acc.config).context(error::TemplateSnafu)?;

    // The Packer input document.
    let mut provisioners = Vec::new();
    provisioners.extend(pre);
    provisioners.extend(main);
    provisioners.extend(post);

    let variables_json: Map<String, Value> = variables
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let mut document = json!({
        "variables": variables_json,
        "provisioners": provisioners,
        "builders": [Value::Object(config)],
    });

    // Reprovision: replace the builder with a null builder that connects to
    // the existing host, and skip installer files entirely.
    if opts.reprovision_host.is_some() {
        null_builder(&mut document)?;
        files.clear();
    }

    // When the active source is local, Packer has no Vault to consult, so
    // embedded references are inlined here.
    if let Some(provider) = creds {
        if !provider.passes_references_downstream() {
            creds::resolve_embedded_references(provider, &mut document)
                .context(error::CredsSnafu)?;
        }
    }

    Ok(AssembledBuild {
        target: target.clone(),
        document,
        evars,
        files,
        required_files: acc.required_files,
        defs: acc.defs,
        workspace,
        name,
    })
}

/// True when any section of the accumulator carries a secret marker or an
/// embedded vault reference.
pub fn secrets_required(acc: &Accumulator) -> bool {
    let rendered = serde_json::to_string(&json!({
        "defs": acc.defs,
        "config": acc.config,
        "variables": acc.variables,
        "evars": acc.evars,
        "files": acc.files,
        "pre": acc.pre_provisioners,
        "main": acc.provisioners,
        "post": acc.post_provisioners,
    }))
    .unwrap_or_default();

    rendered.contains(VAULT_REF_TEXT)
        || SECRET_OPENERS.iter().any(|open| {
            // A bare opener is not enough; the matching closer must follow.
            let close = format!("<{}", &open[..1]);
            rendered
                .find(open)
                .map(|at| rendered[at..].contains(&close))
                .unwrap_or(false)
        })
}

/// DNS search domains for the engine, from the location's defs.
fn search_domains(defs: &Map<String, Value>) -> Vec<String> {
    match defs.get("search_domains") {
        Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
        Some(Value::String(joined)) => joined
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        _ => defs
            .get("domain")
            .map(|d| vec![value_to_string(d)])
            .unwrap_or_default(),
    }
}

/// Renders defs against themselves in insertion order, so later defs can
/// reference earlier ones.
fn render_defs(
    defs: &Map<String, Value>,
    creds: Option<&dyn CredentialProvider>,
    search_domains: &[String],
) -> Result<Map<String, Value>> {
    let mut rendered = defs.clone();
    let keys: Vec<String> = rendered.keys().cloned().collect();
    for key in keys {
        let value = rendered.get(&key).cloned().unwrap_or(Value::Null);
        let engine = Engine {
            defs: &rendered,
            creds,
            search_domains,
        };
        let new_value = engine.render_value(&value).context(error::TemplateSnafu)?;
        rendered.insert(key, new_value);
    }
    Ok(rendered)
}

fn render_text(engine: &Engine<'_>, text: &str) -> Result<String> {
    let rendered = engine.render_string(text).context(error::TemplateSnafu)?;
    Ok(match rendered {
        Value::String(s) => s,
        other => value_to_string(&other),
    })
}

fn render_string_map(
    engine: &Engine<'_>,
    map: &Map<String, Value>,
) -> Result<Vec<(String, String)>> {
    let rendered = engine.render_map(map).context(error::TemplateSnafu)?;
    Ok(rendered
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect())
}

fn render_list(engine: &Engine<'_>, items: &[Value]) -> Result<Vec<Value>> {
    match engine
        .render_value(&Value::Array(items.to_vec()))
        .context(error::TemplateSnafu)?
    {
        Value::Array(rendered) => Ok(rendered),
        _ => unreachable!("rendering an array always yields an array"),
    }
}

/// `--define` values keep their scalar types: bools and integers pass
/// through as themselves, everything else stays a string.
fn parse_scalar(value: &str) -> Value {
    if value == "true" {
        return Value::Bool(true);
    }
    if value == "false" {
        return Value::Bool(false);
    }
    if let Ok(n) = value.parse::<i64>() {
        return Value::from(n);
    }
    Value::String(value.to_string())
}

/// Replaces the single builder with a `null` builder, keeping only the
/// communicator-prefixed connection settings.
fn null_builder(document: &mut Value) -> Result<()> {
    let builders = document
        .get_mut("builders")
        .and_then(Value::as_array_mut)
        .context(error::NoBuilderSnafu)?;
    let original = builders
        .first()
        .and_then(Value::as_object)
        .cloned()
        .context(error::NoBuilderSnafu)?;

    let mut replacement = Map::new();
    replacement.insert("type".to_string(), Value::String("null".to_string()));
    for (key, value) in original {
        if key == "communicator"
            || key.starts_with("ssh_")
            || key.starts_with("winrm_")
        {
            replacement.insert(key, value);
        }
    }
    *builders = vec![Value::Object(replacement)];
    Ok(())
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display(
            "Bad build target '{}'; expected <platform>/<location>/<spec>",
            target
        ))]
        BadTarget { target: String },

        #[snafu(display("'{}' is not in the spec index; try --list", key))]
        SpecNotFound { key: String },

        #[snafu(display("{}", source))]
        Resolution { source: crate::config::Error },

        #[snafu(display("{}", source))]
        Template { source: crate::template::Error },

        #[snafu(display("{}", source))]
        Creds { source: crate::creds::Error },

        #[snafu(display("Bad network '{}'; expected address/prefix", value))]
        BadNetwork { value: String },

        #[snafu(display("No ISO found in '{}' matching {:?}", dir.display(), names))]
        IsoNotLocal {
            dir: std::path::PathBuf,
            names: Vec<String>,
        },

        #[snafu(display("No candidate ISO URL was usable: {:?}", tried))]
        IsoUnavailable { tried: Vec<String> },

        #[snafu(display("ISO probe setup failed: {}", detail))]
        IsoProbe { detail: String },

        #[snafu(display("Document has no builder to replace"))]
        NoBuilder,
    }

    impl Error {
        /// The CLI exit code for this failure class.
        pub fn exit_code(&self) -> i32 {
            match self {
                Error::Creds { .. } => 3,
                Error::Template {
                    source: crate::template::Error::Secret { .. },
                }
                | Error::Template {
                    source: crate::template::Error::NoCredentialSource { .. },
                } => 3,
                _ => 1,
            }
        }
    }
}
pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;
