//! Loads config layers from disk and merges them into the accumulator.
//!
//! All loading funnels through [`Resolver::apply_layer`], which is also the
//! entry point the specific-section processor re-enters for override bodies;
//! one recursive path handles arbitrary nesting depth.

use super::layer::{Accumulator, Layer, MergeMethod};
use super::specific;
use super::{error, merge_value, Result};
use serde_json::{Map, Value};
use snafu::{ensure, ResultExt};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Which part of the library a logical name resolves in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Where {
    Platforms,
    Locations,
    Specs,
}

impl Where {
    fn what(self) -> &'static str {
        match self {
            Where::Platforms => "platform",
            Where::Locations => "location",
            Where::Specs => "spec",
        }
    }
}

/// Owns the accumulator for one resolution.  All loading functions take and
/// return it through `&mut self`; nothing is shared or global.
#[derive(Debug)]
pub struct Resolver {
    data_dir: PathBuf,
    user_dir: PathBuf,
    pub acc: Accumulator,
}

impl Resolver {
    pub fn new<P, Q>(data_dir: P, user_dir: Q) -> Self
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        Self {
            data_dir: data_dir.as_ref().to_owned(),
            user_dir: user_dir.as_ref().to_owned(),
            acc: Accumulator::new(),
        }
    }

    /// Loads the named layer (and its include chain) and merges it in.
    pub fn load(&mut self, section: Where, name: &str) -> Result<()> {
        let path = self.resolve_path(section, name)?;
        self.load_path(section, &path, &mut Vec::new())?;

        // A location may gate the platforms it serves; reject a target outside
        // the gate as soon as the location has been merged.
        if section == Where::Locations {
            if let Some(platforms) = self.acc.platforms.clone() {
                if let Some(platform) = self.acc.def_str("platform") {
                    ensure!(
                        platforms.iter().any(|p| p == &platform),
                        error::PlatformUnsupportedByLocationSnafu {
                            location_name: name,
                            platform,
                            supported: platforms,
                        }
                    );
                }
            }
        }
        Ok(())
    }

    /// Loads a spec layer from an explicit path, as handed out by the index.
    pub fn load_spec_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.load_path(Where::Specs, path.as_ref(), &mut Vec::new())
    }

    /// Depth-first load: includes are applied before the including layer.
    /// The chain tracks canonical paths currently in progress so that a cycle
    /// is rejected while a diamond (the same base included twice) is not.
    fn load_path(&mut self, section: Where, path: &Path, chain: &mut Vec<PathBuf>) -> Result<()> {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_owned());
        ensure!(
            !chain.contains(&canonical),
            error::IncludeCycleSnafu { path: canonical }
        );
        chain.push(canonical);

        log::debug!("Loading {} layer from '{}'", section.what(), path.display());
        let layer = read_layer(path)?;

        if let Some(include) = &layer.include {
            for name in include.names() {
                let include_path = self.resolve_path(section, name)?;
                self.load_path(section, &include_path, chain)?;
            }
        }

        self.apply_layer(&layer)?;
        chain.pop();
        Ok(())
    }

    /// Merges one layer into the accumulator, then applies any specific
    /// overrides it carries.  Override bodies re-enter this function.
    pub fn apply_layer(&mut self, layer: &Layer) -> Result<()> {
        if layer.method == MergeMethod::Replace {
            self.acc.files.clear();
            self.acc.pre_provisioners.clear();
            self.acc.provisioners.clear();
            self.acc.post_provisioners.clear();
        }

        apply_map_section(&mut self.acc.defs, &layer.defs);
        apply_map_section(&mut self.acc.config, &layer.config);
        apply_map_section(&mut self.acc.variables, &layer.variables);
        apply_map_section(&mut self.acc.evars, &layer.evars);

        self.acc.files.extend(layer.files.iter().cloned());
        self.acc
            .pre_provisioners
            .extend(layer.pre_provisioners.iter().cloned());
        self.acc
            .provisioners
            .extend(layer.provisioners.iter().cloned());
        self.acc
            .post_provisioners
            .extend(layer.post_provisioners.iter().cloned());

        if layer.platforms.is_some() {
            self.acc.platforms = layer.platforms.clone();
        }
        if layer.flavor.is_some() {
            self.acc.flavor = layer.flavor.clone();
        }
        if layer.venv.is_some() {
            self.acc.venv = layer.venv.clone();
        }
        self.acc
            .required_files
            .extend(layer.required_files.iter().cloned());

        specific::process(self, layer)
    }

    /// Resolves a logical name to a file for the given section.
    pub fn resolve_path(&self, section: Where, name: &str) -> Result<PathBuf> {
        let candidates = match section {
            Where::Platforms => {
                let dir = self.data_dir.join("platforms");
                vec![dir.join(format!("{}.json", name)), dir.join(format!("{}.toml", name))]
            }
            Where::Locations => {
                let dir = self.user_dir.join("locations");
                vec![dir.join(format!("{}.json", name)), dir.join(format!("{}.toml", name))]
            }
            Where::Specs => {
                let dir = self.data_dir.join("specs");
                vec![dir.join(name).join("spec.json"), dir.join(format!("{}.json", name))]
            }
        };

        for candidate in &candidates {
            if candidate.is_file() {
                return Ok(candidate.clone());
            }
        }
        error::NotFoundSnafu {
            what: section.what(),
            name,
            dir: candidates[0].parent().unwrap_or(&self.data_dir).to_owned(),
        }
        .fail()
    }
}

/// Copies one layer's mapping section into the accumulator's.  Keys named by
/// the section's `merge` directive are deep-merged; all other keys replace.
/// The directive itself never lands in the accumulator.
fn apply_map_section(dst: &mut Map<String, Value>, src: &Map<String, Value>) {
    let merge_keys: HashSet<&str> = src
        .get("merge")
        .and_then(Value::as_array)
        .map(|keys| keys.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    for (key, value) in src {
        if key == "merge" {
            continue;
        }
        if merge_keys.contains(key.as_str()) {
            match dst.get_mut(key) {
                Some(existing) => merge_value(existing, value.clone()),
                None => {
                    dst.insert(key.clone(), value.clone());
                }
            }
        } else {
            dst.insert(key.clone(), value.clone());
        }
    }
}

/// Reads a file into a Layer, converting TOML to the JSON value model first
/// so that one merge path serves both formats.
fn read_layer(path: &Path) -> Result<Layer> {
    let contents = fs::read_to_string(path).context(error::FileReadSnafu { path })?;
    let value: Value = if path.extension().map(|e| e == "toml").unwrap_or(false) {
        let parsed: toml::Value =
            toml::from_str(&contents).context(error::TomlParseSnafu { path })?;
        serde_json::to_value(parsed).context(error::JsonParseSnafu { path })?
    } else {
        serde_json::from_str(&contents).context(error::JsonParseSnafu { path })?
    };
    Layer::from_value(value).context(error::LayerStructureSnafu { path })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write(dir: &Path, rel: &str, value: &Value) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    }

    fn resolver(data: &tempfile::TempDir, user: &tempfile::TempDir) -> Resolver {
        Resolver::new(data.path(), user.path())
    }

    #[test]
    fn include_chain_applies_in_order() {
        let data = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write(
            data.path(),
            "platforms/base.json",
            &json!({"defs": {"cpu_cores": 2, "memory_mb": 2048}}),
        );
        write(
            data.path(),
            "platforms/vmware.json",
            &json!({"include": "base", "defs": {"cpu_cores": 4}}),
        );

        let mut r = resolver(&data, &user);
        r.load(Where::Platforms, "vmware").unwrap();
        // base applied first, then the including layer wins
        assert_eq!(r.acc.defs["cpu_cores"], json!(4));
        assert_eq!(r.acc.defs["memory_mb"], json!(2048));
    }

    #[test]
    fn include_cycle_is_rejected() {
        let data = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write(data.path(), "platforms/a.json", &json!({"include": "b"}));
        write(data.path(), "platforms/b.json", &json!({"include": "a"}));

        let mut r = resolver(&data, &user);
        let err = r.load(Where::Platforms, "a").unwrap_err();
        assert!(matches!(err, super::error::Error::IncludeCycle { .. }));
    }

    #[test]
    fn diamond_include_is_allowed() {
        let data = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write(data.path(), "platforms/common.json", &json!({"defs": {"x": 1}}));
        write(data.path(), "platforms/left.json", &json!({"include": "common"}));
        write(data.path(), "platforms/right.json", &json!({"include": "common"}));
        write(
            data.path(),
            "platforms/top.json",
            &json!({"include": ["left", "right"]}),
        );

        let mut r = resolver(&data, &user);
        r.load(Where::Platforms, "top").unwrap();
        assert_eq!(r.acc.defs["x"], json!(1));
    }

    #[test]
    fn replace_method_clears_list_sections_only() {
        let data = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        let mut r = resolver(&data, &user);

        r.apply_layer(
            &Layer::from_value(json!({
                "defs": {"keep": true},
                "files": [{"sources": ["a"], "dest": "a.cfg"}],
                "provisioners": [{"type": "shell"}]
            }))
            .unwrap(),
        )
        .unwrap();
        r.apply_layer(
            &Layer::from_value(json!({
                "method": "replace",
                "files": [{"sources": ["b"], "dest": "b.cfg"}]
            }))
            .unwrap(),
        )
        .unwrap();

        assert_eq!(r.acc.files.len(), 1);
        assert_eq!(r.acc.files[0].dest, "b.cfg");
        assert!(r.acc.provisioners.is_empty());
        // mapping sections still merge key-by-key
        assert_eq!(r.acc.defs["keep"], json!(true));
    }

    #[test]
    fn merge_directive_deep_merges_named_keys() {
        let data = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        let mut r = resolver(&data, &user);

        r.apply_layer(
            &Layer::from_value(json!({
                "config": {"vmx_data": {"scsi0.virtualdev": "lsisas"}}
            }))
            .unwrap(),
        )
        .unwrap();
        r.apply_layer(
            &Layer::from_value(json!({
                "config": {
                    "merge": ["vmx_data"],
                    "vmx_data": {
                        "scsi0.virtualdev": "pvscsi",
                        "ethernet0.virtualDev": "vmxnet3"
                    }
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let vmx = r.acc.config["vmx_data"].as_object().unwrap();
        assert_eq!(vmx["scsi0.virtualdev"], json!("pvscsi"));
        assert_eq!(vmx["ethernet0.virtualDev"], json!("vmxnet3"));
        // the directive itself must not leak into the accumulator
        assert!(!r.acc.config.contains_key("merge"));
    }

    #[test]
    fn empty_layer_leaves_accumulator_unchanged() {
        let data = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        let mut r = resolver(&data, &user);
        r.apply_layer(&Layer::from_value(json!({"defs": {"a": 1}})).unwrap())
            .unwrap();
        let before = r.acc.clone();

        r.apply_layer(&Layer::default()).unwrap();
        assert_eq!(format!("{:?}", before), format!("{:?}", r.acc));
    }

    #[test]
    fn location_platform_gate() {
        let data = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write(
            user.path(),
            "locations/lab.json",
            &json!({"platforms": ["vmware", "qemu"], "defs": {"domain": "lab.example.com"}}),
        );

        let mut r = resolver(&data, &user);
        r.acc.defs.insert("platform".into(), json!("hyperv"));
        let err = r.load(Where::Locations, "lab").unwrap_err();
        assert!(matches!(
            err,
            super::error::Error::PlatformUnsupportedByLocation { .. }
        ));

        let mut ok = resolver(&data, &user);
        ok.acc.defs.insert("platform".into(), json!("vmware"));
        ok.load(Where::Locations, "lab").unwrap();
        assert_eq!(ok.acc.defs["domain"], json!("lab.example.com"));
    }

    #[test]
    fn toml_location_loads() {
        let data = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        let dir = user.path().join("locations");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("lab.toml"),
            "[defs]\ndomain = \"lab.example.com\"\n",
        )
        .unwrap();

        let mut r = resolver(&data, &user);
        r.load(Where::Locations, "lab").unwrap();
        assert_eq!(r.acc.defs["domain"], json!("lab.example.com"));
    }
}
