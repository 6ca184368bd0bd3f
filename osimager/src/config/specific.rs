//! Conditional override processing.
//!
//! A layer may carry up to six `*_specific` arrays.  They are processed in a
//! fixed order at every level of nesting: platform, location, dist, version,
//! arch, firmware.  Each entry holds its match pattern under the field name
//! (`{"version": "9.*", ...}`); the remainder of the entry is a layer that is
//! merged through the loader when the pattern matches, which in turn processes
//! any specific arrays nested inside the body.

use super::layer::{value_to_string, Layer};
use super::loader::Resolver;
use super::{error, Result};
use regex::RegexBuilder;
use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt};

/// The fixed processing order: section name and the defs field it matches on.
const SPECIFIC_ORDER: [(&str, &str); 6] = [
    ("platform_specific", "platform"),
    ("location_specific", "location"),
    ("dist_specific", "dist"),
    ("version_specific", "version"),
    ("arch_specific", "arch"),
    ("firmware_specific", "firmware"),
];

pub(super) fn process(resolver: &mut Resolver, layer: &Layer) -> Result<()> {
    for (section, field) in SPECIFIC_ORDER {
        let entries = match section {
            "platform_specific" => &layer.platform_specific,
            "location_specific" => &layer.location_specific,
            "dist_specific" => &layer.dist_specific,
            "version_specific" => &layer.version_specific,
            "arch_specific" => &layer.arch_specific,
            _ => &layer.firmware_specific,
        };
        if entries.is_empty() {
            continue;
        }

        // The runtime value comes from defs at the time this section is
        // processed, so earlier sections can influence later matches.
        let runtime = resolver.acc.defs.get(field).map(value_to_string);

        for entry in entries {
            let runtime = match &runtime {
                Some(v) => v,
                None => continue,
            };
            if let Some(body) = matching_body(entry, section, field, runtime)? {
                log::debug!("{} entry matched '{}'", section, runtime);
                resolver.apply_layer(&body)?;
            }
        }
    }
    Ok(())
}

/// Returns the entry's body as a Layer when its pattern full-matches the
/// runtime value, case-insensitively.
fn matching_body(
    entry: &Map<String, Value>,
    section: &'static str,
    field: &'static str,
    runtime: &str,
) -> Result<Option<Layer>> {
    let mut entry = entry.clone();
    let pattern_value = entry
        .remove(field)
        .context(error::SpecificMissingPatternSnafu { section, field })?;
    let pattern = value_to_string(&pattern_value);

    let regex = RegexBuilder::new(&format!("^(?:{})$", pattern))
        .case_insensitive(true)
        .build()
        .context(error::SpecificPatternSnafu {
            pattern: pattern.clone(),
            section,
        })?;
    if !regex.is_match(runtime) {
        return Ok(None);
    }

    let body = Layer::from_value(Value::Object(entry)).context(error::LayerStructureSnafu {
        path: std::path::PathBuf::from(section),
    })?;
    Ok(Some(body))
}

#[cfg(test)]
mod test {
    use super::super::Resolver;
    use super::*;
    use serde_json::json;

    fn resolver_with_defs(defs: Value) -> Resolver {
        let mut r = Resolver::new("/nonexistent", "/nonexistent");
        r.acc.defs = defs.as_object().unwrap().clone();
        r
    }

    #[test]
    fn entries_apply_in_array_order() {
        let mut r = resolver_with_defs(json!({"dist": "rhel"}));
        r.apply_layer(
            &Layer::from_value(json!({
                "dist_specific": [
                    {"dist": "rhel", "defs": {"pkg_mgr": "yum"}},
                    {"dist": "r.*", "defs": {"pkg_mgr": "dnf"}}
                ]
            }))
            .unwrap(),
        )
        .unwrap();
        // later-matching entries overlay earlier ones
        assert_eq!(r.acc.defs["pkg_mgr"], json!("dnf"));
    }

    #[test]
    fn match_is_case_insensitive_and_anchored() {
        let mut r = resolver_with_defs(json!({"arch": "X86_64"}));
        r.apply_layer(
            &Layer::from_value(json!({
                "arch_specific": [
                    {"arch": "x86_64", "defs": {"matched": true}},
                    // a partial match must not fire
                    {"arch": "x86", "defs": {"partial": true}}
                ]
            }))
            .unwrap(),
        )
        .unwrap();
        assert_eq!(r.acc.defs["matched"], json!(true));
        assert!(!r.acc.defs.contains_key("partial"));
    }

    #[test]
    fn missing_runtime_value_matches_nothing() {
        let mut r = resolver_with_defs(json!({}));
        r.apply_layer(
            &Layer::from_value(json!({
                "firmware_specific": [{"firmware": ".*", "defs": {"fired": true}}]
            }))
            .unwrap(),
        )
        .unwrap();
        assert!(!r.acc.defs.contains_key("fired"));
    }

    #[test]
    fn nested_overrides_recurse() {
        // The scenario from the resolution pipeline: a version-specific
        // override carrying a platform-specific override inside its body.
        let mut r = resolver_with_defs(json!({
            "platform": "vmware",
            "dist": "rhel",
            "version": "9.5",
            "arch": "x86_64"
        }));
        r.acc.defs.insert("cpu_cores".into(), json!(2));

        r.apply_layer(
            &Layer::from_value(json!({
                "version_specific": [{
                    "version": "9.*",
                    "defs": {"cpu_cores": 4},
                    "platform_specific": [{
                        "platform": "vmware",
                        "defs": {"cpu_sockets": 2}
                    }]
                }]
            }))
            .unwrap(),
        )
        .unwrap();

        assert_eq!(r.acc.defs["cpu_cores"], json!(4));
        assert_eq!(r.acc.defs["cpu_sockets"], json!(2));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let mut r = resolver_with_defs(json!({"version": "9.5"}));
        let err = r
            .apply_layer(
                &Layer::from_value(json!({
                    "version_specific": [{"version": "9.(", "defs": {}}]
                }))
                .unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, super::super::Error::SpecificPattern { .. }));
    }
}
