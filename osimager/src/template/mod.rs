/*!
The template substitution engine.

Twelve marker actions are applied to every string in a value tree, each
owning a unique delimiter pair, in a fixed order; a marker produced by one
action is never re-parsed by an earlier one.  Values that consist solely of
one marker keep the type of the substituted value (a `false` stays a JSON
`false`); markers inline in longer strings are always stringified.

The final action, list splicing, belongs to the sequence walker rather than
the per-string pipeline: an element that *is* a `[>key<]` marker is replaced
by the items of the named defs value, or dropped when the key is missing.
*/

mod actions;
pub mod crypt;
pub mod expr;

use crate::config::value_to_string;
use crate::creds::CredentialProvider;
use serde_json::{Map, Value};

/// Everything the actions need to resolve a marker.
pub struct Engine<'a> {
    pub defs: &'a Map<String, Value>,
    pub creds: Option<&'a dyn CredentialProvider>,
    /// DNS search domains from the location, tried as suffixes when
    /// resolving a bare host name.
    pub search_domains: &'a [String],
}

impl<'a> Engine<'a> {
    pub fn new(defs: &'a Map<String, Value>) -> Self {
        Self {
            defs,
            creds: None,
            search_domains: &[],
        }
    }

    /// Runs the marker pipeline over one string; the result may be any type.
    pub fn render_string(&self, s: &str) -> Result<Value> {
        actions::apply(self, s)
    }

    /// Recursively substitutes throughout a value.  Mappings have both keys
    /// and values processed; sequences handle splicing; primitive non-strings
    /// pass through unchanged.
    pub fn render_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => self.render_string(s),
            Value::Array(items) => self.render_list(items),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    let rendered_key = match self.render_string(key)? {
                        Value::String(s) => s,
                        other => value_to_string(&other),
                    };
                    out.insert(rendered_key, self.render_value(item)?);
                }
                Ok(Value::Object(out))
            }
            primitive => Ok(primitive.clone()),
        }
    }

    /// Substitutes across a whole mapping section in place.
    pub fn render_map(&self, map: &Map<String, Value>) -> Result<Map<String, Value>> {
        match self.render_value(&Value::Object(map.clone()))? {
            Value::Object(rendered) => Ok(rendered),
            _ => unreachable!("rendering an object always yields an object"),
        }
    }

    fn render_list(&self, items: &[Value]) -> Result<Value> {
        let mut out = Vec::new();
        for item in items {
            if let Value::String(s) = item {
                if let Some(key) = actions::splice_key(s) {
                    match self.defs.get(key) {
                        // A missing key drops the element entirely.
                        None => continue,
                        Some(Value::Array(list)) => out.extend(list.iter().cloned()),
                        Some(Value::String(joined)) => out.extend(
                            joined
                                .split(|c: char| c.is_whitespace() || c == ',')
                                .filter(|item| !item.is_empty())
                                .map(|item| Value::String(item.to_string())),
                        ),
                        Some(other) => out.push(other.clone()),
                    }
                    continue;
                }
            }
            out.push(self.render_value(item)?);
        }
        Ok(Value::Array(out))
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unbalanced '{}' marker in \"{}\"", open, value))]
        UnbalancedMarker { open: &'static str, value: String },

        #[snafu(display("'{}' is not defined (required by \"{}\")", key, value))]
        UnresolvedVariable { key: String, value: String },

        #[snafu(display("Malformed secret reference '{}'; expected 'path:key'", marker))]
        InvalidSecretRef { marker: String },

        #[snafu(display(
            "Secret marker references '{}:{}' but no credential source is configured",
            path,
            key
        ))]
        NoCredentialSource { path: String, key: String },

        #[snafu(display("Secret lookup '{}:{}' failed: {}", path, key, source))]
        Secret {
            path: String,
            key: String,
            source: crate::creds::Error,
        },

        #[snafu(display("Failed to evaluate \"{}\": {}", expression, source))]
        Expression {
            expression: String,
            source: super::expr::Error,
        },
    }
}
pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn defs() -> Map<String, Value> {
        json!({
            "thin_disk": false,
            "cpu_cores": 4,
            "dist": "rhel",
            "version": "9.5",
            "iso_path": "/isos/rhel-9.5-x86_64-dvd.iso",
            "boot_options": ["inst.text", "inst.sshd"],
            "packages": "vim, curl wget",
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn whole_string_preserves_bool() {
        let defs = defs();
        let engine = Engine::new(&defs);
        // cd_label-style booleans must come through as JSON false, not "false"
        assert_eq!(engine.render_string("%>thin_disk<%").unwrap(), json!(false));
        assert_eq!(engine.render_string(">>cpu_cores<<").unwrap(), json!(4));
    }

    #[test]
    fn inline_markers_stringify() {
        let defs = defs();
        let engine = Engine::new(&defs);
        assert_eq!(
            engine.render_string("thin=%>thin_disk<% cores=>>cpu_cores<<").unwrap(),
            json!("thin=false cores=4")
        );
    }

    #[test]
    fn config_entry_scenario() {
        let defs = defs();
        let engine = Engine::new(&defs);
        let config = json!({"disk_thin_provisioned": "%>thin_disk<%"});
        let rendered = engine.render_value(&config).unwrap();
        assert_eq!(rendered["disk_thin_provisioned"], json!(false));
    }

    #[test]
    fn splice_list_value() {
        let defs = defs();
        let engine = Engine::new(&defs);
        let rendered = engine
            .render_value(&json!(["first", "[>boot_options<]", "last"]))
            .unwrap();
        assert_eq!(rendered, json!(["first", "inst.text", "inst.sshd", "last"]));
    }

    #[test]
    fn splice_string_splits_on_whitespace_and_commas() {
        let defs = defs();
        let engine = Engine::new(&defs);
        let rendered = engine.render_value(&json!(["[>packages<]"])).unwrap();
        assert_eq!(rendered, json!(["vim", "curl", "wget"]));
    }

    #[test]
    fn splice_missing_key_drops_element() {
        let defs = defs();
        let engine = Engine::new(&defs);
        let rendered = engine.render_value(&json!(["keep", "[>nonesuch<]"])).unwrap();
        assert_eq!(rendered, json!(["keep"]));
    }

    #[test]
    fn map_keys_are_rendered() {
        let defs = defs();
        let engine = Engine::new(&defs);
        let rendered = engine
            .render_value(&json!({">>dist<<-release": ">>version<<"}))
            .unwrap();
        assert_eq!(rendered["rhel-release"], json!("9.5"));
    }

    #[test]
    fn idempotent_without_markers() {
        let defs = defs();
        let engine = Engine::new(&defs);
        let input = json!({"plain": "no markers here", "n": 3, "b": true});
        assert_eq!(engine.render_value(&input).unwrap(), input);
    }

    #[test]
    fn expression_with_inner_expansion() {
        let defs = defs();
        let engine = Engine::new(&defs);
        // the inner >>...<< is expanded textually before evaluation
        let out = engine
            .render_string("E>'efi' if >>cpu_cores<< >= 4 else 'bios'<E")
            .unwrap();
        assert_eq!(out, json!("efi"));
    }
}
