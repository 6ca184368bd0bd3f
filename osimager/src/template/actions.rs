//! The per-string marker actions, applied in a fixed order.  Each action owns
//! a unique delimiter pair and scans for its own markers; that keeps the
//! grammar unambiguous without a tokenizer.

use super::{crypt, error, expr, Engine, Result};
use crate::config::value_to_string;
use serde_json::Value;
use snafu::ResultExt;
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    /// `%>key<%` full-value replacement
    Full,
    /// `>>key<<` inline substitution
    Inline,
    /// `+>key<+` basename of the value
    Basename,
    /// `*>key<*` DNS A-record resolution of the value
    Dns,
    /// `|>path:key<|` credential lookup
    Secret,
    /// `#>expr<#` numeric expression
    Numeric,
    /// `$>NAME<$` environment variable
    Env,
    /// `1>path:key<1` MD5-crypt of the secret
    Md5Crypt,
    /// `5>path:key<5` SHA-256-crypt of the secret
    Sha256Crypt,
    /// `6>path:key<6` SHA-512-crypt of the secret
    Sha512Crypt,
    /// `E>expression<E` expression evaluation
    Eval,
}

struct Action {
    kind: Kind,
    open: &'static str,
    close: &'static str,
}

/// Actions 1 through 11, in processing order.  Splicing (action 12) lives in
/// the sequence walker.
const ACTIONS: [Action; 11] = [
    Action { kind: Kind::Full, open: "%>", close: "<%" },
    Action { kind: Kind::Inline, open: ">>", close: "<<" },
    Action { kind: Kind::Basename, open: "+>", close: "<+" },
    Action { kind: Kind::Dns, open: "*>", close: "<*" },
    Action { kind: Kind::Secret, open: "|>", close: "<|" },
    Action { kind: Kind::Numeric, open: "#>", close: "<#" },
    Action { kind: Kind::Env, open: "$>", close: "<$" },
    Action { kind: Kind::Md5Crypt, open: "1>", close: "<1" },
    Action { kind: Kind::Sha256Crypt, open: "5>", close: "<5" },
    Action { kind: Kind::Sha512Crypt, open: "6>", close: "<6" },
    Action { kind: Kind::Eval, open: "E>", close: "<E" },
];

/// Returns the splice key when the string is exactly one `[>key<]` marker.
pub(super) fn splice_key(s: &str) -> Option<&str> {
    whole_marker(s, "[>", "<]")
}

/// Runs all actions over one string.  Returns early with a typed value when
/// a whole-string marker substitutes a non-string.
pub(super) fn apply(engine: &Engine<'_>, input: &str) -> Result<Value> {
    let mut text = input.to_string();

    for action in &ACTIONS {
        // Whole-string markers preserve the type of the substituted value
        // for the actions whose handlers can produce one.
        if let Some(inner) = whole_marker(&text, action.open, action.close) {
            match action.kind {
                Kind::Full | Kind::Inline => {
                    match lookup_required(engine, inner, &text)? {
                        // Strings keep flowing through the later actions.
                        Value::String(s) => {
                            text = s;
                            continue;
                        }
                        other => return Ok(other),
                    }
                }
                Kind::Numeric => return Ok(numeric(engine, inner)?),
                Kind::Eval => match evaluate(engine, inner)? {
                    Value::String(s) => {
                        text = s;
                        continue;
                    }
                    other => return Ok(other),
                },
                // Whole-value markers referencing an unset key are fatal for
                // these too; resolution failure (not a missing key) stays
                // non-fatal for DNS.
                Kind::Basename => {
                    let value = lookup_required(engine, inner, &text)?;
                    text = basename(&value_to_string(&value));
                    continue;
                }
                Kind::Dns => {
                    let value = lookup_required(engine, inner, &text)?;
                    text = resolve_a_record(&value_to_string(&value), engine.search_domains)
                        .unwrap_or_default();
                    continue;
                }
                _ => {}
            }
        }

        text = substitute_inline(engine, action, &text)?;
    }

    Ok(Value::String(text))
}

/// Scans for `open ... close` pairs and replaces each with the handler's
/// stringified result.  An opener without a closer is a syntax error.
fn substitute_inline(engine: &Engine<'_>, action: &Action, text: &str) -> Result<String> {
    if !text.contains(action.open) {
        return Ok(text.to_string());
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(action.open) {
        let after_open = &rest[start + action.open.len()..];
        let end = after_open
            .find(action.close)
            .ok_or_else(|| {
                error::UnbalancedMarkerSnafu {
                    open: action.open,
                    value: text.to_string(),
                }
                .build()
            })?;
        let inner = &after_open[..end];

        out.push_str(&rest[..start]);
        out.push_str(&resolve_inline(engine, action.kind, inner)?);
        rest = &after_open[end + action.close.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolves one inline marker to its replacement text.
fn resolve_inline(engine: &Engine<'_>, kind: Kind, inner: &str) -> Result<String> {
    match kind {
        // Unset keys substitute the empty string when inline.
        Kind::Full | Kind::Inline => Ok(engine
            .defs
            .get(inner)
            .map(value_to_string)
            .unwrap_or_default()),

        Kind::Basename => Ok(engine
            .defs
            .get(inner)
            .map(|v| basename(&value_to_string(v)))
            .unwrap_or_default()),

        Kind::Dns => Ok(engine
            .defs
            .get(inner)
            .and_then(|v| resolve_a_record(&value_to_string(v), engine.search_domains))
            .unwrap_or_default()),

        Kind::Secret => get_secret(engine, inner),

        Kind::Numeric => Ok(value_to_string(&numeric(engine, inner)?)),

        Kind::Env => Ok(std::env::var(inner).unwrap_or_default()),

        Kind::Md5Crypt => Ok(crypt::md5_crypt(&get_secret(engine, inner)?)),
        Kind::Sha256Crypt => Ok(crypt::sha256_crypt(&get_secret(engine, inner)?)),
        Kind::Sha512Crypt => Ok(crypt::sha512_crypt(&get_secret(engine, inner)?)),

        Kind::Eval => Ok(value_to_string(&evaluate(engine, inner)?)),
    }
}

/// A whole-string marker referencing an unset key is a hard error; the
/// caller asked for the full value and there is nothing sane to substitute.
fn lookup_required(engine: &Engine<'_>, key: &str, whole: &str) -> Result<Value> {
    engine.defs.get(key).cloned().ok_or_else(|| {
        error::UnresolvedVariableSnafu {
            key,
            value: whole.to_string(),
        }
        .build()
    })
}

fn numeric(engine: &Engine<'_>, source: &str) -> Result<Value> {
    let n = expr::evaluate_numeric(source, engine.defs).context(error::ExpressionSnafu {
        expression: source.to_string(),
    })?;
    Ok(Value::from(n))
}

/// Action 11: expand inner action-2 markers as a pure textual pre-pass, then
/// evaluate the result against defs.
fn evaluate(engine: &Engine<'_>, source: &str) -> Result<Value> {
    let mut expanded = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find(">>") {
        if let Some(end) = rest[start + 2..].find("<<") {
            let key = &rest[start + 2..start + 2 + end];
            expanded.push_str(&rest[..start]);
            expanded.push_str(
                &engine
                    .defs
                    .get(key)
                    .map(value_to_string)
                    .unwrap_or_default(),
            );
            rest = &rest[start + 2 + end + 2..];
        } else {
            break;
        }
    }
    expanded.push_str(rest);

    let value = expr::evaluate(&expanded, engine.defs).context(error::ExpressionSnafu {
        expression: expanded.clone(),
    })?;
    Ok(value.into_json())
}

fn get_secret(engine: &Engine<'_>, marker: &str) -> Result<String> {
    let (path, key) = marker
        .split_once(':')
        .ok_or_else(|| error::InvalidSecretRefSnafu { marker }.build())?;

    let provider = engine
        .creds
        .ok_or_else(|| error::NoCredentialSourceSnafu { path, key }.build())?;

    provider
        .get_secret(path, key)
        .context(error::SecretSnafu { path, key })
}

/// Strips directory components from a path-like value.
fn basename(value: &str) -> String {
    value
        .rsplit('/')
        .next()
        .unwrap_or(value)
        .to_string()
}

/// Resolves a host name to its first A record.  Bare names are tried with
/// each search domain appended before falling back to the name itself.
/// Resolution failure is non-fatal and yields no value.
fn resolve_a_record(name: &str, search_domains: &[String]) -> Option<String> {
    let mut candidates = Vec::new();
    if name.contains('.') || search_domains.is_empty() {
        candidates.push(name.to_string());
    } else {
        for domain in search_domains {
            candidates.push(format!("{}.{}", name, domain));
        }
        candidates.push(name.to_string());
    }

    for candidate in candidates {
        if let Ok(addrs) = dns_lookup::lookup_host(&candidate) {
            // Prefer IPv4 since installer answers embed dotted quads.
            if let Some(v4) = addrs.iter().find(|a| matches!(a, IpAddr::V4(_))) {
                return Some(v4.to_string());
            }
            if let Some(any) = addrs.first() {
                return Some(any.to_string());
            }
        }
    }
    log::debug!("DNS resolution found no address for '{}'", name);
    None
}

/// When the trimmed string is exactly `open inner close` with no nested
/// opener, returns the inner text.
fn whole_marker<'a>(s: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix(open)?.strip_suffix(close)?;
    if inner.contains(open) || inner.contains(close) {
        return None;
    }
    Some(inner)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::creds::{CredentialProvider, Result as CredsResult};
    use serde_json::{json, Map};

    struct FakeCreds;

    impl CredentialProvider for FakeCreds {
        fn get_secret(&self, path: &str, key: &str) -> CredsResult<String> {
            if path == "osimager/build" && key == "root_pw" {
                Ok("hunter2".to_string())
            } else {
                crate::creds::error::SecretUnavailableSnafu { path, key }.fail()
            }
        }
    }

    fn defs() -> Map<String, Value> {
        json!({
            "iso_path": "/data/isos/rhel-9.5.iso",
            "major": 9,
            "minor": 5,
            "memory_mb": 2048,
            "name": "node1",
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn basename_action() {
        let defs = defs();
        let engine = Engine::new(&defs);
        assert_eq!(
            engine.render_string("+>iso_path<+").unwrap(),
            json!("rhel-9.5.iso")
        );
    }

    #[test]
    fn numeric_expression() {
        let defs = defs();
        let engine = Engine::new(&defs);
        assert_eq!(
            engine.render_string("#>major * 10 + minor<#").unwrap(),
            json!(95)
        );
        assert_eq!(
            engine.render_string("mem=#>memory_mb / 2<#").unwrap(),
            json!("mem=1024")
        );
    }

    #[test]
    fn numeric_non_numeric_operand_fails() {
        let defs = defs();
        let engine = Engine::new(&defs);
        assert!(matches!(
            engine.render_string("#>name + 1<#").unwrap_err(),
            error::Error::Expression { .. }
        ));
    }

    #[test]
    fn env_action() {
        let defs = defs();
        let engine = Engine::new(&defs);
        std::env::set_var("OSIMAGER_TEST_ENV_ACTION", "from-env");
        assert_eq!(
            engine.render_string("$>OSIMAGER_TEST_ENV_ACTION<$").unwrap(),
            json!("from-env")
        );
        assert_eq!(
            engine.render_string("$>OSIMAGER_TEST_ENV_MISSING<$").unwrap(),
            json!("")
        );
    }

    #[test]
    fn secret_lookup_and_hashing() {
        let defs = defs();
        let mut engine = Engine::new(&defs);
        engine.creds = Some(&FakeCreds);

        assert_eq!(
            engine.render_string("|>osimager/build:root_pw<|").unwrap(),
            json!("hunter2")
        );

        let hashed = engine
            .render_string("6>osimager/build:root_pw<6")
            .unwrap();
        let hashed = hashed.as_str().unwrap();
        assert!(hashed.starts_with("$6$"));
        let hashed5 = engine.render_string("5>osimager/build:root_pw<5").unwrap();
        assert!(hashed5.as_str().unwrap().starts_with("$5$"));
        let hashed1 = engine.render_string("1>osimager/build:root_pw<1").unwrap();
        assert!(hashed1.as_str().unwrap().starts_with("$1$"));
    }

    #[test]
    fn secret_without_provider_fails_only_with_markers() {
        let defs = defs();
        let engine = Engine::new(&defs);
        // no markers: passes silently
        assert_eq!(
            engine.render_string("no secrets here").unwrap(),
            json!("no secrets here")
        );
        // markers with no provider configured: hard failure
        assert!(matches!(
            engine.render_string("|>osimager/build:root_pw<|").unwrap_err(),
            error::Error::NoCredentialSource { .. }
        ));
    }

    #[test]
    fn unknown_secret_fails_build() {
        let defs = defs();
        let mut engine = Engine::new(&defs);
        engine.creds = Some(&FakeCreds);
        assert!(matches!(
            engine.render_string("|>never/declared:pw<|").unwrap_err(),
            error::Error::Secret { .. }
        ));
    }

    #[test]
    fn unbalanced_marker_is_syntax_error() {
        let defs = defs();
        let engine = Engine::new(&defs);
        assert!(matches!(
            engine.render_string("%>major with no close").unwrap_err(),
            error::Error::UnbalancedMarker { .. }
        ));
    }

    #[test]
    fn whole_string_missing_key_is_strict() {
        let defs = defs();
        let engine = Engine::new(&defs);
        assert!(matches!(
            engine.render_string(">>nonesuch<<").unwrap_err(),
            error::Error::UnresolvedVariable { .. }
        ));
        // inline occurrences substitute the empty string
        assert_eq!(
            engine.render_string("x=>>nonesuch<< done").unwrap(),
            json!("x= done")
        );
    }

    #[test]
    fn eval_expands_markers_before_parsing() {
        let defs = defs();
        let engine = Engine::new(&defs);
        assert_eq!(
            engine
                .render_string("E>'efi' if >>major<< >= 7 else 'bios'<E")
                .unwrap(),
            json!("efi")
        );
        // inner expansion is textual even inside quotes
        assert_eq!(
            engine.render_string("E>'>>name<<-vm'<E").unwrap(),
            json!("node1-vm")
        );
    }

    #[test]
    fn eval_error_reports_pre_expanded_source() {
        let defs = defs();
        let engine = Engine::new(&defs);
        let err = engine
            .render_string("E> >>major<< + & 1 <E")
            .unwrap_err();
        match err {
            error::Error::Expression { expression, .. } => {
                // the report shows the source after inner expansion
                assert!(expression.contains("9 + & 1"), "got: {}", expression);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn whole_eval_preserves_type() {
        let defs = defs();
        let engine = Engine::new(&defs);
        assert_eq!(
            engine.render_string("E>major >= 7<E").unwrap(),
            json!(true)
        );
        assert_eq!(
            engine.render_string("#>major - 2<#").unwrap(),
            json!(7)
        );
    }
}
