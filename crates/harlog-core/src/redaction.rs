//! Allow/deny-list redaction over headers, form pairs and JSON bodies.
//!
//! A [`RedactionRule`] is built once from the configured field lists and
//! then applied to every captured structure. Redaction never changes the
//! shape of what it touches: keys and array lengths survive, only values
//! at matched positions are replaced.
//!
//! Field paths use dot notation (`user.address.street`), are matched
//! case-insensitively, and descend through arrays element by element, so
//! `items.sku` reaches the `sku` key of every object in `items`. A
//! trailing `[]` on a segment is accepted and ignored (`items[].sku`).

use crate::error::{ConfigError, ConfigResult};
use crate::har::NameValue;
use serde_json::{Map, Value};

/// Placeholder for a redacted value without a length hint.
pub const REDACTED: &str = "[REDACTED]";

/// Replace a value with its redaction marker.
///
/// Strings keep a length hint (`"[REDACTED 6]"`); everything else,
/// including objects, becomes `"[REDACTED]"`.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_str(s)),
        _ => Value::String(REDACTED.to_string()),
    }
}

/// Redaction marker for a string value, with its length in characters.
pub fn redact_str(value: &str) -> String {
    format!("[REDACTED {}]", value.chars().count())
}

/// A parsed, normalized dot-notation field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parse a field path, lowercasing it and stripping `[]` markers.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("empty field path".to_string());
        }

        let normalized = trimmed.replace("[]", "").to_lowercase();
        let segments: Vec<String> = normalized.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(format!("field path `{}` has an empty segment", raw));
        }

        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether this path names exactly `name` (case-insensitive).
    fn is_named(&self, name: &str) -> bool {
        self.0.len() == 1 && self.0[0] == name.to_lowercase()
    }
}

/// The redaction policy applied to captured data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RedactionRule {
    /// Capture everything as-is.
    #[default]
    None,
    /// Redact everything except these paths.
    Allow(Vec<FieldPath>),
    /// Redact only these paths.
    Deny(Vec<FieldPath>),
}

impl RedactionRule {
    /// Build a rule from optional allow and deny lists.
    ///
    /// A non-empty deny list always wins over an allow list; the allow list
    /// is then ignored. Empty lists count as not configured.
    pub fn from_lists<A, D>(allow: Option<A>, deny: Option<D>) -> ConfigResult<Self>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let deny = parse_list("denylist", deny)?;
        let allow = parse_list("allowlist", allow)?;

        if !deny.is_empty() {
            if !allow.is_empty() {
                tracing::debug!("both allowlist and denylist configured, using denylist");
            }
            return Ok(Self::Deny(deny));
        }
        if !allow.is_empty() {
            return Ok(Self::Allow(allow));
        }
        Ok(Self::None)
    }

    /// Convenience constructor for a deny rule.
    pub fn deny<I>(paths: I) -> ConfigResult<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self::from_lists(None::<Vec<String>>, Some(paths))
    }

    /// Convenience constructor for an allow rule.
    pub fn allow<I>(paths: I) -> ConfigResult<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self::from_lists(Some(paths), None::<Vec<String>>)
    }

    /// True when no redaction is configured, so callers may skip parsing.
    pub fn pass_through(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Whether a flat field (header name, form key, multipart part) is hidden.
    pub fn is_redacted(&self, name: &str) -> bool {
        match self {
            Self::None => false,
            Self::Deny(paths) => paths.iter().any(|p| p.is_named(name)),
            Self::Allow(paths) => !paths.iter().any(|p| p.is_named(name)),
        }
    }

    /// Redact a list of name/value pairs, matching names case-insensitively.
    pub fn filter_pairs(&self, pairs: Vec<NameValue>) -> Vec<NameValue> {
        if self.pass_through() {
            return pairs;
        }
        pairs.into_iter().map(|pair| self.filter_pair(pair)).collect()
    }

    /// Redact a single name/value pair.
    pub fn filter_pair(&self, pair: NameValue) -> NameValue {
        if !self.pass_through() && self.is_redacted(&pair.name) {
            NameValue {
                value: redact_str(&pair.value),
                name: pair.name,
            }
        } else {
            pair
        }
    }

    /// Redact a JSON document, returning a same-shape copy.
    pub fn filter_json(&self, value: &Value) -> Value {
        match self {
            Self::None => value.clone(),
            Self::Deny(paths) => {
                let mut out = value.clone();
                for path in paths {
                    deny_path(&mut out, path.segments());
                }
                out
            }
            Self::Allow(paths) => {
                let refs: Vec<&[String]> = paths.iter().map(|p| p.segments()).collect();
                allow_paths(value, &refs)
            }
        }
    }
}

fn parse_list<L>(option: &'static str, list: Option<L>) -> ConfigResult<Vec<FieldPath>>
where
    L: IntoIterator,
    L::Item: AsRef<str>,
{
    let Some(list) = list else {
        return Ok(Vec::new());
    };
    list.into_iter()
        .map(|raw| {
            FieldPath::parse(raw.as_ref())
                .map_err(|reason| ConfigError::InvalidFieldList { option, reason })
        })
        .collect()
}

fn key_matches(key: &str, segment: &str) -> bool {
    key.to_lowercase() == segment
}

fn deny_path(value: &mut Value, path: &[String]) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };

    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if !key_matches(key, head) {
                    continue;
                }
                if rest.is_empty() {
                    *child = redact_value(child);
                } else {
                    deny_path(child, rest);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                deny_path(item, path);
            }
        }
        _ => {}
    }
}

fn allow_paths(value: &Value, paths: &[&[String]]) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let mut keep_whole = false;
                let mut nested: Vec<&[String]> = Vec::new();
                for path in paths {
                    if let Some((head, rest)) = path.split_first() {
                        if key_matches(key, head) {
                            if rest.is_empty() {
                                keep_whole = true;
                            } else {
                                nested.push(rest);
                            }
                        }
                    }
                }

                let filtered = if keep_whole {
                    child.clone()
                } else if nested.is_empty() {
                    redact_leaves(child)
                } else {
                    allow_paths(child, &nested)
                };
                out.insert(key.clone(), filtered);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| allow_paths(v, paths)).collect()),
        scalar => redact_value(scalar),
    }
}

fn redact_leaves(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_leaves(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_leaves).collect()),
        scalar => redact_value(scalar),
    }
}
