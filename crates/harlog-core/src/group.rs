//! Grouping: which end user or account a request belongs to.
//!
//! The host application describes the caller with a [`Group`]. Before it is
//! shipped, the group is collapsed into a [`PayloadGroup`] whose `id` is
//! picked by [`resolve_group_id`]. The raw `apiKey` field is never
//! serialized.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::request::Parts;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller identity as supplied by the grouping callback.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// The API key the caller authenticated with. Preferred as the id.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Legacy identifier.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// The caller's API keys, each an arbitrary object such as
    /// `{"id": "...", "name": "...", "bearerAuth": "..."}`.
    #[serde(default)]
    pub keys: Vec<Map<String, Value>>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn key(mut self, key: Map<String, Value>) -> Self {
        self.keys.push(key);
        self
    }

    /// Collapse into the shipped form using the credentials on `parts`.
    ///
    /// Returns `None` when no identifier can be resolved.
    pub fn resolve(&self, parts: &Parts) -> Option<PayloadGroup> {
        let presented = find_api_key(parts);
        let basic_user = basic_username(parts);

        let id = resolve_group_id(self, presented.as_deref(), basic_user.as_deref())?;
        let key = relevant_key(&self.keys, presented.as_deref());
        let label = self
            .label
            .clone()
            .or_else(|| key.and_then(|k| field(k, "label").or_else(|| field(k, "name"))));

        Some(PayloadGroup {
            id,
            label,
            email: self.email.clone(),
        })
    }
}

/// The identity block attached to every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadGroup {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub email: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// A key field rendered as a string; empty strings and nulls don't count.
fn field(key: &Map<String, Value>, name: &str) -> Option<String> {
    match key.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The key holding the presented credential, else the first key.
fn relevant_key<'a>(
    keys: &'a [Map<String, Value>],
    presented: Option<&str>,
) -> Option<&'a Map<String, Value>> {
    presented
        .and_then(|p| {
            keys.iter()
                .find(|k| k.values().any(|v| v.as_str() == Some(p)))
        })
        .or_else(|| keys.first())
}

/// Pick the group id, first match wins:
///
/// 1. `apiKey`
/// 2. legacy `id`
/// 3. the relevant key's `id`, `apiKey`, or a field holding the presented key
/// 4. the Basic auth username
/// 5. the relevant key's `label` or `name`
/// 6. the group's `email`
pub fn resolve_group_id(
    group: &Group,
    presented: Option<&str>,
    basic_user: Option<&str>,
) -> Option<String> {
    if let Some(id) = non_empty(&group.api_key).or_else(|| non_empty(&group.id)) {
        return Some(id);
    }

    let key = relevant_key(&group.keys, presented);
    let from_key = key.and_then(|k| {
        field(k, "id").or_else(|| field(k, "apiKey")).or_else(|| {
            let presented = presented?;
            k.values()
                .any(|v| v.as_str() == Some(presented))
                .then(|| presented.to_string())
        })
    });

    from_key
        .or_else(|| basic_user.filter(|u| !u.is_empty()).map(str::to_string))
        .or_else(|| key.and_then(|k| field(k, "label").or_else(|| field(k, "name"))))
        .or_else(|| non_empty(&group.email))
}

/// The Basic auth username, if the request carries Basic credentials.
pub fn basic_username(parts: &Parts) -> Option<String> {
    let header = parts.headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let user = decoded.split(':').next()?;
    (!user.is_empty()).then(|| user.to_string())
}

/// Find the API key the request presented.
///
/// Looks at a Bearer token, then the Basic username, then any header whose
/// name contains `api-key`, `api_key` or `apikey`, then the `api_key` and
/// `apiKey` query parameters.
pub fn find_api_key(parts: &Parts) -> Option<String> {
    if let Some(auth) = parts
        .headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some((scheme, token)) = auth.trim().split_once(' ') {
            if scheme.eq_ignore_ascii_case("bearer") {
                return Some(token.trim().to_string());
            }
        }
        if let Some(user) = basic_username(parts) {
            return Some(user);
        }
    }

    let from_header = parts.headers.iter().find_map(|(name, value)| {
        let name = name.as_str();
        if name.contains("api-key") || name.contains("api_key") || name.contains("apikey") {
            value.to_str().ok().map(str::to_string)
        } else {
            None
        }
    });
    if from_header.is_some() {
        return from_header;
    }

    let query = parts.uri.query()?;
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(query).ok()?;
    ["api_key", "apiKey"].iter().find_map(|wanted| {
        pairs
            .iter()
            .find(|(name, _)| name == wanted)
            .map(|(_, value)| value.clone())
    })
}
