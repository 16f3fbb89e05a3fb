use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{HeaderMap, Method};
use serde_json::Value;

/// Matcher for HTTP requests
#[derive(Debug, Clone, Default)]
pub struct RequestMatcher {
    pub(crate) method: Option<Method>,
    pub(crate) path: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) basic_auth: Option<(String, String)>,
    pub(crate) body_json: Option<Value>,
}

impl RequestMatcher {
    /// Create a new matcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a specific HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Match a specific path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Match a specific header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Match Basic credentials
    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    /// Match exact JSON body
    pub fn body_json(mut self, body: impl serde::Serialize) -> Self {
        self.body_json =
            Some(serde_json::to_value(body).expect("Failed to serialize body matcher"));
        self
    }

    /// Check if the matcher matches a request
    pub fn matches(&self, method: &Method, path: &str, headers: &HeaderMap, body: &[u8]) -> bool {
        if self.method.as_ref().is_some_and(|m| m != method) {
            return false;
        }

        if self.path.as_deref().is_some_and(|p| p != path) {
            return false;
        }

        let headers_match = self
            .headers
            .iter()
            .all(|(k, v)| headers.get(k).is_some_and(|val| val == v.as_str()));
        if !headers_match {
            return false;
        }

        if let Some((user, password)) = &self.basic_auth {
            let expected = format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)));
            match headers.get(http::header::AUTHORIZATION) {
                Some(val) if val == expected.as_str() => {}
                _ => return false,
            }
        }

        if let Some(expected_json) = &self.body_json {
            match serde_json::from_slice::<Value>(body) {
                Ok(actual) if &actual == expected_json => {}
                _ => return false,
            }
        }

        true
    }
}
