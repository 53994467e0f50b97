//! Recursive redaction of sensitive values in structured payloads.
//!
//! Before a request or response body is attached to a trace span, its decoded
//! JSON form is walked and every string value sitting under a denylisted key
//! is replaced with the literal `"sanitized"`. The denylist is fixed at
//! construction and shared read-only across concurrent calls.

use serde_json::Value;

/// Replacement written over matching string values.
pub const REDACTED: &str = "sanitized";

/// Case-insensitive key denylist applied to decoded payload trees.
///
/// Matching is structural: objects are walked recursively, array elements are
/// walked element-wise, and only *string* values whose containing key matches
/// are replaced. Keys themselves are never altered.
#[derive(Clone, Debug)]
pub struct Redactor {
    keys: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// The default denylist: `password`, `token`, `refreshToken`,
    /// `accessToken`.
    pub fn default_keys() -> Vec<String> {
        ["password", "token", "refreshToken", "accessToken"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn matches(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k.eq_ignore_ascii_case(key))
    }

    /// Redacts matching string values in place, at any depth.
    pub fn sanitize(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    match entry {
                        Value::String(_) if self.matches(key) => {
                            *entry = Value::String(REDACTED.to_owned());
                        }
                        _ => self.sanitize(entry),
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.sanitize(item);
                }
            }
            _ => {}
        }
    }

    /// Sanitizes a textual payload.
    ///
    /// Text that parses as JSON is redacted and re-serialized in compact
    /// form. Anything else is returned unmodified: tracing is best-effort and
    /// must never block the response path on a decode failure.
    pub fn sanitize_text(&self, text: &str) -> String {
        match serde_json::from_str::<Value>(text) {
            Ok(mut value) => {
                self.sanitize(&mut value);
                serde_json::to_string(&value).unwrap_or_else(|_| text.to_owned())
            }
            Err(_) => text.to_owned(),
        }
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(Self::default_keys())
    }
}
