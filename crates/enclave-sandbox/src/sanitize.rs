//! Log sanitizer.
//!
//! Every value a plugin logs passes through [`LogSanitizer::sanitize`] inside
//! the worker, before it is placed into a `console` envelope.  Values under a
//! key that contains one of [`SENSITIVE_PATTERNS`] (ASCII case-insensitive
//! substring) are replaced with [`REDACTED`]; composites nested deeper than
//! the configured depth are replaced with a placeholder.

use aho_corasick::AhoCorasick;
use serde_json::{Map, Value};

/// Key fragments whose values never leave the sandbox.
pub const SENSITIVE_PATTERNS: [&str; 6] =
    ["password", "secret", "token", "key", "auth", "credential"];

/// Replacement for redacted values.
pub const REDACTED: &str = "[REDACTED]";

const OBJECT_PLACEHOLDER: &str = "[Object]";
const ARRAY_PLACEHOLDER: &str = "[Array]";

/// Recursive, depth-bounded redaction of logged values.
#[derive(Debug, Clone)]
pub struct LogSanitizer {
    /// `None` only if the automaton could not be built; every key is then
    /// treated as sensitive.
    matcher: Option<AhoCorasick>,
    max_depth: usize,
}

impl LogSanitizer {
    /// Build a sanitizer that descends at most `max_depth` composite levels.
    pub fn new(max_depth: usize) -> Self {
        let matcher = match AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(SENSITIVE_PATTERNS)
        {
            Ok(ac) => Some(ac),
            Err(e) => {
                tracing::error!(error = %e, "failed to build sensitive-key matcher, redacting all keys");
                None
            }
        };
        Self { matcher, max_depth }
    }

    /// Whether a record key names sensitive data.
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        self.matcher.as_ref().is_none_or(|ac| ac.is_match(key))
    }

    /// Return a sanitized copy of `value`.
    pub fn sanitize(&self, value: &Value) -> Value {
        self.sanitize_at(value, 0)
    }

    /// Sanitize every argument of one log call.
    pub fn sanitize_args(&self, args: &[Value]) -> Vec<Value> {
        args.iter().map(|arg| self.sanitize(arg)).collect()
    }

    fn sanitize_at(&self, value: &Value, depth: usize) -> Value {
        match value {
            Value::Object(map) => {
                if depth >= self.max_depth {
                    return Value::String(OBJECT_PLACEHOLDER.to_owned());
                }
                let cleaned: Map<String, Value> = map
                    .iter()
                    .map(|(key, inner)| {
                        let inner = if self.is_sensitive_key(key) {
                            Value::String(REDACTED.to_owned())
                        } else {
                            self.sanitize_at(inner, depth + 1)
                        };
                        (key.clone(), inner)
                    })
                    .collect();
                Value::Object(cleaned)
            }
            Value::Array(items) => {
                if depth >= self.max_depth {
                    return Value::String(ARRAY_PLACEHOLDER.to_owned());
                }
                Value::Array(
                    items
                        .iter()
                        .map(|item| self.sanitize_at(item, depth + 1))
                        .collect(),
                )
            }
            scalar => scalar.clone(),
        }
    }
}

impl Default for LogSanitizer {
    fn default() -> Self {
        Self::new(4)
    }
}
