use std::fmt;

/// The static secret shared by controller and worker.
///
/// `Debug` and `Display` never print the value, so the key can travel in
/// state structs that end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct RunnerKey(String);

impl RunnerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Exact match; a missing or empty presented key never matches.
    pub fn matches(&self, presented: Option<&str>) -> bool {
        match presented {
            Some(k) if !k.is_empty() => k == self.0,
            _ => false,
        }
    }
}

impl fmt::Debug for RunnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RunnerKey(***)")
    }
}

impl fmt::Display for RunnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Pull the `key` field out of a parsed callback or enqueue body.
pub fn presented_key(body: &serde_json::Value) -> Option<&str> {
    body.get("key").and_then(serde_json::Value::as_str)
}
