//! Named key-value store with typed values.
//!
//! Every configuration layer in kiln (global settings, carton-local
//! variables, per-execution context) is a [`Kv`]. Values are tagged
//! rather than dynamically typed; reads that want a string coerce.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A typed variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A string value.
    Str(String),
    /// An integer value.
    Int(i64),
    /// A boolean value.
    Bool(bool),
}

impl Value {
    /// Returns the string payload, or `None` for non-string values.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, or `None` for non-integer values.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the boolean payload, or `None` for non-boolean values.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Renders the value as it is exported to task environments.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// A named map from string keys to [`Value`]s.
///
/// The name only shows up in log events so that overwrite warnings can
/// say which layer they hit.
#[derive(Debug, Default)]
pub struct Kv {
    name: String,
    vars: Mutex<HashMap<String, Value>>,
}

impl Kv {
    /// Create an empty store named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vars: Mutex::new(HashMap::new()),
        }
    }

    /// Create a store pre-populated with `vars`.
    #[must_use]
    pub fn with_vars(name: impl Into<String>, vars: HashMap<String, Value>) -> Self {
        Self {
            name: name.into(),
            vars: Mutex::new(vars),
        }
    }

    /// The store's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set `key` to `value`, logging if an existing entry is overwritten.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let mut vars = self.vars.lock().expect("kv poisoned");
        if vars.contains_key(&key) {
            warn!(kv = %self.name, %key, "overwriting key");
        }
        vars.insert(key, value.into());
    }

    /// Get the raw value of `key`, or `None` if missing.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.vars.lock().expect("kv poisoned").get(key).cloned()
    }

    /// Get `key` coerced to a string. Missing or non-string values
    /// return the empty string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> String {
        match self.get(key) {
            Some(Value::Str(s)) => s,
            _ => String::new(),
        }
    }

    /// Like [`Kv::get`], but distinguishes "absent" from "present".
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Value> {
        self.get(key)
    }

    /// Visit every entry, rendered to a string.
    pub fn range(&self, mut f: impl FnMut(&str, &str)) {
        let vars = self.vars.lock().expect("kv poisoned");
        for (key, value) in vars.iter() {
            f(key, &value.render());
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.lock().expect("kv poisoned").len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_str_coercion() {
        let kv = Kv::new("test");
        kv.set("A", "hello");
        kv.set("N", 42);
        kv.set("B", true);

        assert_eq!(kv.get_str("A"), "hello");
        assert_eq!(kv.get_str("N"), "");
        assert_eq!(kv.get_str("missing"), "");
        assert_eq!(kv.get("N"), Some(Value::Int(42)));
        assert_eq!(kv.get("B"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let kv = Kv::new("test");
        kv.set("A", "one");
        kv.set("A", "two");
        assert_eq!(kv.get_str("A"), "two");
    }

    #[test]
    fn test_range_renders_all_kinds() {
        let kv = Kv::new("test");
        kv.set("S", "str");
        kv.set("I", 7);
        kv.set("F", false);

        let mut seen = std::collections::HashMap::new();
        kv.range(|k, v| {
            seen.insert(k.to_string(), v.to_string());
        });
        assert_eq!(seen["S"], "str");
        assert_eq!(seen["I"], "7");
        assert_eq!(seen["F"], "false");
    }
}
