//! Secret values handed to a sandbox.
//!
//! Values are held as `SecretString` so they never show up in `Debug`
//! output or tracing fields. The only way out is serialization onto the
//! sandbox's stdin, or an explicit `expose`.

use std::collections::BTreeMap;
use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Env-var style secret map (`KEY -> value`) injected into one run.
#[derive(Default)]
pub struct SecretMap {
    values: BTreeMap<String, SecretString>,
}

impl SecretMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(key.into(), SecretString::from(value.into()));
    }

    /// Expose a value. Use sparingly and never log the result.
    pub fn expose(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.expose_secret())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<SecretString> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Clone for SecretMap {
    fn clone(&self) -> Self {
        Self {
            values: self
                .values
                .iter()
                .map(|(k, v)| (k.clone(), SecretString::from(v.expose_secret().to_string())))
                .collect(),
        }
    }
}

impl fmt::Debug for SecretMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

impl Serialize for SecretMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (key, value) in &self.values {
            map.serialize_entry(key, value.expose_secret())?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SecretMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}
