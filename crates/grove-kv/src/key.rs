//! Path-style keys for the ordered keyspace.
//!
//! A [`Key`] is an owned, normalized path string: it always starts with `/`
//! and contains no empty components. Keys order lexicographically, which is
//! what prefix range queries rely on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A normalized path key, e.g. `/my/tag` or `/UAXESIJ.../c`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    /// Create a key from a path string, normalizing it.
    ///
    /// A leading `/` is added if missing, repeated and trailing slashes are
    /// collapsed, and empty components are dropped. The empty input yields
    /// the root key `/`.
    ///
    /// # Examples
    ///
    /// ```
    /// use grove_kv::Key;
    ///
    /// assert_eq!(Key::new("a/b").as_str(), "/a/b");
    /// assert_eq!(Key::new("/a//b/").as_str(), "/a/b");
    /// assert_eq!(Key::new("").as_str(), "/");
    /// ```
    pub fn new(s: &str) -> Self {
        let mut out = String::with_capacity(s.len() + 1);
        for component in s.split('/').filter(|c| !c.is_empty()) {
            out.push('/');
            out.push_str(component);
        }
        if out.is_empty() {
            out.push('/');
        }
        Self(out)
    }

    /// Create a key from a string that is already in canonical form.
    ///
    /// No normalization is performed; the caller guarantees the input is a
    /// well-formed key. Used by key codecs that assemble keys from parts
    /// that are canonical by construction.
    pub fn raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the root key `/`.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Concatenate another key under this one.
    pub fn child(&self, other: &Key) -> Key {
        if self.is_root() {
            return other.clone();
        }
        if other.is_root() {
            return self.clone();
        }
        Key(format!("{}{}", self.0, other.0))
    }

    /// Returns `true` if this key starts with `prefix` on a component
    /// boundary.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new(s)
    }
}
