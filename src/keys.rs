// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key naming for entries, tag sets and the two global sets.
//!
//! ```text
//! zc:k:<id>     entry hash (d, m, t, i)
//! zc:ti:<tag>   ids carrying <tag>
//! zc:ids        every live id (only with not-matching-tags mode)
//! zc:tags       every tag with a non-empty id set
//! ```

use crate::config::KeyspaceConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    entry_prefix: String,
    tag_prefix: String,
    ids_key: String,
    tags_key: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::from_config(&KeyspaceConfig::default())
    }
}

impl Keyspace {
    pub fn from_config(config: &KeyspaceConfig) -> Self {
        Self {
            entry_prefix: config.entry_prefix.clone(),
            tag_prefix: config.tag_prefix.clone(),
            ids_key: config.ids_key.clone(),
            tags_key: config.tags_key.clone(),
        }
    }

    #[inline]
    pub fn entry(&self, id: &str) -> String {
        format!("{}{}", self.entry_prefix, id)
    }

    #[inline]
    pub fn tag(&self, tag: &str) -> String {
        format!("{}{}", self.tag_prefix, tag)
    }

    pub fn tags_of<S: AsRef<str>>(&self, tags: &[S]) -> Vec<String> {
        tags.iter().map(|t| self.tag(t.as_ref())).collect()
    }

    pub fn entries_of<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        ids.iter().map(|id| self.entry(id.as_ref())).collect()
    }

    pub fn entry_prefix(&self) -> &str {
        &self.entry_prefix
    }

    pub fn tag_prefix(&self) -> &str {
        &self.tag_prefix
    }

    pub fn ids_key(&self) -> &str {
        &self.ids_key
    }

    pub fn tags_key(&self) -> &str {
        &self.tags_key
    }

    /// Glob matching every entry key, for `SCAN MATCH`.
    /// Glob metacharacters in the prefix are escaped.
    pub fn entry_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.entry_prefix.len() + 1);
        for c in self.entry_prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }

    /// Strip the entry prefix from a scanned key.
    pub fn id_from_entry<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.entry_prefix.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_key_names() {
        let ks = Keyspace::default();
        assert_eq!(ks.entry("foo"), "zc:k:foo");
        assert_eq!(ks.tag("bar"), "zc:ti:bar");
        assert_eq!(ks.ids_key(), "zc:ids");
        assert_eq!(ks.tags_key(), "zc:tags");
    }

    #[test]
    fn test_bulk_key_helpers() {
        let ks = Keyspace::default();
        assert_eq!(ks.tags_of(&["a", "b"]), vec!["zc:ti:a", "zc:ti:b"]);
        assert_eq!(ks.entries_of(&vec!["x".to_string()]), vec!["zc:k:x"]);
    }

    #[test]
    fn test_entry_pattern_escapes_glob_chars() {
        assert_eq!(Keyspace::default().entry_pattern(), "zc:k:*");

        let ks = Keyspace::from_config(&KeyspaceConfig {
            entry_prefix: "app[1]*:".into(),
            ..Default::default()
        });
        assert_eq!(ks.entry_pattern(), "app\\[1\\]\\*:*");
    }

    #[test]
    fn test_id_from_entry() {
        let ks = Keyspace::default();
        assert_eq!(ks.id_from_entry("zc:k:abc"), Some("abc"));
        assert_eq!(ks.id_from_entry("zc:ti:abc"), None);
    }
}
