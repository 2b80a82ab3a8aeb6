//! Directory access capability
//!
//! Everything this daemon knows about principals, tokens, and policies
//! lives in an external directory service. The [`Directory`] trait is the
//! seam: a read primitive and a conditional-modify primitive are all the
//! validation core needs. The LDAP implementation lives in [`ldap`]; an
//! in-memory implementation for the test suite lives in [`memory`].

pub mod ldap;
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::Result;

/// A directory entry: a DN plus its attribute values.
///
/// Attribute names are normalized to lowercase at construction so lookups
/// are case-insensitive, as LDAP attribute matching is.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    /// Distinguished name of the entry
    pub dn: String,
    /// Attribute values, keyed by lowercased attribute name
    attrs: HashMap<String, Vec<String>>,
}

impl Entry {
    /// Build an entry from raw attribute pairs.
    #[must_use]
    pub fn new(dn: impl Into<String>, attrs: HashMap<String, Vec<String>>) -> Self {
        let attrs = attrs
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            dn: dn.into(),
            attrs,
        }
    }

    /// First value of an attribute, if present.
    #[must_use]
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.attrs
            .get(&attr.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values of an attribute.
    #[must_use]
    pub fn all(&self, attr: &str) -> &[String] {
        self.attrs
            .get(&attr.to_ascii_lowercase())
            .map_or(&[], Vec::as_slice)
    }

    /// Whether the attribute is present with at least one value.
    #[must_use]
    pub fn has(&self, attr: &str) -> bool {
        !self.all(attr).is_empty()
    }
}

/// One modification within an atomic modify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModOp {
    /// Replace all values of the attribute (creates it when absent)
    Replace(String, Vec<String>),
    /// Add values to the attribute
    Add(String, Vec<String>),
    /// Delete specific values, or the whole attribute when empty
    Delete(String, Vec<String>),
    /// Atomically increment an integer attribute (RFC 4525)
    Increment(String, i64),
}

/// Optimistic-concurrency precondition attached to a modify request:
/// the stored value of `attr` must be less than or equal to `value` at
/// write time, or the whole modify is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    /// Asserted attribute
    pub attr: String,
    /// Upper bound the stored value must satisfy
    pub value: String,
}

impl Assertion {
    /// `attr <= value` precondition.
    #[must_use]
    pub fn less_or_equal(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            value: value.into(),
        }
    }
}

/// Read and conditional-modify operations against the directory service.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Read the entry at `dn` when it matches `filter`, requesting `attrs`.
    ///
    /// Returns `Ok(None)` when the entry does not exist or does not match
    /// the filter. Transport failures are retried internally before they
    /// surface as `Error::Directory`.
    async fn read(&self, dn: &str, filter: &str, attrs: &[&str]) -> Result<Option<Entry>>;

    /// Apply `mods` to `dn` as one atomic operation, rejected as
    /// `Error::PreconditionFailed` when any assertion does not hold at
    /// write time. Precondition rejections are never retried.
    async fn modify(&self, dn: &str, mods: Vec<ModOp>, assertions: Vec<Assertion>) -> Result<()>;
}

/// Parse an LDAP GeneralizedTime value (`YYYYMMDDHHMMSSZ`).
pub fn parse_generalized_time(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%SZ")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Format a timestamp as an LDAP GeneralizedTime value.
#[must_use]
pub fn format_generalized_time(when: chrono::DateTime<chrono::Utc>) -> String {
    when.format("%Y%m%d%H%M%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generalized_time_roundtrip() {
        let parsed = parse_generalized_time("20260807121530Z").unwrap();
        assert_eq!(format_generalized_time(parsed), "20260807121530Z");
        assert!(parse_generalized_time("not-a-time").is_none());
    }

    #[test]
    fn test_entry_lookup_is_case_insensitive() {
        let mut attrs = HashMap::new();
        attrs.insert("oathHOTPCounter".to_string(), vec!["7".to_string()]);
        let entry = Entry::new("cn=token", attrs);
        assert_eq!(entry.first("oathhotpcounter"), Some("7"));
        assert_eq!(entry.first("OATHHOTPCOUNTER"), Some("7"));
        assert!(entry.has("oathHOTPCounter"));
        assert!(!entry.has("missing"));
    }

    #[test]
    fn test_assertion_builder() {
        let a = Assertion::less_or_equal("oathHOTPCounter", "12");
        assert_eq!(a.attr, "oathHOTPCounter");
        assert_eq!(a.value, "12");
    }
}
