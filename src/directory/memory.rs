//! In-memory directory implementation
//!
//! Backs the test suite: a process-local entry map with a minimal LDAP
//! filter evaluator (presence, equality, `>=`, and `&` conjunction, the
//! subset the principal/token filters use) and numeric evaluation of
//! assertion preconditions, matching the semantics the LDAP backend gets
//! from the server. Reads of a DN registered as failing return transport
//! errors, for exercising the retry-exhausted paths.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Assertion, Directory, Entry, ModOp};
use crate::{Error, Result};

type AttrMap = HashMap<String, Vec<String>>;

/// Process-local [`Directory`] implementation.
#[derive(Default)]
pub struct MemoryDirectory {
    entries: Mutex<HashMap<String, AttrMap>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    pub fn insert(&self, dn: &str, attrs: &[(&str, &[&str])]) {
        let map: AttrMap = attrs
            .iter()
            .map(|(name, values)| {
                (
                    name.to_ascii_lowercase(),
                    values.iter().map(ToString::to_string).collect(),
                )
            })
            .collect();
        self.entries.lock().insert(dn.to_ascii_lowercase(), map);
    }

    /// Make every operation on `dn` fail with a transport error.
    pub fn set_failing(&self, dn: &str) {
        self.failing.lock().insert(dn.to_ascii_lowercase());
    }

    /// Fetch a raw attribute value for assertions in tests.
    #[must_use]
    pub fn get_attr(&self, dn: &str, attr: &str) -> Option<Vec<String>> {
        self.entries
            .lock()
            .get(&dn.to_ascii_lowercase())
            .and_then(|e| e.get(&attr.to_ascii_lowercase()))
            .cloned()
    }

    fn check_failing(&self, dn: &str) -> Result<()> {
        if self.failing.lock().contains(&dn.to_ascii_lowercase()) {
            return Err(Error::Directory(format!("simulated outage reading {dn}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn read(&self, dn: &str, filter: &str, _attrs: &[&str]) -> Result<Option<Entry>> {
        self.check_failing(dn)?;
        let parsed = Filter::parse(filter)?;
        let entries = self.entries.lock();
        Ok(entries.get(&dn.to_ascii_lowercase()).and_then(|attrs| {
            parsed
                .matches(attrs)
                .then(|| Entry::new(dn.to_string(), attrs.clone()))
        }))
    }

    async fn modify(&self, dn: &str, mods: Vec<ModOp>, assertions: Vec<Assertion>) -> Result<()> {
        self.check_failing(dn)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&dn.to_ascii_lowercase())
            .ok_or_else(|| Error::Directory(format!("no such entry: {dn}")))?;

        // Assertions are evaluated against current state under the same
        // lock that applies the mods, like the server side does.
        for assertion in &assertions {
            let attr = assertion.attr.to_ascii_lowercase();
            let stored: i64 = entry
                .get(&attr)
                .and_then(|v| v.first())
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| {
                    Error::Directory(format!("assertion on non-numeric {}", assertion.attr))
                })?;
            let bound: i64 = assertion
                .value
                .parse()
                .map_err(|_| Error::Directory("non-numeric assertion value".to_string()))?;
            if stored > bound {
                return Err(Error::PreconditionFailed(format!(
                    "{} is {stored}, asserted <= {bound}",
                    assertion.attr
                )));
            }
        }

        for op in mods {
            match op {
                ModOp::Replace(attr, values) => {
                    entry.insert(attr.to_ascii_lowercase(), values);
                }
                ModOp::Add(attr, values) => {
                    entry.entry(attr.to_ascii_lowercase()).or_default().extend(values);
                }
                ModOp::Delete(attr, values) => {
                    let attr = attr.to_ascii_lowercase();
                    if values.is_empty() {
                        entry.remove(&attr);
                    } else if let Some(existing) = entry.get_mut(&attr) {
                        existing.retain(|v| !values.contains(v));
                        if existing.is_empty() {
                            entry.remove(&attr);
                        }
                    }
                }
                ModOp::Increment(attr, by) => {
                    let attr = attr.to_ascii_lowercase();
                    let current: i64 = entry
                        .get(&attr)
                        .and_then(|v| v.first())
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    entry.insert(attr, vec![(current + by).to_string()]);
                }
            }
        }
        Ok(())
    }
}

/// Parsed LDAP filter subset.
enum Filter {
    Present(String),
    Equals(String, String),
    GreaterOrEqual(String, i64),
    And(Vec<Filter>),
}

impl Filter {
    fn parse(s: &str) -> Result<Self> {
        let inner = s
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| Error::Internal(format!("unparenthesized filter: {s}")))?;

        if let Some(rest) = inner.strip_prefix('&') {
            let mut parts = Vec::new();
            let mut depth = 0usize;
            let mut start = 0usize;
            for (i, c) in rest.char_indices() {
                match c {
                    '(' => {
                        if depth == 0 {
                            start = i;
                        }
                        depth += 1;
                    }
                    ')' => {
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            parts.push(Self::parse(&rest[start..=i])?);
                        }
                    }
                    _ => {}
                }
            }
            return Ok(Self::And(parts));
        }

        if let Some((attr, value)) = inner.split_once(">=") {
            let bound = value
                .parse()
                .map_err(|_| Error::Internal(format!("non-numeric >= filter: {inner}")))?;
            return Ok(Self::GreaterOrEqual(attr.to_ascii_lowercase(), bound));
        }
        if let Some((attr, value)) = inner.split_once('=') {
            if value == "*" {
                return Ok(Self::Present(attr.to_ascii_lowercase()));
            }
            return Ok(Self::Equals(
                attr.to_ascii_lowercase(),
                value.to_string(),
            ));
        }
        Err(Error::Internal(format!("unsupported filter: {s}")))
    }

    fn matches(&self, attrs: &AttrMap) -> bool {
        match self {
            Self::Present(attr) => attrs.get(attr).is_some_and(|v| !v.is_empty()),
            Self::Equals(attr, value) => attrs
                .get(attr)
                .is_some_and(|vs| vs.iter().any(|v| v.eq_ignore_ascii_case(value))),
            Self::GreaterOrEqual(attr, bound) => attrs
                .get(attr)
                .and_then(|v| v.first())
                .and_then(|v| v.parse::<i64>().ok())
                .is_some_and(|v| v >= *bound),
            Self::And(parts) => parts.iter().all(|p| p.matches(attrs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_dir() -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.insert(
            "cn=token1,ou=tokens,dc=example",
            &[
                ("objectClass", &["oathHOTPToken"]),
                ("oathHOTPCounter", &["10"]),
                ("oathSecret", &["GEZDGNBVGY3TQOJQ"]),
            ],
        );
        dir
    }

    #[tokio::test]
    async fn test_read_with_matching_filter() {
        let dir = token_dir();
        let entry = dir
            .read(
                "cn=token1,ou=tokens,dc=example",
                "(&(objectClass=oathHOTPToken)(oathHOTPCounter>=0)(oathSecret=*))",
                &[],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.first("oathHOTPCounter"), Some("10"));
    }

    #[tokio::test]
    async fn test_read_filter_mismatch() {
        let dir = token_dir();
        let result = dir
            .read(
                "cn=token1,ou=tokens,dc=example",
                "(objectClass=oathHOTPUser)",
                &[],
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_read_missing_entry() {
        let dir = token_dir();
        let result = dir
            .read("cn=absent,dc=example", "(objectClass=*)", &[])
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_modify_assertion_rejects_stale_write() {
        let dir = token_dir();
        let dn = "cn=token1,ou=tokens,dc=example";
        // Counter is 10; asserting <= 9 must fail
        let err = dir
            .modify(
                dn,
                vec![ModOp::Replace("oathHOTPCounter".into(), vec!["9".into()])],
                vec![Assertion::less_or_equal("oathHOTPCounter", "9")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
        assert_eq!(dir.get_attr(dn, "oathHOTPCounter").unwrap(), vec!["10"]);
    }

    #[tokio::test]
    async fn test_modify_assertion_allows_forward_write() {
        let dir = token_dir();
        let dn = "cn=token1,ou=tokens,dc=example";
        dir.modify(
            dn,
            vec![ModOp::Replace("oathHOTPCounter".into(), vec!["12".into()])],
            vec![Assertion::less_or_equal("oathHOTPCounter", "12")],
        )
        .await
        .unwrap();
        assert_eq!(dir.get_attr(dn, "oathHOTPCounter").unwrap(), vec!["12"]);
    }

    #[tokio::test]
    async fn test_increment_initializes_absent_attr() {
        let dir = token_dir();
        let dn = "cn=token1,ou=tokens,dc=example";
        dir.modify(dn, vec![ModOp::Increment("oathFailureCount".into(), 1)], vec![])
            .await
            .unwrap();
        dir.modify(dn, vec![ModOp::Increment("oathFailureCount".into(), 1)], vec![])
            .await
            .unwrap();
        assert_eq!(dir.get_attr(dn, "oathFailureCount").unwrap(), vec!["2"]);
    }

    #[tokio::test]
    async fn test_delete_whole_attribute() {
        let dir = token_dir();
        let dn = "cn=token1,ou=tokens,dc=example";
        dir.modify(dn, vec![ModOp::Delete("oathSecret".into(), vec![])], vec![])
            .await
            .unwrap();
        assert!(dir.get_attr(dn, "oathSecret").is_none());
    }

    #[tokio::test]
    async fn test_failing_dn() {
        let dir = token_dir();
        let dn = "cn=token1,ou=tokens,dc=example";
        dir.set_failing(dn);
        assert!(matches!(
            dir.read(dn, "(objectClass=*)", &[]).await,
            Err(Error::Directory(_))
        ));
    }
}
