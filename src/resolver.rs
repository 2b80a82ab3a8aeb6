//! Token and policy resolution
//!
//! Given a principal DN, locates the associated token entry and policy
//! parameters. Principal and token reads always hit the directory,
//! since counter and lockout state must be fresh. Policy entries, which
//! rarely change, are served from a TTL'd read-through cache.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::{PolicyCacheConfig, SchemaConfig};
use crate::directory::{Directory, Entry, parse_generalized_time};
use crate::{Error, Result};

/// Policy parameters with the documented defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyLimits {
    /// OTP length in digits
    pub otp_length: u32,
    /// Counter look-ahead (drift) window
    pub look_ahead: u32,
    /// Maximum usage count; negative means unlimited
    pub max_usage: i64,
    /// Maximum secret age in seconds; 0 means never expires
    pub secret_max_age: u64,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            otp_length: 6,
            look_ahead: 5,
            max_usage: -1,
            secret_max_age: 0,
        }
    }
}

/// Typed view of the principal entry.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Distinguished name
    pub dn: String,
    /// Scheme-tagged credential hash, when present
    pub password_hash: Option<String>,
    /// Validity-period start
    pub not_before: Option<DateTime<Utc>>,
    /// Validity-period end
    pub not_after: Option<DateTime<Utc>>,
    /// Whether a failure-timestamp history exists (clearing it on success
    /// is only worth a write when there is something to clear)
    pub has_failure_history: bool,
}

/// Typed view of the token entry.
#[derive(Debug, Clone)]
pub struct Token {
    /// Distinguished name
    pub dn: String,
    /// Stored HOTP counter
    pub counter: u64,
    /// Stored shared-secret blob (base32 or encrypted envelope)
    pub secret: String,
    /// Token identifier; empty means unset
    pub identifier: String,
    /// Time the secret was provisioned (falls back to entry creation time)
    pub secret_set_time: Option<DateTime<Utc>>,
    /// Whether a failure-count attribute already exists
    pub has_failure_count: bool,
}

/// The three entries a validation needs, resolved and typed.
#[derive(Debug, Clone)]
pub struct ResolvedEntries {
    /// Principal being validated
    pub principal: Principal,
    /// Token holding secret and counter
    pub token: Token,
    /// Effective policy (entry values or defaults)
    pub policy: PolicyLimits,
}

/// Resolves principal, token, and policy entries.
pub struct Resolver {
    directory: Arc<dyn Directory>,
    schema: SchemaConfig,
    cache_config: PolicyCacheConfig,
    policy_cache: DashMap<String, (PolicyLimits, Instant)>,
}

impl Resolver {
    /// Create a resolver over the given directory.
    #[must_use]
    pub fn new(
        directory: Arc<dyn Directory>,
        schema: SchemaConfig,
        cache_config: PolicyCacheConfig,
    ) -> Self {
        Self {
            directory,
            schema,
            cache_config,
            policy_cache: DashMap::new(),
        }
    }

    /// Resolve the entries for `principal_dn`.
    ///
    /// Returns `Ok(None)` when the entry is not a recognized OTP-capable
    /// principal; the caller passes the request through to default
    /// handling. A matched principal with an unreadable or unprovisioned
    /// token is an internal error, not a pass-through.
    pub async fn resolve(&self, principal_dn: &str) -> Result<Option<ResolvedEntries>> {
        let schema = &self.schema;
        let mut principal_attrs = vec![
            schema.password_attr.as_str(),
            schema.token_ref_attr.as_str(),
            schema.failure_time_attr.as_str(),
        ];
        if let Some(attr) = &schema.not_before_attr {
            principal_attrs.push(attr);
        }
        if let Some(attr) = &schema.not_after_attr {
            principal_attrs.push(attr);
        }

        let Some(entry) = self
            .directory
            .read(principal_dn, &schema.principal_filter, &principal_attrs)
            .await?
        else {
            debug!(dn = %principal_dn, "Not an OTP-capable principal");
            return Ok(None);
        };
        let token_ref = entry.first(&schema.token_ref_attr).map(ToString::to_string);
        let principal = self.parse_principal(entry)?;
        let token_dn = token_ref.unwrap_or_else(|| principal_dn.to_string());

        let token_attrs = [
            schema.counter_attr.as_str(),
            schema.secret_attr.as_str(),
            schema.token_id_attr.as_str(),
            schema.policy_ref_attr.as_str(),
            schema.secret_time_attr.as_str(),
            schema.failure_count_attr.as_str(),
            schema.create_timestamp_attr.as_str(),
        ];
        let token_entry = self
            .directory
            .read(&token_dn, &schema.token_filter, &token_attrs)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!("token entry {token_dn} missing or not provisioned"))
            })?;

        let policy_dn = token_entry.first(&schema.policy_ref_attr).map(ToString::to_string);
        let token = self.parse_token(token_entry)?;

        let policy = match policy_dn {
            Some(dn) => self.policy(&dn).await,
            None => PolicyLimits::default(),
        };

        Ok(Some(ResolvedEntries {
            principal,
            token,
            policy,
        }))
    }

    fn parse_principal(&self, entry: Entry) -> Result<Principal> {
        let schema = &self.schema;
        let parse_time = |attr: &Option<String>| -> Result<Option<DateTime<Utc>>> {
            let Some(name) = attr else { return Ok(None) };
            match entry.first(name) {
                None => Ok(None),
                Some(raw) => parse_generalized_time(raw)
                    .map(Some)
                    .ok_or_else(|| {
                        Error::Internal(format!("malformed {name} on {}: {raw}", entry.dn))
                    }),
            }
        };

        Ok(Principal {
            password_hash: entry.first(&schema.password_attr).map(ToString::to_string),
            not_before: parse_time(&schema.not_before_attr)?,
            not_after: parse_time(&schema.not_after_attr)?,
            has_failure_history: entry.has(&schema.failure_time_attr),
            dn: entry.dn,
        })
    }

    fn parse_token(&self, entry: Entry) -> Result<Token> {
        let schema = &self.schema;
        let counter: u64 = entry
            .first(&schema.counter_attr)
            .ok_or_else(|| Error::Internal(format!("token {} has no counter", entry.dn)))?
            .parse()
            .map_err(|_| Error::Internal(format!("malformed counter on {}", entry.dn)))?;
        let secret = entry
            .first(&schema.secret_attr)
            .ok_or_else(|| Error::Internal(format!("token {} has no secret", entry.dn)))?
            .to_string();

        let secret_set_time = entry
            .first(&schema.secret_time_attr)
            .or_else(|| entry.first(&schema.create_timestamp_attr))
            .and_then(parse_generalized_time);

        Ok(Token {
            counter,
            secret,
            identifier: entry
                .first(&schema.token_id_attr)
                .unwrap_or_default()
                .to_string(),
            secret_set_time,
            has_failure_count: entry.has(&schema.failure_count_attr),
            dn: entry.dn,
        })
    }

    /// Read-through policy lookup. A read failure degrades to defaults:
    /// a missing or broken policy entry must not block validation.
    async fn policy(&self, policy_dn: &str) -> PolicyLimits {
        if self.cache_config.enabled {
            if let Some(cached) = self.policy_cache.get(policy_dn) {
                let (limits, cached_at) = *cached;
                if cached_at.elapsed() <= self.cache_config.ttl {
                    return limits;
                }
                drop(cached);
                self.policy_cache.remove(policy_dn);
            }
        }

        let schema = &self.schema;
        let attrs = [
            schema.otp_length_attr.as_str(),
            schema.look_ahead_attr.as_str(),
            schema.max_usage_attr.as_str(),
            schema.secret_max_age_attr.as_str(),
        ];
        let limits = match self.directory.read(policy_dn, "(objectClass=*)", &attrs).await {
            Ok(Some(entry)) => self.parse_policy(&entry),
            Ok(None) => {
                warn!(dn = %policy_dn, "Policy entry missing, applying defaults");
                PolicyLimits::default()
            }
            Err(e) => {
                warn!(dn = %policy_dn, error = %e, "Policy read failed, applying defaults");
                PolicyLimits::default()
            }
        };

        if self.cache_config.enabled {
            self.policy_cache
                .insert(policy_dn.to_string(), (limits, Instant::now()));
        }
        limits
    }

    fn parse_policy(&self, entry: &Entry) -> PolicyLimits {
        let defaults = PolicyLimits::default();
        let schema = &self.schema;
        fn parse<T: std::str::FromStr>(entry: &Entry, attr: &str) -> Option<T> {
            entry.first(attr).and_then(|v| v.parse().ok())
        }
        PolicyLimits {
            otp_length: parse(entry, &schema.otp_length_attr).unwrap_or(defaults.otp_length),
            look_ahead: parse(entry, &schema.look_ahead_attr).unwrap_or(defaults.look_ahead),
            max_usage: parse(entry, &schema.max_usage_attr).unwrap_or(defaults.max_usage),
            secret_max_age: parse(entry, &schema.secret_max_age_attr)
                .unwrap_or(defaults.secret_max_age),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::memory::MemoryDirectory;
    use std::time::Duration;

    /// Resolver with default schema and the given cache TTL.
    fn test_resolver(directory: Arc<dyn Directory>, ttl: Duration) -> Resolver {
        Resolver::new(
            directory,
            SchemaConfig::default(),
            PolicyCacheConfig { enabled: true, ttl },
        )
    }

    const USER_DN: &str = "uid=alice,ou=people,dc=example";
    const TOKEN_DN: &str = "cn=tok1,ou=tokens,dc=example";
    const POLICY_DN: &str = "cn=policy,ou=policies,dc=example";

    fn seed(dir: &MemoryDirectory, with_policy_ref: bool) {
        dir.insert(
            USER_DN,
            &[
                ("objectClass", &["oathHOTPUser"]),
                ("oathHOTPToken", &[TOKEN_DN]),
                ("userPassword", &["{CRYPT}$6$x$y"]),
            ],
        );
        let mut token_attrs: Vec<(&str, &[&str])> = vec![
            ("objectClass", &["oathHOTPToken"]),
            ("oathHOTPCounter", &["17"]),
            ("oathSecret", &["GEZDGNBVGY3TQOJQ"]),
            ("oathTokenIdentifier", &["YK123"]),
        ];
        if with_policy_ref {
            token_attrs.push(("oathHOTPParams", &[POLICY_DN]));
        }
        dir.insert(TOKEN_DN, &token_attrs);
    }

    #[tokio::test]
    async fn test_resolve_full_chain() {
        let dir = Arc::new(MemoryDirectory::new());
        seed(&dir, true);
        dir.insert(
            POLICY_DN,
            &[
                ("objectClass", &["oathHOTPParams"]),
                ("oathOTPLength", &["8"]),
                ("oathHOTPLookAhead", &["3"]),
                ("oathMaxUsageCount", &["1000"]),
                ("oathSecretMaxAge", &["86400"]),
            ],
        );
        let resolver = test_resolver(dir, Duration::from_secs(600));
        let resolved = resolver.resolve(USER_DN).await.unwrap().unwrap();
        assert_eq!(resolved.token.counter, 17);
        assert_eq!(resolved.token.identifier, "YK123");
        assert_eq!(resolved.policy.otp_length, 8);
        assert_eq!(resolved.policy.look_ahead, 3);
        assert_eq!(resolved.policy.max_usage, 1000);
        assert_eq!(resolved.policy.secret_max_age, 86400);
    }

    #[tokio::test]
    async fn test_default_policy_without_reference() {
        // P4: defaults are deterministic and independent of cache state
        let dir = Arc::new(MemoryDirectory::new());
        seed(&dir, false);
        let resolver = test_resolver(dir, Duration::from_secs(600));
        for _ in 0..3 {
            let resolved = resolver.resolve(USER_DN).await.unwrap().unwrap();
            assert_eq!(resolved.policy, PolicyLimits::default());
            assert_eq!(resolved.policy.otp_length, 6);
            assert_eq!(resolved.policy.look_ahead, 5);
            assert_eq!(resolved.policy.max_usage, -1);
            assert_eq!(resolved.policy.secret_max_age, 0);
        }
    }

    #[tokio::test]
    async fn test_unknown_principal_passes_through() {
        let dir = Arc::new(MemoryDirectory::new());
        let resolver = test_resolver(dir, Duration::from_secs(600));
        assert!(resolver.resolve("uid=ghost,dc=example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unprovisioned_token_is_internal_error() {
        let dir = Arc::new(MemoryDirectory::new());
        seed(&dir, false);
        // Token loses its secret: filter no longer matches
        dir.insert(
            TOKEN_DN,
            &[
                ("objectClass", &["oathHOTPToken"]),
                ("oathHOTPCounter", &["17"]),
            ],
        );
        let resolver = test_resolver(dir, Duration::from_secs(600));
        assert!(matches!(
            resolver.resolve(USER_DN).await,
            Err(Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_policy_read_failure_degrades_to_defaults() {
        let dir = Arc::new(MemoryDirectory::new());
        seed(&dir, true);
        dir.set_failing(POLICY_DN);
        let resolver = test_resolver(dir, Duration::from_secs(600));
        let resolved = resolver.resolve(USER_DN).await.unwrap().unwrap();
        assert_eq!(resolved.policy, PolicyLimits::default());
    }

    #[tokio::test]
    async fn test_policy_cache_serves_stale_within_ttl() {
        let dir = Arc::new(MemoryDirectory::new());
        seed(&dir, true);
        dir.insert(POLICY_DN, &[("objectClass", &["oathHOTPParams"]), ("oathOTPLength", &["8"])]);
        let resolver = test_resolver(Arc::clone(&dir) as Arc<dyn Directory>, Duration::from_secs(600));

        assert_eq!(resolver.resolve(USER_DN).await.unwrap().unwrap().policy.otp_length, 8);
        // Policy changes in the directory, but the cache is still fresh
        dir.insert(POLICY_DN, &[("objectClass", &["oathHOTPParams"]), ("oathOTPLength", &["6"])]);
        assert_eq!(resolver.resolve(USER_DN).await.unwrap().unwrap().policy.otp_length, 8);
    }

    #[tokio::test]
    async fn test_policy_cache_expires() {
        let dir = Arc::new(MemoryDirectory::new());
        seed(&dir, true);
        dir.insert(POLICY_DN, &[("objectClass", &["oathHOTPParams"]), ("oathOTPLength", &["8"])]);
        let resolver =
            test_resolver(Arc::clone(&dir) as Arc<dyn Directory>, Duration::from_millis(1));

        assert_eq!(resolver.resolve(USER_DN).await.unwrap().unwrap().policy.otp_length, 8);
        dir.insert(POLICY_DN, &[("objectClass", &["oathHOTPParams"]), ("oathOTPLength", &["6"])]);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(resolver.resolve(USER_DN).await.unwrap().unwrap().policy.otp_length, 6);
    }

    #[tokio::test]
    async fn test_token_ref_defaults_to_principal_dn() {
        let dir = Arc::new(MemoryDirectory::new());
        // Principal carries its own token attributes; filter overridden so
        // the token-reference predicate is not required
        dir.insert(
            USER_DN,
            &[
                ("objectClass", &["oathHOTPUser", "oathHOTPToken"]),
                ("oathHOTPCounter", &["3"]),
                ("oathSecret", &["GEZDGNBVGY3TQOJQ"]),
            ],
        );
        let schema = SchemaConfig {
            principal_filter: "(objectClass=oathHOTPUser)".to_string(),
            ..Default::default()
        };
        let resolver = Resolver::new(
            dir,
            schema,
            PolicyCacheConfig::default(),
        );
        let resolved = resolver.resolve(USER_DN).await.unwrap().unwrap();
        assert_eq!(resolved.token.dn, USER_DN);
        assert_eq!(resolved.token.counter, 3);
        assert_eq!(resolved.token.identifier, "");
    }
}
