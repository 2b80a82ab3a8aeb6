//! Validation state machine
//!
//! Orchestrates one validation attempt: resolve entries, split the
//! combined credential, compute the password and OTP checks, persist the
//! counter/audit state, then walk the policy checks in a fixed order to a
//! single verdict.
//!
//! Two orderings are deliberate and security-relevant:
//!
//! - Password and OTP results are both computed before any check is
//!   allowed to short-circuit, so the counter is advanced (and the
//!   response timing does not vary) no matter which policy check fails.
//! - The counter/audit update is issued *before* the verdict is produced;
//!   a write failure aborts the request rather than risking a success
//!   response without a durably advanced counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::config::{PolicyCacheConfig, SchemaConfig};
use crate::directory::Directory;
use crate::keyring::Decryptor;
use crate::resolver::{ResolvedEntries, Resolver};
use crate::updater::Updater;
use crate::{Error, Result, hotp, password};

/// Why a validation attempt was rejected. The closed vocabulary is the
/// only detail ever attached to a response, and only in verbose mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Principal outside its validity period
    EntryNotValid,
    /// Asserted token identifier does not match the stored one
    WrongTokenIdentifier,
    /// Token counter exceeded the policy usage limit
    CounterExceeded,
    /// Shared secret older than the policy allows
    TokenExpired,
    /// Password or OTP wrong (indistinguishable by design)
    VerificationFailed,
}

impl Reason {
    /// Stable reason code for the diagnostic channel.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::EntryNotValid => "entry-not-valid",
            Self::WrongTokenIdentifier => "wrong-token-identifier",
            Self::CounterExceeded => "counter-exceeded",
            Self::TokenExpired => "token-expired",
            Self::VerificationFailed => "verification-failed",
        }
    }
}

/// Outcome of a validation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Credential accepted; counter durably advanced
    Success,
    /// Credential rejected
    InvalidCredentials(Reason),
}

/// Per-process validation statistics.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StatsSnapshot {
    /// Validation attempts that reached a verdict
    pub attempts: u64,
    /// Accepted attempts
    pub successes: u64,
    /// Rejected attempts
    pub rejections: u64,
    /// HOTP engine invocations
    pub engine_invocations: u64,
    /// Highest counter drift ever observed on a match
    pub drift_high_water: u64,
}

/// The validation state machine.
pub struct Validator {
    resolver: Resolver,
    updater: Updater,
    decryptor: Decryptor,
    attempts: AtomicU64,
    successes: AtomicU64,
    rejections: AtomicU64,
    engine_invocations: AtomicU64,
    drift_high_water: AtomicU64,
}

impl Validator {
    /// Create a validator over the given directory.
    #[must_use]
    pub fn new(
        directory: Arc<dyn Directory>,
        schema: SchemaConfig,
        cache_config: PolicyCacheConfig,
        decryptor: Decryptor,
    ) -> Self {
        Self {
            resolver: Resolver::new(Arc::clone(&directory), schema.clone(), cache_config),
            updater: Updater::new(directory, schema),
            decryptor,
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            engine_invocations: AtomicU64::new(0),
            drift_high_water: AtomicU64::new(0),
        }
    }

    /// Validate a combined password+OTP credential for `principal_dn`.
    ///
    /// Returns `Ok(None)` when the target is not a recognized OTP-capable
    /// principal (caller passes the request through). Directory failures,
    /// malformed stored data, unknown hash schemes, and counter-write
    /// precondition rejections surface as errors; "could not check" is
    /// never conflated with "checked and rejected".
    pub async fn validate(&self, principal_dn: &str, credential: &[u8]) -> Result<Option<Verdict>> {
        let Some(resolved) = self.resolver.resolve(principal_dn).await? else {
            return Ok(None);
        };
        let ResolvedEntries {
            principal,
            token,
            policy,
        } = &resolved;

        let secret = self.decryptor.decrypt(&token.secret)?;

        let (pw, claimed_id, otp) = split_credential(
            credential,
            policy.otp_length as usize,
            token.identifier.len(),
        );

        let stored_hash = principal.password_hash.as_deref().ok_or_else(|| {
            Error::Internal(format!("principal {} has no credential hash", principal.dn))
        })?;
        let password_match = password::verify(stored_hash, pw)?;

        // An empty OTP is always wrong; the engine is not consulted but
        // the attempt still runs its bookkeeping below.
        let next_counter = if otp.is_empty() {
            None
        } else {
            self.engine_invocations.fetch_add(1, Ordering::Relaxed);
            hotp::verify(&secret, otp, token.counter, policy.otp_length, policy.look_ahead)
        };
        let otp_match = next_counter.is_some();

        if let Some(next) = next_counter {
            let drift = next - 1 - token.counter;
            let prev = self.drift_high_water.fetch_max(drift, Ordering::Relaxed);
            if drift > prev {
                info!(drift, token = %token.dn, "New counter drift high-water mark");
            }
        }

        let identifier_match = bool::from(
            claimed_id.ct_eq(token.identifier.as_bytes()),
        );

        // Counter and failure bookkeeping persist before the verdict. The
        // counter advances whenever a code matched: a code the server
        // has observed is consumed even when the attempt fails a later
        // check or asserted the wrong identifier.
        self.updater
            .apply_token(token, otp_match && identifier_match, next_counter)
            .await?;

        let now = Utc::now();
        let verdict = if principal.not_before.is_some_and(|t| now < t)
            || principal.not_after.is_some_and(|t| now > t)
        {
            Verdict::InvalidCredentials(Reason::EntryNotValid)
        } else if !identifier_match {
            Verdict::InvalidCredentials(Reason::WrongTokenIdentifier)
        } else if policy.max_usage >= 0 && (policy.max_usage as u64) < token.counter {
            Verdict::InvalidCredentials(Reason::CounterExceeded)
        } else if policy.secret_max_age > 0
            && token.secret_set_time.is_some_and(|set| {
                (now - set).num_seconds() > i64::try_from(policy.secret_max_age).unwrap_or(i64::MAX)
            })
        {
            Verdict::InvalidCredentials(Reason::TokenExpired)
        } else if password_match && otp_match {
            Verdict::Success
        } else {
            Verdict::InvalidCredentials(Reason::VerificationFailed)
        };

        let success = verdict == Verdict::Success;
        self.updater.apply_principal(principal, success).await;

        self.attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
            debug!(dn = %principal.dn, "Validation succeeded");
        } else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            if let Verdict::InvalidCredentials(reason) = verdict {
                warn!(dn = %principal.dn, reason = reason.code(), "Validation rejected");
            }
        }

        Ok(Some(verdict))
    }

    /// Snapshot of per-process validation statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            engine_invocations: self.engine_invocations.load(Ordering::Relaxed),
            drift_high_water: self.drift_high_water.load(Ordering::Relaxed),
        }
    }
}

/// Split the combined credential into password, token identifier, and OTP
/// using fixed trailing lengths known from server-side state. A credential
/// too short to carry both trailers is all password: the OTP check then
/// fails without revealing which part was malformed.
fn split_credential(credential: &[u8], otp_len: usize, id_len: usize) -> (&[u8], &[u8], &[u8]) {
    if credential.len() < otp_len + id_len {
        return (credential, b"", b"");
    }
    let (rest, otp) = credential.split_at(credential.len() - otp_len);
    let (pw, claimed_id) = rest.split_at(rest.len() - id_len);
    (pw, claimed_id, otp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_credential() {
        let (pw, id, otp) = split_credential(b"hunter2YK123755224", 6, 5);
        assert_eq!(pw, b"hunter2");
        assert_eq!(id, b"YK123");
        assert_eq!(otp, b"755224");
    }

    #[test]
    fn test_split_credential_empty_identifier() {
        let (pw, id, otp) = split_credential(b"hunter2755224", 6, 0);
        assert_eq!(pw, b"hunter2");
        assert_eq!(id, b"");
        assert_eq!(otp, b"755224");
    }

    #[test]
    fn test_split_credential_too_short() {
        let (pw, id, otp) = split_credential(b"abc", 6, 5);
        assert_eq!(pw, b"abc");
        assert_eq!(id, b"");
        assert_eq!(otp, b"");
    }

    #[test]
    fn test_split_credential_exact_length() {
        // Password may legitimately be empty
        let (pw, id, otp) = split_credential(b"YK123755224", 6, 5);
        assert_eq!(pw, b"");
        assert_eq!(id, b"YK123");
        assert_eq!(otp, b"755224");
    }

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(Reason::EntryNotValid.code(), "entry-not-valid");
        assert_eq!(Reason::WrongTokenIdentifier.code(), "wrong-token-identifier");
        assert_eq!(Reason::CounterExceeded.code(), "counter-exceeded");
        assert_eq!(Reason::TokenExpired.code(), "token-expired");
        assert_eq!(Reason::VerificationFailed.code(), "verification-failed");
    }
}
