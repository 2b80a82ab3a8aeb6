//! Counter advancement and audit bookkeeping
//!
//! Persists the outcome of every validation attempt. The token update is
//! one atomic modify; when it carries a counter advancement the write is
//! guarded by an assertion so that concurrent validators racing on the
//! same token have exactly one winner. The principal update is best-effort
//! bookkeeping and never fails the request.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::SchemaConfig;
use crate::directory::{Assertion, Directory, ModOp, format_generalized_time};
use crate::resolver::{Principal, Token};
use crate::Result;

/// Applies per-attempt state changes to token and principal entries.
pub struct Updater {
    directory: Arc<dyn Directory>,
    schema: SchemaConfig,
}

impl Updater {
    /// Create an updater over the given directory.
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>, schema: SchemaConfig) -> Self {
        Self { directory, schema }
    }

    /// Persist the token-side outcome of a validation attempt.
    ///
    /// `success` here means the OTP itself was correct for this token (it
    /// drives the failure-count bookkeeping); `next_counter` is present
    /// whenever a code matched inside the drift window and always advances
    /// the stored counter: a code the server has seen is burned even when
    /// the overall validation fails for another reason.
    ///
    /// # Errors
    ///
    /// Any write failure is fatal to the request: returning success
    /// without a durably advanced counter would permit replay.
    /// `Error::PreconditionFailed` means another validator advanced the
    /// counter first; the caller must not retry.
    pub async fn apply_token(
        &self,
        token: &Token,
        success: bool,
        next_counter: Option<u64>,
    ) -> Result<()> {
        let schema = &self.schema;
        let now = format_generalized_time(Utc::now());
        let mut mods = Vec::with_capacity(3);
        let mut assertions = Vec::new();

        if success {
            mods.push(ModOp::Replace(
                schema.failure_count_attr.clone(),
                vec!["0".to_string()],
            ));
            mods.push(ModOp::Replace(schema.last_login_attr.clone(), vec![now]));
        } else {
            if token.has_failure_count {
                mods.push(ModOp::Increment(schema.failure_count_attr.clone(), 1));
            } else {
                mods.push(ModOp::Replace(
                    schema.failure_count_attr.clone(),
                    vec!["1".to_string()],
                ));
            }
            mods.push(ModOp::Replace(schema.last_failure_attr.clone(), vec![now]));
        }

        if let Some(next) = next_counter {
            mods.push(ModOp::Replace(
                schema.counter_attr.clone(),
                vec![next.to_string()],
            ));
            // The stored counter must not have reached the matched value
            // yet: assert counter <= matched (= next - 1). LDAP has no
            // strict less-than filter, hence the decrement. A competing
            // validator that already consumed this code fails here.
            assertions.push(Assertion::less_or_equal(
                schema.counter_attr.clone(),
                next.saturating_sub(1).to_string(),
            ));
        }

        self.directory.modify(&token.dn, mods, assertions).await?;
        debug!(dn = %token.dn, success, next_counter, "Token state updated");
        Ok(())
    }

    /// Persist the principal-side outcome: append a failure timestamp on
    /// failure, clear the history on success. Best-effort: a write
    /// failure is logged and absorbed, the token-side guarantee already
    /// holds.
    pub async fn apply_principal(&self, principal: &Principal, success: bool) {
        let schema = &self.schema;
        let mods = if success {
            if !principal.has_failure_history {
                return;
            }
            vec![ModOp::Delete(schema.failure_time_attr.clone(), Vec::new())]
        } else {
            vec![ModOp::Add(
                schema.failure_time_attr.clone(),
                vec![format_generalized_time(Utc::now())],
            )]
        };

        if let Err(e) = self
            .directory
            .modify(&principal.dn, mods, Vec::new())
            .await
        {
            warn!(dn = %principal.dn, error = %e, "Principal bookkeeping update failed");
        }
    }
}
