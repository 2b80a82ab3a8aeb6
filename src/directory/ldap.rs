//! LDAP-backed directory client
//!
//! Wraps an `ldap3` connection with lazy (re)connection, per-operation
//! timeouts, and bounded fixed-delay retry on transient transport loss.
//! The optimistic-concurrency precondition is sent as an RFC 4528
//! Assertion control carrying a BER-encoded `lessOrEqual` filter, so the
//! directory server itself rejects a counter write that lost a race.

use std::collections::HashSet;

use backon::{ConstantBuilder, Retryable};
use ldap3::controls::RawControl;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, Scope, SearchEntry};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Assertion, Directory, Entry, ModOp};
use crate::config::DirectoryConfig;
use crate::{Error, Result};

/// RFC 4528 Assertion control OID.
const ASSERTION_CONTROL_OID: &str = "1.3.6.1.1.12";

/// LDAP resultCode assertionFailed (RFC 4511 / RFC 4528).
const RC_ASSERTION_FAILED: u32 = 122;

/// LDAP resultCode noSuchObject.
const RC_NO_SUCH_OBJECT: u32 = 32;

/// Directory client over an LDAP connection.
pub struct LdapDirectory {
    config: DirectoryConfig,
    /// Cached connection handle; dropped on transport failure so the next
    /// attempt reconnects.
    conn: Mutex<Option<Ldap>>,
}

impl LdapDirectory {
    /// Create a client; the connection is established lazily.
    #[must_use]
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    fn retry_policy(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.config.retry_delay)
            .with_max_times(self.config.retry_attempts as usize)
    }

    /// Get a usable connection handle, connecting and binding if needed.
    async fn handle(&self) -> Result<Ldap> {
        let mut slot = self.conn.lock().await;
        if let Some(ldap) = slot.as_ref() {
            return Ok(ldap.clone());
        }

        let settings = LdapConnSettings::new().set_conn_timeout(self.config.connect_timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.config.url)
            .await
            .map_err(ldap_err)?;
        ldap3::drive!(conn);

        if let Some(bind_dn) = &self.config.bind_dn {
            let password = self.config.resolve_bind_password().unwrap_or_default();
            ldap.with_timeout(self.config.op_timeout)
                .simple_bind(bind_dn, &password)
                .await
                .map_err(ldap_err)?
                .success()
                .map_err(ldap_err)?;
            debug!(bind_dn = %bind_dn, "Directory bind established");
        }

        *slot = Some(ldap.clone());
        Ok(ldap)
    }

    /// Drop the cached connection after a transport failure.
    async fn invalidate(&self) {
        *self.conn.lock().await = None;
    }

    async fn read_once(&self, dn: &str, filter: &str, attrs: &[&str]) -> Result<Option<Entry>> {
        let mut ldap = self.handle().await?;
        let result = ldap
            .with_timeout(self.config.op_timeout)
            .search(dn, Scope::Base, filter, attrs.to_vec())
            .await;

        let search = match result {
            Ok(s) => s,
            Err(e) => {
                self.invalidate().await;
                return Err(ldap_err(e));
            }
        };

        match search.success() {
            Ok((entries, _)) => Ok(entries.into_iter().next().map(|re| {
                let se = SearchEntry::construct(re);
                let mut attrs = se.attrs;
                // Values the server marked binary still matter (e.g. a
                // secret blob); fold them in lossily as text.
                for (name, values) in se.bin_attrs {
                    attrs.entry(name).or_default().extend(
                        values
                            .into_iter()
                            .map(|v| String::from_utf8_lossy(&v).into_owned()),
                    );
                }
                Entry::new(se.dn, attrs)
            })),
            Err(LdapError::LdapResult { result }) if result.rc == RC_NO_SUCH_OBJECT => Ok(None),
            Err(e) => Err(ldap_err(e)),
        }
    }

    async fn modify_once(
        &self,
        dn: &str,
        mods: &[ModOp],
        assertions: &[Assertion],
    ) -> Result<()> {
        let mut ldap = self.handle().await?;
        let converted: Vec<Mod<String>> = mods.iter().map(convert_mod).collect();

        let op = ldap.with_timeout(self.config.op_timeout);
        let result = if assertions.is_empty() {
            op.modify(dn, converted).await
        } else {
            let controls: Vec<RawControl> = assertions.iter().map(assertion_control).collect();
            op.with_controls(controls).modify(dn, converted).await
        };

        let res = match result {
            Ok(r) => r,
            Err(e) => {
                self.invalidate().await;
                return Err(ldap_err(e));
            }
        };

        match res.rc {
            0 => Ok(()),
            RC_ASSERTION_FAILED => Err(Error::PreconditionFailed(format!(
                "modify of {dn} rejected by assertion"
            ))),
            rc => Err(Error::Directory(format!(
                "modify of {dn} failed: rc={rc} {}",
                res.text
            ))),
        }
    }
}

#[async_trait::async_trait]
impl Directory for LdapDirectory {
    async fn read(&self, dn: &str, filter: &str, attrs: &[&str]) -> Result<Option<Entry>> {
        (|| async { self.read_once(dn, filter, attrs).await })
            .retry(self.retry_policy())
            .when(|e: &Error| e.is_transient())
            .notify(|err, dur| {
                warn!(error = %err, delay_ms = dur.as_millis(), "Retrying directory read");
            })
            .await
    }

    async fn modify(&self, dn: &str, mods: Vec<ModOp>, assertions: Vec<Assertion>) -> Result<()> {
        // Precondition rejections are terminal by construction: `when`
        // only admits transient transport errors.
        (|| async { self.modify_once(dn, &mods, &assertions).await })
            .retry(self.retry_policy())
            .when(|e: &Error| e.is_transient())
            .notify(|err, dur| {
                warn!(error = %err, delay_ms = dur.as_millis(), "Retrying directory modify");
            })
            .await
    }
}

fn ldap_err(e: LdapError) -> Error {
    Error::Directory(e.to_string())
}

fn convert_mod(op: &ModOp) -> Mod<String> {
    match op {
        ModOp::Replace(attr, values) => {
            Mod::Replace(attr.clone(), values.iter().cloned().collect::<HashSet<_>>())
        }
        ModOp::Add(attr, values) => {
            Mod::Add(attr.clone(), values.iter().cloned().collect::<HashSet<_>>())
        }
        ModOp::Delete(attr, values) => {
            Mod::Delete(attr.clone(), values.iter().cloned().collect::<HashSet<_>>())
        }
        ModOp::Increment(attr, by) => Mod::Increment(attr.clone(), by.to_string()),
    }
}

/// Build the Assertion control for `attr <= value`.
fn assertion_control(assertion: &Assertion) -> RawControl {
    RawControl {
        ctype: ASSERTION_CONTROL_OID.to_string(),
        crit: true,
        val: Some(ber_less_or_equal(
            assertion.attr.as_bytes(),
            assertion.value.as_bytes(),
        )),
    }
}

/// BER-encode the LDAP filter `(attr<=value)`:
/// `lessOrEqual [6] AttributeValueAssertion`: a context-specific
/// constructed tag 6 wrapping two OCTET STRINGs.
fn ber_less_or_equal(attr: &[u8], value: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(attr.len() + value.len() + 8);
    ber_octet_string(&mut inner, attr);
    ber_octet_string(&mut inner, value);

    let mut out = Vec::with_capacity(inner.len() + 4);
    out.push(0xa6);
    ber_length(&mut out, inner.len());
    out.extend_from_slice(&inner);
    out
}

fn ber_octet_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(0x04);
    ber_length(out, bytes.len());
    out.extend_from_slice(bytes);
}

fn ber_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push((len & 0xff) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ber_less_or_equal_encoding() {
        let ber = ber_less_or_equal(b"oathHOTPCounter", b"42");
        // A6 <len> 04 0F "oathHOTPCounter" 04 02 "42"
        assert_eq!(ber[0], 0xa6);
        assert_eq!(ber[1], 21);
        assert_eq!(ber[2], 0x04);
        assert_eq!(ber[3], 15);
        assert_eq!(&ber[4..19], b"oathHOTPCounter");
        assert_eq!(ber[19], 0x04);
        assert_eq!(ber[20], 2);
        assert_eq!(&ber[21..], b"42");
    }

    #[test]
    fn test_ber_long_form_length() {
        let attr = vec![b'a'; 200];
        let ber = ber_less_or_equal(&attr, b"1");
        // inner = 04 81 C8 <200 bytes> 04 01 31 = 206 bytes -> long form
        assert_eq!(ber[0], 0xa6);
        assert_eq!(ber[1], 0x81);
        assert_eq!(ber[2], 206);
        assert_eq!(ber[3], 0x04);
        assert_eq!(ber[4], 0x81);
        assert_eq!(ber[5], 200);
    }

    #[test]
    fn test_assertion_control_shape() {
        let ctrl = assertion_control(&Assertion::less_or_equal("oathHOTPCounter", "7"));
        assert_eq!(ctrl.ctype, ASSERTION_CONTROL_OID);
        assert!(ctrl.crit);
        assert!(ctrl.val.is_some());
    }

    #[test]
    fn test_convert_increment() {
        let m = convert_mod(&ModOp::Increment("oathFailureCount".into(), 1));
        assert!(matches!(m, Mod::Increment(attr, v) if attr == "oathFailureCount" && v == "1"));
    }
}
