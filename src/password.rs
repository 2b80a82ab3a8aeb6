//! Credential-hash scheme dispatch
//!
//! Directory credential hashes are scheme-tagged (`{CRYPT}`, `{ARGON2}`).
//! The tag set is a closed enum: an unknown scheme is a hard error, never a
//! silent mismatch, so a misconfigured deployment surfaces operationally
//! instead of locking every user out as "wrong password".

use argon2::{Argon2, PasswordHash, PasswordVerifier};

use crate::{Error, Result};

/// A parsed, scheme-tagged credential hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashScheme<'a> {
    /// crypt(3) hash (DES, MD5 `$1$`, SHA-256 `$5$`, SHA-512 `$6$`, bcrypt)
    Crypt(&'a str),
    /// Argon2 PHC-format hash
    Argon2(&'a str),
}

impl<'a> HashScheme<'a> {
    /// Parse a stored credential value into its scheme and payload.
    ///
    /// Tags are matched case-insensitively. An untagged value is treated as
    /// `{CRYPT}`, matching common directory deployments.
    pub fn parse(stored: &'a str) -> Result<Self> {
        let Some(rest) = stored.strip_prefix('{') else {
            return Ok(Self::Crypt(stored));
        };
        let Some(end) = rest.find('}') else {
            return Err(Error::UnknownHashScheme(stored.to_string()));
        };
        let (scheme, payload) = (&rest[..end], &rest[end + 1..]);
        if scheme.eq_ignore_ascii_case("crypt") {
            Ok(Self::Crypt(payload))
        } else if scheme.eq_ignore_ascii_case("argon2") {
            Ok(Self::Argon2(payload))
        } else {
            Err(Error::UnknownHashScheme(scheme.to_string()))
        }
    }
}

/// Verify `candidate` against a stored scheme-tagged hash.
///
/// Returns `Ok(false)` on a clean mismatch. Malformed hash payloads and
/// unknown schemes are errors ("could not check" is kept distinct from
/// "checked and rejected").
pub fn verify(stored: &str, candidate: &[u8]) -> Result<bool> {
    match HashScheme::parse(stored)? {
        HashScheme::Crypt(hash) => Ok(pwhash::unix::verify(candidate, hash)),
        HashScheme::Argon2(hash) => {
            let parsed = PasswordHash::new(hash)
                .map_err(|e| Error::Decode(format!("malformed Argon2 hash: {e}")))?;
            Ok(Argon2::default().verify_password(candidate, &parsed).is_ok())
        }
    }
}
