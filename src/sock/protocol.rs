//! slapd-sock wire protocol
//!
//! Newline-delimited text framing. A request is one line: a verb, a
//! decimal message ID, then whitespace-delimited fields. Textual fields
//! (peer address, DN, attribute type) are percent-escaped so whitespace
//! never splits them; credential and assertion payloads are base64 of the
//! raw bytes. A response is one line, flushed immediately: `RESULT` with
//! `msgid=`/`code=` key=value pairs (and a quoted `info=` only in verbose
//! mode), or the `CONTINUE` sentinel telling the directory server to
//! apply its own default handling.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

use crate::{Error, Result};

/// LDAP resultCode: success.
pub const RC_SUCCESS: u32 = 0;
/// LDAP resultCode: compareFalse.
pub const RC_COMPARE_FALSE: u32 = 5;
/// LDAP resultCode: compareTrue.
pub const RC_COMPARE_TRUE: u32 = 6;
/// LDAP resultCode: invalidCredentials.
pub const RC_INVALID_CREDENTIALS: u32 = 49;
/// LDAP resultCode: other (internal error).
pub const RC_OTHER: u32 = 80;

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Simple bind with a credential blob
    Bind {
        /// Message ID echoed in the response
        msgid: u64,
        /// Peer address as reported by the directory server
        peer: String,
        /// Target DN
        dn: String,
        /// Raw credential bytes
        cred: Vec<u8>,
    },
    /// Compare of an asserted value against an attribute
    Compare {
        /// Message ID echoed in the response
        msgid: u64,
        /// Peer address as reported by the directory server
        peer: String,
        /// Target DN
        dn: String,
        /// Asserted attribute type
        attr: String,
        /// Raw asserted value bytes
        value: Vec<u8>,
    },
    /// Any other delegated operation; always answered with CONTINUE
    Other {
        /// Message ID echoed in the response
        msgid: u64,
        /// Verb as received
        verb: String,
    },
}

impl Request {
    /// Parse one request line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split_ascii_whitespace();
        let verb = fields
            .next()
            .ok_or_else(|| Error::Protocol("empty request line".to_string()))?;
        let msgid: u64 = fields
            .next()
            .ok_or_else(|| Error::Protocol("missing message ID".to_string()))?
            .parse()
            .map_err(|_| Error::Protocol("malformed message ID".to_string()))?;

        match verb {
            "BIND" => {
                let peer = unescape(next_field(&mut fields, "peer")?)?;
                let dn = unescape(next_field(&mut fields, "dn")?)?;
                let cred = decode_b64(next_field(&mut fields, "cred")?)?;
                Ok(Self::Bind {
                    msgid,
                    peer,
                    dn,
                    cred,
                })
            }
            "COMPARE" => {
                let peer = unescape(next_field(&mut fields, "peer")?)?;
                let dn = unescape(next_field(&mut fields, "dn")?)?;
                let attr = unescape(next_field(&mut fields, "attr")?)?;
                let value = decode_b64(next_field(&mut fields, "value")?)?;
                Ok(Self::Compare {
                    msgid,
                    peer,
                    dn,
                    attr,
                    value,
                })
            }
            _ => Ok(Self::Other {
                msgid,
                verb: verb.to_string(),
            }),
        }
    }

    /// Serialize back to a request line (the client side of the protocol;
    /// used by tooling and the test suite).
    #[must_use]
    pub fn serialize(&self) -> String {
        match self {
            Self::Bind {
                msgid,
                peer,
                dn,
                cred,
            } => format!(
                "BIND {msgid} {} {} {}",
                escape(peer),
                escape(dn),
                B64.encode(cred)
            ),
            Self::Compare {
                msgid,
                peer,
                dn,
                attr,
                value,
            } => format!(
                "COMPARE {msgid} {} {} {} {}",
                escape(peer),
                escape(dn),
                escape(attr),
                B64.encode(value)
            ),
            Self::Other { msgid, verb } => format!("{verb} {msgid}"),
        }
    }
}

/// A response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Terminal result for an intercepted operation
    Result {
        /// Message ID of the request
        msgid: u64,
        /// LDAP result code
        code: u32,
        /// Diagnostic detail; omitted unless verbose mode is enabled
        info: Option<String>,
    },
    /// Pass the operation back to the directory server's own handling
    Continue {
        /// Message ID of the request
        msgid: u64,
    },
}

impl Response {
    /// Serialize to one response line (without trailing newline).
    #[must_use]
    pub fn serialize(&self) -> String {
        match self {
            Self::Result { msgid, code, info } => match info {
                Some(info) => {
                    format!("RESULT msgid={msgid} code={code} info=\"{}\"", quote(info))
                }
                None => format!("RESULT msgid={msgid} code={code}"),
            },
            Self::Continue { msgid } => format!("CONTINUE msgid={msgid}"),
        }
    }
}

fn next_field<'a>(fields: &mut impl Iterator<Item = &'a str>, name: &str) -> Result<&'a str> {
    fields
        .next()
        .ok_or_else(|| Error::Protocol(format!("missing {name} field")))
}

fn decode_b64(field: &str) -> Result<Vec<u8>> {
    B64.decode(field)
        .map_err(|e| Error::Protocol(format!("malformed base64 field: {e}")))
}

/// Percent-escape everything outside the RFC 3986 unreserved set.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Reverse of [`escape`].
pub fn unescape(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::Protocol("truncated percent escape".to_string()))?;
            let hex = std::str::from_utf8(hex)
                .map_err(|_| Error::Protocol("malformed percent escape".to_string()))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::Protocol("malformed percent escape".to_string()))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::Protocol("field is not UTF-8".to_string()))
}

/// Escape a quoted-string info value.
fn quote(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_bind() {
        let cred = B64.encode(b"hunter2755224");
        let line = format!("BIND 7 IP%3D10.0.0.9 uid%3Dalice%2Cdc%3Dexample {cred}");
        let request = Request::parse(&line).unwrap();
        assert_eq!(
            request,
            Request::Bind {
                msgid: 7,
                peer: "IP=10.0.0.9".to_string(),
                dn: "uid=alice,dc=example".to_string(),
                cred: b"hunter2755224".to_vec(),
            }
        );
    }

    #[test]
    fn test_parse_compare() {
        let value = B64.encode(b"755224");
        let line = format!("COMPARE 9 peer uid%3Dalice%2Cdc%3Dexample oathHOTPValue {value}");
        let request = Request::parse(&line).unwrap();
        assert_eq!(
            request,
            Request::Compare {
                msgid: 9,
                peer: "peer".to_string(),
                dn: "uid=alice,dc=example".to_string(),
                attr: "oathHOTPValue".to_string(),
                value: b"755224".to_vec(),
            }
        );
    }

    #[test]
    fn test_parse_other_verb() {
        let request = Request::parse("UNBIND 3").unwrap();
        assert_eq!(
            request,
            Request::Other {
                msgid: 3,
                verb: "UNBIND".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Request::parse("").is_err());
        assert!(Request::parse("BIND").is_err());
        assert!(Request::parse("BIND notanumber peer dn Yg==").is_err());
        assert!(Request::parse("BIND 1 peer dn not!!base64").is_err());
        assert!(Request::parse("BIND 1 peer").is_err());
    }

    #[test]
    fn test_request_roundtrip() {
        let request = Request::Bind {
            msgid: 42,
            peer: "PATH=/run/slapd/ldapi".to_string(),
            dn: "cn=May Spaces,ou=people,dc=example".to_string(),
            cred: vec![0, 1, 2, 255],
        };
        assert_eq!(Request::parse(&request.serialize()).unwrap(), request);
    }

    #[test]
    fn test_escape_roundtrip() {
        let raw = "cn=a b,ou=x%y,dc=Ünïcode";
        assert_eq!(unescape(&escape(raw)).unwrap(), raw);
        // Escaped form never contains whitespace
        assert!(!escape(raw).contains(' '));
    }

    #[test]
    fn test_serialize_result_without_info() {
        let response = Response::Result {
            msgid: 5,
            code: RC_INVALID_CREDENTIALS,
            info: None,
        };
        assert_eq!(response.serialize(), "RESULT msgid=5 code=49");
    }

    #[test]
    fn test_serialize_result_with_info() {
        let response = Response::Result {
            msgid: 5,
            code: RC_INVALID_CREDENTIALS,
            info: Some("token-expired".to_string()),
        };
        assert_eq!(
            response.serialize(),
            "RESULT msgid=5 code=49 info=\"token-expired\""
        );
    }

    #[test]
    fn test_serialize_continue() {
        let response = Response::Continue { msgid: 12 };
        assert_eq!(response.serialize(), "CONTINUE msgid=12");
    }

    #[test]
    fn test_quote_escapes_specials() {
        let response = Response::Result {
            msgid: 1,
            code: RC_OTHER,
            info: Some("a\"b\\c".to_string()),
        };
        assert_eq!(
            response.serialize(),
            "RESULT msgid=1 code=80 info=\"a\\\"b\\\\c\""
        );
    }
}
