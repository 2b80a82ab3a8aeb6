//! slapd-sock protocol front end
//!
//! [`protocol`] defines the wire format; [`listener`] owns the Unix-domain
//! socket and per-connection request loops. Dispatch lives here: one
//! request in, one response out, with the `CONTINUE` sentinel as an
//! explicit value: "not our request" is ordinary data flow, not an error
//! path.

pub mod listener;
pub mod protocol;

pub use self::listener::Listener;
pub use self::protocol::{Request, Response};

use tracing::{debug, error};

use self::protocol::{
    RC_COMPARE_FALSE, RC_COMPARE_TRUE, RC_INVALID_CREDENTIALS, RC_OTHER, RC_SUCCESS,
};
use crate::validate::{Validator, Verdict};

/// Handle one parsed request to completion.
///
/// Only `BIND`, and `COMPARE` on the designated attribute, are
/// intercepted; anything else, including operations on DNs that are not
/// OTP-capable principals, is answered with `CONTINUE`.
pub async fn dispatch(
    validator: &Validator,
    compare_attr: &str,
    verbose: bool,
    request: Request,
) -> Response {
    match request {
        Request::Bind {
            msgid,
            peer,
            dn,
            cred,
        } => {
            debug!(msgid, peer = %peer, dn = %dn, "Dispatching BIND");
            respond(validator.validate(&dn, &cred).await, msgid, false, verbose)
        }
        Request::Compare {
            msgid,
            peer,
            dn,
            attr,
            value,
        } => {
            if !attr.eq_ignore_ascii_case(compare_attr) {
                return Response::Continue { msgid };
            }
            debug!(msgid, peer = %peer, dn = %dn, "Dispatching COMPARE");
            respond(validator.validate(&dn, &value).await, msgid, true, verbose)
        }
        Request::Other { msgid, verb } => {
            debug!(msgid, verb = %verb, "Passing through");
            Response::Continue { msgid }
        }
    }
}

/// Map a validation result onto the wire. Exactly three response shapes
/// per operation: success, invalid credentials, internal error. In
/// non-verbose mode rejections are byte-identical regardless of cause.
fn respond(
    result: crate::Result<Option<Verdict>>,
    msgid: u64,
    is_compare: bool,
    verbose: bool,
) -> Response {
    match result {
        Ok(None) => Response::Continue { msgid },
        Ok(Some(Verdict::Success)) => Response::Result {
            msgid,
            code: if is_compare { RC_COMPARE_TRUE } else { RC_SUCCESS },
            info: None,
        },
        Ok(Some(Verdict::InvalidCredentials(reason))) => Response::Result {
            msgid,
            code: if is_compare {
                RC_COMPARE_FALSE
            } else {
                RC_INVALID_CREDENTIALS
            },
            info: verbose.then(|| reason.code().to_string()),
        },
        Err(e) => {
            error!(msgid, error = %e, "Validation aborted");
            Response::Result {
                msgid,
                code: RC_OTHER,
                info: verbose.then(|| "internal-error".to_string()),
            }
        }
    }
}
