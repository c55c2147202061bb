//! Chain-of-custody admission: an attestation may only extend the current head.

use crate::chain::Attestation;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject(Rejection),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// Signature did not verify.
    InvalidSignature,
    /// The move was already applied: `new_commit` is the current head.
    Stale,
    /// `old_commit` names something other than the current head.
    Fork,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rejection::InvalidSignature => "invalid_signature",
            Rejection::Stale => "stale",
            Rejection::Fork => "fork",
        };
        f.write_str(s)
    }
}

/// Accept iff `att.old_commit` equals `current_head` (GENESIS for unseen refs).
pub fn admit(att: &Attestation, current_head: &str) -> Admission {
    if att.old_commit == current_head {
        Admission::Accept
    } else if att.new_commit == current_head {
        Admission::Reject(Rejection::Stale)
    } else {
        Admission::Reject(Rejection::Fork)
    }
}
