//! Attestation checks: signature and chain-of-custody.

mod consistency;
mod signature;

pub use consistency::{admit, Admission, Rejection};
pub use signature::{canonical_message, check_signature, verify, SignatureError};
