//! ECDSA P-256 verification of attestations over their canonical message.

use crate::chain::Attestation;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::io;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("public key is not a P-256 point ({0} bytes)")]
    MalformedKey(usize),
    #[error("signature is not a raw r||s pair ({0} bytes)")]
    MalformedSignature(usize),
    #[error("encode canonical message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signature does not match message")]
    Mismatch,
}

/// True iff `att.signature` is a valid signature by `att.signer_identity` over
/// [`canonical_message`]. Never fails; every decoding problem is a `false`.
pub fn verify(att: &Attestation) -> bool {
    match check_signature(att) {
        Ok(()) => true,
        Err(e) => {
            debug!(repo_id = %att.repo_id, ref_name = %att.ref_name, error = %e, "signature rejected");
            false
        }
    }
}

/// Same check as [`verify`], keeping the failure cause.
pub fn check_signature(att: &Attestation) -> Result<(), SignatureError> {
    let message = canonical_message(att)?;
    let key = decode_public_key(&att.signer_identity)?;
    let sig_bytes = hex::decode(&att.signature)?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| SignatureError::MalformedSignature(sig_bytes.len()))?;
    let digest = Sha1::digest(&message);
    key.verify_prehash(&digest, &signature)
        .map_err(|_| SignatureError::Mismatch)
}

/// Signed payload: `repo_id`, `ref`, `old_commit`, `new_commit` as a JSON object
/// with sorted keys, `", "` / `": "` separators and ASCII-only output.
///
/// The byte layout matches what the signing CLI produces, so it must not change.
pub fn canonical_message(att: &Attestation) -> Result<Vec<u8>, serde_json::Error> {
    let fields: BTreeMap<&str, &str> = [
        ("repo_id", att.repo_id.as_str()),
        ("ref", att.ref_name.as_str()),
        ("old_commit", att.old_commit.as_str()),
        ("new_commit", att.new_commit.as_str()),
    ]
    .into_iter()
    .collect();
    let mut out = Vec::with_capacity(192);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, SpacedAsciiFormatter);
    fields.serialize(&mut ser)?;
    Ok(out)
}

/// Accepts raw `x || y` (64 bytes) as well as SEC1 compressed/uncompressed points.
fn decode_public_key(hex_key: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = hex::decode(hex_key)?;
    let sec1 = if bytes.len() == 64 {
        let mut v = Vec::with_capacity(65);
        v.push(0x04);
        v.extend_from_slice(&bytes);
        v
    } else {
        bytes
    };
    VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| SignatureError::MalformedKey(sec1.len()))
}

struct SpacedAsciiFormatter;

impl serde_json::ser::Formatter for SpacedAsciiFormatter {
    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        for ch in fragment.chars() {
            if (ch as u32) < 0x7f {
                writer.write_all(&[ch as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}
