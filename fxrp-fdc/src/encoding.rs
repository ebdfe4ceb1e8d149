//! Byte-level helpers for attestation requests.
//!
//! The ABI-encoded request is the idempotency key of the whole protocol: the fee
//! is priced on it, the hub transaction carries it, and the data-availability
//! layer indexes proofs by it. It is kept as normalised `0x` hex end to end.

use fxrp_common::normalize_hex;

use crate::AttestationError;

/// Attestation type used for source-ledger payments.
pub const ATTESTATION_TYPE_PAYMENT: &str = "Payment";

/// Encode a short ASCII name as a right-zero-padded `bytes32`, `0x` hex.
pub fn encode_name32(name: &str) -> Result<String, AttestationError> {
    let bytes = name.as_bytes();
    if bytes.len() > 32 {
        return Err(AttestationError::InvalidResponse(format!(
            "name {} longer than 32 bytes",
            name
        )));
    }
    let mut padded = [0u8; 32];
    padded[..bytes.len()].copy_from_slice(bytes);
    Ok(format!("0x{}", hex::encode(padded)))
}

/// Decode request bytes, accepting either case and an optional `0x` prefix.
pub fn decode_request(request_bytes: &str) -> Result<Vec<u8>, AttestationError> {
    let normalized = normalize_hex(request_bytes);
    hex::decode(&normalized[2..])
        .map_err(|e| AttestationError::InvalidResponse(format!("request bytes: {}", e)))
}

/// Whether `haystack` (transaction input) carries `needle` (request bytes).
pub fn contains_request(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|window| window == needle)
}
