//! fxrp-common
//!
//! Shared data model for the FXRP bridge: fixed-point amounts, the bridge and
//! redemption status graphs, persisted records, attestation tickets and the
//! payment events consumed by the state machines.

pub mod amount;
pub mod attestation;
pub mod events;
pub mod records;
pub mod status;

pub use amount::{Amount, AmountError, AMOUNT_DECIMALS};
pub use attestation::{AttestationProof, AttestationTicket, SourceNetwork};
pub use events::{PaymentEvent, PaymentInstruction, PaymentTarget};
pub use records::{
    BridgeRecord, CollateralReservation, Position, RedemptionRecord, RedemptionTicket,
    Withdrawal, CANCELLATION_EXPIRED,
};
pub use status::{BridgeStatus, FailureKind, RedemptionStatus, TransitionError};

/// Normalise a hex string to lowercase with a `0x` prefix.
pub fn normalize_hex(value: &str) -> String {
    let trimmed = value.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_hex_adds_prefix() {
        assert_eq!(normalize_hex("ABcd"), "0xabcd");
        assert_eq!(normalize_hex("0XFF"), "0xff");
        assert_eq!(normalize_hex(" 0x01 "), "0x01");
    }
}
