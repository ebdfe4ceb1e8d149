//! Payment events and payment instructions exchanged with the outside world.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::attestation::SourceNetwork;

/// Record a detected payment belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaymentTarget {
    Bridge(String),
    Redemption(String),
}

/// Emitted by the payment detector when a watched address sees a payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub target: PaymentTarget,
    pub tx_hash: String,
    pub amount: Amount,
    pub from_address: String,
    pub to_address: String,
}

/// What the user has to send on the source ledger to complete a reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInstruction {
    pub bridge_id: String,
    pub destination: String,
    pub amount: Amount,
    pub amount_raw: u128,
    /// Payment reference to attach as the memo.
    pub memo: String,
    pub network: SourceNetwork,
}
