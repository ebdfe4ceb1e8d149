//! Persisted records for both directions of the bridge.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::Amount;
use crate::attestation::{AttestationProof, AttestationTicket};
use crate::status::{BridgeStatus, FailureKind, RedemptionStatus, TransitionError};

/// Reason written when the sweep cancels a lapsed reservation.
pub const CANCELLATION_EXPIRED: &str = "expired";

fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERAL & REDEMPTION TICKETS
// ═══════════════════════════════════════════════════════════════════════════════

/// Collateral reserved by an agent for a pending mint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralReservation {
    pub reservation_id: String,
    pub agent_vault_address: String,
    /// Agent's address on the source ledger; the user pays here.
    pub agent_source_address: String,
    /// 32-byte payment reference, `0x`-prefixed hex, sent as the payment memo.
    pub payment_reference: String,
    pub value_raw: u128,
    pub fee_raw: u128,
    /// Deadline for the user's payment.
    pub expires_at: DateTime<Utc>,
}

impl CollateralReservation {
    /// Value plus fee, saturating so a malformed reservation fails the totals check.
    pub fn total_raw(&self) -> u128 {
        self.value_raw.saturating_add(self.fee_raw)
    }
}

/// Redemption assigned to an agent after the wrapped asset was burned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionTicket {
    pub request_id: String,
    pub redemption_tx_hash: String,
    pub agent_vault_address: String,
    pub agent_source_address: String,
    pub payment_reference: String,
    /// Amount the agent must pay out, in source-ledger base units.
    pub expected_payout_raw: u128,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BRIDGE RECORD
// ═══════════════════════════════════════════════════════════════════════════════

/// One forward conversion attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub id: String,
    pub wallet_address: String,
    pub vault_id: String,
    pub position_id: Option<String>,
    pub source_amount: Amount,
    pub destination_amount_expected: Amount,
    pub status: BridgeStatus,

    // Reservation
    pub source_payment_reference: Option<String>,
    pub agent_vault_address: Option<String>,
    pub agent_source_address: Option<String>,
    pub collateral_reservation_id: Option<String>,
    pub reserved_value_raw: Option<u128>,
    pub reserved_fee_raw: Option<u128>,
    pub total_amount_raw: Option<u128>,
    pub reservation_expiry: Option<DateTime<Utc>>,

    // Source payment
    pub source_tx_hash: Option<String>,
    pub source_confirmed_at: Option<DateTime<Utc>>,

    // Attestation
    pub attestation_tx_hash: Option<String>,
    pub voting_round_id: Option<u64>,
    pub attestation_request_bytes: Option<String>,
    pub proof: Option<AttestationProof>,

    // Destination
    pub destination_tx_hash: Option<String>,
    pub destination_amount_received: Option<Amount>,
    pub vault_mint_tx_hash: Option<String>,

    // Failure bookkeeping
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub retry_count: u32,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub attested_at: Option<DateTime<Utc>>,
    pub minted_at: Option<DateTime<Utc>>,
    pub vault_minted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl BridgeRecord {
    pub fn new(
        wallet_address: impl Into<String>,
        vault_id: impl Into<String>,
        source_amount: Amount,
        now: DateTime<Utc>,
        payment_window: Duration,
    ) -> Self {
        Self {
            id: new_id("brg"),
            wallet_address: wallet_address.into(),
            vault_id: vault_id.into(),
            position_id: None,
            source_amount,
            destination_amount_expected: source_amount,
            status: BridgeStatus::Pending,
            source_payment_reference: None,
            agent_vault_address: None,
            agent_source_address: None,
            collateral_reservation_id: None,
            reserved_value_raw: None,
            reserved_fee_raw: None,
            total_amount_raw: None,
            reservation_expiry: None,
            source_tx_hash: None,
            source_confirmed_at: None,
            attestation_tx_hash: None,
            voting_round_id: None,
            attestation_request_bytes: None,
            proof: None,
            destination_tx_hash: None,
            destination_amount_received: None,
            vault_mint_tx_hash: None,
            error_message: None,
            failure_kind: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            reserved_at: None,
            attested_at: None,
            minted_at: None,
            vault_minted_at: None,
            expires_at: Some(now + payment_window),
            cancelled_at: None,
            cancellation_reason: None,
        }
    }

    /// Move to `next` if the status graph allows it.
    pub fn transition(&mut self, next: BridgeStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to `failed` and record why.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(BridgeStatus::Failed)?;
        self.record_failure(kind, message);
        Ok(())
    }

    /// Record a failure without changing status.
    pub fn record_failure(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.failure_kind = Some(kind);
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub fn clear_failure(&mut self) {
        self.failure_kind = None;
        self.error_message = None;
    }

    /// Copy a fresh reservation onto the record.
    pub fn apply_reservation(&mut self, reservation: &CollateralReservation, now: DateTime<Utc>) {
        self.collateral_reservation_id = Some(reservation.reservation_id.clone());
        self.agent_vault_address = Some(reservation.agent_vault_address.clone());
        self.agent_source_address = Some(reservation.agent_source_address.clone());
        self.source_payment_reference = Some(reservation.payment_reference.clone());
        self.reserved_value_raw = Some(reservation.value_raw);
        self.reserved_fee_raw = Some(reservation.fee_raw);
        self.total_amount_raw = Some(reservation.total_raw());
        self.reservation_expiry = Some(reservation.expires_at);
        self.expires_at = Some(reservation.expires_at);
        self.destination_amount_expected = Amount::from_raw(reservation.value_raw);
        self.reserved_at = Some(now);
    }

    /// Copy a submitted attestation onto the record.
    pub fn apply_ticket(&mut self, ticket: &AttestationTicket) {
        self.attestation_tx_hash = Some(ticket.attestation_tx_hash.clone());
        self.voting_round_id = Some(ticket.voting_round_id);
        self.attestation_request_bytes = Some(ticket.request_bytes.clone());
    }

    /// The stored attestation, if every piece needed to resume it is present.
    pub fn stored_ticket(&self) -> Option<AttestationTicket> {
        Some(AttestationTicket {
            request_bytes: self.attestation_request_bytes.clone()?,
            attestation_tx_hash: self.attestation_tx_hash.clone().unwrap_or_default(),
            block_timestamp: 0,
            voting_round_id: self.voting_round_id?,
        })
    }

    /// Lapsed payment window on a record that has not reached a terminal state.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at.map_or(false, |at| at <= now)
    }

    /// Cancel a lapsed record. Expiry applies from any non-terminal status,
    /// outside the status graph. Returns `false` when nothing changed.
    pub fn cancel_expired(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_expired(now) {
            return false;
        }
        self.status = BridgeStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.cancellation_reason = Some(CANCELLATION_EXPIRED.to_string());
        self.record_failure(FailureKind::ReservationExpired, "payment window expired");
        self.updated_at = now;
        true
    }

    /// Shares are minted once the mint hash exists, whatever the status says.
    pub fn shares_minted(&self) -> bool {
        self.vault_mint_tx_hash.is_some()
    }

    /// `total == value + fee` whenever a reservation is present.
    pub fn reservation_totals_consistent(&self) -> bool {
        match (self.reserved_value_raw, self.reserved_fee_raw, self.total_amount_raw) {
            (Some(value), Some(fee), Some(total)) => value.checked_add(fee) == Some(total),
            (None, None, None) => true,
            _ => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REDEMPTION RECORD
// ═══════════════════════════════════════════════════════════════════════════════

/// One reverse conversion attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub id: String,
    pub wallet_address: String,
    /// Source-ledger address that receives the agent payout.
    pub user_source_address: String,
    pub vault_id: String,
    pub position_id: String,
    pub share_amount: Amount,
    pub status: RedemptionStatus,

    // Share redemption
    pub vault_redeem_tx_hash: Option<String>,
    pub fxrp_redeemed: Option<Amount>,

    // Burn / agent assignment
    pub destination_request_id: Option<String>,
    pub redemption_tx_hash: Option<String>,
    pub agent_vault_address: Option<String>,
    pub agent_source_address: Option<String>,
    pub payment_reference: Option<String>,
    pub expected_payout_raw: Option<u128>,

    // Payout & proof
    pub source_payout_tx_hash: Option<String>,
    pub xrp_sent: Option<Amount>,
    pub attestation_tx_hash: Option<String>,
    pub voting_round_id: Option<u64>,
    pub attestation_request_bytes: Option<String>,
    pub proof: Option<AttestationProof>,
    pub confirmation_tx_hash: Option<String>,

    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payout_received_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RedemptionRecord {
    pub fn new(
        wallet_address: impl Into<String>,
        user_source_address: impl Into<String>,
        vault_id: impl Into<String>,
        position_id: impl Into<String>,
        share_amount: Amount,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id("rdm"),
            wallet_address: wallet_address.into(),
            user_source_address: user_source_address.into(),
            vault_id: vault_id.into(),
            position_id: position_id.into(),
            share_amount,
            status: RedemptionStatus::Pending,
            vault_redeem_tx_hash: None,
            fxrp_redeemed: None,
            destination_request_id: None,
            redemption_tx_hash: None,
            agent_vault_address: None,
            agent_source_address: None,
            payment_reference: None,
            expected_payout_raw: None,
            source_payout_tx_hash: None,
            xrp_sent: None,
            attestation_tx_hash: None,
            voting_round_id: None,
            attestation_request_bytes: None,
            proof: None,
            confirmation_tx_hash: None,
            error_message: None,
            failure_kind: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            payout_received_at: None,
            completed_at: None,
        }
    }

    pub fn transition(&mut self, next: RedemptionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(RedemptionStatus::Failed)?;
        self.record_failure(kind, message);
        Ok(())
    }

    pub fn record_failure(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.failure_kind = Some(kind);
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub fn clear_failure(&mut self) {
        self.failure_kind = None;
        self.error_message = None;
    }

    pub fn apply_ticket(&mut self, ticket: &AttestationTicket) {
        self.attestation_tx_hash = Some(ticket.attestation_tx_hash.clone());
        self.voting_round_id = Some(ticket.voting_round_id);
        self.attestation_request_bytes = Some(ticket.request_bytes.clone());
    }

    pub fn stored_ticket(&self) -> Option<AttestationTicket> {
        Some(AttestationTicket {
            request_bytes: self.attestation_request_bytes.clone()?,
            attestation_tx_hash: self.attestation_tx_hash.clone().unwrap_or_default(),
            block_timestamp: 0,
            voting_round_id: self.voting_round_id?,
        })
    }

    /// Settled exactly once, keyed on the confirmation hash.
    pub fn is_confirmed(&self) -> bool {
        self.confirmation_tx_hash.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POSITIONS & WITHDRAWALS
// ═══════════════════════════════════════════════════════════════════════════════

/// Vault shares held by a wallet, as reported by share accounting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub wallet_address: String,
    pub vault_id: String,
    pub shares: Amount,
    /// Bridges credited into this position; guards against double credit.
    pub bridge_ids: Vec<String>,
    /// Shares held back for in-flight redemptions, keyed by redemption id.
    #[serde(default)]
    pub reserved: BTreeMap<String, Amount>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn reserved_shares(&self) -> Amount {
        self.reserved
            .values()
            .fold(Amount::ZERO, |sum, amount| Amount::from_raw(sum.raw().saturating_add(amount.raw())))
    }

    /// Shares not yet promised to a redemption.
    pub fn available_shares(&self) -> Amount {
        self.shares
            .checked_sub(self.reserved_shares())
            .unwrap_or(Amount::ZERO)
    }
}

/// Completed redemption out of a position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: String,
    pub redemption_id: String,
    pub position_id: String,
    pub wallet_address: String,
    pub shares: Amount,
    pub fxrp_amount: Amount,
    pub xrp_sent: Amount,
    pub created_at: DateTime<Utc>,
}

impl Withdrawal {
    pub fn from_redemption(record: &RedemptionRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id("wdr"),
            redemption_id: record.id.clone(),
            position_id: record.position_id.clone(),
            wallet_address: record.wallet_address.clone(),
            shares: record.share_amount,
            fxrp_amount: record.fxrp_redeemed.unwrap_or(Amount::ZERO),
            xrp_sent: record.xrp_sent.unwrap_or(Amount::ZERO),
            created_at: now,
        }
    }
}
