//! Status graphs for bridge and redemption records.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: String,
    pub to: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BRIDGE STATUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Life cycle of a forward (payment → wrapped asset) conversion.
///
/// ```text
/// pending → bridging → awaiting_payment → xrpl_confirmed → fdc_proof_generated
///         → completed → vault_minting → vault_minted
///
/// xrpl_confirmed ──► fdc_timeout ──► fdc_proof_generated   (proof retry)
/// vault_minting  ──► vault_mint_failed ──► vault_minting   (mint retry)
/// failed ──► xrpl_confirmed | fdc_proof_generated | completed (reconciliation)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Pending,
    Bridging,
    AwaitingPayment,
    XrplConfirmed,
    FdcProofGenerated,
    Completed,
    VaultMinting,
    VaultMinted,
    FdcTimeout,
    Failed,
    Cancelled,
    VaultMintFailed,
}

impl BridgeStatus {
    pub const ALL: [BridgeStatus; 12] = [
        BridgeStatus::Pending,
        BridgeStatus::Bridging,
        BridgeStatus::AwaitingPayment,
        BridgeStatus::XrplConfirmed,
        BridgeStatus::FdcProofGenerated,
        BridgeStatus::Completed,
        BridgeStatus::VaultMinting,
        BridgeStatus::VaultMinted,
        BridgeStatus::FdcTimeout,
        BridgeStatus::Failed,
        BridgeStatus::Cancelled,
        BridgeStatus::VaultMintFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Pending => "pending",
            BridgeStatus::Bridging => "bridging",
            BridgeStatus::AwaitingPayment => "awaiting_payment",
            BridgeStatus::XrplConfirmed => "xrpl_confirmed",
            BridgeStatus::FdcProofGenerated => "fdc_proof_generated",
            BridgeStatus::Completed => "completed",
            BridgeStatus::VaultMinting => "vault_minting",
            BridgeStatus::VaultMinted => "vault_minted",
            BridgeStatus::FdcTimeout => "fdc_timeout",
            BridgeStatus::Failed => "failed",
            BridgeStatus::Cancelled => "cancelled",
            BridgeStatus::VaultMintFailed => "vault_mint_failed",
        }
    }

    /// No further automatic progress. `failed` may still be picked up by
    /// reconciliation when its failure kind is recoverable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BridgeStatus::VaultMinted | BridgeStatus::Cancelled | BridgeStatus::Failed
        )
    }

    /// The wrapped asset has been minted on the destination chain.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            BridgeStatus::Completed
                | BridgeStatus::VaultMinting
                | BridgeStatus::VaultMintFailed
                | BridgeStatus::VaultMinted
        )
    }

    /// Statuses whose reservation window can still lapse.
    pub fn is_awaiting_payment(&self) -> bool {
        matches!(
            self,
            BridgeStatus::Pending | BridgeStatus::Bridging | BridgeStatus::AwaitingPayment
        )
    }

    /// Statuses swept by the expiry pass.
    pub fn non_terminal() -> Vec<BridgeStatus> {
        Self::ALL.into_iter().filter(|s| !s.is_terminal()).collect()
    }

    pub fn can_transition_to(&self, next: BridgeStatus) -> bool {
        use BridgeStatus::*;

        if *self == next {
            return matches!(self, FdcTimeout | VaultMinting | XrplConfirmed);
        }

        match self {
            Pending => matches!(next, Bridging | Failed | Cancelled),
            Bridging => matches!(next, AwaitingPayment | Failed | Cancelled),
            AwaitingPayment => matches!(next, XrplConfirmed | Failed | Cancelled),
            XrplConfirmed => matches!(next, FdcProofGenerated | FdcTimeout | Failed),
            FdcTimeout => matches!(next, FdcProofGenerated | Failed),
            FdcProofGenerated => matches!(next, Completed | Failed),
            Completed => matches!(next, VaultMinting | VaultMinted),
            VaultMinting => matches!(next, VaultMinted | VaultMintFailed),
            VaultMintFailed => matches!(next, VaultMinting | VaultMinted),
            Failed => matches!(next, XrplConfirmed | FdcProofGenerated | FdcTimeout | Completed),
            VaultMinted | Cancelled => false,
        }
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REDEMPTION STATUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Life cycle of a reverse (vault shares → source-ledger payout) conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    Pending,
    RedeemingShares,
    SharesRedeemed,
    AwaitingPayout,
    XrplReceived,
    AwaitingProof,
    ProofGenerated,
    Completed,
    Failed,
}

impl RedemptionStatus {
    pub const ALL: [RedemptionStatus; 9] = [
        RedemptionStatus::Pending,
        RedemptionStatus::RedeemingShares,
        RedemptionStatus::SharesRedeemed,
        RedemptionStatus::AwaitingPayout,
        RedemptionStatus::XrplReceived,
        RedemptionStatus::AwaitingProof,
        RedemptionStatus::ProofGenerated,
        RedemptionStatus::Completed,
        RedemptionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::RedeemingShares => "redeeming_shares",
            RedemptionStatus::SharesRedeemed => "shares_redeemed",
            RedemptionStatus::AwaitingPayout => "awaiting_payout",
            RedemptionStatus::XrplReceived => "xrpl_received",
            RedemptionStatus::AwaitingProof => "awaiting_proof",
            RedemptionStatus::ProofGenerated => "proof_generated",
            RedemptionStatus::Completed => "completed",
            RedemptionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RedemptionStatus::Completed | RedemptionStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RedemptionStatus) -> bool {
        use RedemptionStatus::*;

        if *self == next {
            return matches!(self, AwaitingProof | XrplReceived);
        }

        match self {
            Pending => matches!(next, RedeemingShares | Failed),
            RedeemingShares => matches!(next, SharesRedeemed | Failed),
            SharesRedeemed => matches!(next, AwaitingPayout | Failed),
            AwaitingPayout => matches!(next, XrplReceived | Failed),
            XrplReceived => matches!(next, ProofGenerated | AwaitingProof | Failed),
            AwaitingProof => matches!(next, ProofGenerated | Failed),
            ProofGenerated => matches!(next, Completed | Failed),
            Failed => matches!(next, RedeemingShares | SharesRedeemed | XrplReceived | ProofGenerated),
            Completed => false,
        }
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FAILURE KINDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Tagged reason stored next to every persisted error message.
///
/// Reconciliation routes on this value instead of inspecting message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Request fields missing or malformed.
    InvalidRequest,
    /// The agent could not reserve collateral.
    ReservationFailed,
    /// The reservation window lapsed before payment.
    ReservationExpired,
    /// The source-ledger transaction failed validation.
    InvalidSourceTransaction,
    /// The verifier rejected the attestation request.
    AttestationRejected,
    /// Submitting the attestation request did not yield a mined transaction.
    AttestationSubmission,
    /// The data-availability layer did not finalize a proof in time.
    ProofTimeout,
    /// The data-availability layer answered with a fatal HTTP error.
    ProofUnavailable,
    /// The mint transaction may or may not have been broadcast.
    MintSubmissionUncertain,
    /// The mint transaction reverted.
    MintReverted,
    /// Share accounting rejected or failed the vault operation.
    VaultOperation,
    /// The destination contract rejected the redemption request.
    RedemptionRequest,
    /// The payout confirmation may or may not have been broadcast.
    ConfirmationUncertain,
    /// Network failure talking to a collaborator.
    Transport,
    Internal,
}

impl FailureKind {
    /// Whether reconciliation may resume a record failed with this kind.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FailureKind::AttestationSubmission
                | FailureKind::ProofTimeout
                | FailureKind::MintSubmissionUncertain
                | FailureKind::VaultOperation
                | FailureKind::ConfirmationUncertain
                | FailureKind::Transport
        )
    }
}
