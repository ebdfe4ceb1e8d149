//! Collaborators the state machines drive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use fxrp_common::{normalize_hex, Amount, AttestationProof, CollateralReservation, RedemptionTicket};

use crate::error::BackendError;

// ═══════════════════════════════════════════════════════════════════════════════
// SHARE ACCOUNTING
// ═══════════════════════════════════════════════════════════════════════════════

/// Shares minted into a vault position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintedShares {
    pub tx_hash: String,
    pub position_id: String,
}

/// Shares redeemed out of a vault position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemedShares {
    pub tx_hash: String,
    /// Wrapped asset released by the vault.
    pub assets_redeemed: Amount,
}

/// Position id for a wallet's shares in a vault. Stable across deposits.
pub fn position_id_for(vault_id: &str, wallet_address: &str) -> String {
    let key = format!(
        "position:{}:{}",
        vault_id.to_ascii_lowercase(),
        wallet_address.to_ascii_lowercase()
    );
    format!("pos_{}", hex::encode(&keccak256(key.as_bytes())[..8]))
}

/// Vault share accounting. Opaque; callers retry, implementations do not.
#[async_trait]
pub trait ShareAccounting: Send + Sync {
    async fn mint_shares(
        &self,
        vault_id: &str,
        user_address: &str,
        amount: Amount,
    ) -> Result<MintedShares, BackendError>;

    async fn redeem_shares(
        &self,
        vault_id: &str,
        user_address: &str,
        share_amount: Amount,
    ) -> Result<RedeemedShares, BackendError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// PAYMENT DETECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Addresses the source-ledger listener should watch.
#[async_trait]
pub trait PaymentWatcher: Send + Sync {
    /// Watch an agent address for incoming user payments.
    async fn add_agent_address(&self, address: &str);
    async fn remove_agent_address(&self, address: &str);
    /// Watch a user address for an incoming agent payout.
    async fn subscribe_user_for_redemption(&self, address: &str);
    async fn unsubscribe_user_address(&self, address: &str);
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE LEDGER
// ═══════════════════════════════════════════════════════════════════════════════

/// A payment as reported by the source ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTransaction {
    pub hash: String,
    /// Included in a validated ledger.
    pub validated: bool,
    /// Transaction result was a success.
    pub succeeded: bool,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub destination: String,
    pub delivered_amount: Amount,
    /// First memo, `0x` hex, if any.
    pub memo: Option<String>,
}

impl SourceTransaction {
    /// Whether the memo carries `reference`, compared as normalised hex.
    pub fn memo_matches(&self, reference: &str) -> bool {
        self.memo
            .as_deref()
            .map_or(false, |memo| normalize_hex(memo) == normalize_hex(reference))
    }
}

/// Read access to the source ledger.
#[async_trait]
pub trait SourceLedger: Send + Sync {
    async fn get_transaction(&self, tx_hash: &str) -> Result<SourceTransaction, BackendError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// DESTINATION CHAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Agent offering minting capacity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub vault_address: String,
    pub fee_bips: u32,
    pub free_lots: u64,
}

/// Destination contract gateway: agents, reservations, minting and redemption.
#[async_trait]
pub trait DestinationGateway: Send + Sync {
    async fn available_agents(&self) -> Result<Vec<AgentInfo>, BackendError>;

    /// Native-token fee charged for reserving `lots`.
    async fn collateral_reservation_fee(&self, lots: u64) -> Result<u128, BackendError>;

    async fn reserve_collateral(
        &self,
        agent_vault: &str,
        lots: u64,
        max_minting_fee_bips: u32,
        reservation_fee: u128,
    ) -> Result<CollateralReservation, BackendError>;

    /// Broadcast the minting transaction and return its hash without waiting.
    async fn submit_mint(
        &self,
        reservation_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError>;

    /// Wait for the receipt of `tx_hash` and return the amount minted to us.
    async fn minted_amount(&self, tx_hash: &str) -> Result<Amount, BackendError>;

    async fn request_redemption(
        &self,
        lots: u64,
        receiver_source_address: &str,
    ) -> Result<RedemptionTicket, BackendError>;

    async fn confirm_redemption_payment(
        &self,
        request_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_comparison_ignores_case_and_prefix() {
        let tx = SourceTransaction {
            hash: "ABC".into(),
            validated: true,
            succeeded: true,
            timestamp: Utc::now(),
            source: "rUser".into(),
            destination: "rAgent".into(),
            delivered_amount: Amount::from_units(1),
            memo: Some("46425052664100".into()),
        };
        assert!(tx.memo_matches("0x46425052664100"));
        assert!(!tx.memo_matches("0x46425052664101"));
    }

    #[test]
    fn position_ids_ignore_address_case() {
        let id = position_id_for("0xVaultA", "0xUser");
        assert_eq!(id, position_id_for("0xvaulta", "0xuser"));
        assert_ne!(id, position_id_for("0xvaultb", "0xuser"));
        assert_eq!(id.len(), "pos_".len() + 16);
    }
}
