//! Settlement backends.
//!
//! The state machines never branch on "demo" versus "production": they talk to
//! one [`SettlementBackend`] chosen when the engine is assembled. The chain
//! backend reserves collateral with a real agent and mints on the destination
//! contract; the simulator in [`crate::simulated`] synthesises deterministic data.

use std::sync::Arc;

use async_trait::async_trait;

use fxrp_common::{Amount, AttestationProof, CollateralReservation, RedemptionTicket};

use crate::agent::AgentClient;
use crate::error::BackendError;
use crate::traits::DestinationGateway;

/// Everything the state machines need from the destination side.
#[async_trait]
pub trait SettlementBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Smallest mintable unit. Bridge amounts must be whole multiples.
    fn lot_size(&self) -> Amount;

    async fn reserve_collateral(
        &self,
        bridge_id: &str,
        amount: Amount,
    ) -> Result<CollateralReservation, BackendError>;

    /// Broadcast the minting transaction; returns the hash before inclusion.
    async fn submit_mint(
        &self,
        reservation_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError>;

    /// Amount actually minted by `tx_hash`, read from its transfer event.
    async fn minted_amount(&self, tx_hash: &str) -> Result<Amount, BackendError>;

    async fn request_redemption(
        &self,
        redemption_id: &str,
        amount: Amount,
        receiver_source_address: &str,
    ) -> Result<RedemptionTicket, BackendError>;

    async fn confirm_redemption_payment(
        &self,
        request_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError>;
}

/// Backend over a live destination chain.
pub struct ChainBackend {
    agents: AgentClient,
    gateway: Arc<dyn DestinationGateway>,
}

impl ChainBackend {
    pub fn new(gateway: Arc<dyn DestinationGateway>, lot_size: Amount, max_minting_fee_bips: u32) -> Self {
        Self {
            agents: AgentClient::new(gateway.clone(), lot_size, max_minting_fee_bips),
            gateway,
        }
    }
}

#[async_trait]
impl SettlementBackend for ChainBackend {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn lot_size(&self) -> Amount {
        self.agents.lot_size()
    }

    async fn reserve_collateral(
        &self,
        _bridge_id: &str,
        amount: Amount,
    ) -> Result<CollateralReservation, BackendError> {
        self.agents.reserve(amount).await
    }

    async fn submit_mint(
        &self,
        reservation_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError> {
        self.gateway.submit_mint(reservation_id, proof).await
    }

    async fn minted_amount(&self, tx_hash: &str) -> Result<Amount, BackendError> {
        self.gateway.minted_amount(tx_hash).await
    }

    async fn request_redemption(
        &self,
        _redemption_id: &str,
        amount: Amount,
        receiver_source_address: &str,
    ) -> Result<RedemptionTicket, BackendError> {
        self.agents.redeem(amount, receiver_source_address).await
    }

    async fn confirm_redemption_payment(
        &self,
        request_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError> {
        self.gateway
            .confirm_redemption_payment(request_id, proof)
            .await
    }
}
