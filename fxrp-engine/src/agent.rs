//! Collateral/agent client.
//!
//! Picks a minting agent, converts amounts into lots, and asks the destination
//! contract to reserve collateral or redeem.

use std::sync::Arc;

use tracing::{debug, info};

use fxrp_common::{Amount, CollateralReservation, RedemptionTicket};

use crate::error::BackendError;
use crate::traits::{AgentInfo, DestinationGateway};

/// Agent client over a destination gateway.
pub struct AgentClient {
    gateway: Arc<dyn DestinationGateway>,
    lot_size: Amount,
    max_minting_fee_bips: u32,
}

impl AgentClient {
    pub fn new(gateway: Arc<dyn DestinationGateway>, lot_size: Amount, max_minting_fee_bips: u32) -> Self {
        Self {
            gateway,
            lot_size,
            max_minting_fee_bips,
        }
    }

    pub fn lot_size(&self) -> Amount {
        self.lot_size
    }

    /// Lots covering `amount` exactly. Partial lots are rejected.
    pub fn lots_for(&self, amount: Amount) -> Result<u64, BackendError> {
        whole_lots(amount, self.lot_size)
    }

    /// Cheapest agent with enough free lots within the fee ceiling.
    pub fn select_agent(&self, agents: &[AgentInfo], lots: u64) -> Result<AgentInfo, BackendError> {
        agents
            .iter()
            .filter(|a| a.free_lots >= lots && a.fee_bips <= self.max_minting_fee_bips)
            .min_by_key(|a| (a.fee_bips, std::cmp::Reverse(a.free_lots)))
            .cloned()
            .ok_or(BackendError::NoAgentAvailable { lots })
    }

    pub async fn reserve(&self, amount: Amount) -> Result<CollateralReservation, BackendError> {
        let lots = self.lots_for(amount)?;
        let agents = self.gateway.available_agents().await?;
        debug!(lots, candidates = agents.len(), "Selecting minting agent");

        let agent = self.select_agent(&agents, lots)?;
        let fee = self.gateway.collateral_reservation_fee(lots).await?;
        let reservation = self
            .gateway
            .reserve_collateral(&agent.vault_address, lots, agent.fee_bips, fee)
            .await?;

        info!(
            agent_vault = %reservation.agent_vault_address,
            reservation_id = %reservation.reservation_id,
            lots,
            "Collateral reserved"
        );
        Ok(reservation)
    }

    /// Redeem the largest whole number of lots in `amount`.
    pub async fn redeem(
        &self,
        amount: Amount,
        receiver_source_address: &str,
    ) -> Result<RedemptionTicket, BackendError> {
        let lots = floor_lots(amount, self.lot_size)?;
        if lots == 0 {
            return Err(BackendError::InvalidAmount(format!(
                "{} is less than one lot ({})",
                amount, self.lot_size
            )));
        }
        self.gateway
            .request_redemption(lots, receiver_source_address)
            .await
    }
}

/// Number of lots in `amount`, which must be a positive multiple of `lot_size`.
pub fn whole_lots(amount: Amount, lot_size: Amount) -> Result<u64, BackendError> {
    let lots = floor_lots(amount, lot_size)?;
    if lots == 0 || amount.raw() % lot_size.raw() != 0 {
        return Err(BackendError::InvalidAmount(format!(
            "{} is not a whole number of lots of {}",
            amount, lot_size
        )));
    }
    Ok(lots)
}

fn floor_lots(amount: Amount, lot_size: Amount) -> Result<u64, BackendError> {
    if lot_size.is_zero() {
        return Err(BackendError::Config("lot size is zero".into()));
    }
    u64::try_from(amount.raw() / lot_size.raw())
        .map_err(|_| BackendError::InvalidAmount(format!("{} lots overflow", amount)))
}
