//! Redemption state machine: vault shares back to a source-ledger payout.
//!
//! ```text
//! pending ─► redeeming_shares ─► shares_redeemed ─► awaiting_payout
//!   ─► xrpl_received ─► proof_generated ─► completed
//!                │
//!                └─► awaiting_proof ─► retry_redemption_proof
//! ```
//!
//! Creating a redemption holds its shares on the position, so two redemptions
//! can never spend the same shares. `confirmation_tx_hash` marks the redemption
//! settled. It is persisted before the held shares are debited and the
//! withdrawal written.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use fxrp_common::{
    Amount, AttestationProof, FailureKind, PaymentEvent, PaymentTarget, RedemptionRecord,
    RedemptionStatus, RedemptionTicket, Withdrawal,
};
use fxrp_fdc::{AttestationClient, AttestationError};

use crate::backend::SettlementBackend;
use crate::bridge::{check_ledger_transaction, BridgeConfig};
use crate::error::BridgeError;
use crate::locks::KeyedLocks;
use crate::reconcile::{ReconcileAction, ReconcileOutcome};
use crate::store::{RecordStore, StoreError};
use crate::traits::{PaymentWatcher, ShareAccounting, SourceLedger, SourceTransaction};

/// Request to redeem shares out of a position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateRedemptionRequest {
    pub wallet_address: String,
    /// Source-ledger address the agent pays out to.
    pub user_source_address: String,
    pub position_id: String,
    pub share_amount: Amount,
}

/// Reverse-flow orchestrator.
pub struct RedemptionService {
    store: RecordStore,
    backend: Arc<dyn SettlementBackend>,
    attestation: Arc<AttestationClient>,
    ledger: Arc<dyn SourceLedger>,
    shares: Arc<dyn ShareAccounting>,
    watcher: Arc<dyn PaymentWatcher>,
    locks: KeyedLocks,
    config: BridgeConfig,
}

fn apply_redemption_ticket(record: &mut RedemptionRecord, ticket: &RedemptionTicket) {
    record.destination_request_id = Some(ticket.request_id.clone());
    record.redemption_tx_hash = Some(ticket.redemption_tx_hash.clone());
    record.agent_vault_address = Some(ticket.agent_vault_address.clone());
    record.agent_source_address = Some(ticket.agent_source_address.clone()).filter(|a| !a.is_empty());
    record.payment_reference = Some(ticket.payment_reference.clone());
    record.expected_payout_raw = Some(ticket.expected_payout_raw);
}

impl RedemptionService {
    pub fn new(
        store: RecordStore,
        backend: Arc<dyn SettlementBackend>,
        attestation: Arc<AttestationClient>,
        ledger: Arc<dyn SourceLedger>,
        shares: Arc<dyn ShareAccounting>,
        watcher: Arc<dyn PaymentWatcher>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            store,
            backend,
            attestation,
            ledger,
            shares,
            watcher,
            locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn get_redemption(&self, id: &str) -> Result<RedemptionRecord, BridgeError> {
        self.store
            .get_redemption(id)?
            .ok_or_else(|| BridgeError::not_found("redemption", id))
    }

    pub fn create_redemption(
        &self,
        request: CreateRedemptionRequest,
    ) -> Result<RedemptionRecord, BridgeError> {
        if request.share_amount.is_zero() {
            return Err(BridgeError::InvalidRequest("share amount must be positive".into()));
        }
        if request.user_source_address.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("payout address is required".into()));
        }
        let position = self
            .store
            .get_position(&request.position_id)?
            .ok_or_else(|| BridgeError::not_found("position", &request.position_id))?;
        if !position
            .wallet_address
            .eq_ignore_ascii_case(request.wallet_address.trim())
        {
            return Err(BridgeError::InvalidRequest(format!(
                "position {} does not belong to {}",
                position.id, request.wallet_address
            )));
        }
        let record = RedemptionRecord::new(
            request.wallet_address.trim(),
            request.user_source_address.trim(),
            position.vault_id,
            position.id,
            request.share_amount,
            Utc::now(),
        );
        match self
            .store
            .reserve_shares(&record.position_id, &record.id, record.share_amount, record.created_at)
        {
            Ok(_) => {}
            Err(StoreError::InsufficientShares {
                position_id,
                available,
                requested,
            }) => {
                return Err(BridgeError::InvalidRequest(format!(
                    "position {} has {} shares available, {} requested",
                    position_id, available, requested
                )));
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.store.insert_redemption(&record) {
            self.store
                .release_shares(&record.position_id, &record.id, Utc::now())?;
            return Err(e.into());
        }
        info!(
            redemption_id = %record.id,
            position_id = %record.position_id,
            shares = %record.share_amount,
            "Redemption created"
        );
        Ok(record)
    }

    /// Redeem the shares, burn the wrapped asset, and start watching for the payout.
    pub async fn request_redemption(&self, id: &str) -> Result<RedemptionRecord, BridgeError> {
        let _guard = self.locks.lock(id).await;
        let record = self.get_redemption(id)?;
        match record.status {
            RedemptionStatus::Pending => self.redeem_shares_locked(record).await,
            RedemptionStatus::AwaitingPayout => Ok(record),
            status => Err(BridgeError::InvalidState {
                id: id.to_string(),
                status: status.to_string(),
                operation: "request redemption for",
            }),
        }
    }

    async fn redeem_shares_locked(&self, record: RedemptionRecord) -> Result<RedemptionRecord, BridgeError> {
        let id = record.id.clone();
        self.store.update_redemption(&id, |r| {
            r.transition(RedemptionStatus::RedeemingShares)?;
            r.clear_failure();
            Ok::<_, BridgeError>(())
        })?;

        let redeemed = match self
            .shares
            .redeem_shares(&record.vault_id, &record.wallet_address, record.share_amount)
            .await
        {
            Ok(redeemed) => redeemed,
            Err(e) => return Err(self.fail_redemption(&id, FailureKind::VaultOperation, e.into())),
        };

        let record = self.store.update_redemption(&id, |r| {
            r.transition(RedemptionStatus::SharesRedeemed)?;
            r.vault_redeem_tx_hash = Some(redeemed.tx_hash.clone());
            r.fxrp_redeemed = Some(redeemed.assets_redeemed);
            Ok::<_, BridgeError>(())
        })?;
        info!(
            redemption_id = %id,
            fxrp_redeemed = %redeemed.assets_redeemed,
            "Vault shares redeemed"
        );

        self.burn_locked(record).await
    }

    async fn burn_locked(&self, record: RedemptionRecord) -> Result<RedemptionRecord, BridgeError> {
        let id = record.id.clone();
        let amount = record
            .fxrp_redeemed
            .ok_or_else(|| BridgeError::missing(&id, "fxrp_redeemed"))?;

        let ticket = match self
            .backend
            .request_redemption(&id, amount, &record.user_source_address)
            .await
        {
            Ok(ticket) => ticket,
            Err(e) => return Err(self.fail_redemption(&id, FailureKind::RedemptionRequest, e.into())),
        };

        let record = self.store.update_redemption(&id, |r| {
            r.transition(RedemptionStatus::AwaitingPayout)?;
            apply_redemption_ticket(r, &ticket);
            Ok::<_, BridgeError>(())
        })?;
        self.watcher
            .subscribe_user_for_redemption(&record.user_source_address)
            .await;

        info!(
            redemption_id = %id,
            request_id = %ticket.request_id,
            agent_vault = %ticket.agent_vault_address,
            expected_payout = %Amount::from_raw(ticket.expected_payout_raw),
            "Awaiting agent payout"
        );
        Ok(record)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PAYOUT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Validate a detected payout, prove it, and confirm it on the destination.
    ///
    /// A proof that does not finalize in time leaves the record in
    /// `awaiting_proof` and returns `Ok`.
    pub async fn handle_payout(&self, event: &PaymentEvent) -> Result<RedemptionRecord, BridgeError> {
        let PaymentTarget::Redemption(id) = &event.target else {
            return Err(BridgeError::InvalidRequest(format!(
                "payment {} is not addressed to a redemption",
                event.tx_hash
            )));
        };
        let _guard = self.locks.lock(id).await;
        let record = self.get_redemption(id)?;

        if record.status.is_terminal() {
            return Err(BridgeError::Terminal {
                id: id.clone(),
                status: record.status.to_string(),
            });
        }
        let same_payout = record
            .source_payout_tx_hash
            .as_deref()
            .map_or(true, |hash| hash.eq_ignore_ascii_case(&event.tx_hash));
        let accepted = match record.status {
            RedemptionStatus::AwaitingPayout => true,
            RedemptionStatus::XrplReceived => same_payout,
            _ => false,
        };
        if !accepted {
            return Err(BridgeError::InvalidState {
                id: id.clone(),
                status: record.status.to_string(),
                operation: "accept a payout for",
            });
        }
        info!(
            redemption_id = %id,
            tx_hash = %event.tx_hash,
            amount = %event.amount,
            "Payout detected"
        );

        self.attest_payout_locked(record, &event.tx_hash).await
    }

    async fn attest_payout_locked(
        &self,
        record: RedemptionRecord,
        payout_tx_hash: &str,
    ) -> Result<RedemptionRecord, BridgeError> {
        let id = record.id.clone();
        let detected = record.status == RedemptionStatus::AwaitingPayout;

        // A payout that cannot be read or does not match leaves an awaiting
        // record and its watch untouched.
        let checked = match self.ledger.get_transaction(payout_tx_hash).await {
            Ok(tx) => validate_payout(&record, &tx, &self.config).map(|_| tx),
            Err(e) => Err(BridgeError::from(e)),
        };
        let tx = match checked {
            Ok(tx) => tx,
            Err(err) if detected => {
                warn!(
                    redemption_id = %id,
                    tx_hash = payout_tx_hash,
                    "Payout rejected, still awaiting the agent: {}",
                    err
                );
                return Err(err);
            }
            Err(err) => {
                let kind = err.failure_kind();
                return Err(self.fail_redemption(&id, kind, err));
            }
        };

        self.store.update_redemption(&id, |r| {
            r.transition(RedemptionStatus::XrplReceived)?;
            r.source_payout_tx_hash = Some(payout_tx_hash.to_string());
            r.payout_received_at.get_or_insert_with(Utc::now);
            r.xrp_sent = Some(tx.delivered_amount);
            Ok::<_, BridgeError>(())
        })?;
        if detected {
            self.watcher
                .unsubscribe_user_address(&record.user_source_address)
                .await;
        }

        let ticket = match self
            .attestation
            .request_attestation(payout_tx_hash, self.config.network)
            .await
        {
            Ok(ticket) => ticket,
            Err(e) => return Err(self.fail_redemption(&id, e.failure_kind(), e.into())),
        };
        self.store.update_redemption(&id, |r| {
            r.apply_ticket(&ticket);
            r.updated_at = Utc::now();
            Ok::<_, BridgeError>(())
        })?;
        info!(
            redemption_id = %id,
            voting_round_id = ticket.voting_round_id,
            "Payout attestation paid, awaiting proof"
        );

        let result = self.attestation.await_proof(&ticket).await;
        self.settle_proof(&id, result).await
    }

    async fn settle_proof(
        &self,
        id: &str,
        result: Result<AttestationProof, AttestationError>,
    ) -> Result<RedemptionRecord, BridgeError> {
        match result {
            Ok(proof) => {
                let record = self.store.update_redemption(id, |r| {
                    r.transition(RedemptionStatus::ProofGenerated)?;
                    r.proof = Some(proof.clone());
                    r.clear_failure();
                    Ok::<_, BridgeError>(())
                })?;
                info!(redemption_id = id, voting_round_id = proof.voting_round_id, "Payout proof stored");
                self.confirm_locked(record).await
            }
            Err(e) if e.is_timeout() => {
                let message = e.to_string();
                let record = self.store.update_redemption(id, |r| {
                    r.transition(RedemptionStatus::AwaitingProof)?;
                    r.record_failure(FailureKind::ProofTimeout, message.clone());
                    Ok::<_, BridgeError>(())
                })?;
                warn!(redemption_id = id, "Payout proof not finalized in time, parked for retry");
                Ok(record)
            }
            Err(e) => Err(self.fail_redemption(id, e.failure_kind(), e.into())),
        }
    }

    /// Confirm the payout (unless already confirmed), then settle the books.
    async fn confirm_locked(&self, record: RedemptionRecord) -> Result<RedemptionRecord, BridgeError> {
        let id = record.id.clone();
        if !record.is_confirmed() {
            let request_id = record
                .destination_request_id
                .clone()
                .ok_or_else(|| BridgeError::missing(&id, "destination_request_id"))?;
            let proof = record
                .proof
                .clone()
                .ok_or_else(|| BridgeError::missing(&id, "proof"))?;

            let tx_hash = match self
                .backend
                .confirm_redemption_payment(&request_id, &proof)
                .await
            {
                Ok(hash) => hash,
                Err(e) => {
                    let kind = e.submission_kind(
                        FailureKind::ConfirmationUncertain,
                        FailureKind::RedemptionRequest,
                    );
                    return Err(self.fail_redemption(&id, kind, e.into()));
                }
            };
            self.store.update_redemption(&id, |r| {
                if r.confirmation_tx_hash.is_none() {
                    r.confirmation_tx_hash = Some(tx_hash.clone());
                    r.updated_at = Utc::now();
                }
                Ok::<_, BridgeError>(())
            })?;
            info!(redemption_id = %id, tx_hash = %tx_hash, "Payout confirmed on destination");
        }

        self.finish_locked(&id)
    }

    /// Debit the position, write the withdrawal, and mark the redemption completed.
    fn finish_locked(&self, id: &str) -> Result<RedemptionRecord, BridgeError> {
        let now = Utc::now();
        let record = self.get_redemption(id)?;
        if record.status == RedemptionStatus::Completed {
            return Ok(record);
        }

        let position = self
            .store
            .record_withdrawal(&Withdrawal::from_redemption(&record, now))?;
        let record = self.store.update_redemption(id, |r| {
            if r.status == RedemptionStatus::Failed {
                r.transition(RedemptionStatus::ProofGenerated)?;
            }
            r.transition(RedemptionStatus::Completed)?;
            r.completed_at = Some(now);
            r.clear_failure();
            Ok::<_, BridgeError>(())
        })?;

        info!(
            redemption_id = id,
            position_id = %position.id,
            remaining_shares = %position.shares,
            "Redemption completed"
        );
        Ok(record)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // RETRIES & RECONCILIATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Poll again for a timed-out payout proof.
    pub async fn retry_redemption_proof(&self, id: &str) -> Result<RedemptionRecord, BridgeError> {
        let _guard = self.locks.lock(id).await;
        let record = self.get_redemption(id)?;
        if record.status.is_terminal() {
            debug!(redemption_id = id, status = %record.status, "Nothing to retry");
            return Ok(record);
        }
        if record.status != RedemptionStatus::AwaitingProof {
            return Err(BridgeError::InvalidState {
                id: id.to_string(),
                status: record.status.to_string(),
                operation: "retry proof for",
            });
        }
        self.resume_proof_locked(record).await
    }

    async fn resume_proof_locked(&self, record: RedemptionRecord) -> Result<RedemptionRecord, BridgeError> {
        let id = record.id.clone();
        let ticket = record
            .stored_ticket()
            .ok_or_else(|| BridgeError::missing(&id, "attestation ticket"))?;

        let record = self.store.update_redemption(&id, |r| {
            r.retry_count += 1;
            r.updated_at = Utc::now();
            Ok::<_, BridgeError>(())
        })?;
        info!(
            redemption_id = %id,
            voting_round_id = ticket.voting_round_id,
            retry = record.retry_count,
            "Retrying payout proof retrieval"
        );
        let result = self
            .attestation
            .resume_proof(ticket.voting_round_id, &ticket.request_bytes)
            .await;
        self.settle_proof(&id, result).await
    }

    /// Resume a stuck or recoverably failed redemption from the right step.
    pub async fn reconcile_redemption(&self, id: &str) -> Result<ReconcileOutcome, BridgeError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            let record = self.get_redemption(id)?;
            return Ok(ReconcileOutcome::new(id, ReconcileAction::Busy, record.status));
        };
        let record = self.get_redemption(id)?;
        debug!(redemption_id = id, status = %record.status, "Reconciling redemption");

        if record.is_confirmed() && record.status != RedemptionStatus::Completed {
            let record = self.finish_locked(id)?;
            return Ok(ReconcileOutcome::new(id, ReconcileAction::RepairedStatus, record.status));
        }

        let (action, record) = match record.status {
            RedemptionStatus::AwaitingProof => (
                ReconcileAction::RetriedProof,
                self.resume_proof_locked(record).await?,
            ),
            RedemptionStatus::ProofGenerated => (
                ReconcileAction::ResumedConfirmation,
                self.confirm_locked(record).await?,
            ),
            RedemptionStatus::XrplReceived => {
                if record.stored_ticket().is_some() {
                    (ReconcileAction::RetriedProof, self.resume_proof_locked(record).await?)
                } else {
                    let payout = record
                        .source_payout_tx_hash
                        .clone()
                        .ok_or_else(|| BridgeError::missing(id, "source_payout_tx_hash"))?;
                    (
                        ReconcileAction::RegeneratedProof,
                        self.attest_payout_locked(record, &payout).await?,
                    )
                }
            }
            RedemptionStatus::Failed => match record.failure_kind {
                Some(kind) if kind.is_recoverable() => self.resume_failed(record).await?,
                kind => {
                    return Ok(ReconcileOutcome::new(id, ReconcileAction::NotRecoverable, record.status)
                        .with_detail(format!("failure kind {:?}", kind)));
                }
            },
            RedemptionStatus::RedeemingShares => {
                return Ok(ReconcileOutcome::new(id, ReconcileAction::NotRecoverable, record.status)
                    .with_detail("share redemption outcome unknown, needs manual review"));
            }
            RedemptionStatus::Pending
            | RedemptionStatus::SharesRedeemed
            | RedemptionStatus::AwaitingPayout
            | RedemptionStatus::Completed => {
                return Ok(ReconcileOutcome::new(id, ReconcileAction::Skipped, record.status));
            }
        };
        Ok(ReconcileOutcome::new(id, action, record.status))
    }

    async fn resume_failed(
        &self,
        record: RedemptionRecord,
    ) -> Result<(ReconcileAction, RedemptionRecord), BridgeError> {
        let id = record.id.clone();

        if record.proof.is_some() {
            let record = self.store.update_redemption(&id, |r| {
                r.transition(RedemptionStatus::ProofGenerated)?;
                Ok::<_, BridgeError>(())
            })?;
            return Ok((ReconcileAction::ResumedConfirmation, self.confirm_locked(record).await?));
        }
        if let Some(payout) = record.source_payout_tx_hash.clone() {
            let has_ticket = record.stored_ticket().is_some();
            let record = self.store.update_redemption(&id, |r| {
                r.transition(RedemptionStatus::XrplReceived)?;
                r.clear_failure();
                Ok::<_, BridgeError>(())
            })?;
            if has_ticket {
                return Ok((ReconcileAction::RetriedProof, self.resume_proof_locked(record).await?));
            }
            return Ok((
                ReconcileAction::RegeneratedProof,
                self.attest_payout_locked(record, &payout).await?,
            ));
        }
        if record.vault_redeem_tx_hash.is_none() {
            return Ok((
                ReconcileAction::RetriedShareRedemption,
                self.redeem_shares_locked(record).await?,
            ));
        }
        if record.redemption_tx_hash.is_none() {
            let record = self.store.update_redemption(&id, |r| {
                r.transition(RedemptionStatus::SharesRedeemed)?;
                r.clear_failure();
                Ok::<_, BridgeError>(())
            })?;
            return Ok((ReconcileAction::RetriedBurn, self.burn_locked(record).await?));
        }
        // Burned and assigned: the payout has to be reported before anything can resume.
        Ok((ReconcileAction::NotRecoverable, record))
    }

    fn fail_redemption(&self, id: &str, kind: FailureKind, err: BridgeError) -> BridgeError {
        let message = err.to_string();
        let persisted = self.store.update_redemption(id, |r| {
            if r.fail(kind, message.clone()).is_err() {
                r.record_failure(kind, message.clone());
            }
            Ok::<_, BridgeError>(())
        });
        match persisted {
            Ok(record) => {
                warn!(
                    redemption_id = id,
                    status = %record.status,
                    failure_kind = ?kind,
                    "Redemption step failed: {}",
                    message
                );
                self.release_if_abandoned(&record);
            }
            Err(e) => error!(redemption_id = id, "Could not persist failure ({}): {}", message, e),
        }
        err
    }

    /// Give the held shares back once a redemption can no longer resume and
    /// the vault never redeemed them.
    fn release_if_abandoned(&self, record: &RedemptionRecord) {
        let resumable = record.failure_kind.map_or(true, |k| k.is_recoverable());
        if record.status != RedemptionStatus::Failed || resumable || record.vault_redeem_tx_hash.is_some() {
            return;
        }
        match self
            .store
            .release_shares(&record.position_id, &record.id, Utc::now())
        {
            Ok(position) => info!(
                redemption_id = %record.id,
                position_id = %position.id,
                available = %position.available_shares(),
                "Released held shares"
            ),
            Err(e) => error!(redemption_id = %record.id, "Could not release held shares: {}", e),
        }
    }
}

/// Check a source transaction is the agent's payout for this redemption.
pub fn validate_payout(
    record: &RedemptionRecord,
    tx: &SourceTransaction,
    config: &BridgeConfig,
) -> Result<(), BridgeError> {
    check_ledger_transaction(tx, Utc::now(), config)?;

    let invalid = |reason: String| -> Result<(), BridgeError> {
        Err(BridgeError::InvalidSourceTransaction(format!("{}: {}", tx.hash, reason)))
    };
    if tx.destination != record.user_source_address {
        return invalid(format!(
            "paid {} instead of {}",
            tx.destination, record.user_source_address
        ));
    }
    let reference = record
        .payment_reference
        .as_deref()
        .ok_or_else(|| BridgeError::missing(&record.id, "payment_reference"))?;
    if !tx.memo_matches(reference) {
        return invalid("memo does not carry the redemption reference".into());
    }
    let expected = Amount::from_raw(
        record
            .expected_payout_raw
            .ok_or_else(|| BridgeError::missing(&record.id, "expected_payout_raw"))?,
    );
    if tx.delivered_amount < expected {
        return invalid(format!(
            "delivered {} but {} was expected",
            tx.delivered_amount, expected
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn awaiting(now: chrono::DateTime<Utc>) -> RedemptionRecord {
        let mut record = RedemptionRecord::new("0xuser", "rUser", "vault-1", "pos_1", Amount::from_units(10), now);
        apply_redemption_ticket(
            &mut record,
            &RedemptionTicket {
                request_id: "9".into(),
                redemption_tx_hash: "0xburn".into(),
                agent_vault_address: "0xagent".into(),
                agent_source_address: String::new(),
                payment_reference: "0x4642505266410002".into(),
                expected_payout_raw: 10_000_000,
            },
        );
        record
    }

    fn payout(now: chrono::DateTime<Utc>, to: &str, amount: Amount) -> SourceTransaction {
        SourceTransaction {
            hash: "PAYOUT".into(),
            validated: true,
            succeeded: true,
            timestamp: now - Duration::seconds(3),
            source: "rAgent".into(),
            destination: to.into(),
            delivered_amount: amount,
            memo: Some("0x4642505266410002".into()),
        }
    }

    #[test]
    fn ticket_without_agent_address_leaves_it_unset() {
        let record = awaiting(Utc::now());
        assert!(record.agent_source_address.is_none());
        assert_eq!(record.destination_request_id.as_deref(), Some("9"));
    }

    #[test]
    fn payout_must_reach_the_user_in_full() {
        let now = Utc::now();
        let record = awaiting(now);
        let config = BridgeConfig::default();

        assert!(validate_payout(&record, &payout(now, "rUser", Amount::from_units(10)), &config).is_ok());
        assert!(validate_payout(&record, &payout(now, "rSomeoneElse", Amount::from_units(10)), &config).is_err());
        assert!(validate_payout(&record, &payout(now, "rUser", Amount::from_raw(9_999_999)), &config).is_err());
    }
}
