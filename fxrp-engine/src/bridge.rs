//! Bridge state machine: the forward (payment → wrapped asset → vault shares)
//! life cycle.
//!
//! ```text
//! create ─► reserve_collateral_quick ─► [user pays] ─► execute_minting_with_proof
//!                                                        │
//!   xrpl_confirmed ─► attestation ─► fdc_proof_generated ─► mint ─► completed
//!        │                                                             │
//!        └─► fdc_timeout ─► retry_proof_generation          vault hand-off ─► vault_minted
//! ```
//!
//! Every step is written through to the store before the next one starts, and
//! every public operation holds the record's lock for its whole duration. Two
//! hashes act as idempotency keys: `destination_tx_hash` (the mint was
//! broadcast) and `vault_mint_tx_hash` (shares were minted). Both are persisted
//! before the status that follows them.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use fxrp_common::{
    Amount, AttestationProof, BridgeRecord, BridgeStatus, FailureKind, PaymentEvent,
    PaymentInstruction, PaymentTarget, SourceNetwork,
};
use fxrp_fdc::{AttestationClient, AttestationError};

use crate::agent::whole_lots;
use crate::backend::SettlementBackend;
use crate::error::BridgeError;
use crate::locks::KeyedLocks;
use crate::reconcile::{ReconcileAction, ReconcileOutcome};
use crate::store::RecordStore;
use crate::traits::{PaymentWatcher, ShareAccounting, SourceLedger, SourceTransaction};

/// Bridge state machine settings.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub network: SourceNetwork,
    /// Payment window granted to a new bridge before a reservation replaces it.
    pub reservation_window: Duration,
    /// Oldest source transaction accepted as payment.
    pub max_source_tx_age: Duration,
    /// Tolerated lead of the ledger close time over our clock.
    pub max_clock_skew: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            network: SourceNetwork::Testnet,
            reservation_window: Duration::minutes(15),
            max_source_tx_age: Duration::days(365),
            max_clock_skew: Duration::seconds(60),
        }
    }
}

/// Request to open a bridge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateBridgeRequest {
    pub wallet_address: String,
    pub vault_id: String,
    pub amount: Amount,
}

/// Forward-flow orchestrator.
pub struct BridgeService {
    store: RecordStore,
    backend: Arc<dyn SettlementBackend>,
    attestation: Arc<AttestationClient>,
    ledger: Arc<dyn SourceLedger>,
    shares: Arc<dyn ShareAccounting>,
    watcher: Arc<dyn PaymentWatcher>,
    locks: KeyedLocks,
    config: BridgeConfig,
}

impl BridgeService {
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

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn get_bridge(&self, id: &str) -> Result<BridgeRecord, BridgeError> {
        self.store
            .get_bridge(id)?
            .ok_or_else(|| BridgeError::not_found("bridge", id))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CREATION & RESERVATION
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn create_bridge(&self, request: CreateBridgeRequest) -> Result<BridgeRecord, BridgeError> {
        if request.wallet_address.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("wallet address is required".into()));
        }
        if request.vault_id.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("vault id is required".into()));
        }
        whole_lots(request.amount, self.backend.lot_size())
            .map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;

        let record = BridgeRecord::new(
            request.wallet_address.trim(),
            request.vault_id.trim(),
            request.amount,
            Utc::now(),
            self.config.reservation_window,
        );
        self.store.insert_bridge(&record)?;

        info!(
            bridge_id = %record.id,
            amount = %record.source_amount,
            vault_id = %record.vault_id,
            "Bridge created"
        );
        Ok(record)
    }

    /// Reserve collateral and start watching the agent address. Returns quickly;
    /// nothing here waits on the source ledger or the attestation protocol.
    pub async fn reserve_collateral_quick(&self, id: &str) -> Result<BridgeRecord, BridgeError> {
        let _guard = self.locks.lock(id).await;
        let now = Utc::now();
        let record = self.get_bridge(id)?;

        match record.status {
            BridgeStatus::Pending => {}
            BridgeStatus::AwaitingPayment if record.collateral_reservation_id.is_some() => {
                debug!(bridge_id = id, "Collateral already reserved");
                return Ok(record);
            }
            status => {
                return Err(BridgeError::InvalidState {
                    id: id.to_string(),
                    status: status.to_string(),
                    operation: "reserve collateral for",
                })
            }
        }
        if record.is_expired(now) {
            self.expire_bridge(id, now).await?;
            return Err(BridgeError::Expired { id: id.to_string() });
        }

        let record = self.store.update_bridge(id, |r| {
            r.transition(BridgeStatus::Bridging)?;
            Ok::<_, BridgeError>(())
        })?;

        let reservation = match self
            .backend
            .reserve_collateral(id, record.source_amount)
            .await
        {
            Ok(reservation) => reservation,
            Err(e) => return Err(self.fail_bridge(id, FailureKind::ReservationFailed, e.into())),
        };

        let mut consistent = true;
        let record = self.store.update_bridge(id, |r| {
            r.apply_reservation(&reservation, Utc::now());
            consistent = r.reservation_totals_consistent();
            if consistent {
                r.transition(BridgeStatus::AwaitingPayment)?;
            }
            Ok::<_, BridgeError>(())
        })?;
        if !consistent {
            // Unpaid reservations lapse on the agent's side at their expiry.
            let err = BridgeError::InvalidRequest(format!(
                "reservation {} totals do not add up",
                reservation.reservation_id
            ));
            return Err(self.fail_bridge(id, FailureKind::ReservationFailed, err));
        }
        self.watcher
            .add_agent_address(&reservation.agent_source_address)
            .await;

        info!(
            bridge_id = id,
            backend = self.backend.name(),
            reservation_id = %reservation.reservation_id,
            total_raw = reservation.total_raw(),
            expires_at = %reservation.expires_at,
            "Awaiting payment"
        );
        Ok(record)
    }

    /// Payment instruction for the user, from a reserved bridge.
    pub fn build_payment_request(&self, record: &BridgeRecord) -> Result<PaymentInstruction, BridgeError> {
        payment_instruction(record, self.config.network, Utc::now())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // MINTING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Route a detected payment to its bridge.
    pub async fn handle_payment(&self, event: &PaymentEvent) -> Result<BridgeRecord, BridgeError> {
        let PaymentTarget::Bridge(id) = &event.target else {
            return Err(BridgeError::InvalidRequest(format!(
                "payment {} is not addressed to a bridge",
                event.tx_hash
            )));
        };
        info!(
            bridge_id = %id,
            tx_hash = %event.tx_hash,
            amount = %event.amount,
            from = %event.from_address,
            "Payment detected"
        );
        self.execute_minting_with_proof(id, &event.tx_hash).await
    }

    /// Confirm the user's payment, prove it, mint, and hand off to the vault.
    ///
    /// A proof that does not finalize in time leaves the record in
    /// `fdc_timeout` and returns `Ok`.
    pub async fn execute_minting_with_proof(
        &self,
        id: &str,
        source_tx_hash: &str,
    ) -> Result<BridgeRecord, BridgeError> {
        let _guard = self.locks.lock(id).await;
        let now = Utc::now();
        let record = self.get_bridge(id)?;

        if record.status.is_terminal() {
            return Err(BridgeError::Terminal {
                id: id.to_string(),
                status: record.status.to_string(),
            });
        }
        if record.is_expired(now) {
            self.expire_bridge(id, now).await?;
            return Err(BridgeError::Expired { id: id.to_string() });
        }
        let same_payment = record
            .source_tx_hash
            .as_deref()
            .map_or(true, |hash| hash.eq_ignore_ascii_case(source_tx_hash));
        let resumable = match record.status {
            BridgeStatus::AwaitingPayment => true,
            BridgeStatus::XrplConfirmed => same_payment,
            _ => false,
        };
        if !resumable {
            return Err(BridgeError::InvalidState {
                id: id.to_string(),
                status: record.status.to_string(),
                operation: "execute minting for",
            });
        }

        let mut previous = record.status;
        let marked = self.store.update_bridge(id, |r| {
            if r.is_expired(now) {
                return Err(BridgeError::Expired { id: r.id.clone() });
            }
            previous = r.status;
            r.transition(BridgeStatus::XrplConfirmed)?;
            r.source_tx_hash = Some(source_tx_hash.to_string());
            r.source_confirmed_at = Some(now);
            // The reservation is consumed once paid.
            r.expires_at = None;
            Ok(())
        });
        let record = match marked {
            Ok(record) => record,
            Err(BridgeError::Expired { id }) => {
                self.expire_bridge(&id, now).await?;
                return Err(BridgeError::Expired { id });
            }
            Err(e) => return Err(e),
        };
        if previous == BridgeStatus::AwaitingPayment {
            if let Some(agent) = &record.agent_source_address {
                self.watcher.remove_agent_address(agent).await;
            }
        }
        info!(bridge_id = id, source_tx_hash, "Source payment confirmed");

        if record.stored_ticket().is_some() {
            debug!(bridge_id = id, "Attestation already paid for, resuming proof");
            return self.resume_proof_locked(record).await;
        }
        self.attest_locked(record, source_tx_hash).await
    }

    /// Fetch and validate the source transaction, then pay for and await its proof.
    async fn attest_locked(
        &self,
        record: BridgeRecord,
        source_tx_hash: &str,
    ) -> Result<BridgeRecord, BridgeError> {
        let id = record.id.clone();

        let tx = match self.ledger.get_transaction(source_tx_hash).await {
            Ok(tx) => tx,
            Err(e) => {
                let err = BridgeError::from(e);
                return Err(self.fail_bridge(&id, err.failure_kind(), err));
            }
        };
        if let Err(err) = validate_payment(&record, &tx, Utc::now(), &self.config) {
            return Err(self.fail_bridge(&id, FailureKind::InvalidSourceTransaction, err));
        }

        let ticket = match self
            .attestation
            .request_attestation(source_tx_hash, self.config.network)
            .await
        {
            Ok(ticket) => ticket,
            Err(e) => return Err(self.fail_bridge(&id, e.failure_kind(), e.into())),
        };
        self.store.update_bridge(&id, |r| {
            r.apply_ticket(&ticket);
            r.updated_at = Utc::now();
            Ok::<_, BridgeError>(())
        })?;
        info!(
            bridge_id = %id,
            voting_round_id = ticket.voting_round_id,
            attestation_tx_hash = %ticket.attestation_tx_hash,
            "Attestation paid, awaiting proof"
        );

        let result = self.attestation.await_proof(&ticket).await;
        self.settle_proof(&id, result).await
    }

    async fn settle_proof(
        &self,
        id: &str,
        result: Result<AttestationProof, AttestationError>,
    ) -> Result<BridgeRecord, BridgeError> {
        match result {
            Ok(proof) => {
                let record = self.store.update_bridge(id, |r| {
                    r.transition(BridgeStatus::FdcProofGenerated)?;
                    r.proof = Some(proof.clone());
                    r.attested_at = Some(Utc::now());
                    r.clear_failure();
                    Ok::<_, BridgeError>(())
                })?;
                info!(
                    bridge_id = id,
                    voting_round_id = proof.voting_round_id,
                    "Attestation proof stored"
                );
                self.mint_locked(record).await
            }
            Err(e) if e.is_timeout() => {
                let message = e.to_string();
                let record = self.store.update_bridge(id, |r| {
                    r.transition(BridgeStatus::FdcTimeout)?;
                    r.record_failure(FailureKind::ProofTimeout, message.clone());
                    Ok::<_, BridgeError>(())
                })?;
                warn!(
                    bridge_id = id,
                    voting_round_id = ?record.voting_round_id,
                    "Proof not finalized in time, parked for retry"
                );
                Ok(record)
            }
            Err(e) => Err(self.fail_bridge(id, e.failure_kind(), e.into())),
        }
    }

    /// Submit the proof (unless already broadcast), read back the minted amount,
    /// and continue with the vault hand-off.
    async fn mint_locked(&self, record: BridgeRecord) -> Result<BridgeRecord, BridgeError> {
        let id = record.id.clone();
        let reservation_id = record
            .collateral_reservation_id
            .clone()
            .ok_or_else(|| BridgeError::missing(&id, "collateral_reservation_id"))?;

        let tx_hash = match record.destination_tx_hash.clone() {
            Some(hash) => {
                info!(bridge_id = %id, tx_hash = %hash, "Mint already broadcast, verifying");
                hash
            }
            None => {
                let proof = record
                    .proof
                    .clone()
                    .ok_or_else(|| BridgeError::missing(&id, "proof"))?;
                let hash = match self.backend.submit_mint(&reservation_id, &proof).await {
                    Ok(hash) => hash,
                    Err(e) => {
                        let kind = e.submission_kind(
                            FailureKind::MintSubmissionUncertain,
                            FailureKind::MintReverted,
                        );
                        return Err(self.fail_bridge(&id, kind, e.into()));
                    }
                };
                self.store.update_bridge(&id, |r| match &r.destination_tx_hash {
                    Some(existing) if existing != &hash => Err(BridgeError::InvalidState {
                        id: r.id.clone(),
                        status: r.status.to_string(),
                        operation: "record a second mint transaction for",
                    }),
                    _ => {
                        r.destination_tx_hash = Some(hash.clone());
                        r.updated_at = Utc::now();
                        Ok(())
                    }
                })?;
                info!(bridge_id = %id, tx_hash = %hash, "Mint submitted");
                hash
            }
        };

        let minted = match self.backend.minted_amount(&tx_hash).await {
            Ok(amount) => amount,
            Err(e) => {
                let kind = e.submission_kind(
                    FailureKind::MintSubmissionUncertain,
                    FailureKind::MintReverted,
                );
                return Err(self.fail_bridge(&id, kind, e.into()));
            }
        };
        if minted != record.destination_amount_expected {
            warn!(
                bridge_id = %id,
                expected = %record.destination_amount_expected,
                minted = %minted,
                "Minted amount differs from reservation"
            );
        }

        self.store.update_bridge(&id, |r| {
            r.transition(BridgeStatus::Completed)?;
            r.destination_amount_received = Some(minted);
            r.minted_at = Some(Utc::now());
            r.clear_failure();
            Ok::<_, BridgeError>(())
        })?;
        info!(bridge_id = %id, minted = %minted, "Wrapped asset minted");

        self.vault_mint_locked(&id).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // RETRIES & VAULT HAND-OFF
    // ═══════════════════════════════════════════════════════════════════════════

    /// Poll again for a timed-out proof, reusing the paid attestation.
    pub async fn retry_proof_generation(&self, id: &str) -> Result<BridgeRecord, BridgeError> {
        let _guard = self.locks.lock(id).await;
        self.retry_proof_locked(id).await
    }

    async fn retry_proof_locked(&self, id: &str) -> Result<BridgeRecord, BridgeError> {
        let record = self.get_bridge(id)?;
        if record.status.is_terminal() || record.status.is_settled() {
            debug!(bridge_id = id, status = %record.status, "Nothing to retry");
            return Ok(record);
        }
        if record.status != BridgeStatus::FdcTimeout {
            return Err(BridgeError::InvalidState {
                id: id.to_string(),
                status: record.status.to_string(),
                operation: "retry proof for",
            });
        }
        self.resume_proof_locked(record).await
    }

    async fn resume_proof_locked(&self, record: BridgeRecord) -> Result<BridgeRecord, BridgeError> {
        let id = record.id.clone();
        let voting_round_id = record
            .voting_round_id
            .ok_or_else(|| BridgeError::missing(&id, "voting_round_id"))?;
        let request_bytes = record
            .attestation_request_bytes
            .clone()
            .ok_or_else(|| BridgeError::missing(&id, "attestation_request_bytes"))?;
        if record.source_tx_hash.is_none() {
            return Err(BridgeError::missing(&id, "source_tx_hash"));
        }
        if record.collateral_reservation_id.is_none() {
            return Err(BridgeError::missing(&id, "collateral_reservation_id"));
        }

        let record = self.store.update_bridge(&id, |r| {
            r.retry_count += 1;
            r.updated_at = Utc::now();
            Ok::<_, BridgeError>(())
        })?;
        info!(
            bridge_id = %id,
            voting_round_id,
            retry = record.retry_count,
            "Retrying proof retrieval"
        );

        let result = self
            .attestation
            .resume_proof(voting_round_id, &request_bytes)
            .await;
        self.settle_proof(&id, result).await
    }

    /// Mint vault shares for a completed bridge. Safe to call repeatedly.
    pub async fn complete_bridge_with_vault_minting(&self, id: &str) -> Result<BridgeRecord, BridgeError> {
        let _guard = self.locks.lock(id).await;
        self.vault_mint_locked(id).await
    }

    async fn vault_mint_locked(&self, id: &str) -> Result<BridgeRecord, BridgeError> {
        let record = self.get_bridge(id)?;
        if record.shares_minted() {
            return self.repair_minted_status(record);
        }

        let amount = record
            .destination_amount_received
            .ok_or_else(|| BridgeError::missing(id, "destination_amount_received"))?;
        if !matches!(
            record.status,
            BridgeStatus::Completed | BridgeStatus::VaultMinting | BridgeStatus::VaultMintFailed
        ) {
            return Err(BridgeError::InvalidState {
                id: id.to_string(),
                status: record.status.to_string(),
                operation: "mint vault shares for",
            });
        }

        let (record, _) = self.store.try_update_bridge(id, |r| {
            if r.shares_minted() {
                return Ok::<_, BridgeError>(false);
            }
            r.transition(BridgeStatus::VaultMinting)?;
            Ok(true)
        })?;
        if record.shares_minted() {
            return self.repair_minted_status(record);
        }

        let minted = match self
            .shares
            .mint_shares(&record.vault_id, &record.wallet_address, amount)
            .await
        {
            Ok(minted) => minted,
            Err(e) => {
                let message = e.to_string();
                let record = self.store.update_bridge(id, |r| {
                    r.transition(BridgeStatus::VaultMintFailed)?;
                    r.record_failure(FailureKind::VaultOperation, message.clone());
                    Ok::<_, BridgeError>(())
                })?;
                warn!(bridge_id = id, "Vault share minting failed: {}", message);
                return Ok(record);
            }
        };

        // The hash goes in first; its presence alone marks the shares as minted.
        let (record, recorded) = self.store.try_update_bridge(id, |r| {
            if r.vault_mint_tx_hash.is_some() {
                return Ok::<_, BridgeError>(false);
            }
            r.vault_mint_tx_hash = Some(minted.tx_hash.clone());
            r.position_id = Some(minted.position_id.clone());
            r.updated_at = Utc::now();
            Ok(true)
        })?;
        if !recorded {
            error!(
                bridge_id = id,
                tx_hash = %minted.tx_hash,
                "Vault mint hash already recorded, ignoring second mint"
            );
            return self.repair_minted_status(record);
        }

        let now = Utc::now();
        self.store.credit_position(
            &minted.position_id,
            &record.wallet_address,
            &record.vault_id,
            id,
            amount,
            now,
        )?;
        let record = self.store.update_bridge(id, |r| {
            r.transition(BridgeStatus::VaultMinted)?;
            r.vault_minted_at = Some(now);
            r.clear_failure();
            Ok::<_, BridgeError>(())
        })?;

        info!(
            bridge_id = id,
            position_id = %minted.position_id,
            vault_mint_tx_hash = %minted.tx_hash,
            "Vault shares minted"
        );
        Ok(record)
    }

    /// A recorded vault mint hash is authoritative; bring status and position in line.
    fn repair_minted_status(&self, record: BridgeRecord) -> Result<BridgeRecord, BridgeError> {
        if record.status == BridgeStatus::VaultMinted {
            return Ok(record);
        }
        let id = record.id.clone();
        if let (Some(position_id), Some(amount)) =
            (record.position_id.as_deref(), record.destination_amount_received)
        {
            self.store.credit_position(
                position_id,
                &record.wallet_address,
                &record.vault_id,
                &id,
                amount,
                Utc::now(),
            )?;
        }
        let record = self.store.update_bridge(&id, |r| {
            if r.status.can_transition_to(BridgeStatus::VaultMinted) {
                r.transition(BridgeStatus::VaultMinted)?;
                r.vault_minted_at.get_or_insert_with(Utc::now);
                r.clear_failure();
            }
            Ok::<_, BridgeError>(())
        })?;
        info!(bridge_id = %id, status = %record.status, "Status repaired from vault mint hash");
        Ok(record)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EXPIRY & RECONCILIATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cancel the bridge if its payment window has lapsed.
    ///
    /// Does not take the record lock: the expiry check is repeated inside the
    /// compare-and-swap, and paid records never carry an expiry.
    pub async fn expire_bridge(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BridgeRecord>, BridgeError> {
        let mut watched = false;
        let (record, cancelled) = self.store.try_update_bridge(id, |r| {
            watched = r.status == BridgeStatus::AwaitingPayment;
            Ok::<_, BridgeError>(r.cancel_expired(now))
        })?;
        if !cancelled {
            return Ok(None);
        }
        if watched {
            if let Some(agent) = &record.agent_source_address {
                self.watcher.remove_agent_address(agent).await;
            }
        }
        info!(bridge_id = id, "Bridge expired and cancelled");
        Ok(Some(record))
    }

    /// Resume a stuck or recoverably failed bridge from the right step.
    ///
    /// | state                                  | action                          |
    /// |----------------------------------------|---------------------------------|
    /// | vault mint hash set, status stale      | repair status                   |
    /// | `fdc_timeout`                          | retry proof                     |
    /// | `completed`, `vault_mint_failed`       | retry vault mint                |
    /// | `fdc_proof_generated`                  | resume mint                     |
    /// | `xrpl_confirmed`                       | resume or regenerate proof      |
    /// | `failed` + recoverable kind            | deepest persisted step onward   |
    /// | anything else                          | not recoverable                 |
    pub async fn reconcile_bridge(&self, id: &str) -> Result<ReconcileOutcome, BridgeError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            let record = self.get_bridge(id)?;
            return Ok(ReconcileOutcome::new(id, ReconcileAction::Busy, record.status));
        };
        let record = self.get_bridge(id)?;
        debug!(bridge_id = id, status = %record.status, "Reconciling bridge");

        if record.shares_minted() {
            if record.status == BridgeStatus::VaultMinted {
                return Ok(ReconcileOutcome::new(id, ReconcileAction::Skipped, record.status));
            }
            let record = self.repair_minted_status(record)?;
            return Ok(ReconcileOutcome::new(id, ReconcileAction::RepairedStatus, record.status));
        }

        let (action, record) = match record.status {
            BridgeStatus::FdcTimeout => (
                ReconcileAction::RetriedProof,
                self.resume_proof_locked(record).await?,
            ),
            BridgeStatus::Completed | BridgeStatus::VaultMintFailed => (
                ReconcileAction::RetriedVaultMint,
                self.vault_mint_locked(id).await?,
            ),
            BridgeStatus::FdcProofGenerated => {
                (ReconcileAction::ResumedMint, self.mint_locked(record).await?)
            }
            BridgeStatus::XrplConfirmed => self.resume_confirmed(record).await?,
            BridgeStatus::Failed => match record.failure_kind {
                Some(kind) if kind.is_recoverable() => self.resume_failed(record).await?,
                kind => {
                    let outcome = ReconcileOutcome::new(id, ReconcileAction::NotRecoverable, record.status)
                        .with_detail(format!("failure kind {:?}", kind));
                    return Ok(outcome);
                }
            },
            BridgeStatus::VaultMinting => {
                return Ok(ReconcileOutcome::new(id, ReconcileAction::NotRecoverable, record.status)
                    .with_detail("vault mint outcome unknown, needs manual review"));
            }
            BridgeStatus::Pending
            | BridgeStatus::Bridging
            | BridgeStatus::AwaitingPayment
            | BridgeStatus::VaultMinted
            | BridgeStatus::Cancelled => {
                return Ok(ReconcileOutcome::new(id, ReconcileAction::Skipped, record.status));
            }
        };

        Ok(ReconcileOutcome::new(id, action, record.status))
    }

    async fn resume_confirmed(
        &self,
        record: BridgeRecord,
    ) -> Result<(ReconcileAction, BridgeRecord), BridgeError> {
        if record.stored_ticket().is_some() {
            return Ok((ReconcileAction::RetriedProof, self.resume_proof_locked(record).await?));
        }
        let source_tx_hash = record
            .source_tx_hash
            .clone()
            .ok_or_else(|| BridgeError::missing(&record.id, "source_tx_hash"))?;
        Ok((
            ReconcileAction::RegeneratedProof,
            self.attest_locked(record, &source_tx_hash).await?,
        ))
    }

    /// Pick up a recoverably failed bridge at the deepest step whose output was persisted.
    async fn resume_failed(
        &self,
        record: BridgeRecord,
    ) -> Result<(ReconcileAction, BridgeRecord), BridgeError> {
        let id = record.id.clone();

        if record.destination_tx_hash.is_some() || record.proof.is_some() {
            return Ok((ReconcileAction::ResumedMint, self.mint_locked(record).await?));
        }
        if record.stored_ticket().is_some() {
            // Failed → fdc_timeout keeps the paid attestation in the retry path.
            let record = self.store.update_bridge(&id, |r| {
                r.transition(BridgeStatus::FdcTimeout)?;
                Ok::<_, BridgeError>(())
            })?;
            return Ok((ReconcileAction::RetriedProof, self.resume_proof_locked(record).await?));
        }
        let Some(source_tx_hash) = record.source_tx_hash.clone() else {
            return Err(BridgeError::missing(&id, "source_tx_hash"));
        };
        let record = self.store.update_bridge(&id, |r| {
            r.transition(BridgeStatus::XrplConfirmed)?;
            r.clear_failure();
            Ok::<_, BridgeError>(())
        })?;
        Ok((
            ReconcileAction::RegeneratedProof,
            self.attest_locked(record, &source_tx_hash).await?,
        ))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // FAILURE BOOKKEEPING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Mirror `err` onto the record and hand it back for propagation.
    fn fail_bridge(&self, id: &str, kind: FailureKind, err: BridgeError) -> BridgeError {
        let message = err.to_string();
        let persisted = self.store.update_bridge(id, |r| {
            if r.fail(kind, message.clone()).is_err() {
                r.record_failure(kind, message.clone());
            }
            Ok::<_, BridgeError>(())
        });
        match persisted {
            Ok(record) => warn!(
                bridge_id = id,
                status = %record.status,
                failure_kind = ?kind,
                "Bridge step failed: {}",
                message
            ),
            Err(e) => error!(bridge_id = id, "Could not persist failure ({}): {}", message, e),
        }
        err
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PURE HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Payment instruction for a reserved bridge. Every reservation field must be
/// present and the reservation must still be open.
pub fn payment_instruction(
    record: &BridgeRecord,
    network: SourceNetwork,
    now: DateTime<Utc>,
) -> Result<PaymentInstruction, BridgeError> {
    let destination = record
        .agent_source_address
        .clone()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| BridgeError::missing(&record.id, "agent_source_address"))?;
    let memo = record
        .source_payment_reference
        .clone()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| BridgeError::missing(&record.id, "source_payment_reference"))?;
    let amount_raw = record
        .total_amount_raw
        .ok_or_else(|| BridgeError::missing(&record.id, "total_amount_raw"))?;
    let expiry = record
        .reservation_expiry
        .ok_or_else(|| BridgeError::missing(&record.id, "reservation_expiry"))?;
    if expiry <= now {
        return Err(BridgeError::Expired {
            id: record.id.clone(),
        });
    }

    Ok(PaymentInstruction {
        bridge_id: record.id.clone(),
        destination,
        amount: Amount::from_raw(amount_raw),
        amount_raw,
        memo,
        network,
    })
}

/// Check a source transaction pays this bridge's reservation in full.
pub fn validate_payment(
    record: &BridgeRecord,
    tx: &SourceTransaction,
    now: DateTime<Utc>,
    config: &BridgeConfig,
) -> Result<(), BridgeError> {
    let invalid = |reason: String| -> Result<(), BridgeError> {
        Err(BridgeError::InvalidSourceTransaction(format!("{}: {}", tx.hash, reason)))
    };

    check_ledger_transaction(tx, now, config)?;

    let agent = record
        .agent_source_address
        .as_deref()
        .ok_or_else(|| BridgeError::missing(&record.id, "agent_source_address"))?;
    if tx.destination != agent {
        return invalid(format!("paid {} instead of agent {}", tx.destination, agent));
    }
    let reference = record
        .source_payment_reference
        .as_deref()
        .ok_or_else(|| BridgeError::missing(&record.id, "source_payment_reference"))?;
    if !tx.memo_matches(reference) {
        return invalid("memo does not carry the payment reference".into());
    }
    let due = Amount::from_raw(
        record
            .total_amount_raw
            .ok_or_else(|| BridgeError::missing(&record.id, "total_amount_raw"))?,
    );
    if tx.delivered_amount < due {
        return invalid(format!("delivered {} but {} is due", tx.delivered_amount, due));
    }
    Ok(())
}

/// Finality and timestamp sanity shared by both directions.
pub(crate) fn check_ledger_transaction(
    tx: &SourceTransaction,
    now: DateTime<Utc>,
    config: &BridgeConfig,
) -> Result<(), BridgeError> {
    let invalid = |reason: &str| -> Result<(), BridgeError> {
        Err(BridgeError::InvalidSourceTransaction(format!("{}: {}", tx.hash, reason)))
    };

    if !tx.validated {
        return invalid("not in a validated ledger");
    }
    if !tx.succeeded {
        return invalid("transaction did not succeed");
    }
    if tx.timestamp > now + config.max_clock_skew {
        return invalid("timestamp is in the future");
    }
    if tx.timestamp < now - config.max_source_tx_age {
        return invalid("timestamp is older than the accepted window");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxrp_common::CollateralReservation;

    fn reserved(now: DateTime<Utc>) -> BridgeRecord {
        let mut record = BridgeRecord::new("0xuser", "vault-1", Amount::from_units(100), now, Duration::minutes(15));
        record.apply_reservation(
            &CollateralReservation {
                reservation_id: "7".into(),
                agent_vault_address: "0xagent".into(),
                agent_source_address: "rAgent".into(),
                payment_reference: "0x4642505266410001".into(),
                value_raw: 99_750_000,
                fee_raw: 250_000,
                expires_at: now + Duration::minutes(15),
            },
            now,
        );
        record
    }

    fn payment(now: DateTime<Utc>, amount: Amount) -> SourceTransaction {
        SourceTransaction {
            hash: "ABC".into(),
            validated: true,
            succeeded: true,
            timestamp: now - Duration::seconds(5),
            source: "rUser".into(),
            destination: "rAgent".into(),
            delivered_amount: amount,
            memo: Some("0x4642505266410001".into()),
        }
    }

    #[test]
    fn instruction_carries_total_and_memo() {
        let now = Utc::now();
        let instruction = payment_instruction(&reserved(now), SourceNetwork::Testnet, now).unwrap();
        assert_eq!(instruction.destination, "rAgent");
        assert_eq!(instruction.amount_raw, 100_000_000);
        assert_eq!(instruction.amount.to_string(), "100.000000");
        assert_eq!(instruction.memo, "0x4642505266410001");
    }

    #[test]
    fn instruction_rejects_missing_fields_and_lapsed_reservations() {
        let now = Utc::now();
        let bare = BridgeRecord::new("0xuser", "vault-1", Amount::from_units(1), now, Duration::minutes(15));
        assert!(matches!(
            payment_instruction(&bare, SourceNetwork::Testnet, now),
            Err(BridgeError::MissingField { field: "agent_source_address", .. })
        ));
        assert!(matches!(
            payment_instruction(&reserved(now), SourceNetwork::Testnet, now + Duration::minutes(16)),
            Err(BridgeError::Expired { .. })
        ));
    }

    #[test]
    fn payment_validation() {
        let now = Utc::now();
        let record = reserved(now);
        let config = BridgeConfig::default();

        assert!(validate_payment(&record, &payment(now, Amount::from_units(100)), now, &config).is_ok());

        let short = payment(now, Amount::from_units(99));
        assert!(validate_payment(&record, &short, now, &config).is_err());

        let mut wrong_memo = payment(now, Amount::from_units(100));
        wrong_memo.memo = Some("0x4642505266410002".into());
        assert!(validate_payment(&record, &wrong_memo, now, &config).is_err());

        let mut future = payment(now, Amount::from_units(100));
        future.timestamp = now + Duration::hours(1);
        assert!(validate_payment(&record, &future, now, &config).is_err());

        let mut ancient = payment(now, Amount::from_units(100));
        ancient.timestamp = now - Duration::days(400);
        assert!(validate_payment(&record, &ancient, now, &config).is_err());

        let mut pending = payment(now, Amount::from_units(100));
        pending.validated = false;
        assert!(matches!(
            validate_payment(&record, &pending, now, &config),
            Err(BridgeError::InvalidSourceTransaction(_))
        ));
    }
}
