//! End-to-end bridge and redemption flows against the simulated stack.
//!
//! Tests run on a paused clock: the round wait and the proof polling ceiling
//! elapse instantly. Record timestamps still come from the wall clock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use fxrp_common::{
    Amount, AttestationProof, BridgeRecord, BridgeStatus, CollateralReservation, FailureKind,
    PaymentEvent, PaymentTarget, RedemptionRecord, RedemptionStatus, RedemptionTicket,
    CANCELLATION_EXPIRED,
};
use fxrp_engine::simulated::{SimulatedBackend, SimulatedStack};
use fxrp_engine::{
    BackendError, BridgeConfig, BridgeError, CreateBridgeRequest, CreateRedemptionRequest, Engine,
    EngineParts, ReconcileAction, RecordStore, SettlementBackend, SimulatedConfig,
};
use fxrp_fdc::{AttestationConfig, RoundSchedule};

const OFFSET: u64 = 1_658_430_000;
const DURATION: u64 = 90;
const ROUND: u64 = 12_345;
const USER: &str = "0x00000000000000000000000000000000000000aa";
const USER_SOURCE: &str = "rUserPayoutAddressXXXXXXXXXXXXXXXX";
const VAULT: &str = "vault-main";

struct Harness {
    engine: Engine,
    sim: SimulatedStack,
}

fn harness(config: SimulatedConfig) -> Harness {
    harness_with(config, |sim| sim.backend.clone())
}

fn harness_with(
    config: SimulatedConfig,
    backend: impl FnOnce(&SimulatedStack) -> Arc<dyn SettlementBackend>,
) -> Harness {
    let sim = SimulatedStack::new(config, RoundSchedule::new(OFFSET, DURATION));
    sim.attestation.set_block_timestamp(OFFSET + ROUND * DURATION);

    let engine = Engine::new(EngineParts {
        store: RecordStore::in_memory().unwrap(),
        backend: backend(&sim),
        attestation: Arc::new(sim.attestation_client(AttestationConfig::default())),
        ledger: sim.ledger.clone(),
        shares: sim.shares.clone(),
        config: BridgeConfig::default(),
    });
    Harness { engine, sim }
}

/// Create and reserve a bridge for `units`, then record the user's payment.
async fn reserved_and_paid(h: &Harness, units: u64) -> (BridgeRecord, PaymentEvent) {
    let record = h
        .engine
        .bridges
        .create_bridge(CreateBridgeRequest {
            wallet_address: USER.into(),
            vault_id: VAULT.into(),
            amount: Amount::from_units(units),
        })
        .unwrap();
    let record = h.engine.bridges.reserve_collateral_quick(&record.id).await.unwrap();
    let instruction = h.engine.bridges.build_payment_request(&record).unwrap();

    let tx = h.sim.ledger.record_payment(
        "rUserSourceXXXXXXXXXXXXXXXXXXXXXXX",
        &instruction.destination,
        instruction.amount,
        &instruction.memo,
        Utc::now(),
    );
    let event = PaymentEvent {
        target: PaymentTarget::Bridge(record.id.clone()),
        tx_hash: tx.hash,
        amount: tx.delivered_amount,
        from_address: tx.source,
        to_address: tx.destination,
    };
    (record, event)
}

async fn minted_bridge(h: &Harness, units: u64) -> BridgeRecord {
    let (_, event) = reserved_and_paid(h, units).await;
    h.engine.bridges.handle_payment(&event).await.unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════════
// FORWARD FLOW
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn payment_is_proven_minted_and_deposited() {
    let h = harness(SimulatedConfig::default());
    let (reserved, event) = reserved_and_paid(&h, 100).await;

    assert_eq!(reserved.status, BridgeStatus::AwaitingPayment);
    assert_eq!(reserved.reserved_value_raw, Some(99_750_000));
    assert_eq!(reserved.reserved_fee_raw, Some(250_000));
    assert_eq!(reserved.total_amount_raw, Some(100_000_000));
    assert!(h.engine.watcher.is_watching_agent(&h.sim.backend.config().agent_source_address));

    let record = h.engine.bridges.handle_payment(&event).await.unwrap();

    assert_eq!(record.status, BridgeStatus::VaultMinted);
    assert_eq!(record.voting_round_id, Some(ROUND));
    assert_eq!(record.destination_amount_received.unwrap().to_string(), "99.750000");
    assert!(record.position_id.is_some());
    assert!(record.vault_mint_tx_hash.is_some());
    assert!(record.expires_at.is_none());
    assert!(record.failure_kind.is_none());
    assert!(!h.engine.watcher.is_watching_agent(&h.sim.backend.config().agent_source_address));

    let position = h
        .engine
        .store()
        .get_position(record.position_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(position.shares.to_string(), "99.750000");
    assert_eq!(position.bridge_ids, vec![record.id.clone()]);

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["status"], "vault_minted");
    assert!(!json["position_id"].is_null());
}

#[tokio::test(start_paused = true)]
async fn minted_amount_comes_from_the_destination() {
    let h = harness(SimulatedConfig {
        fee_bips: 0,
        mint_shortfall: Amount::from_raw(5_000),
        ..SimulatedConfig::default()
    });
    let record = minted_bridge(&h, 20).await;

    assert_eq!(record.destination_amount_expected.to_string(), "20.000000");
    assert_eq!(record.destination_amount_received.unwrap().to_string(), "19.995000");
    assert_eq!(record.status, BridgeStatus::VaultMinted);
}

#[tokio::test(start_paused = true)]
async fn fractional_lots_are_rejected() {
    let h = harness(SimulatedConfig::default());
    let err = h
        .engine
        .bridges
        .create_bridge(CreateBridgeRequest {
            wallet_address: USER.into(),
            vault_id: VAULT.into(),
            amount: Amount::from_raw(1_500_000),
        })
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidRequest(_)));
}

#[tokio::test(start_paused = true)]
async fn underpayment_fails_the_bridge() {
    let h = harness(SimulatedConfig::default());
    let (reserved, _) = reserved_and_paid(&h, 10).await;
    let short = h.sim.ledger.record_payment(
        "rUserSourceXXXXXXXXXXXXXXXXXXXXXXX",
        reserved.agent_source_address.as_deref().unwrap(),
        Amount::from_units(5),
        reserved.source_payment_reference.as_deref().unwrap(),
        Utc::now(),
    );

    let err = h
        .engine
        .bridges
        .execute_minting_with_proof(&reserved.id, &short.hash)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidSourceTransaction(_)));

    let record = h.engine.bridges.get_bridge(&reserved.id).unwrap();
    assert_eq!(record.status, BridgeStatus::Failed);
    assert_eq!(record.failure_kind, Some(FailureKind::InvalidSourceTransaction));
    assert_eq!(h.sim.attestation.submissions(), 0);
}

/// Reports a reservation whose fee cannot be added to its value.
struct OverflowingReservations(Arc<SimulatedBackend>);

#[async_trait]
impl SettlementBackend for OverflowingReservations {
    fn name(&self) -> &'static str {
        "overflowing"
    }

    fn lot_size(&self) -> Amount {
        self.0.lot_size()
    }

    async fn reserve_collateral(
        &self,
        bridge_id: &str,
        amount: Amount,
    ) -> Result<CollateralReservation, BackendError> {
        let mut reservation = self.0.reserve_collateral(bridge_id, amount).await?;
        reservation.fee_raw = u128::MAX;
        Ok(reservation)
    }

    async fn submit_mint(&self, reservation_id: &str, proof: &AttestationProof) -> Result<String, BackendError> {
        self.0.submit_mint(reservation_id, proof).await
    }

    async fn minted_amount(&self, tx_hash: &str) -> Result<Amount, BackendError> {
        self.0.minted_amount(tx_hash).await
    }

    async fn request_redemption(
        &self,
        redemption_id: &str,
        amount: Amount,
        receiver_source_address: &str,
    ) -> Result<RedemptionTicket, BackendError> {
        self.0
            .request_redemption(redemption_id, amount, receiver_source_address)
            .await
    }

    async fn confirm_redemption_payment(
        &self,
        request_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError> {
        self.0.confirm_redemption_payment(request_id, proof).await
    }
}

#[tokio::test(start_paused = true)]
async fn inconsistent_reservation_fails_the_bridge() {
    let h = harness_with(SimulatedConfig::default(), |sim| {
        Arc::new(OverflowingReservations(sim.backend.clone()))
    });
    let record = h
        .engine
        .bridges
        .create_bridge(CreateBridgeRequest {
            wallet_address: USER.into(),
            vault_id: VAULT.into(),
            amount: Amount::from_units(10),
        })
        .unwrap();

    let err = h
        .engine
        .bridges
        .reserve_collateral_quick(&record.id)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidRequest(_)));

    let stored = h.engine.bridges.get_bridge(&record.id).unwrap();
    assert_eq!(stored.status, BridgeStatus::Failed);
    assert_eq!(stored.failure_kind, Some(FailureKind::ReservationFailed));
    assert!(stored.collateral_reservation_id.is_some());
    assert!(!h.engine.watcher.is_watching_agent(&h.sim.backend.config().agent_source_address));

    let outcome = h.engine.bridges.reconcile_bridge(&record.id).await.unwrap();
    assert_eq!(outcome.action, ReconcileAction::NotRecoverable);
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROOF TIMEOUT
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn unfinalized_proof_parks_the_bridge_for_retry() {
    let h = harness(SimulatedConfig::default());
    h.sim.attestation.withhold_proofs(true);
    let record = minted_bridge(&h, 10).await;

    assert_eq!(record.status, BridgeStatus::FdcTimeout);
    assert_eq!(record.failure_kind, Some(FailureKind::ProofTimeout));
    assert_eq!(record.voting_round_id, Some(ROUND));
    assert!(record.attestation_request_bytes.is_some());
    assert!(record.attestation_tx_hash.is_some());
    assert_eq!(h.sim.backend.mint_submissions(), 0);

    h.sim.attestation.withhold_proofs(false);
    let record = h.engine.bridges.retry_proof_generation(&record.id).await.unwrap();

    assert_eq!(record.status, BridgeStatus::VaultMinted);
    assert_eq!(record.retry_count, 1);
    // The paid attestation was reused.
    assert_eq!(h.sim.attestation.submissions(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_outside_timeout_is_rejected() {
    let h = harness(SimulatedConfig::default());
    let (reserved, _) = reserved_and_paid(&h, 10).await;
    let err = h
        .engine
        .bridges
        .retry_proof_generation(&reserved.id)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidState { .. }));
}

// ═══════════════════════════════════════════════════════════════════════════════
// IDEMPOTENCY
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn finished_bridges_ignore_retries() {
    let h = harness(SimulatedConfig::default());
    let (_, event) = reserved_and_paid(&h, 10).await;
    let record = h.engine.bridges.handle_payment(&event).await.unwrap();
    assert_eq!(record.status, BridgeStatus::VaultMinted);

    let again = h.engine.bridges.complete_bridge_with_vault_minting(&record.id).await.unwrap();
    assert_eq!(again.status, BridgeStatus::VaultMinted);
    assert_eq!(again.vault_mint_tx_hash, record.vault_mint_tx_hash);

    let retried = h.engine.bridges.retry_proof_generation(&record.id).await.unwrap();
    assert_eq!(retried.status, BridgeStatus::VaultMinted);

    let err = h.engine.bridges.handle_payment(&event).await.unwrap_err();
    assert!(matches!(err, BridgeError::Terminal { .. }));

    assert_eq!(h.sim.backend.mint_submissions(), 1);
    assert_eq!(h.sim.shares.mints(), 1);
    assert_eq!(h.sim.attestation.submissions(), 1);
}

#[tokio::test(start_paused = true)]
async fn redelivered_payment_reuses_the_paid_attestation() {
    let h = harness(SimulatedConfig::default());
    h.sim.attestation.withhold_proofs(true);
    let (reserved, event) = reserved_and_paid(&h, 10).await;
    let parked = h.engine.bridges.handle_payment(&event).await.unwrap();
    assert_eq!(parked.status, BridgeStatus::FdcTimeout);
    assert_eq!(h.sim.attestation.submissions(), 1);

    // The process stopped after the ticket was stored, before the proof wait ended.
    h.engine
        .store()
        .update_bridge::<_, BridgeError>(&reserved.id, |r| {
            r.status = BridgeStatus::XrplConfirmed;
            r.clear_failure();
            Ok(())
        })
        .unwrap();
    h.sim.attestation.withhold_proofs(false);

    let record = h.engine.bridges.handle_payment(&event).await.unwrap();
    assert_eq!(record.status, BridgeStatus::VaultMinted);
    assert_eq!(record.attestation_tx_hash, parked.attestation_tx_hash);
    assert_eq!(record.retry_count, 1);
    assert_eq!(h.sim.attestation.submissions(), 1);
    assert_eq!(h.sim.backend.mint_submissions(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_vault_mints_mint_once() {
    let h = harness(SimulatedConfig::default());
    h.sim.shares.fail_next(1);
    let record = minted_bridge(&h, 10).await;
    assert_eq!(record.status, BridgeStatus::VaultMintFailed);
    assert_eq!(record.failure_kind, Some(FailureKind::VaultOperation));

    let bridges = h.engine.bridges.clone();
    let (a, b) = tokio::join!(
        bridges.complete_bridge_with_vault_minting(&record.id),
        bridges.complete_bridge_with_vault_minting(&record.id),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.status, BridgeStatus::VaultMinted);
    assert_eq!(b.status, BridgeStatus::VaultMinted);
    assert_eq!(a.vault_mint_tx_hash, b.vault_mint_tx_hash);
    assert_eq!(h.sim.shares.mints(), 1);

    let position = h
        .engine
        .store()
        .get_position(a.position_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(position.shares.to_string(), "9.975000");
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXPIRY
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn lapsed_reservations_are_cancelled_for_good() {
    let h = harness(SimulatedConfig::default());
    let (reserved, event) = reserved_and_paid(&h, 10).await;
    let agent = reserved.agent_source_address.clone().unwrap();

    let report = h
        .engine
        .reconciler
        .sweep_expired(Utc::now() + Duration::minutes(16))
        .await
        .unwrap();
    assert_eq!(report.cancelled, vec![reserved.id.clone()]);
    assert!(report.errors.is_empty());

    let record = h.engine.bridges.get_bridge(&reserved.id).unwrap();
    assert_eq!(record.status, BridgeStatus::Cancelled);
    assert_eq!(record.cancellation_reason.as_deref(), Some(CANCELLATION_EXPIRED));
    assert_eq!(record.failure_kind, Some(FailureKind::ReservationExpired));
    assert!(!h.engine.watcher.is_watching_agent(&agent));

    // A late payment cannot revive it.
    let err = h.engine.bridges.handle_payment(&event).await.unwrap_err();
    assert!(matches!(err, BridgeError::Terminal { .. }));
    let outcome = h.engine.bridges.reconcile_bridge(&reserved.id).await.unwrap();
    assert_eq!(outcome.action, ReconcileAction::Skipped);
    assert_eq!(h.engine.bridges.get_bridge(&reserved.id).unwrap().status, BridgeStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn paid_bridges_never_expire() {
    let h = harness(SimulatedConfig::default());
    let record = minted_bridge(&h, 10).await;

    let report = h
        .engine
        .reconciler
        .sweep_expired(Utc::now() + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(h.engine.bridges.get_bridge(&record.id).unwrap().status, BridgeStatus::VaultMinted);
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECONCILIATION
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn recovery_finishes_interrupted_bridges() {
    let h = harness(SimulatedConfig::default());

    h.sim.shares.fail_next(1);
    let vault_failed = minted_bridge(&h, 10).await;
    assert_eq!(vault_failed.status, BridgeStatus::VaultMintFailed);

    h.sim.attestation.withhold_proofs(true);
    let timed_out = minted_bridge(&h, 20).await;
    assert_eq!(timed_out.status, BridgeStatus::FdcTimeout);
    h.sim.attestation.withhold_proofs(false);

    let done = minted_bridge(&h, 30).await;

    let report = h.engine.reconciler.recover_all().await.unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(report.count(ReconcileAction::RetriedVaultMint), 1);
    assert_eq!(report.count(ReconcileAction::RetriedProof), 1);
    assert!(report.outcomes.iter().all(|o| o.id != done.id));

    for id in [&vault_failed.id, &timed_out.id] {
        assert_eq!(h.engine.bridges.get_bridge(id).unwrap().status, BridgeStatus::VaultMinted);
    }
    assert_eq!(h.sim.backend.mint_submissions(), 3);
}

#[tokio::test(start_paused = true)]
async fn uncertain_mint_resumes_from_the_broadcast_transaction() {
    let h = harness(SimulatedConfig::default());
    h.sim.backend.lose_next_receipts(1);
    let (reserved, event) = reserved_and_paid(&h, 10).await;

    let err = h.engine.bridges.handle_payment(&event).await.unwrap_err();
    assert!(matches!(err, BridgeError::Backend(BackendError::ReceiptUnavailable { .. })));
    let failed = h.engine.bridges.get_bridge(&reserved.id).unwrap();
    assert_eq!(failed.status, BridgeStatus::Failed);
    assert_eq!(failed.failure_kind, Some(FailureKind::MintSubmissionUncertain));
    assert!(failed.destination_tx_hash.is_some());
    assert_eq!(h.engine.store().recoverable_bridges().unwrap().len(), 1);

    let outcome = h.engine.bridges.reconcile_bridge(&reserved.id).await.unwrap();
    assert_eq!(outcome.action, ReconcileAction::ResumedMint);
    assert_eq!(outcome.status, "vault_minted");

    let record = h.engine.bridges.get_bridge(&reserved.id).unwrap();
    assert_eq!(record.destination_tx_hash, failed.destination_tx_hash);
    assert_eq!(record.destination_amount_received.unwrap().to_string(), "9.975000");
    assert!(record.failure_kind.is_none());
    assert_eq!(h.sim.backend.mint_submissions(), 1);
    assert_eq!(h.sim.attestation.submissions(), 1);
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_failures_are_left_alone() {
    let h = harness(SimulatedConfig::default());
    let (reserved, _) = reserved_and_paid(&h, 10).await;
    let bogus = h.sim.ledger.record_payment(
        "rUserSourceXXXXXXXXXXXXXXXXXXXXXXX",
        "rSomeoneElseXXXXXXXXXXXXXXXXXXXXXX",
        Amount::from_units(10),
        reserved.source_payment_reference.as_deref().unwrap(),
        Utc::now(),
    );
    h.engine
        .bridges
        .execute_minting_with_proof(&reserved.id, &bogus.hash)
        .await
        .unwrap_err();

    let outcome = h.engine.bridges.reconcile_bridge(&reserved.id).await.unwrap();
    assert_eq!(outcome.action, ReconcileAction::NotRecoverable);
    assert_eq!(outcome.status, "failed");
}

// ═══════════════════════════════════════════════════════════════════════════════
// REDEMPTION
// ═══════════════════════════════════════════════════════════════════════════════

async fn payout_event(h: &Harness, redemption_id: &str) -> PaymentEvent {
    let record = h.engine.redemptions.get_redemption(redemption_id).unwrap();
    let tx = h.sim.ledger.record_payment(
        &h.sim.backend.config().agent_source_address,
        &record.user_source_address,
        Amount::from_raw(record.expected_payout_raw.unwrap()),
        record.payment_reference.as_deref().unwrap(),
        Utc::now(),
    );
    PaymentEvent {
        target: PaymentTarget::Redemption(redemption_id.to_string()),
        tx_hash: tx.hash,
        amount: tx.delivered_amount,
        from_address: tx.source,
        to_address: tx.destination,
    }
}

#[tokio::test(start_paused = true)]
async fn redemption_pays_out_and_debits_the_position() {
    let h = harness(SimulatedConfig::default());
    let bridge = minted_bridge(&h, 100).await;
    let position_id = bridge.position_id.clone().unwrap();

    let record = h
        .engine
        .redemptions
        .create_redemption(CreateRedemptionRequest {
            wallet_address: USER.to_uppercase().replacen("0X", "0x", 1),
            user_source_address: USER_SOURCE.into(),
            position_id: position_id.clone(),
            share_amount: Amount::from_units(50),
        })
        .unwrap();
    let record = h.engine.redemptions.request_redemption(&record.id).await.unwrap();

    assert_eq!(record.status, RedemptionStatus::AwaitingPayout);
    assert_eq!(record.expected_payout_raw, Some(50_000_000));
    assert!(h.engine.watcher.is_watching_user(USER_SOURCE));
    assert_eq!(h.sim.shares.redemptions(), 1);

    let event = payout_event(&h, &record.id).await;
    let record = h.engine.redemptions.handle_payout(&event).await.unwrap();

    assert_eq!(record.status, RedemptionStatus::Completed);
    assert_eq!(record.voting_round_id, Some(ROUND));
    assert_eq!(record.xrp_sent.unwrap().to_string(), "50.000000");
    assert!(record.confirmation_tx_hash.is_some());
    assert!(!h.engine.watcher.is_watching_user(USER_SOURCE));

    let position = h.engine.store().get_position(&position_id).unwrap().unwrap();
    assert_eq!(position.shares.to_string(), "49.750000");
    let withdrawal = h.engine.store().withdrawal_for(&record.id).unwrap().unwrap();
    assert_eq!(withdrawal.shares.to_string(), "50.000000");

    let err = h.engine.redemptions.handle_payout(&event).await.unwrap_err();
    assert!(matches!(err, BridgeError::Terminal { .. }));
    assert_eq!(h.sim.backend.confirmation_submissions(), 1);
}

#[tokio::test(start_paused = true)]
async fn redemption_rejects_foreign_or_oversized_requests() {
    let h = harness(SimulatedConfig::default());
    let bridge = minted_bridge(&h, 10).await;
    let position_id = bridge.position_id.unwrap();

    let foreign = h.engine.redemptions.create_redemption(CreateRedemptionRequest {
        wallet_address: "0x00000000000000000000000000000000000000bb".into(),
        user_source_address: USER_SOURCE.into(),
        position_id: position_id.clone(),
        share_amount: Amount::from_units(1),
    });
    assert!(matches!(foreign, Err(BridgeError::InvalidRequest(_))));

    let oversized = h.engine.redemptions.create_redemption(CreateRedemptionRequest {
        wallet_address: USER.into(),
        user_source_address: USER_SOURCE.into(),
        position_id,
        share_amount: Amount::from_units(11),
    });
    assert!(matches!(oversized, Err(BridgeError::InvalidRequest(_))));
}

#[tokio::test(start_paused = true)]
async fn timed_out_payout_proof_is_recovered() {
    let h = harness(SimulatedConfig::default());
    let bridge = minted_bridge(&h, 10).await;

    let record = h
        .engine
        .redemptions
        .create_redemption(CreateRedemptionRequest {
            wallet_address: USER.into(),
            user_source_address: USER_SOURCE.into(),
            position_id: bridge.position_id.unwrap(),
            share_amount: Amount::from_units(9),
        })
        .unwrap();
    h.engine.redemptions.request_redemption(&record.id).await.unwrap();

    h.sim.attestation.withhold_proofs(true);
    let event = payout_event(&h, &record.id).await;
    let parked = h.engine.redemptions.handle_payout(&event).await.unwrap();
    assert_eq!(parked.status, RedemptionStatus::AwaitingProof);
    assert_eq!(parked.failure_kind, Some(FailureKind::ProofTimeout));

    h.sim.attestation.withhold_proofs(false);
    let report = h.engine.reconciler.recover_all().await.unwrap();
    let outcome = report.outcomes.iter().find(|o| o.id == record.id).unwrap();
    assert_eq!(outcome.action, ReconcileAction::RetriedProof);
    assert_eq!(outcome.status, "completed");
}

#[tokio::test(start_paused = true)]
async fn failed_share_redemption_is_retried() {
    let h = harness(SimulatedConfig::default());
    let bridge = minted_bridge(&h, 10).await;

    let record = h
        .engine
        .redemptions
        .create_redemption(CreateRedemptionRequest {
            wallet_address: USER.into(),
            user_source_address: USER_SOURCE.into(),
            position_id: bridge.position_id.unwrap(),
            share_amount: Amount::from_units(4),
        })
        .unwrap();
    h.sim.shares.fail_next(1);
    h.engine.redemptions.request_redemption(&record.id).await.unwrap_err();
    let failed = h.engine.redemptions.get_redemption(&record.id).unwrap();
    assert_eq!(failed.status, RedemptionStatus::Failed);
    assert_eq!(failed.failure_kind, Some(FailureKind::VaultOperation));

    let outcome = h.engine.redemptions.reconcile_redemption(&record.id).await.unwrap();
    assert_eq!(outcome.action, ReconcileAction::RetriedShareRedemption);
    assert_eq!(outcome.status, "awaiting_payout");
}

async fn redeem(h: &Harness, position_id: &str, units: u64) -> Result<RedemptionRecord, BridgeError> {
    let record = h.engine.redemptions.create_redemption(CreateRedemptionRequest {
        wallet_address: USER.into(),
        user_source_address: USER_SOURCE.into(),
        position_id: position_id.to_string(),
        share_amount: Amount::from_units(units),
    })?;
    h.engine.redemptions.request_redemption(&record.id).await
}

#[tokio::test(start_paused = true)]
async fn concurrent_redemptions_cannot_spend_the_same_shares() {
    let h = harness(SimulatedConfig::default());
    let bridge = minted_bridge(&h, 10).await;
    let position_id = bridge.position_id.unwrap();

    let (a, b) = tokio::join!(redeem(&h, &position_id, 9), redeem(&h, &position_id, 9));
    let (accepted, refused) = match (a, b) {
        (Ok(record), Err(err)) | (Err(err), Ok(record)) => (record, err),
        (a, b) => panic!("exactly one redemption should be accepted: {:?} / {:?}", a, b),
    };
    assert!(matches!(refused, BridgeError::InvalidRequest(_)));
    assert_eq!(accepted.status, RedemptionStatus::AwaitingPayout);
    assert_eq!(h.sim.shares.redemptions(), 1);

    let position = h.engine.store().get_position(&position_id).unwrap().unwrap();
    assert_eq!(position.available_shares().to_string(), "0.975000");

    let event = payout_event(&h, &accepted.id).await;
    let completed = h.engine.redemptions.handle_payout(&event).await.unwrap();
    assert_eq!(completed.status, RedemptionStatus::Completed);
    assert_eq!(h.sim.backend.confirmation_submissions(), 1);

    let position = h.engine.store().get_position(&position_id).unwrap().unwrap();
    assert_eq!(position.shares.to_string(), "0.975000");
    assert!(position.reserved.is_empty());

    let report = h.engine.reconciler.recover_all().await.unwrap();
    assert!(report.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stray_payment_to_the_user_leaves_the_redemption_waiting() {
    let h = harness(SimulatedConfig::default());
    let bridge = minted_bridge(&h, 10).await;
    let record = redeem(&h, bridge.position_id.as_deref().unwrap(), 9).await.unwrap();

    let stray = h.sim.ledger.record_payment(
        "rStrangerXXXXXXXXXXXXXXXXXXXXXXXXX",
        USER_SOURCE,
        Amount::from_units(1),
        "0x00",
        Utc::now(),
    );
    let stray_event = PaymentEvent {
        target: PaymentTarget::Redemption(record.id.clone()),
        tx_hash: stray.hash,
        amount: stray.delivered_amount,
        from_address: stray.source,
        to_address: stray.destination,
    };
    let err = h.engine.redemptions.handle_payout(&stray_event).await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidSourceTransaction(_)));

    let waiting = h.engine.redemptions.get_redemption(&record.id).unwrap();
    assert_eq!(waiting.status, RedemptionStatus::AwaitingPayout);
    assert!(waiting.source_payout_tx_hash.is_none());
    assert!(waiting.failure_kind.is_none());
    assert!(h.engine.watcher.is_watching_user(USER_SOURCE));
    assert_eq!(h.sim.attestation.submissions(), 1);

    let event = payout_event(&h, &record.id).await;
    let completed = h.engine.redemptions.handle_payout(&event).await.unwrap();
    assert_eq!(completed.status, RedemptionStatus::Completed);
    assert_eq!(completed.source_payout_tx_hash.as_deref(), Some(event.tx_hash.as_str()));
    assert!(!h.engine.watcher.is_watching_user(USER_SOURCE));
}
