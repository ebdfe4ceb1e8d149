//! Deterministic stand-ins for every external party.
//!
//! Used when the relayer runs in `simulated` mode and by the test suites. All
//! identifiers are derived from their inputs with keccak, so the same bridge
//! always yields the same reservation, reference and transaction hashes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ethers::utils::keccak256;
use tracing::debug;

use fxrp_common::{
    normalize_hex, Amount, AttestationProof, CollateralReservation, RedemptionTicket,
    SourceNetwork,
};
use fxrp_fdc::{
    AttestationClient, AttestationConfig, AttestationHub, DaError, DataAvailability, HubError, HubSubmission, PrepareOutcome,
    RoundSchedule, TransportError, Verifier,
};

use crate::backend::SettlementBackend;
use crate::error::BackendError;
use crate::traits::{
    position_id_for, MintedShares, RedeemedShares, ShareAccounting, SourceLedger, SourceTransaction,
};

/// Payment reference prefixes used by the asset manager.
const MINTING_REFERENCE_PREFIX: u64 = 0x4642_5052_6641_0001;
const REDEMPTION_REFERENCE_PREFIX: u64 = 0x4642_5052_6641_0002;

fn hash_hex(parts: &[&str]) -> String {
    format!("0x{}", hex::encode(keccak256(parts.join(":").as_bytes())))
}

fn derived_id(parts: &[&str]) -> u64 {
    let digest = keccak256(parts.join(":").as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    // Keep ids readable and positive when parsed as i64.
    u64::from_be_bytes(buf) >> 16
}

/// `prefix` in the top 8 bytes, `id` in the bottom 8 bytes of a bytes32.
pub fn payment_reference(prefix: u64, id: u64) -> String {
    format!("0x{:016x}{}{:016x}", prefix, "0".repeat(32), id)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SETTLEMENT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct SimulatedConfig {
    pub agent_vault_address: String,
    pub agent_source_address: String,
    /// Minting fee retained from the user's payment.
    pub fee_bips: u32,
    pub lot_size: Amount,
    pub reservation_window: Duration,
    /// Subtracted from every mint, as fee rounding on the destination would.
    pub mint_shortfall: Amount,
    /// Agent fee deducted from redemption payouts.
    pub redemption_fee_bips: u32,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            agent_vault_address: "0x5151515151515151515151515151515151515151".into(),
            agent_source_address: "rSimulatedAgentVau1tXXXXXXXXXXXXX".into(),
            fee_bips: 25,
            lot_size: Amount::from_units(1),
            reservation_window: Duration::minutes(15),
            mint_shortfall: Amount::ZERO,
            redemption_fee_bips: 0,
        }
    }
}

#[derive(Default)]
struct SettlementState {
    reservations: HashMap<String, u128>,
    mints: HashMap<String, Amount>,
    confirmations: HashSet<String>,
}

/// Settlement backend with deterministic reservations and mints.
pub struct SimulatedBackend {
    config: SimulatedConfig,
    state: Mutex<SettlementState>,
    mint_submissions: AtomicU32,
    confirmation_submissions: AtomicU32,
    lost_receipts: AtomicU32,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SettlementState::default()),
            mint_submissions: AtomicU32::new(0),
            confirmation_submissions: AtomicU32::new(0),
            lost_receipts: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    pub fn mint_submissions(&self) -> u32 {
        self.mint_submissions.load(Ordering::SeqCst)
    }

    pub fn confirmation_submissions(&self) -> u32 {
        self.confirmation_submissions.load(Ordering::SeqCst)
    }

    /// Mint receipts for the next `count` lookups cannot be read.
    pub fn lose_next_receipts(&self, count: u32) {
        self.lost_receipts.store(count, Ordering::SeqCst);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SettlementState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SettlementBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn lot_size(&self) -> Amount {
        self.config.lot_size
    }

    async fn reserve_collateral(
        &self,
        bridge_id: &str,
        amount: Amount,
    ) -> Result<CollateralReservation, BackendError> {
        let fee = amount.fee_bips(self.config.fee_bips);
        let value = amount
            .checked_sub(fee)
            .ok_or_else(|| BackendError::InvalidAmount(amount.to_string()))?;
        let id = derived_id(&["reservation", bridge_id]);
        let reservation_id = id.to_string();

        self.state()
            .reservations
            .insert(reservation_id.clone(), value.raw());
        debug!(bridge_id, %reservation_id, "Simulated collateral reservation");

        Ok(CollateralReservation {
            reservation_id,
            agent_vault_address: self.config.agent_vault_address.clone(),
            agent_source_address: self.config.agent_source_address.clone(),
            payment_reference: payment_reference(MINTING_REFERENCE_PREFIX, id),
            value_raw: value.raw(),
            fee_raw: fee.raw(),
            expires_at: Utc::now() + self.config.reservation_window,
        })
    }

    async fn submit_mint(
        &self,
        reservation_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError> {
        let mut state = self.state();
        let value = *state
            .reservations
            .get(reservation_id)
            .ok_or_else(|| BackendError::Reverted {
                tx_hash: format!("unknown reservation {}", reservation_id),
            })?;

        let tx_hash = hash_hex(&["mint", reservation_id, &proof.response_hex]);
        let minted = Amount::from_raw(value)
            .checked_sub(self.config.mint_shortfall)
            .unwrap_or(Amount::ZERO);
        state.mints.insert(tx_hash.clone(), minted);
        self.mint_submissions.fetch_add(1, Ordering::SeqCst);
        Ok(tx_hash)
    }

    async fn minted_amount(&self, tx_hash: &str) -> Result<Amount, BackendError> {
        let lost = self
            .lost_receipts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(BackendError::ReceiptUnavailable {
                tx_hash: tx_hash.to_string(),
            });
        }
        self.state()
            .mints
            .get(tx_hash)
            .copied()
            .ok_or_else(|| BackendError::TransactionNotFound(tx_hash.to_string()))
    }

    async fn request_redemption(
        &self,
        redemption_id: &str,
        amount: Amount,
        _receiver_source_address: &str,
    ) -> Result<RedemptionTicket, BackendError> {
        let lots = amount.raw() / self.config.lot_size.raw().max(1);
        if lots == 0 {
            return Err(BackendError::InvalidAmount(format!("{} is less than one lot", amount)));
        }
        let redeemed = Amount::from_raw(lots * self.config.lot_size.raw());
        let payout = redeemed
            .checked_sub(redeemed.fee_bips(self.config.redemption_fee_bips))
            .unwrap_or(Amount::ZERO);
        let id = derived_id(&["redemption", redemption_id]);

        Ok(RedemptionTicket {
            request_id: id.to_string(),
            redemption_tx_hash: hash_hex(&["redeem", redemption_id]),
            agent_vault_address: self.config.agent_vault_address.clone(),
            agent_source_address: self.config.agent_source_address.clone(),
            payment_reference: payment_reference(REDEMPTION_REFERENCE_PREFIX, id),
            expected_payout_raw: payout.raw(),
        })
    }

    async fn confirm_redemption_payment(
        &self,
        request_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError> {
        let tx_hash = hash_hex(&["confirm", request_id, &proof.response_hex]);
        self.state().confirmations.insert(tx_hash.clone());
        self.confirmation_submissions.fetch_add(1, Ordering::SeqCst);
        Ok(tx_hash)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE LEDGER
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory source ledger. Payments are recorded explicitly.
#[derive(Default)]
pub struct SimulatedLedger {
    transactions: Mutex<HashMap<String, SourceTransaction>>,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tx: SourceTransaction) {
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tx.hash.to_ascii_uppercase(), tx);
    }

    /// Record a validated, successful payment and return it.
    pub fn record_payment(
        &self,
        from: &str,
        to: &str,
        amount: Amount,
        memo: &str,
        timestamp: DateTime<Utc>,
    ) -> SourceTransaction {
        let hash = hash_hex(&["payment", from, to, &amount.to_string(), memo])[2..].to_ascii_uppercase();
        let tx = SourceTransaction {
            hash,
            validated: true,
            succeeded: true,
            timestamp,
            source: from.to_string(),
            destination: to.to_string(),
            delivered_amount: amount,
            memo: Some(normalize_hex(memo)),
        };
        self.record(tx.clone());
        tx
    }
}

#[async_trait]
impl SourceLedger for SimulatedLedger {
    async fn get_transaction(&self, tx_hash: &str) -> Result<SourceTransaction, BackendError> {
        let key = tx_hash.trim_start_matches("0x").to_ascii_uppercase();
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
            .ok_or_else(|| BackendError::TransactionNotFound(tx_hash.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ATTESTATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Verifier, hub and data-availability layer in one deterministic fake.
pub struct SimulatedAttestation {
    schedule: RoundSchedule,
    /// Timestamp of the next hub block; `0` uses the wall clock.
    next_block_timestamp: AtomicU64,
    withhold_proofs: AtomicBool,
    submitted: Mutex<HashMap<String, HubSubmission>>,
    submissions: AtomicU32,
    block_number: AtomicU64,
}

impl SimulatedAttestation {
    pub fn new(schedule: RoundSchedule) -> Self {
        Self {
            schedule,
            next_block_timestamp: AtomicU64::new(0),
            withhold_proofs: AtomicBool::new(false),
            submitted: Mutex::new(HashMap::new()),
            submissions: AtomicU32::new(0),
            block_number: AtomicU64::new(1),
        }
    }

    /// Pin the hub block timestamp so submissions land in a chosen round.
    pub fn set_block_timestamp(&self, timestamp: u64) {
        self.next_block_timestamp.store(timestamp, Ordering::SeqCst);
    }

    /// While set, the data-availability layer answers 404 for every request.
    pub fn withhold_proofs(&self, withhold: bool) {
        self.withhold_proofs.store(withhold, Ordering::SeqCst);
    }

    /// Fee-paying hub submissions, including ones rejected as already known.
    pub fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }

    fn submitted(&self) -> std::sync::MutexGuard<'_, HashMap<String, HubSubmission>> {
        self.submitted.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn block_timestamp(&self) -> u64 {
        match self.next_block_timestamp.load(Ordering::SeqCst) {
            0 => Utc::now().timestamp().max(0) as u64,
            pinned => pinned,
        }
    }
}

#[async_trait]
impl Verifier for SimulatedAttestation {
    async fn prepare_request(
        &self,
        source_tx_hash: &str,
        network: SourceNetwork,
    ) -> Result<PrepareOutcome, TransportError> {
        Ok(PrepareOutcome::Valid {
            request_bytes: hash_hex(&[
                "Payment",
                network.source_id(),
                &source_tx_hash.to_ascii_uppercase(),
            ]),
        })
    }
}

#[async_trait]
impl AttestationHub for SimulatedAttestation {
    async fn request_fee(&self, _request_bytes: &str) -> Result<u128, HubError> {
        Ok(1_000_000_000_000_000)
    }

    async fn submit_request(
        &self,
        request_bytes: &str,
        _fee: u128,
    ) -> Result<HubSubmission, HubError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let mut submitted = self.submitted();
        if submitted.contains_key(request_bytes) {
            return Err(HubError::AlreadyKnown);
        }
        let block_number = self.block_number.fetch_add(1, Ordering::SeqCst);
        let submission = HubSubmission {
            tx_hash: hash_hex(&["attest", request_bytes]),
            block_number,
            block_timestamp: self.block_timestamp(),
        };
        submitted.insert(request_bytes.to_string(), submission.clone());
        Ok(submission)
    }

    async fn find_submission(
        &self,
        request_bytes: &str,
        _lookback_blocks: u64,
    ) -> Result<Option<HubSubmission>, HubError> {
        Ok(self.submitted().get(request_bytes).cloned())
    }

    async fn round_schedule(&self) -> Result<RoundSchedule, HubError> {
        Ok(self.schedule)
    }
}

#[async_trait]
impl DataAvailability for SimulatedAttestation {
    async fn fetch_proof(
        &self,
        voting_round_id: u64,
        request_bytes: &str,
    ) -> Result<AttestationProof, DaError> {
        if self.withhold_proofs.load(Ordering::SeqCst) {
            return Err(DaError::NotReady { status: 404 });
        }
        let known = self.submitted().contains_key(request_bytes);
        if !known {
            return Err(DaError::NotReady { status: 404 });
        }
        Ok(AttestationProof {
            voting_round_id,
            response_hex: hash_hex(&["response", &voting_round_id.to_string(), request_bytes]),
            merkle_proof: vec![hash_hex(&["leaf", request_bytes])],
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARE ACCOUNTING
// ═══════════════════════════════════════════════════════════════════════════════

/// Vault that mints shares 1:1 and can be told to fail.
#[derive(Default)]
pub struct SimulatedShares {
    failures_remaining: AtomicU32,
    mints: AtomicU32,
    redemptions: AtomicU32,
}

impl SimulatedShares {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` vault operations fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn mints(&self) -> u32 {
        self.mints.load(Ordering::SeqCst)
    }

    pub fn redemptions(&self) -> u32 {
        self.redemptions.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<(), BackendError> {
        let tripped = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(BackendError::Vault("simulated vault failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ShareAccounting for SimulatedShares {
    async fn mint_shares(
        &self,
        vault_id: &str,
        user_address: &str,
        amount: Amount,
    ) -> Result<MintedShares, BackendError> {
        self.check_failure()?;
        let n = self.mints.fetch_add(1, Ordering::SeqCst);
        Ok(MintedShares {
            tx_hash: hash_hex(&["shares", vault_id, user_address, &amount.to_string(), &n.to_string()]),
            position_id: position_id_for(vault_id, user_address),
        })
    }

    async fn redeem_shares(
        &self,
        vault_id: &str,
        user_address: &str,
        share_amount: Amount,
    ) -> Result<RedeemedShares, BackendError> {
        self.check_failure()?;
        let n = self.redemptions.fetch_add(1, Ordering::SeqCst);
        Ok(RedeemedShares {
            tx_hash: hash_hex(&["unshare", vault_id, user_address, &n.to_string()]),
            assets_redeemed: share_amount,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STACK
// ═══════════════════════════════════════════════════════════════════════════════

/// Every simulated collaborator, shared so callers can steer them.
#[derive(Clone)]
pub struct SimulatedStack {
    pub backend: Arc<SimulatedBackend>,
    pub ledger: Arc<SimulatedLedger>,
    pub attestation: Arc<SimulatedAttestation>,
    pub shares: Arc<SimulatedShares>,
}

impl SimulatedStack {
    pub fn new(config: SimulatedConfig, schedule: RoundSchedule) -> Self {
        Self {
            backend: Arc::new(SimulatedBackend::new(config)),
            ledger: Arc::new(SimulatedLedger::new()),
            attestation: Arc::new(SimulatedAttestation::new(schedule)),
            shares: Arc::new(SimulatedShares::new()),
        }
    }

    /// Attestation client whose verifier, hub and data-availability layer are
    /// all the simulated attestation.
    pub fn attestation_client(&self, config: AttestationConfig) -> AttestationClient {
        AttestationClient::new(
            self.attestation.clone(),
            self.attestation.clone(),
            self.attestation.clone(),
            config,
        )
    }
}
