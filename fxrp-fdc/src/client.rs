//! Attestation client.
//!
//! Drives one attestation from source transaction to finalized Merkle proof:
//!
//! ```text
//! verifier.prepare ──(poll)──► hub.request_fee ──► hub.submit ──► round id
//!                                                   │ already known
//!                                                   └─► hub.find_submission
//! round id ──(wait 2 rounds)──► data-availability.fetch_proof ──(poll ≤ 15 min)──► proof
//! ```
//!
//! The two halves are exposed separately so callers can persist the paid ticket
//! before the long poll starts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fxrp_common::{normalize_hex, AttestationProof, AttestationTicket, SourceNetwork};

use crate::round::RoundSchedule;
use crate::transport::{
    AttestationHub, DaError, DataAvailability, HubError, HubSubmission, PrepareOutcome, Verifier,
};
use crate::AttestationError;

/// Timing knobs for the attestation protocol.
#[derive(Clone, Debug)]
pub struct AttestationConfig {
    /// Verifier polls before giving up on an unindexed transaction.
    pub prepare_max_attempts: u32,
    pub prepare_interval: Duration,
    /// Full rounds to wait after submission before the first proof poll.
    pub round_wait_rounds: u32,
    pub proof_poll_interval: Duration,
    /// Wall-clock ceiling on proof polling.
    pub proof_timeout: Duration,
    /// Blocks scanned when the hub reports a request as already known.
    pub duplicate_lookback_blocks: u64,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            prepare_max_attempts: 10,
            prepare_interval: Duration::from_secs(5),
            round_wait_rounds: 2,
            proof_poll_interval: Duration::from_secs(10),
            proof_timeout: Duration::from_secs(15 * 60),
            duplicate_lookback_blocks: 50,
        }
    }
}

/// Output of a full request-and-prove cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmittedProof {
    pub proof: AttestationProof,
    pub attestation_tx_hash: String,
    pub voting_round_id: u64,
    pub request_bytes: String,
}

/// Attestation client shared by every state machine.
pub struct AttestationClient {
    verifier: Arc<dyn Verifier>,
    hub: Arc<dyn AttestationHub>,
    data_availability: Arc<dyn DataAvailability>,
    config: AttestationConfig,
    schedule: OnceCell<RoundSchedule>,
}

impl AttestationClient {
    pub fn new(
        verifier: Arc<dyn Verifier>,
        hub: Arc<dyn AttestationHub>,
        data_availability: Arc<dyn DataAvailability>,
        config: AttestationConfig,
    ) -> Self {
        Self {
            verifier,
            hub,
            data_availability,
            config,
            schedule: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &AttestationConfig {
        &self.config
    }

    /// Round constants, fetched on first use and cached for the process lifetime.
    pub async fn round_schedule(&self) -> Result<RoundSchedule, AttestationError> {
        self.schedule
            .get_or_try_init(|| async {
                let schedule = self.hub.round_schedule().await?;
                info!(
                    first_round_start = schedule.first_round_start,
                    round_duration = schedule.round_duration,
                    "Loaded voting round schedule"
                );
                Ok::<_, AttestationError>(schedule)
            })
            .await
            .copied()
    }

    /// Request, pay for, and prove a source-ledger payment.
    pub async fn submit_and_prove(
        &self,
        source_tx_hash: &str,
        network: SourceNetwork,
    ) -> Result<SubmittedProof, AttestationError> {
        let ticket = self.request_attestation(source_tx_hash, network).await?;
        let proof = self.await_proof(&ticket).await?;
        Ok(SubmittedProof {
            proof,
            attestation_tx_hash: ticket.attestation_tx_hash,
            voting_round_id: ticket.voting_round_id,
            request_bytes: ticket.request_bytes,
        })
    }

    /// Prepare the request, pay the hub fee once, and derive the voting round.
    pub async fn request_attestation(
        &self,
        source_tx_hash: &str,
        network: SourceNetwork,
    ) -> Result<AttestationTicket, AttestationError> {
        let request_bytes = self.prepare_request(source_tx_hash, network).await?;
        let submission = self.submit_once(&request_bytes).await?;
        let schedule = self.round_schedule().await?;
        let voting_round_id = schedule.round_for(submission.block_timestamp)?;

        info!(
            source_tx_hash,
            attestation_tx_hash = %submission.tx_hash,
            voting_round_id,
            "Attestation request submitted"
        );

        Ok(AttestationTicket {
            request_bytes,
            attestation_tx_hash: submission.tx_hash,
            block_timestamp: submission.block_timestamp,
            voting_round_id,
        })
    }

    /// Wait for the round to close, then poll for the finalized proof.
    pub async fn await_proof(
        &self,
        ticket: &AttestationTicket,
    ) -> Result<AttestationProof, AttestationError> {
        let schedule = self.round_schedule().await?;
        let wait = schedule.duration() * self.config.round_wait_rounds;
        debug!(
            voting_round_id = ticket.voting_round_id,
            wait_secs = wait.as_secs(),
            "Waiting for voting round to close"
        );
        tokio::time::sleep(wait).await;

        self.poll_proof(ticket.voting_round_id, &ticket.request_bytes)
            .await
    }

    /// Poll for a proof of an attestation that was already paid for.
    pub async fn resume_proof(
        &self,
        voting_round_id: u64,
        request_bytes: &str,
    ) -> Result<AttestationProof, AttestationError> {
        self.poll_proof(voting_round_id, &normalize_hex(request_bytes))
            .await
    }

    /// Poll the verifier until it reports the transaction indexed and valid.
    pub async fn prepare_request(
        &self,
        source_tx_hash: &str,
        network: SourceNetwork,
    ) -> Result<String, AttestationError> {
        let attempts = self.config.prepare_max_attempts.max(1);
        let mut last_status = String::from("no response");

        for attempt in 1..=attempts {
            match self.verifier.prepare_request(source_tx_hash, network).await {
                Ok(PrepareOutcome::Valid { request_bytes }) => {
                    debug!(source_tx_hash, attempt, "Verifier prepared request");
                    return Ok(normalize_hex(&request_bytes));
                }
                Ok(PrepareOutcome::Pending { status }) => {
                    debug!(source_tx_hash, attempt, %status, "Transaction not indexed yet");
                    last_status = status;
                }
                Ok(PrepareOutcome::Invalid { status }) => {
                    return Err(AttestationError::Rejected {
                        tx_hash: source_tx_hash.to_string(),
                        status,
                    });
                }
                Err(e) => {
                    warn!(source_tx_hash, attempt, "Verifier request failed: {}", e);
                    last_status = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.prepare_interval).await;
            }
        }

        Err(AttestationError::NotIndexed {
            tx_hash: source_tx_hash.to_string(),
            attempts,
            last_status,
        })
    }

    async fn submit_once(&self, request_bytes: &str) -> Result<HubSubmission, AttestationError> {
        let fee = self.hub.request_fee(request_bytes).await?;
        debug!(fee, "Submitting attestation request");

        match self.hub.submit_request(request_bytes, fee).await {
            Ok(submission) => Ok(submission),
            Err(HubError::AlreadyKnown) => {
                let lookback = self.config.duplicate_lookback_blocks;
                warn!(lookback, "Attestation request already known, scanning recent blocks");
                match self.hub.find_submission(request_bytes, lookback).await? {
                    Some(submission) => {
                        info!(tx_hash = %submission.tx_hash, "Recovered earlier attestation submission");
                        Ok(submission)
                    }
                    None => Err(AttestationError::SubmissionNotFound { lookback }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn poll_proof(
        &self,
        voting_round_id: u64,
        request_bytes: &str,
    ) -> Result<AttestationProof, AttestationError> {
        let deadline = Instant::now() + self.config.proof_timeout;
        let mut last_status = None;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self
                .data_availability
                .fetch_proof(voting_round_id, request_bytes)
                .await
            {
                Ok(proof) => {
                    info!(voting_round_id, attempts, "Proof finalized");
                    return Ok(proof);
                }
                Err(DaError::NotReady { status }) => {
                    debug!(voting_round_id, status, "Proof not ready");
                    last_status = Some(status);
                }
                Err(DaError::Http { status, body }) => {
                    return Err(AttestationError::DataAvailability { status, body });
                }
                Err(DaError::Transport(e)) => {
                    warn!(voting_round_id, "Data-availability request failed: {}", e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            tokio::time::sleep(self.config.proof_poll_interval.min(remaining)).await;
        }

        warn!(voting_round_id, attempts, ?last_status, "Proof polling timed out");
        Err(AttestationError::ProofTimeout {
            voting_round_id,
            last_status,
            request_bytes: request_bytes.to_string(),
        })
    }
}
