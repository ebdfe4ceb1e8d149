//! fxrp-fdc
//!
//! Attestation client for source-ledger payments: prepares the encoded request
//! with the verifier, pays the hub fee exactly once, derives the voting round
//! from the submission block and polls the data-availability layer for the
//! finalized Merkle proof.
//!
//! # Example
//!
//! ```ignore
//! let client = AttestationClient::new(verifier, hub, data_availability, AttestationConfig::default());
//! let ticket = client.request_attestation(&tx_hash, SourceNetwork::Testnet).await?;
//! store.save_ticket(&ticket)?;
//! let proof = client.await_proof(&ticket).await?;
//! ```

pub mod client;
pub mod encoding;
pub mod http;
pub mod round;
pub mod transport;

pub use client::{AttestationClient, AttestationConfig, SubmittedProof};
pub use http::{HttpDataAvailability, HttpTransportConfig, HttpVerifier};
pub use round::RoundSchedule;
pub use transport::{
    AttestationHub, DaError, DataAvailability, HubError, HubSubmission, PrepareOutcome,
    TransportError, Verifier,
};

use fxrp_common::FailureKind;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors surfaced by the attestation client.
#[derive(Debug, Clone, Error)]
pub enum AttestationError {
    /// The verifier never reported the transaction as indexed.
    #[error("transaction {tx_hash} not indexed after {attempts} attempts (last status: {last_status})")]
    NotIndexed {
        tx_hash: String,
        attempts: u32,
        last_status: String,
    },

    #[error("verifier rejected transaction {tx_hash}: {status}")]
    Rejected { tx_hash: String, status: String },

    #[error(transparent)]
    Hub(#[from] HubError),

    /// The hub reported the request as known but no mined copy was found.
    #[error("attestation request already known but not found in the last {lookback} blocks")]
    SubmissionNotFound { lookback: u64 },

    #[error("block timestamp {timestamp} precedes first voting round start {first_round_start}")]
    BeforeFirstRound {
        timestamp: u64,
        first_round_start: u64,
    },

    /// Proof polling exceeded its wall-clock ceiling.
    #[error("proof for voting round {voting_round_id} not available in time (last HTTP status: {last_status:?})")]
    ProofTimeout {
        voting_round_id: u64,
        last_status: Option<u16>,
        request_bytes: String,
    },

    #[error("data-availability layer returned HTTP {status}: {body}")]
    DataAvailability { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl AttestationError {
    /// Failure kind persisted when this error ends a state-machine step.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AttestationError::NotIndexed { .. }
            | AttestationError::SubmissionNotFound { .. } => FailureKind::AttestationSubmission,
            AttestationError::Rejected { .. } => FailureKind::AttestationRejected,
            AttestationError::Hub(HubError::Reverted(_)) => FailureKind::AttestationRejected,
            AttestationError::Hub(_) => FailureKind::AttestationSubmission,
            AttestationError::ProofTimeout { .. } => FailureKind::ProofTimeout,
            AttestationError::DataAvailability { .. } => FailureKind::ProofUnavailable,
            AttestationError::Transport(_) => FailureKind::Transport,
            AttestationError::BeforeFirstRound { .. } | AttestationError::InvalidResponse(_) => {
                FailureKind::Internal
            }
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.failure_kind().is_recoverable()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AttestationError::ProofTimeout { .. })
    }
}
