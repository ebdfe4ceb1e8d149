//! Collaborators the attestation client talks to.
//!
//! Each one is a trait so the chain-backed implementations (HTTP, EVM) and test
//! fakes can be swapped without touching the polling logic.

use async_trait::async_trait;
use thiserror::Error;

use fxrp_common::{AttestationProof, SourceNetwork};

use crate::round::RoundSchedule;

// ═══════════════════════════════════════════════════════════════════════════════
// VERIFIER
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of asking the verifier to prepare a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Transaction indexed and valid; the encoded request is ready.
    Valid { request_bytes: String },
    /// Not indexed or not yet final. Retry later.
    Pending { status: String },
    /// The verifier will never accept this transaction.
    Invalid { status: String },
}

/// Off-chain verifier preparing ABI-encoded attestation requests.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn prepare_request(
        &self,
        source_tx_hash: &str,
        network: SourceNetwork,
    ) -> Result<PrepareOutcome, TransportError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// ATTESTATION HUB
// ═══════════════════════════════════════════════════════════════════════════════

/// A mined hub transaction carrying an attestation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubSubmission {
    pub tx_hash: String,
    pub block_number: u64,
    pub block_timestamp: u64,
}

/// Errors raised by the on-chain attestation hub.
#[derive(Debug, Clone, Error)]
pub enum HubError {
    /// The node already holds a transaction with this payload.
    #[error("attestation request already known")]
    AlreadyKnown,

    #[error("attestation request reverted: {0}")]
    Reverted(String),

    #[error("hub rpc error: {0}")]
    Rpc(String),
}

/// On-chain attestation hub plus the fee and round-schedule contracts around it.
#[async_trait]
pub trait AttestationHub: Send + Sync {
    /// Fee for exactly these request bytes.
    async fn request_fee(&self, request_bytes: &str) -> Result<u128, HubError>;

    /// Submit and wait for inclusion.
    async fn submit_request(&self, request_bytes: &str, fee: u128)
        -> Result<HubSubmission, HubError>;

    /// Scan the last `lookback_blocks` for a hub transaction whose input carries
    /// `request_bytes`.
    async fn find_submission(
        &self,
        request_bytes: &str,
        lookback_blocks: u64,
    ) -> Result<Option<HubSubmission>, HubError>;

    async fn round_schedule(&self) -> Result<RoundSchedule, HubError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// DATA AVAILABILITY
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors from the data-availability layer.
#[derive(Debug, Clone, Error)]
pub enum DaError {
    /// Round not finalized yet (404, or 400 "request not found").
    #[error("proof not ready (HTTP {status})")]
    NotReady { status: u16 },

    /// Any other HTTP failure. Fatal.
    #[error("data-availability HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// HTTP service exposing finalized proofs keyed by (round, request bytes).
#[async_trait]
pub trait DataAvailability: Send + Sync {
    async fn fetch_proof(
        &self,
        voting_round_id: u64,
        request_bytes: &str,
    ) -> Result<AttestationProof, DaError>;
}

/// Connection-level failure shared by the HTTP transports.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}
