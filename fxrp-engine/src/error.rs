//! Engine errors.

use thiserror::Error;

use fxrp_common::{FailureKind, TransitionError};
use fxrp_fdc::AttestationError;

use crate::store::StoreError;

// ═══════════════════════════════════════════════════════════════════════════════
// BACKEND ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors raised by settlement backends and chain gateways.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("no agent with {lots} free lots available")]
    NoAgentAvailable { lots: u64 },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    /// Sent, but no receipt could be read back.
    #[error("receipt for {tx_hash} not available")]
    ReceiptUnavailable { tx_hash: String },

    #[error("event {event} missing from transaction {tx_hash}")]
    MissingEvent { event: &'static str, tx_hash: String },

    #[error("vault operation failed: {0}")]
    Vault(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BackendError {
    /// Kind recorded when a mint or confirmation submission fails with this error.
    pub fn submission_kind(&self, uncertain: FailureKind, reverted: FailureKind) -> FailureKind {
        match self {
            BackendError::Reverted { .. } => reverted,
            BackendError::NoAgentAvailable { .. } | BackendError::InvalidAmount(_) => {
                FailureKind::InvalidRequest
            }
            BackendError::Decode(_) | BackendError::Config(_) => FailureKind::Internal,
            BackendError::Vault(_) => FailureKind::VaultOperation,
            BackendError::TransactionNotFound(_)
            | BackendError::ReceiptUnavailable { .. }
            | BackendError::MissingEvent { .. }
            | BackendError::Rpc(_) => uncertain,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATE MACHINE ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors returned by the bridge and redemption state machines.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{id} is missing {field}")]
    MissingField { id: String, field: &'static str },

    #[error("reservation for {id} has expired")]
    Expired { id: String },

    #[error("{id} is already {status}")]
    Terminal { id: String, status: String },

    #[error("cannot {operation} {id} in status {status}")]
    InvalidState {
        id: String,
        status: String,
        operation: &'static str,
    },

    #[error("invalid source transaction: {0}")]
    InvalidSourceTransaction(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BridgeError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        BridgeError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn missing(id: &str, field: &'static str) -> Self {
        BridgeError::MissingField {
            id: id.to_string(),
            field,
        }
    }

    /// Kind persisted on the record when this error ends a step.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BridgeError::NotFound { .. }
            | BridgeError::InvalidRequest(_)
            | BridgeError::MissingField { .. }
            | BridgeError::Terminal { .. }
            | BridgeError::InvalidState { .. } => FailureKind::InvalidRequest,
            BridgeError::Expired { .. } => FailureKind::ReservationExpired,
            BridgeError::InvalidSourceTransaction(_) => FailureKind::InvalidSourceTransaction,
            BridgeError::Attestation(e) => e.failure_kind(),
            BridgeError::Backend(BackendError::Rpc(_)) => FailureKind::Transport,
            BridgeError::Backend(e) => e.submission_kind(FailureKind::Transport, FailureKind::Internal),
            BridgeError::Transition(_) | BridgeError::Store(_) => FailureKind::Internal,
        }
    }
}
