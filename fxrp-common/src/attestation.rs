//! Attestation data carried between the FDC client and the state machines.

use serde::{Deserialize, Serialize};

/// Source ledger network the verifier and attestation hub are asked about.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceNetwork {
    Mainnet,
    #[default]
    Testnet,
}

impl SourceNetwork {
    /// FDC source identifier.
    pub fn source_id(&self) -> &'static str {
        match self {
            SourceNetwork::Mainnet => "XRP",
            SourceNetwork::Testnet => "testXRP",
        }
    }

    /// Path segment of the verifier API.
    pub fn verifier_chain(&self) -> &'static str {
        "xrp"
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceNetwork::Mainnet => "mainnet",
            SourceNetwork::Testnet => "testnet",
        }
    }
}

/// A submitted attestation request whose voting round is known.
///
/// Everything needed to resume proof polling without paying the fee again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationTicket {
    /// ABI-encoded request, `0x`-prefixed hex. Also the fee and lookup key.
    pub request_bytes: String,
    /// Hash of the fee-paying hub transaction.
    pub attestation_tx_hash: String,
    /// Timestamp of the block that included the hub transaction.
    pub block_timestamp: u64,
    pub voting_round_id: u64,
}

/// Finalized Merkle proof returned by the data-availability layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationProof {
    pub voting_round_id: u64,
    /// ABI-encoded attestation response, `0x`-prefixed hex.
    pub response_hex: String,
    /// Merkle siblings, `0x`-prefixed 32-byte hex strings.
    pub merkle_proof: Vec<String>,
}
