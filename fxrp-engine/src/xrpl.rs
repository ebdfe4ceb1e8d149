//! XRPL JSON-RPC source-ledger gateway.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use fxrp_common::Amount;

use crate::error::BackendError;
use crate::traits::{SourceLedger, SourceTransaction};

/// Seconds between the Unix epoch and the ledger's epoch (2000-01-01).
pub const RIPPLE_EPOCH_OFFSET: i64 = 946_684_800;

#[derive(Deserialize)]
struct RpcEnvelope {
    result: TxResult,
}

#[derive(Deserialize)]
struct TxResult {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    validated: bool,
    #[serde(default)]
    date: Option<i64>,
    #[serde(rename = "Account", default)]
    account: Option<String>,
    #[serde(rename = "Destination", default)]
    destination: Option<String>,
    #[serde(rename = "TransactionType", default)]
    transaction_type: Option<String>,
    #[serde(rename = "Memos", default)]
    memos: Vec<MemoWrapper>,
    #[serde(default)]
    meta: Option<TxMeta>,
}

#[derive(Deserialize)]
struct MemoWrapper {
    #[serde(rename = "Memo")]
    memo: Memo,
}

#[derive(Deserialize)]
struct Memo {
    #[serde(rename = "MemoData", default)]
    memo_data: Option<String>,
}

#[derive(Deserialize)]
struct TxMeta {
    #[serde(rename = "TransactionResult")]
    transaction_result: String,
    #[serde(default)]
    delivered_amount: Option<Value>,
}

/// Source ledger read over the `tx` JSON-RPC method.
pub struct XrplClient {
    rpc_url: String,
    http_client: reqwest::Client,
}

impl XrplClient {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Config(e.to_string()))?;
        Ok(Self {
            rpc_url: rpc_url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl SourceLedger for XrplClient {
    async fn get_transaction(&self, tx_hash: &str) -> Result<SourceTransaction, BackendError> {
        let hash = tx_hash.trim_start_matches("0x").to_ascii_uppercase();
        let body = json!({
            "method": "tx",
            "params": [{ "transaction": hash, "binary": false }],
        });

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Rpc(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackendError::Rpc(format!("HTTP {}", response.status())));
        }

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        debug!(tx_hash = %hash, validated = envelope.result.validated, "Fetched source transaction");
        parse_transaction(&hash, envelope.result)
    }
}

fn ripple_time(date: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(date + RIPPLE_EPOCH_OFFSET, 0).single()
}

fn parse_transaction(requested: &str, result: TxResult) -> Result<SourceTransaction, BackendError> {
    if let Some(error) = result.error {
        return Err(match error.as_str() {
            "txnNotFound" => BackendError::TransactionNotFound(requested.to_string()),
            _ => BackendError::Rpc(result.error_message.unwrap_or(error)),
        });
    }

    if result.transaction_type.as_deref() != Some("Payment") {
        return Err(BackendError::Decode(format!(
            "{} is a {} transaction, not a payment",
            requested,
            result.transaction_type.unwrap_or_else(|| "unknown".into())
        )));
    }

    let meta = result
        .meta
        .ok_or_else(|| BackendError::Decode(format!("{} has no metadata", requested)))?;
    let delivered_amount = match meta.delivered_amount {
        Some(Value::String(drops)) => drops
            .parse::<u128>()
            .map(Amount::from_raw)
            .map_err(|e| BackendError::Decode(format!("delivered_amount {}: {}", drops, e)))?,
        // Issued-currency amounts are objects; they never count as native payment.
        Some(_) | None => Amount::ZERO,
    };

    let date = result
        .date
        .ok_or_else(|| BackendError::Decode(format!("{} has no close time", requested)))?;
    let timestamp = ripple_time(date)
        .ok_or_else(|| BackendError::Decode(format!("{} has invalid close time {}", requested, date)))?;

    let memo = result
        .memos
        .into_iter()
        .find_map(|m| m.memo.memo_data)
        .map(|data| format!("0x{}", data.to_ascii_lowercase()));

    Ok(SourceTransaction {
        hash: result.hash.unwrap_or_else(|| requested.to_string()),
        validated: result.validated,
        succeeded: meta.transaction_result == "tesSUCCESS",
        timestamp,
        source: result.account.unwrap_or_default(),
        destination: result.destination.unwrap_or_default(),
        delivered_amount,
        memo,
    })
}
