//! HTTP transports for the verifier and the data-availability layer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fxrp_common::{normalize_hex, AttestationProof, SourceNetwork};

use crate::encoding::{encode_name32, ATTESTATION_TYPE_PAYMENT};
use crate::transport::{DaError, DataAvailability, PrepareOutcome, TransportError, Verifier};

/// Connection settings shared by both transports.
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    pub base_url: String,
    /// Sent as `X-API-KEY` when present.
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.is_empty());
        self
    }

    fn client(&self) -> Result<reqwest::Client, TransportError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    fn post(&self, client: &reqwest::Client, url: &str) -> reqwest::RequestBuilder {
        let request = client
            .post(url)
            .header("Content-Type", "application/json");
        match &self.api_key {
            Some(key) => request.header("X-API-KEY", key),
            None => request,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VERIFIER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrepareRequest {
    attestation_type: String,
    source_id: String,
    request_body: PaymentRequestBody,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequestBody {
    transaction_id: String,
    in_utxo: String,
    utxo: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrepareResponse {
    status: String,
    abi_encoded_request: Option<String>,
}

/// Verifier reached over HTTP.
pub struct HttpVerifier {
    config: HttpTransportConfig,
    http_client: reqwest::Client,
}

impl HttpVerifier {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let http_client = config.client()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    fn prepare_url(&self, network: SourceNetwork) -> String {
        format!(
            "{}/verifier/{}/{}/prepareRequest",
            self.config.base_url,
            network.verifier_chain(),
            ATTESTATION_TYPE_PAYMENT
        )
    }
}

/// Map a verifier status string onto the polling outcome.
fn classify_status(status: &str, request_bytes: Option<String>) -> PrepareOutcome {
    let upper = status.trim().to_ascii_uppercase();
    if upper == "VALID" {
        match request_bytes.filter(|bytes| bytes.len() > 2) {
            Some(request_bytes) => PrepareOutcome::Valid { request_bytes },
            None => PrepareOutcome::Pending {
                status: "VALID without encoded request".into(),
            },
        }
    } else if upper.starts_with("INVALID") {
        PrepareOutcome::Invalid {
            status: status.to_string(),
        }
    } else {
        PrepareOutcome::Pending {
            status: status.to_string(),
        }
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn prepare_request(
        &self,
        source_tx_hash: &str,
        network: SourceNetwork,
    ) -> Result<PrepareOutcome, TransportError> {
        let body = PrepareRequest {
            attestation_type: encode_name32(ATTESTATION_TYPE_PAYMENT)
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?,
            source_id: encode_name32(network.source_id())
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?,
            request_body: PaymentRequestBody {
                transaction_id: normalize_hex(source_tx_hash),
                in_utxo: "0".into(),
                utxo: "0".into(),
            },
        };

        let url = self.prepare_url(network);
        let response = self
            .config
            .post(&self.http_client, &url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PrepareResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        debug!(source_tx_hash, status = %parsed.status, "Verifier responded");

        Ok(classify_status(&parsed.status, parsed.abi_encoded_request))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DATA AVAILABILITY
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProofRequest<'a> {
    voting_round_id: u64,
    request_bytes: &'a str,
}

#[derive(Deserialize)]
struct ProofResponse {
    #[serde(default)]
    response_hex: Option<String>,
    #[serde(default)]
    proof: Vec<String>,
}

/// Data-availability layer reached over HTTP.
pub struct HttpDataAvailability {
    config: HttpTransportConfig,
    http_client: reqwest::Client,
}

impl HttpDataAvailability {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let http_client = config.client()?;
        Ok(Self {
            config,
            http_client,
        })
    }
}

/// `404`, or `400` carrying "not found", means the round is not finalized yet.
pub fn is_not_ready(status: u16, body: &str) -> bool {
    status == 404 || (status == 400 && body.to_ascii_lowercase().contains("not found"))
}

#[async_trait]
impl DataAvailability for HttpDataAvailability {
    async fn fetch_proof(
        &self,
        voting_round_id: u64,
        request_bytes: &str,
    ) -> Result<AttestationProof, DaError> {
        let url = format!(
            "{}/api/v1/fdc/proof-by-request-round-raw",
            self.config.base_url
        );
        let response = self
            .config
            .post(&self.http_client, &url)
            .json(&ProofRequest {
                voting_round_id,
                request_bytes,
            })
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_not_ready(status, &body) {
                return Err(DaError::NotReady { status });
            }
            return Err(DaError::Http { status, body });
        }

        let parsed: ProofResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        match parsed.response_hex.filter(|hex| !hex.is_empty()) {
            Some(response_hex) => Ok(AttestationProof {
                voting_round_id,
                response_hex: normalize_hex(&response_hex),
                merkle_proof: parsed.proof,
            }),
            None => Err(DaError::NotReady { status }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_statuses() {
        assert!(is_not_ready(404, ""));
        assert!(is_not_ready(400, "{\"error\":\"Request Not Found\"}"));
        assert!(!is_not_ready(400, "malformed request bytes"));
        assert!(!is_not_ready(500, "not found"));
    }

    #[test]
    fn verifier_status_classification() {
        assert_eq!(
            classify_status("VALID", Some("0xabcd".into())),
            PrepareOutcome::Valid {
                request_bytes: "0xabcd".into()
            }
        );
        assert!(matches!(
            classify_status("VALID", None),
            PrepareOutcome::Pending { .. }
        ));
        assert!(matches!(
            classify_status("INDETERMINATE: transaction not yet finalized", None),
            PrepareOutcome::Pending { .. }
        ));
        assert!(matches!(
            classify_status("INVALID: payment failed", None),
            PrepareOutcome::Invalid { .. }
        ));
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let config = HttpTransportConfig::new("https://verifier.example/").with_api_key(Some(String::new()));
        assert_eq!(config.base_url, "https://verifier.example");
        assert!(config.api_key.is_none());
    }
}
