//! Attestation client against in-memory collaborators.
//!
//! Every test runs on a paused clock, so the 15-minute proof ceiling and the
//! round wait complete instantly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use fxrp_common::{AttestationProof, SourceNetwork};
use fxrp_fdc::{
    AttestationClient, AttestationConfig, AttestationError, AttestationHub, DaError,
    DataAvailability, HubError, HubSubmission, PrepareOutcome, RoundSchedule, TransportError,
    Verifier,
};

const OFFSET: u64 = 1_658_430_000;
const DURATION: u64 = 90;
const REQUEST: &str = "0x5061796d656e74000000000000000000000000000000000000000000000000";
const SOURCE_TX: &str = "0xa1b2c3";

// ═══════════════════════════════════════════════════════════════════════════════
// FAKES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct ScriptedVerifier {
    script: Mutex<VecDeque<Result<PrepareOutcome, TransportError>>>,
    calls: AtomicU32,
}

impl ScriptedVerifier {
    fn with(script: Vec<Result<PrepareOutcome, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    fn pending_forever() -> Self {
        Self::with(
            (0..100)
                .map(|_| {
                    Ok(PrepareOutcome::Pending {
                        status: "INDETERMINATE: not indexed".into(),
                    })
                })
                .collect(),
        )
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn prepare_request(
        &self,
        _source_tx_hash: &str,
        _network: SourceNetwork,
    ) -> Result<PrepareOutcome, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(PrepareOutcome::Valid {
                    request_bytes: REQUEST.to_uppercase().replacen("0X", "0x", 1),
                })
            })
    }
}

enum SubmitBehaviour {
    Mine(u64),
    AlreadyKnown(Option<u64>),
    Revert,
}

struct FakeHub {
    behaviour: SubmitBehaviour,
    submissions: AtomicU32,
    scans: AtomicU32,
    schedule_reads: AtomicU32,
}

impl FakeHub {
    fn new(behaviour: SubmitBehaviour) -> Self {
        Self {
            behaviour,
            submissions: AtomicU32::new(0),
            scans: AtomicU32::new(0),
            schedule_reads: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl AttestationHub for FakeHub {
    async fn request_fee(&self, request_bytes: &str) -> Result<u128, HubError> {
        assert_eq!(request_bytes, REQUEST, "fee must be priced on normalised bytes");
        Ok(1_000_000_000_000_000)
    }

    async fn submit_request(
        &self,
        _request_bytes: &str,
        _fee: u128,
    ) -> Result<HubSubmission, HubError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            SubmitBehaviour::Mine(ts) => Ok(HubSubmission {
                tx_hash: "0xhub".into(),
                block_number: 100,
                block_timestamp: ts,
            }),
            SubmitBehaviour::AlreadyKnown(_) => Err(HubError::AlreadyKnown),
            SubmitBehaviour::Revert => Err(HubError::Reverted("fee too low".into())),
        }
    }

    async fn find_submission(
        &self,
        _request_bytes: &str,
        lookback_blocks: u64,
    ) -> Result<Option<HubSubmission>, HubError> {
        assert_eq!(lookback_blocks, 50);
        self.scans.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            SubmitBehaviour::AlreadyKnown(Some(ts)) => Ok(Some(HubSubmission {
                tx_hash: "0xearlier".into(),
                block_number: 97,
                block_timestamp: ts,
            })),
            _ => Ok(None),
        }
    }

    async fn round_schedule(&self) -> Result<RoundSchedule, HubError> {
        self.schedule_reads.fetch_add(1, Ordering::SeqCst);
        Ok(RoundSchedule::new(OFFSET, DURATION))
    }
}

enum DaBehaviour {
    ReadyAfter(u32),
    AlwaysNotFound,
    ServerError,
}

struct FakeDa {
    behaviour: DaBehaviour,
    calls: AtomicU32,
}

impl FakeDa {
    fn new(behaviour: DaBehaviour) -> Self {
        Self {
            behaviour,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DataAvailability for FakeDa {
    async fn fetch_proof(
        &self,
        voting_round_id: u64,
        request_bytes: &str,
    ) -> Result<AttestationProof, DaError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.behaviour {
            DaBehaviour::ReadyAfter(n) if call > n => Ok(AttestationProof {
                voting_round_id,
                response_hex: format!("0xresponse{}", &request_bytes[2..6]),
                merkle_proof: vec![format!("0x{}", "ab".repeat(32))],
            }),
            DaBehaviour::ReadyAfter(_) | DaBehaviour::AlwaysNotFound => {
                Err(DaError::NotReady { status: 404 })
            }
            DaBehaviour::ServerError => Err(DaError::Http {
                status: 500,
                body: "internal error".into(),
            }),
        }
    }
}

fn client(
    verifier: Arc<ScriptedVerifier>,
    hub: Arc<FakeHub>,
    da: Arc<FakeDa>,
) -> AttestationClient {
    AttestationClient::new(verifier, hub, da, AttestationConfig::default())
}

fn round_ts(round: u64) -> u64 {
    OFFSET + round * DURATION + 17
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn submit_and_prove_returns_round_and_proof() {
    let verifier = Arc::new(ScriptedVerifier::default());
    let hub = Arc::new(FakeHub::new(SubmitBehaviour::Mine(round_ts(12_345))));
    let da = Arc::new(FakeDa::new(DaBehaviour::ReadyAfter(3)));
    let client = client(verifier, hub.clone(), da.clone());

    let started = Instant::now();
    let result = client
        .submit_and_prove(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap();

    assert_eq!(result.voting_round_id, 12_345);
    assert_eq!(result.proof.voting_round_id, 12_345);
    assert_eq!(result.attestation_tx_hash, "0xhub");
    assert_eq!(result.request_bytes, REQUEST);
    assert_eq!(hub.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(da.calls.load(Ordering::SeqCst), 4);
    // Two rounds of waiting before the first poll.
    assert!(started.elapsed() >= Duration::from_secs(2 * DURATION));
}

#[tokio::test(start_paused = true)]
async fn already_known_reuses_earlier_submission() {
    let verifier = Arc::new(ScriptedVerifier::default());
    let hub = Arc::new(FakeHub::new(SubmitBehaviour::AlreadyKnown(Some(round_ts(
        4_000,
    )))));
    let da = Arc::new(FakeDa::new(DaBehaviour::ReadyAfter(0)));
    let client = client(verifier, hub.clone(), da);

    let ticket = client
        .request_attestation(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap();

    assert_eq!(ticket.attestation_tx_hash, "0xearlier");
    assert_eq!(ticket.voting_round_id, 4_000);
    assert_eq!(hub.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(hub.scans.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn already_known_without_mined_copy_is_recoverable() {
    let verifier = Arc::new(ScriptedVerifier::default());
    let hub = Arc::new(FakeHub::new(SubmitBehaviour::AlreadyKnown(None)));
    let da = Arc::new(FakeDa::new(DaBehaviour::ReadyAfter(0)));
    let client = client(verifier, hub.clone(), da);

    let err = client
        .request_attestation(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap_err();

    assert!(matches!(err, AttestationError::SubmissionNotFound { lookback: 50 }));
    assert!(err.is_recoverable());
    assert_eq!(hub.submissions.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn hub_revert_is_fatal() {
    let verifier = Arc::new(ScriptedVerifier::default());
    let hub = Arc::new(FakeHub::new(SubmitBehaviour::Revert));
    let da = Arc::new(FakeDa::new(DaBehaviour::ReadyAfter(0)));
    let client = client(verifier, hub, da);

    let err = client
        .request_attestation(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap_err();
    assert!(matches!(err, AttestationError::Hub(HubError::Reverted(_))));
    assert!(!err.is_recoverable());
}

#[tokio::test(start_paused = true)]
async fn pending_prepare_is_retried_not_surfaced() {
    let verifier = Arc::new(ScriptedVerifier::with(vec![
        Ok(PrepareOutcome::Pending {
            status: "INDETERMINATE".into(),
        }),
        Err(TransportError::Connection("reset".into())),
        Ok(PrepareOutcome::Pending {
            status: "INDETERMINATE".into(),
        }),
    ]));
    let hub = Arc::new(FakeHub::new(SubmitBehaviour::Mine(round_ts(1))));
    let da = Arc::new(FakeDa::new(DaBehaviour::ReadyAfter(0)));
    let client = client(verifier.clone(), hub, da);

    let bytes = client
        .prepare_request(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap();
    assert_eq!(bytes, REQUEST);
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn unindexed_transaction_gives_up_after_bounded_attempts() {
    let verifier = Arc::new(ScriptedVerifier::pending_forever());
    let hub = Arc::new(FakeHub::new(SubmitBehaviour::Mine(round_ts(1))));
    let da = Arc::new(FakeDa::new(DaBehaviour::ReadyAfter(0)));
    let client = client(verifier.clone(), hub.clone(), da);

    let err = client
        .request_attestation(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap_err();

    assert!(matches!(err, AttestationError::NotIndexed { attempts: 10, .. }));
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 10);
    assert_eq!(hub.submissions.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_transaction_is_rejected_immediately() {
    let verifier = Arc::new(ScriptedVerifier::with(vec![Ok(PrepareOutcome::Invalid {
        status: "INVALID: transaction failed".into(),
    })]));
    let hub = Arc::new(FakeHub::new(SubmitBehaviour::Mine(round_ts(1))));
    let da = Arc::new(FakeDa::new(DaBehaviour::ReadyAfter(0)));
    let client = client(verifier.clone(), hub, da);

    let err = client
        .request_attestation(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap_err();
    assert!(matches!(err, AttestationError::Rejected { .. }));
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn not_found_for_whole_budget_times_out_with_context() {
    let verifier = Arc::new(ScriptedVerifier::default());
    let hub = Arc::new(FakeHub::new(SubmitBehaviour::Mine(round_ts(12_345))));
    let da = Arc::new(FakeDa::new(DaBehaviour::AlwaysNotFound));
    let client = client(verifier, hub, da.clone());

    let ticket = client
        .request_attestation(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap();
    let started = Instant::now();
    let err = client.resume_proof(ticket.voting_round_id, &ticket.request_bytes).await.unwrap_err();

    match err {
        AttestationError::ProofTimeout {
            voting_round_id,
            last_status,
            request_bytes,
        } => {
            assert_eq!(voting_round_id, 12_345);
            assert_eq!(last_status, Some(404));
            assert_eq!(request_bytes, REQUEST);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(15 * 60));
    // One poll every 10s for 15 minutes, plus the poll at the deadline.
    assert_eq!(da.calls.load(Ordering::SeqCst), 91);
}

#[tokio::test(start_paused = true)]
async fn server_error_is_fatal_immediately() {
    let verifier = Arc::new(ScriptedVerifier::default());
    let hub = Arc::new(FakeHub::new(SubmitBehaviour::Mine(round_ts(7))));
    let da = Arc::new(FakeDa::new(DaBehaviour::ServerError));
    let client = client(verifier, hub, da.clone());

    let err = client
        .submit_and_prove(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap_err();
    assert!(matches!(err, AttestationError::DataAvailability { status: 500, .. }));
    assert!(!err.is_recoverable());
    assert_eq!(da.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn resume_skips_round_wait_and_schedule_is_cached() {
    let verifier = Arc::new(ScriptedVerifier::default());
    let hub = Arc::new(FakeHub::new(SubmitBehaviour::Mine(round_ts(3))));
    let da = Arc::new(FakeDa::new(DaBehaviour::ReadyAfter(0)));
    let client = client(verifier, hub.clone(), da);

    client
        .request_attestation(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap();
    client
        .request_attestation(SOURCE_TX, SourceNetwork::Testnet)
        .await
        .unwrap();
    assert_eq!(hub.schedule_reads.load(Ordering::SeqCst), 1);

    let started = Instant::now();
    let proof = client.resume_proof(3, REQUEST).await.unwrap();
    assert_eq!(proof.voting_round_id, 3);
    assert!(started.elapsed() < Duration::from_secs(DURATION));
}
