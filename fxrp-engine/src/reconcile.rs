//! Reconciliation engine.
//!
//! Two passes over the store:
//!
//! * the expiry sweep cancels bridges whose payment window lapsed, and
//! * recovery walks every recoverable (or crash-interrupted) record through
//!   `reconcile_bridge` / `reconcile_redemption`, one at a time.
//!
//! Neither pass aborts on a per-record error; errors are collected into the
//! report. [`ReconciliationScheduler`] runs both at start and then sweeps on a
//! fixed interval until stopped.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use fxrp_common::{BridgeStatus, RedemptionStatus};

use crate::bridge::BridgeService;
use crate::error::BridgeError;
use crate::redemption::RedemptionService;

// ═══════════════════════════════════════════════════════════════════════════════
// OUTCOMES
// ═══════════════════════════════════════════════════════════════════════════════

/// What reconciliation did with one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Nothing to do in the record's current state.
    Skipped,
    /// Another operation holds the record.
    Busy,
    /// A persisted idempotency hash proved the step done; status caught up.
    RepairedStatus,
    RetriedProof,
    RegeneratedProof,
    ResumedMint,
    RetriedVaultMint,
    RetriedShareRedemption,
    RetriedBurn,
    ResumedConfirmation,
    NotRecoverable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub id: String,
    pub action: ReconcileAction,
    /// Status after the action ran.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ReconcileOutcome {
    pub fn new(id: impl Into<String>, action: ReconcileAction, status: impl fmt::Display) -> Self {
        Self {
            id: id.into(),
            action,
            status: status.to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A record a pass could not handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub id: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub cancelled: Vec<String>,
    pub errors: Vec<RecordFailure>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub outcomes: Vec<ReconcileOutcome>,
    pub errors: Vec<RecordFailure>,
}

impl RecoveryReport {
    pub fn attempted(&self) -> usize {
        self.outcomes.len() + self.errors.len()
    }

    pub fn count(&self, action: ReconcileAction) -> usize {
        self.outcomes.iter().filter(|o| o.action == action).count()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECONCILER
// ═══════════════════════════════════════════════════════════════════════════════

/// Bridge statuses a crash can leave mid-step.
const INTERRUPTED_BRIDGE_STATUSES: [BridgeStatus; 3] = [
    BridgeStatus::XrplConfirmed,
    BridgeStatus::FdcProofGenerated,
    BridgeStatus::Completed,
];

const INTERRUPTED_REDEMPTION_STATUSES: [RedemptionStatus; 2] =
    [RedemptionStatus::XrplReceived, RedemptionStatus::ProofGenerated];

pub struct Reconciler {
    bridges: Arc<BridgeService>,
    redemptions: Arc<RedemptionService>,
}

impl Reconciler {
    pub fn new(bridges: Arc<BridgeService>, redemptions: Arc<RedemptionService>) -> Self {
        Self {
            bridges,
            redemptions,
        }
    }

    /// Cancel every non-terminal bridge whose expiry is at or before `now`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, BridgeError> {
        let candidates = self.bridges.store().expired_bridges(now)?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for record in candidates {
            match self.bridges.expire_bridge(&record.id, now).await {
                Ok(Some(_)) => report.cancelled.push(record.id),
                // Progressed between the scan and the write.
                Ok(None) => debug!(bridge_id = %record.id, "No longer expired"),
                Err(e) => {
                    warn!(bridge_id = %record.id, "Expiry failed: {}", e);
                    report.errors.push(RecordFailure {
                        id: record.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.cancelled.is_empty() || !report.errors.is_empty() {
            info!(
                examined = report.examined,
                cancelled = report.cancelled.len(),
                errors = report.errors.len(),
                "Expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Drive every recoverable record, plus records interrupted mid-step,
    /// through reconciliation. Sequential; never stops early.
    pub async fn recover_all(&self) -> Result<RecoveryReport, BridgeError> {
        let store = self.bridges.store();
        let mut report = RecoveryReport::default();

        let bridge_ids: BTreeSet<String> = store
            .recoverable_bridges()?
            .into_iter()
            .chain(store.bridges_in(&INTERRUPTED_BRIDGE_STATUSES)?)
            .map(|r| r.id)
            .collect();
        for id in bridge_ids {
            match self.bridges.reconcile_bridge(&id).await {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => {
                    warn!(bridge_id = %id, "Bridge recovery failed: {}", e);
                    report.errors.push(RecordFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let redemption_ids: BTreeSet<String> = store
            .recoverable_redemptions()?
            .into_iter()
            .chain(store.redemptions_in(&INTERRUPTED_REDEMPTION_STATUSES)?)
            .map(|r| r.id)
            .collect();
        for id in redemption_ids {
            match self.redemptions.reconcile_redemption(&id).await {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => {
                    warn!(redemption_id = %id, "Redemption recovery failed: {}", e);
                    report.errors.push(RecordFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            attempted = report.attempted(),
            not_recoverable = report.count(ReconcileAction::NotRecoverable),
            errors = report.errors.len(),
            "Recovery pass finished"
        );
        Ok(report)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCHEDULER
// ═══════════════════════════════════════════════════════════════════════════════

/// Background task: recovery and a sweep at start, then a sweep every interval.
pub struct ReconciliationScheduler {
    reconciler: Arc<Reconciler>,
    sweep_interval: Duration,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl ReconciliationScheduler {
    pub fn new(reconciler: Arc<Reconciler>, sweep_interval: Duration) -> Self {
        Self {
            reconciler,
            sweep_interval,
            shutdown: None,
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Spawn the loop. A second call while running is a no-op.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = self.reconciler.clone();
        let period = self.sweep_interval;

        self.handle = Some(tokio::spawn(run_loop(reconciler, period, shutdown_rx)));
        self.shutdown = Some(shutdown_tx);
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Reconciliation task ended abnormally: {}", e);
            }
        }
    }
}

async fn run_loop(reconciler: Arc<Reconciler>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(sweep_interval_secs = period.as_secs(), "Reconciliation scheduler started");

    if let Err(e) = reconciler.recover_all().await {
        error!("Startup recovery failed: {}", e);
    }

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reconciler.sweep_expired(Utc::now()).await {
                    error!("Expiry sweep failed: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Reconciliation scheduler stopped");
}
