//! Payment-event dispatch.
//!
//! Detected payments arrive on a bounded queue (from the HTTP rail or an
//! external ledger listener) and each one is driven through its state machine
//! on its own task. Per-record locks inside the engine serialise duplicates.

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use fxrp_common::{PaymentEvent, PaymentTarget};
use fxrp_engine::Engine;

pub type PaymentSender = mpsc::Sender<PaymentEvent>;

/// Handle to the running dispatch loop.
pub struct PaymentDispatcher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PaymentDispatcher {
    /// Start the loop and return it with the queue's sending half.
    pub fn spawn(engine: Engine, capacity: usize) -> (Self, PaymentSender) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(engine, events_rx, shutdown_rx));
        (
            Self {
                shutdown: shutdown_tx,
                handle,
            },
            events_tx,
        )
    }

    /// Stop accepting events and abort in-flight work. Every step is persisted
    /// before the next starts, so reconciliation resumes aborted records.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!("Payment dispatcher ended abnormally: {}", e);
        }
    }
}

async fn run(
    engine: Engine,
    mut events: mpsc::Receiver<PaymentEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();
    info!("Payment dispatcher started");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                in_flight.spawn(process(engine.clone(), event));
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!("Payment task panicked: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if !in_flight.is_empty() {
        warn!(in_flight = in_flight.len(), "Aborting in-flight payments");
        in_flight.shutdown().await;
    }
    info!("Payment dispatcher stopped");
}

async fn process(engine: Engine, event: PaymentEvent) {
    debug!(target_record = ?event.target, tx_hash = %event.tx_hash, "Dispatching payment");
    match &event.target {
        PaymentTarget::Bridge(id) => match engine.bridges.handle_payment(&event).await {
            Ok(record) => info!(bridge_id = %id, status = %record.status, "Payment processed"),
            Err(e) => warn!(bridge_id = %id, "Payment processing failed: {}", e),
        },
        PaymentTarget::Redemption(id) => match engine.redemptions.handle_payout(&event).await {
            Ok(record) => info!(redemption_id = %id, status = %record.status, "Payout processed"),
            Err(e) => warn!(redemption_id = %id, "Payout processing failed: {}", e),
        },
    }
}
