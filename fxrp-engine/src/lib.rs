//! fxrp-engine
//!
//! Orchestrates the FXRP bridge. A user payment on the source ledger is
//! attested, minted as the wrapped asset on the destination chain and deposited
//! into a vault; redemptions run the same pipeline in reverse.
//!
//! The crate is assembled from:
//!
//! - [`bridge`] and [`redemption`]: the two persisted state machines
//! - [`backend`], [`agent`], [`evm`] and [`xrpl`]: settlement against live chains
//! - [`simulated`]: deterministic stand-ins for every external party
//! - [`store`] and [`locks`]: durable records and per-record exclusion
//! - [`reconcile`]: expiry sweeps and crash recovery

pub mod agent;
pub mod backend;
pub mod bridge;
pub mod error;
pub mod evm;
pub mod locks;
pub mod reconcile;
pub mod redemption;
pub mod simulated;
pub mod store;
pub mod traits;
pub mod watch;
pub mod xrpl;

use std::sync::Arc;

pub use agent::AgentClient;
pub use backend::{ChainBackend, SettlementBackend};
pub use bridge::{BridgeConfig, BridgeService, CreateBridgeRequest};
pub use error::{BackendError, BridgeError};
pub use evm::{EvmConfig, EvmGateway};
pub use reconcile::{
    ReconcileAction, ReconcileOutcome, ReconciliationScheduler, Reconciler, RecoveryReport,
    SweepReport,
};
pub use redemption::{CreateRedemptionRequest, RedemptionService};
pub use simulated::{SimulatedConfig, SimulatedStack};
pub use store::{RecordStore, StoreError};
pub use traits::{PaymentWatcher, ShareAccounting, SourceLedger, SourceTransaction};
pub use watch::SubscriptionRegistry;
pub use xrpl::XrplClient;

use fxrp_fdc::AttestationClient;

/// The external parties an [`Engine`] is built from.
pub struct EngineParts {
    pub store: RecordStore,
    pub backend: Arc<dyn SettlementBackend>,
    pub attestation: Arc<AttestationClient>,
    pub ledger: Arc<dyn SourceLedger>,
    pub shares: Arc<dyn ShareAccounting>,
    pub config: BridgeConfig,
}

/// Both state machines and the reconciler, sharing one store and one watch
/// registry.
#[derive(Clone)]
pub struct Engine {
    pub bridges: Arc<BridgeService>,
    pub redemptions: Arc<RedemptionService>,
    pub reconciler: Arc<Reconciler>,
    pub watcher: Arc<SubscriptionRegistry>,
    store: RecordStore,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        let watcher = Arc::new(SubscriptionRegistry::new());

        let bridges = Arc::new(BridgeService::new(
            parts.store.clone(),
            parts.backend.clone(),
            parts.attestation.clone(),
            parts.ledger.clone(),
            parts.shares.clone(),
            watcher.clone(),
            parts.config.clone(),
        ));
        let redemptions = Arc::new(RedemptionService::new(
            parts.store.clone(),
            parts.backend,
            parts.attestation,
            parts.ledger,
            parts.shares,
            watcher.clone(),
            parts.config,
        ));
        let reconciler = Arc::new(Reconciler::new(bridges.clone(), redemptions.clone()));

        Self {
            bridges,
            redemptions,
            reconciler,
            watcher,
            store: parts.store,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }
}
