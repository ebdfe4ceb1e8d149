//! Builds an [`Engine`] from configuration.
//!
//! The settlement backend is chosen once here. Simulated mode wires every
//! collaborator to the in-process stand-ins. Chain mode talks to the EVM chain
//! (asset manager, attestation hub and ERC-4626 vaults), the attestation
//! verifier and data-availability layer, and the XRPL node.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use fxrp_engine::{
    ChainBackend, Engine, EngineParts, EvmGateway, RecordStore, SimulatedConfig, SimulatedStack,
    XrplClient,
};
use fxrp_fdc::{AttestationClient, HttpDataAvailability, HttpVerifier, RoundSchedule};

use crate::config::{Mode, RelayerConfig};

/// First voting round start used by the simulated attestation layer.
const SIMULATED_FIRST_ROUND_START: u64 = 1_658_430_000;

/// A built engine and, in simulated mode, the stand-ins it runs against.
pub struct Assembled {
    pub engine: Engine,
    pub simulated: Option<SimulatedStack>,
}

pub async fn build_engine(config: &RelayerConfig) -> Result<Assembled> {
    let store = open_store(config)?;
    match config.mode {
        Mode::Simulated => Ok(simulated_engine(config, store)),
        Mode::Chain => chain_engine(config, store).await,
    }
}

fn open_store(config: &RelayerConfig) -> Result<RecordStore> {
    if config.store.in_memory {
        warn!("Using in-memory record store; records are lost on exit");
        return RecordStore::in_memory().context("opening in-memory store");
    }
    RecordStore::persistent(&config.store.path)
        .with_context(|| format!("opening record store at {}", config.store.path.display()))
}

/// Engine over the simulated stack.
pub fn simulated_engine(config: &RelayerConfig, store: RecordStore) -> Assembled {
    let sim_config = SimulatedConfig {
        fee_bips: config.simulated.fee_bips,
        lot_size: config.simulated.lot_size,
        reservation_window: chrono::Duration::seconds(config.bridge.reservation_window_secs as i64),
        ..SimulatedConfig::default()
    };
    let schedule = RoundSchedule::new(SIMULATED_FIRST_ROUND_START, config.simulated.round_duration_secs);
    let sim = SimulatedStack::new(sim_config, schedule);

    let engine = Engine::new(EngineParts {
        store,
        backend: sim.backend.clone(),
        attestation: Arc::new(sim.attestation_client(config.attestation_config())),
        ledger: sim.ledger.clone(),
        shares: sim.shares.clone(),
        config: config.bridge_config(),
    });
    info!(
        network = ?config.network,
        fee_bips = config.simulated.fee_bips,
        lot_size = %config.simulated.lot_size,
        "Assembled simulated engine"
    );

    Assembled {
        engine,
        simulated: Some(sim),
    }
}

async fn chain_engine(config: &RelayerConfig, store: RecordStore) -> Result<Assembled> {
    let gateway = Arc::new(
        EvmGateway::connect(config.evm_config())
            .await
            .with_context(|| format!("connecting to EVM node at {}", config.evm.rpc_url))?,
    );
    let backend = Arc::new(ChainBackend::new(
        gateway.clone(),
        config.evm.lot_size,
        config.evm.max_minting_fee_bips,
    ));

    let verifier = Arc::new(HttpVerifier::new(config.verifier_transport()).context("building verifier client")?);
    let data_availability =
        Arc::new(HttpDataAvailability::new(config.da_transport()).context("building data-availability client")?);
    let attestation = Arc::new(AttestationClient::new(
        verifier,
        gateway.clone(),
        data_availability,
        config.attestation_config(),
    ));

    let ledger = Arc::new(
        XrplClient::new(&config.xrpl.rpc_url, Duration::from_secs(config.xrpl.timeout_secs))
            .context("building XRPL client")?,
    );

    let engine = Engine::new(EngineParts {
        store,
        backend,
        attestation,
        ledger,
        shares: gateway,
        config: config.bridge_config(),
    });
    info!(
        network = ?config.network,
        evm_rpc = %config.evm.rpc_url,
        vaults = config.evm.vault_addresses().len(),
        xrpl_rpc = %config.xrpl.rpc_url,
        "Assembled chain engine"
    );

    Ok(Assembled {
        engine,
        simulated: None,
    })
}
