//! Relayer configuration.
//!
//! Read from `FXRP_`-prefixed environment variables, with `__` separating
//! nested keys (`FXRP_EVM__RPC_URL`, `FXRP_BRIDGE__SWEEP_INTERVAL_SECS`). A
//! `.env` file is loaded first when present. Every key has a default, so an
//! empty environment starts a simulated relayer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use fxrp_common::{Amount, SourceNetwork};
use fxrp_engine::{BridgeConfig, EvmConfig};
use fxrp_fdc::{AttestationConfig, HttpTransportConfig};

const ENV_PREFIX: &str = "FXRP";

/// Which settlement backend the engine is assembled with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Simulated,
    Chain,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RelayerConfig {
    #[serde(default)]
    pub network: SourceNetwork,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub xrpl: XrplConfig,
    #[serde(default)]
    pub evm: EvmSection,
    #[serde(default)]
    pub fdc: FdcSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub simulated: SimulatedSection,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Capacity of the payment-event queue.
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct XrplConfig {
    #[serde(default = "default_xrpl_rpc")]
    pub rpc_url: String,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EvmSection {
    #[serde(default = "default_evm_rpc")]
    pub rpc_url: String,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub asset_manager: String,
    #[serde(default)]
    pub fxrp_token: String,
    #[serde(default)]
    pub fdc_hub: String,
    #[serde(default)]
    pub fee_config: String,
    #[serde(default)]
    pub systems_manager: String,
    /// Comma-separated ERC-4626 vault addresses bridges may deposit into.
    #[serde(default)]
    pub vaults: String,
    /// Asset-manager lot size, as a decimal amount.
    #[serde(default = "default_lot_size")]
    pub lot_size: Amount,
    /// Highest agent minting fee accepted when picking an agent.
    #[serde(default = "default_max_minting_fee_bips")]
    pub max_minting_fee_bips: u32,
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_receipt_poll")]
    pub receipt_poll_interval_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FdcSection {
    #[serde(default = "default_verifier_url")]
    pub verifier_url: String,
    #[serde(default)]
    pub verifier_api_key: Option<String>,
    #[serde(default = "default_da_url")]
    pub da_url: String,
    #[serde(default)]
    pub da_api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_prepare_attempts")]
    pub prepare_max_attempts: u32,
    #[serde(default = "default_prepare_interval")]
    pub prepare_interval_secs: u64,
    #[serde(default = "default_round_wait")]
    pub round_wait_rounds: u32,
    #[serde(default = "default_proof_poll")]
    pub proof_poll_interval_secs: u64,
    #[serde(default = "default_proof_timeout")]
    pub proof_timeout_secs: u64,
    #[serde(default = "default_lookback")]
    pub duplicate_lookback_blocks: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_reservation_window")]
    pub reservation_window_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_tx_age")]
    pub max_source_tx_age_secs: u64,
    #[serde(default = "default_clock_skew")]
    pub max_clock_skew_secs: u64,
}

/// Knobs for the simulated backend.
#[derive(Clone, Debug, Deserialize)]
pub struct SimulatedSection {
    #[serde(default = "default_sim_fee_bips")]
    pub fee_bips: u32,
    #[serde(default = "default_sim_lot_size")]
    pub lot_size: Amount,
    #[serde(default = "default_sim_round_duration")]
    pub round_duration_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Keep records in a temporary database, dropped on exit.
    #[serde(default)]
    pub in_memory: bool,
}

impl EvmSection {
    pub fn vault_addresses(&self) -> Vec<String> {
        self.vaults
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEFAULTS
// ═══════════════════════════════════════════════════════════════════════════════

fn default_bind() -> String {
    "0.0.0.0:3010".into()
}

fn default_event_queue() -> usize {
    1000
}

fn default_xrpl_rpc() -> String {
    "https://s.altnet.rippletest.net:51234".into()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_evm_rpc() -> String {
    "https://coston2-api.flare.network/ext/C/rpc".into()
}

fn default_lot_size() -> Amount {
    Amount::from_units(10)
}

fn default_max_minting_fee_bips() -> u32 {
    100
}

fn default_receipt_timeout() -> u64 {
    120
}

fn default_receipt_poll() -> u64 {
    3
}

fn default_verifier_url() -> String {
    "https://fdc-verifiers-testnet.flare.network/verifier".into()
}

fn default_da_url() -> String {
    "https://ctn2-data-availability.flare.network".into()
}

fn default_prepare_attempts() -> u32 {
    10
}

fn default_prepare_interval() -> u64 {
    5
}

fn default_round_wait() -> u32 {
    2
}

fn default_proof_poll() -> u64 {
    10
}

fn default_proof_timeout() -> u64 {
    15 * 60
}

fn default_lookback() -> u64 {
    50
}

fn default_reservation_window() -> u64 {
    15 * 60
}

fn default_sweep_interval() -> u64 {
    5 * 60
}

fn default_max_tx_age() -> u64 {
    365 * 24 * 60 * 60
}

fn default_clock_skew() -> u64 {
    60
}

fn default_sim_fee_bips() -> u32 {
    25
}

fn default_sim_lot_size() -> Amount {
    Amount::from_units(1)
}

fn default_sim_round_duration() -> u64 {
    90
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/fxrp-relayer")
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            event_queue: default_event_queue(),
        }
    }
}

impl Default for XrplConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_xrpl_rpc(),
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for EvmSection {
    fn default() -> Self {
        Self {
            rpc_url: default_evm_rpc(),
            private_key: None,
            asset_manager: String::new(),
            fxrp_token: String::new(),
            fdc_hub: String::new(),
            fee_config: String::new(),
            systems_manager: String::new(),
            vaults: String::new(),
            lot_size: default_lot_size(),
            max_minting_fee_bips: default_max_minting_fee_bips(),
            receipt_timeout_secs: default_receipt_timeout(),
            receipt_poll_interval_secs: default_receipt_poll(),
        }
    }
}

impl Default for FdcSection {
    fn default() -> Self {
        Self {
            verifier_url: default_verifier_url(),
            verifier_api_key: None,
            da_url: default_da_url(),
            da_api_key: None,
            request_timeout_secs: default_request_timeout(),
            prepare_max_attempts: default_prepare_attempts(),
            prepare_interval_secs: default_prepare_interval(),
            round_wait_rounds: default_round_wait(),
            proof_poll_interval_secs: default_proof_poll(),
            proof_timeout_secs: default_proof_timeout(),
            duplicate_lookback_blocks: default_lookback(),
        }
    }
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            reservation_window_secs: default_reservation_window(),
            sweep_interval_secs: default_sweep_interval(),
            max_source_tx_age_secs: default_max_tx_age(),
            max_clock_skew_secs: default_clock_skew(),
        }
    }
}

impl Default for SimulatedSection {
    fn default() -> Self {
        Self {
            fee_bips: default_sim_fee_bips(),
            lot_size: default_sim_lot_size(),
            round_duration_secs: default_sim_round_duration(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            in_memory: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOADING
// ═══════════════════════════════════════════════════════════════════════════════

impl RelayerConfig {
    /// Load `.env`, then the `FXRP_` environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_environment(None)
    }

    /// Load from an explicit variable map instead of the process environment.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        Self::from_environment(Some(vars))
    }

    fn from_environment(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(vars);
        let config: RelayerConfig = config::Config::builder()
            .add_source(environment)
            .build()
            .context("reading FXRP_ environment")?
            .try_deserialize()
            .context("parsing relayer configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bridge.sweep_interval_secs == 0 {
            bail!("FXRP_BRIDGE__SWEEP_INTERVAL_SECS must be positive");
        }
        if self.mode == Mode::Chain {
            let missing: Vec<&str> = [
                ("asset_manager", &self.evm.asset_manager),
                ("fxrp_token", &self.evm.fxrp_token),
                ("fdc_hub", &self.evm.fdc_hub),
                ("fee_config", &self.evm.fee_config),
                ("systems_manager", &self.evm.systems_manager),
            ]
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name)
            .collect();
            if !missing.is_empty() {
                bail!("chain mode needs FXRP_EVM__ addresses for: {}", missing.join(", "));
            }
            if self.evm.lot_size.is_zero() {
                bail!("FXRP_EVM__LOT_SIZE must be positive");
            }
            if self.evm.vault_addresses().is_empty() {
                bail!("chain mode needs at least one vault in FXRP_EVM__VAULTS");
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ENGINE SETTINGS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            network: self.network,
            reservation_window: chrono::Duration::seconds(self.bridge.reservation_window_secs as i64),
            max_source_tx_age: chrono::Duration::seconds(self.bridge.max_source_tx_age_secs as i64),
            max_clock_skew: chrono::Duration::seconds(self.bridge.max_clock_skew_secs as i64),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.sweep_interval_secs)
    }

    pub fn attestation_config(&self) -> AttestationConfig {
        AttestationConfig {
            prepare_max_attempts: self.fdc.prepare_max_attempts,
            prepare_interval: Duration::from_secs(self.fdc.prepare_interval_secs),
            round_wait_rounds: self.fdc.round_wait_rounds,
            proof_poll_interval: Duration::from_secs(self.fdc.proof_poll_interval_secs),
            proof_timeout: Duration::from_secs(self.fdc.proof_timeout_secs),
            duplicate_lookback_blocks: self.fdc.duplicate_lookback_blocks,
        }
    }

    pub fn verifier_transport(&self) -> HttpTransportConfig {
        let mut transport =
            HttpTransportConfig::new(&self.fdc.verifier_url).with_api_key(self.fdc.verifier_api_key.clone());
        transport.timeout = Duration::from_secs(self.fdc.request_timeout_secs);
        transport
    }

    pub fn da_transport(&self) -> HttpTransportConfig {
        let mut transport = HttpTransportConfig::new(&self.fdc.da_url).with_api_key(self.fdc.da_api_key.clone());
        transport.timeout = Duration::from_secs(self.fdc.request_timeout_secs);
        transport
    }

    pub fn evm_config(&self) -> EvmConfig {
        EvmConfig {
            rpc_url: self.evm.rpc_url.clone(),
            private_key: self.evm.private_key.clone().filter(|k| !k.is_empty()),
            asset_manager: self.evm.asset_manager.clone(),
            fxrp_token: self.evm.fxrp_token.clone(),
            fdc_hub: self.evm.fdc_hub.clone(),
            fee_config: self.evm.fee_config.clone(),
            systems_manager: self.evm.systems_manager.clone(),
            vaults: self.evm.vault_addresses(),
            receipt_timeout: Duration::from_secs(self.evm.receipt_timeout_secs),
            receipt_poll_interval: Duration::from_secs(self.evm.receipt_poll_interval_secs),
        }
    }
}
