//! fxrp-relayer
//!
//! Axum-based HTTP service in front of the FXRP bridge engine. Users open
//! bridges and redemptions here; payment notices are queued for the dispatcher,
//! and operators trigger reconciliation and recovery.

pub mod assembly;
pub mod config;
pub mod dispatch;
pub mod logging;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use fxrp_common::{
    Amount, BridgeRecord, BridgeStatus, PaymentEvent, PaymentInstruction, PaymentTarget, Position,
    RedemptionRecord, RedemptionStatus, SourceNetwork,
};
use fxrp_engine::{
    BackendError, BridgeError, CreateBridgeRequest, CreateRedemptionRequest, Engine, SimulatedStack,
    StoreError,
};

use crate::dispatch::PaymentSender;

/// Source address simulated payments are sent from when the caller names none.
const SIMULATED_USER_SOURCE: &str = "rSimulatedUserSourceXXXXXXXXXXXXX";

// ═══════════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Queue drained by the payment dispatcher
    pub payments: PaymentSender,
    pub network: SourceNetwork,
    /// Present only when the engine runs against the simulated stack
    pub simulated: Option<SimulatedStack>,
}

impl AppState {
    pub fn new(
        engine: Engine,
        payments: PaymentSender,
        network: SourceNetwork,
        simulated: Option<SimulatedStack>,
    ) -> Self {
        Self {
            engine,
            payments,
            network,
            simulated,
        }
    }

    fn backend_name(&self) -> &'static str {
        if self.simulated.is_some() {
            "simulated"
        } else {
            "chain"
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Build the router
pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // Bridges
        .route("/bridges", post(create_bridge))
        .route("/bridges/:id", get(get_bridge))
        .route("/bridges/:id/payment-request", get(get_payment_request))
        .route("/bridges/:id/payment", post(notify_payment))
        .route("/bridges/:id/reconcile", post(reconcile_bridge))
        // Redemptions
        .route("/redemptions", post(create_redemption))
        .route("/redemptions/:id", get(get_redemption))
        .route("/redemptions/:id/payout", post(notify_payout))
        .route("/redemptions/:id/reconcile", post(reconcile_redemption))
        // Positions and watched addresses
        .route("/wallets/:address/positions", get(wallet_positions))
        .route("/watch", get(watched_addresses))
        // Recovery
        .route("/recovery", get(list_recoverable))
        .route("/recovery/run", post(run_recovery))
        // Simulated ledger
        .route("/simulate/bridges/:id/pay", post(simulate_bridge_payment))
        .route("/simulate/redemptions/:id/payout", post(simulate_redemption_payout))
        .layer(cors)
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS: HEALTH
// ═══════════════════════════════════════════════════════════════════════════════

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "fxrp-relayer",
        "backend": state.backend_name(),
        "network": state.network.as_str(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS: BRIDGES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct BridgeCreated {
    pub bridge: BridgeRecord,
    pub payment_request: PaymentInstruction,
}

/// Create a bridge and reserve collateral for it in one call.
async fn create_bridge(
    State(state): State<AppState>,
    Json(req): Json<CreateBridgeRequest>,
) -> Result<(StatusCode, Json<BridgeCreated>), ApiError> {
    let bridges = &state.engine.bridges;
    let record = bridges.create_bridge(req)?;
    let bridge = bridges.reserve_collateral_quick(&record.id).await?;
    let payment_request = bridges.build_payment_request(&bridge)?;

    info!(bridge_id = %bridge.id, amount = %bridge.source_amount, "Bridge opened");
    Ok((
        StatusCode::CREATED,
        Json(BridgeCreated {
            bridge,
            payment_request,
        }),
    ))
}

async fn get_bridge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BridgeRecord>, ApiError> {
    Ok(Json(state.engine.bridges.get_bridge(&id)?))
}

async fn get_payment_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PaymentInstruction>, ApiError> {
    let bridges = &state.engine.bridges;
    let record = bridges.get_bridge(&id)?;
    Ok(Json(bridges.build_payment_request(&record)?))
}

/// A payment seen on the source ledger. Only `tx_hash` is required; the
/// ledger's copy of the transaction is what gets validated.
#[derive(Debug, Default, Deserialize)]
pub struct PaymentNotice {
    pub tx_hash: String,
    #[serde(default)]
    pub amount: Option<Amount>,
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default)]
    pub to_address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub id: String,
    pub tx_hash: String,
    pub status: &'static str,
}

async fn notify_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(notice): Json<PaymentNotice>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let record = state.engine.bridges.get_bridge(&id)?;
    let event = bridge_payment_event(&record, notice)?;
    enqueue(&state, event)
}

fn bridge_payment_event(record: &BridgeRecord, notice: PaymentNotice) -> Result<PaymentEvent, ApiError> {
    if notice.tx_hash.trim().is_empty() {
        return Err(ApiError::bad_request("tx_hash is required"));
    }
    if record.status.is_terminal() {
        return Err(BridgeError::Terminal {
            id: record.id.clone(),
            status: record.status.to_string(),
        }
        .into());
    }
    if !matches!(
        record.status,
        BridgeStatus::AwaitingPayment | BridgeStatus::XrplConfirmed
    ) {
        return Err(BridgeError::InvalidState {
            id: record.id.clone(),
            status: record.status.to_string(),
            operation: "accept a payment for",
        }
        .into());
    }

    Ok(PaymentEvent {
        target: PaymentTarget::Bridge(record.id.clone()),
        tx_hash: notice.tx_hash,
        amount: notice
            .amount
            .or(record.total_amount_raw.map(Amount::from_raw))
            .unwrap_or(record.source_amount),
        from_address: notice.from_address.unwrap_or_default(),
        to_address: notice
            .to_address
            .or_else(|| record.agent_source_address.clone())
            .unwrap_or_default(),
    })
}

async fn reconcile_bridge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.engine.bridges.reconcile_bridge(&id).await?;
    Ok(Json(serde_json::json!(outcome)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS: REDEMPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Create a redemption and burn its shares and wrapped asset in one call.
async fn create_redemption(
    State(state): State<AppState>,
    Json(req): Json<CreateRedemptionRequest>,
) -> Result<(StatusCode, Json<RedemptionRecord>), ApiError> {
    let redemptions = &state.engine.redemptions;
    let record = redemptions.create_redemption(req)?;
    let record = redemptions.request_redemption(&record.id).await?;

    info!(redemption_id = %record.id, shares = %record.share_amount, "Redemption opened");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_redemption(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RedemptionRecord>, ApiError> {
    Ok(Json(state.engine.redemptions.get_redemption(&id)?))
}

async fn notify_payout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(notice): Json<PaymentNotice>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let record = state.engine.redemptions.get_redemption(&id)?;
    let event = redemption_payout_event(&record, notice)?;
    enqueue(&state, event)
}

fn redemption_payout_event(
    record: &RedemptionRecord,
    notice: PaymentNotice,
) -> Result<PaymentEvent, ApiError> {
    if notice.tx_hash.trim().is_empty() {
        return Err(ApiError::bad_request("tx_hash is required"));
    }
    if !matches!(
        record.status,
        RedemptionStatus::AwaitingPayout | RedemptionStatus::XrplReceived
    ) {
        return Err(BridgeError::InvalidState {
            id: record.id.clone(),
            status: record.status.to_string(),
            operation: "accept a payout for",
        }
        .into());
    }

    Ok(PaymentEvent {
        target: PaymentTarget::Redemption(record.id.clone()),
        tx_hash: notice.tx_hash,
        amount: notice
            .amount
            .or(record.expected_payout_raw.map(Amount::from_raw))
            .unwrap_or(Amount::ZERO),
        from_address: notice
            .from_address
            .or_else(|| record.agent_source_address.clone())
            .unwrap_or_default(),
        to_address: notice
            .to_address
            .unwrap_or_else(|| record.user_source_address.clone()),
    })
}

async fn reconcile_redemption(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.engine.redemptions.reconcile_redemption(&id).await?;
    Ok(Json(serde_json::json!(outcome)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS: POSITIONS & WATCH
// ═══════════════════════════════════════════════════════════════════════════════

async fn wallet_positions(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<Position>>, ApiError> {
    let positions = state
        .engine
        .store()
        .positions_for(&address)
        .map_err(BridgeError::from)?;
    Ok(Json(positions))
}

/// Addresses an external ledger listener should follow.
async fn watched_addresses(State(state): State<AppState>) -> Json<serde_json::Value> {
    let watcher = &state.engine.watcher;
    Json(serde_json::json!({
        "agent_addresses": watcher.agent_addresses(),
        "user_addresses": watcher.user_addresses(),
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS: RECOVERY
// ═══════════════════════════════════════════════════════════════════════════════

async fn list_recoverable(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.engine.store();
    let bridges = store.recoverable_bridges().map_err(BridgeError::from)?;
    let redemptions = store.recoverable_redemptions().map_err(BridgeError::from)?;
    Ok(Json(serde_json::json!({
        "count": bridges.len() + redemptions.len(),
        "bridges": bridges,
        "redemptions": redemptions,
    })))
}

/// Cancel lapsed reservations, then drive every recoverable record.
async fn run_recovery(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let reconciler = &state.engine.reconciler;
    let sweep = reconciler.sweep_expired(Utc::now()).await?;
    let recovery = reconciler.recover_all().await?;
    Ok(Json(serde_json::json!({
        "sweep": sweep,
        "recovery": recovery,
    })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS: SIMULATED LEDGER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct SimulatedPayment {
    /// Defaults to the exact amount requested.
    #[serde(default)]
    pub amount: Option<Amount>,
    #[serde(default)]
    pub from_address: Option<String>,
}

/// Record the payment a bridge asks for on the simulated ledger and queue it.
async fn simulate_bridge_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<SimulatedPayment>>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let sim = simulated(&state)?;
    let payment = body.map(|Json(p)| p).unwrap_or_default();
    let bridges = &state.engine.bridges;
    let record = bridges.get_bridge(&id)?;
    let instruction = bridges.build_payment_request(&record)?;

    let from = payment
        .from_address
        .unwrap_or_else(|| SIMULATED_USER_SOURCE.to_string());
    let tx = sim.ledger.record_payment(
        &from,
        &instruction.destination,
        payment.amount.unwrap_or(instruction.amount),
        &instruction.memo,
        Utc::now(),
    );
    let event = bridge_payment_event(
        &record,
        PaymentNotice {
            tx_hash: tx.hash,
            amount: Some(tx.delivered_amount),
            from_address: Some(tx.source),
            to_address: Some(tx.destination),
        },
    )?;
    enqueue(&state, event)
}

/// Record the agent's payout for a redemption on the simulated ledger and queue it.
async fn simulate_redemption_payout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<SimulatedPayment>>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let sim = simulated(&state)?;
    let payment = body.map(|Json(p)| p).unwrap_or_default();
    let record = state.engine.redemptions.get_redemption(&id)?;

    let (Some(reference), Some(expected)) = (
        record.payment_reference.as_deref(),
        record.expected_payout_raw,
    ) else {
        return Err(BridgeError::InvalidState {
            id: record.id.clone(),
            status: record.status.to_string(),
            operation: "simulate a payout for",
        }
        .into());
    };
    let from = payment
        .from_address
        .or_else(|| record.agent_source_address.clone())
        .unwrap_or_else(|| sim.backend.config().agent_source_address.clone());
    let tx = sim.ledger.record_payment(
        &from,
        &record.user_source_address,
        payment.amount.unwrap_or(Amount::from_raw(expected)),
        reference,
        Utc::now(),
    );
    let event = redemption_payout_event(
        &record,
        PaymentNotice {
            tx_hash: tx.hash,
            amount: Some(tx.delivered_amount),
            from_address: Some(tx.source),
            to_address: Some(tx.destination),
        },
    )?;
    enqueue(&state, event)
}

fn simulated(state: &AppState) -> Result<&SimulatedStack, ApiError> {
    state.simulated.as_ref().ok_or_else(|| ApiError {
        status: StatusCode::NOT_FOUND,
        message: "Simulated ledger is only available in simulated mode".into(),
        code: "SIMULATION_DISABLED".into(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn enqueue(state: &AppState, event: PaymentEvent) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let id = match &event.target {
        PaymentTarget::Bridge(id) | PaymentTarget::Redemption(id) => id.clone(),
    };
    let tx_hash = event.tx_hash.clone();

    state.payments.try_send(event).map_err(|e| match e {
        TrySendError::Full(_) => ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "Payment queue is full, retry later".into(),
            code: "QUEUE_FULL".into(),
        },
        TrySendError::Closed(_) => ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "Payment dispatcher is shutting down".into(),
            code: "SHUTTING_DOWN".into(),
        },
    })?;

    info!(record_id = %id, tx_hash = %tx_hash, "Payment queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            id,
            tx_hash,
            status: "accepted",
        }),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR HANDLING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: "INVALID_REQUEST".into(),
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let (status, code) = match &err {
            BridgeError::NotFound { .. } | BridgeError::Store(StoreError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            BridgeError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            BridgeError::Store(StoreError::InsufficientShares { .. }) => {
                (StatusCode::BAD_REQUEST, "INSUFFICIENT_SHARES")
            }
            BridgeError::Expired { .. } => (StatusCode::GONE, "RESERVATION_EXPIRED"),
            BridgeError::Terminal { .. } => (StatusCode::CONFLICT, "TERMINAL_STATE"),
            BridgeError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
            BridgeError::MissingField { .. } => (StatusCode::CONFLICT, "MISSING_FIELD"),
            BridgeError::Transition(_) => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            BridgeError::InvalidSourceTransaction(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_SOURCE_TRANSACTION")
            }
            BridgeError::Backend(BackendError::NoAgentAvailable { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "NO_AGENT_AVAILABLE")
            }
            BridgeError::Backend(BackendError::InvalidAmount(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_AMOUNT")
            }
            BridgeError::Backend(_) => (StatusCode::BAD_GATEWAY, "BACKEND_ERROR"),
            BridgeError::Attestation(_) => (StatusCode::BAD_GATEWAY, "ATTESTATION_ERROR"),
            BridgeError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
        };
        if status.is_server_error() {
            warn!(error_code = code, "Request failed: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
            code: code.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": self.message,
            "error_code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVER
// ═══════════════════════════════════════════════════════════════════════════════

pub mod main_entry {
    use super::*;

    use anyhow::Context;
    use fxrp_engine::ReconciliationScheduler;

    use crate::assembly::build_engine;
    use crate::config::RelayerConfig;
    use crate::dispatch::PaymentDispatcher;

    /// Load configuration, assemble the engine and serve until interrupted.
    pub async fn run_server() -> anyhow::Result<()> {
        logging::init();
        let config = RelayerConfig::load()?;
        info!(mode = ?config.mode, network = ?config.network, "Starting FXRP relayer");

        let assembled = build_engine(&config).await?;
        let engine = assembled.engine;

        let (dispatcher, payments) = PaymentDispatcher::spawn(engine.clone(), config.http.event_queue);
        let mut scheduler = ReconciliationScheduler::new(engine.reconciler.clone(), config.sweep_interval());
        scheduler.start();

        let state = AppState::new(engine.clone(), payments, config.network, assembled.simulated);
        let listener = tokio::net::TcpListener::bind(&config.http.bind)
            .await
            .with_context(|| format!("binding {}", config.http.bind))?;
        info!("FXRP relayer listening on {}", config.http.bind);

        axum::serve(listener, app_router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("serving HTTP")?;

        info!("Shutting down");
        scheduler.stop().await;
        dispatcher.stop().await;
        engine.store().flush().await.context("flushing record store")?;
        info!("FXRP relayer stopped");
        Ok(())
    }

    async fn shutdown_signal() {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received ctrl-c"),
            _ = terminate => info!("Received SIGTERM"),
        }
    }
}
