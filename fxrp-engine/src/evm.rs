//! EVM destination gateway.
//!
//! Talks to the asset manager (agents, reservations, minting, redemption), the
//! attestation hub and its fee configuration, the systems manager that
//! publishes the voting-round schedule, and the ERC-4626 vaults minted FXRP is
//! deposited into. Calldata is built from selectors and
//! `ethers::abi` tokens; events are decoded straight from receipt logs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{id, keccak256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fxrp_common::{normalize_hex, Amount, AttestationProof, CollateralReservation, RedemptionTicket};
use fxrp_fdc::encoding::{contains_request, decode_request};
use fxrp_fdc::{AttestationHub, HubError, HubSubmission, RoundSchedule};

use crate::error::BackendError;
use crate::traits::{
    position_id_for, AgentInfo, DestinationGateway, MintedShares, RedeemedShares, ShareAccounting,
};

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

const PROOF_TUPLE: &str = "(bytes32[],(bytes32,bytes32,uint64,uint64,(bytes32,uint256,uint256),(uint64,uint64,bytes32,bytes32,bytes32,bytes32,int256,int256,int256,int256,bytes32,bool,uint8)))";

const COLLATERAL_RESERVED: &str = "CollateralReserved(address,address,uint256,uint256,uint256,uint256,uint256,uint256,string,bytes32,address,uint256)";
const REDEMPTION_REQUESTED: &str = "RedemptionRequested(address,address,uint256,string,uint256,uint256,uint256,uint256,uint256,bytes32,address,uint256)";
const TRANSFER: &str = "Transfer(address,address,uint256)";
const VAULT_DEPOSIT: &str = "Deposit(address,address,uint256,uint256)";
const VAULT_WITHDRAW: &str = "Withdraw(address,address,address,uint256,uint256)";

/// Agent status reported by the asset manager for agents open to minting.
const AGENT_STATUS_NORMAL: u64 = 0;
const AGENT_PAGE_SIZE: u64 = 100;

/// Contract addresses and timings for the gateway.
#[derive(Clone, Debug)]
pub struct EvmConfig {
    pub rpc_url: String,
    /// Signing key; a throwaway key is generated when absent (read-only use).
    pub private_key: Option<String>,
    pub asset_manager: String,
    pub fxrp_token: String,
    pub fdc_hub: String,
    pub fee_config: String,
    pub systems_manager: String,
    /// Vaults shares may be minted in; a vault id is its contract address.
    pub vaults: Vec<String>,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
}

/// Gateway over an HTTP JSON-RPC provider with a local signer.
pub struct EvmGateway {
    client: Client,
    asset_manager: Address,
    fxrp_token: Address,
    fdc_hub: Address,
    fee_config: Address,
    systems_manager: Address,
    vaults: Vec<Address>,
    receipt_timeout: Duration,
    receipt_poll_interval: Duration,
}

fn parse_address(name: &str, value: &str) -> Result<Address, BackendError> {
    value
        .parse::<Address>()
        .map_err(|e| BackendError::Config(format!("{} address {}: {}", name, value, e)))
}

fn parse_hash(value: &str) -> Result<H256, BackendError> {
    value
        .parse::<H256>()
        .map_err(|e| BackendError::Decode(format!("tx hash {}: {}", value, e)))
}

fn hex_of<T: std::fmt::Debug>(value: &T) -> String {
    format!("{:?}", value)
}

fn to_u128(value: U256) -> Result<u128, BackendError> {
    if value > U256::from(u128::MAX) {
        return Err(BackendError::Decode(format!("{} does not fit in u128", value)));
    }
    Ok(value.as_u128())
}

fn to_u64(value: U256) -> Result<u64, BackendError> {
    if value > U256::from(u64::MAX) {
        return Err(BackendError::Decode(format!("{} does not fit in u64", value)));
    }
    Ok(value.as_u64())
}

impl EvmGateway {
    pub async fn connect(config: EvmConfig) -> Result<Self, BackendError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| BackendError::Config(format!("provider {}: {}", config.rpc_url, e)))?;
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| BackendError::Rpc(e.to_string()))?;

        let wallet = match &config.private_key {
            Some(key) => key
                .parse::<LocalWallet>()
                .map_err(|e| BackendError::Config(format!("private key: {}", e)))?,
            None => {
                warn!("No EVM private key configured, using an ephemeral signer");
                LocalWallet::new(&mut rand::thread_rng())
            }
        };
        let wallet = wallet.with_chain_id(chain_id.as_u64());
        info!(chain_id = %chain_id, signer = ?wallet.address(), "Connected to destination chain");

        let vaults = config
            .vaults
            .iter()
            .map(|vault| parse_address("vault", vault))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            client: SignerMiddleware::new(provider, wallet),
            asset_manager: parse_address("asset manager", &config.asset_manager)?,
            fxrp_token: parse_address("fxrp token", &config.fxrp_token)?,
            fdc_hub: parse_address("fdc hub", &config.fdc_hub)?,
            fee_config: parse_address("fee config", &config.fee_config)?,
            systems_manager: parse_address("systems manager", &config.systems_manager)?,
            vaults,
            receipt_timeout: config.receipt_timeout,
            receipt_poll_interval: config.receipt_poll_interval,
        })
    }

    fn signer(&self) -> Address {
        self.client.address()
    }

    fn vault(&self, vault_id: &str) -> Result<Address, BackendError> {
        let vault = parse_address("vault", vault_id)?;
        if !self.vaults.contains(&vault) {
            return Err(BackendError::Vault(format!("vault {} is not configured", vault_id)));
        }
        Ok(vault)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // RPC HELPERS
    // ═══════════════════════════════════════════════════════════════════════════

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, BackendError> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.client
            .call(&tx, None)
            .await
            .map_err(|e| BackendError::Rpc(e.to_string()))
    }

    async fn call_decode(
        &self,
        to: Address,
        data: Bytes,
        outputs: &[ParamType],
    ) -> Result<Vec<Token>, BackendError> {
        let raw = self.call(to, data).await?;
        abi::decode(outputs, &raw).map_err(|e| BackendError::Decode(e.to_string()))
    }

    /// Broadcast and return the hash without waiting for inclusion.
    async fn send(&self, to: Address, data: Bytes, value: U256) -> Result<H256, String> {
        let tx = TransactionRequest::new().to(to).data(data).value(value);
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| e.to_string())?;
        Ok(pending.tx_hash())
    }

    async fn wait_receipt(&self, tx_hash: H256) -> Result<TransactionReceipt, BackendError> {
        let deadline = Instant::now() + self.receipt_timeout;
        loop {
            match self.client.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status == Some(U64::zero()) {
                        return Err(BackendError::Reverted {
                            tx_hash: hex_of(&tx_hash),
                        });
                    }
                    return Ok(receipt);
                }
                Ok(None) => debug!(tx_hash = ?tx_hash, "Receipt not available yet"),
                Err(e) => warn!(tx_hash = ?tx_hash, "Receipt lookup failed: {}", e),
            }
            if Instant::now() >= deadline {
                return Err(BackendError::ReceiptUnavailable {
                    tx_hash: hex_of(&tx_hash),
                });
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, BackendError> {
        let block = self
            .client
            .get_block(block_number)
            .await
            .map_err(|e| BackendError::Rpc(e.to_string()))?
            .ok_or_else(|| BackendError::Rpc(format!("block {} not found", block_number)))?;
        to_u64(block.timestamp)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ABI
// ═══════════════════════════════════════════════════════════════════════════════

fn calldata(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(tokens));
    Bytes::from(data)
}

/// `IPayment.Response` as returned by the data-availability layer.
fn payment_response_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::FixedBytes(32),
        ParamType::FixedBytes(32),
        ParamType::Uint(64),
        ParamType::Uint(64),
        ParamType::Tuple(vec![
            ParamType::FixedBytes(32),
            ParamType::Uint(256),
            ParamType::Uint(256),
        ]),
        ParamType::Tuple(vec![
            ParamType::Uint(64),
            ParamType::Uint(64),
            ParamType::FixedBytes(32),
            ParamType::FixedBytes(32),
            ParamType::FixedBytes(32),
            ParamType::FixedBytes(32),
            ParamType::Int(256),
            ParamType::Int(256),
            ParamType::Int(256),
            ParamType::Int(256),
            ParamType::FixedBytes(32),
            ParamType::Bool,
            ParamType::Uint(8),
        ]),
    ])
}

/// `IPayment.Proof { bytes32[] merkleProof; Response data; }`.
fn proof_token(proof: &AttestationProof) -> Result<Token, BackendError> {
    let response_bytes = decode_request(&proof.response_hex)
        .map_err(|e| BackendError::Decode(e.to_string()))?;
    let mut response = abi::decode(&[payment_response_type()], &response_bytes)
        .map_err(|e| BackendError::Decode(format!("attestation response: {}", e)))?;
    let response = response
        .pop()
        .ok_or_else(|| BackendError::Decode("empty attestation response".into()))?;

    let merkle_proof = proof
        .merkle_proof
        .iter()
        .map(|node| {
            let bytes = decode_request(node).map_err(|e| BackendError::Decode(e.to_string()))?;
            if bytes.len() != 32 {
                return Err(BackendError::Decode(format!("merkle node {} is not 32 bytes", node)));
            }
            Ok(Token::FixedBytes(bytes))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Token::Tuple(vec![Token::Array(merkle_proof), response]))
}

fn parse_id(value: &str) -> Result<U256, BackendError> {
    U256::from_dec_str(value).map_err(|e| BackendError::Decode(format!("id {}: {}", value, e)))
}

fn event_logs<'a>(receipt: &'a TransactionReceipt, emitter: Address, signature: &str) -> Vec<&'a Log> {
    let topic = H256::from(keccak256(signature.as_bytes()));
    receipt
        .logs
        .iter()
        .filter(|log| log.address == emitter && log.topics.first() == Some(&topic))
        .collect()
}

fn topic_u256(log: &Log, index: usize) -> Result<U256, BackendError> {
    log.topics
        .get(index)
        .map(|t| U256::from_big_endian(t.as_bytes()))
        .ok_or_else(|| BackendError::Decode(format!("missing topic {}", index)))
}

fn topic_address(log: &Log, index: usize) -> Result<Address, BackendError> {
    log.topics
        .get(index)
        .map(|t| Address::from_slice(&t.as_bytes()[12..]))
        .ok_or_else(|| BackendError::Decode(format!("missing topic {}", index)))
}

fn uint(token: &Token) -> Result<U256, BackendError> {
    token
        .clone()
        .into_uint()
        .ok_or_else(|| BackendError::Decode(format!("expected uint, got {:?}", token)))
}

fn decode_collateral_reserved(log: &Log) -> Result<CollateralReservation, BackendError> {
    let agent_vault = topic_address(log, 1)?;
    let reservation_id = topic_u256(log, 3)?;
    let data = abi::decode(
        &[
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::String,
            ParamType::FixedBytes(32),
            ParamType::Address,
            ParamType::Uint(256),
        ],
        &log.data,
    )
    .map_err(|e| BackendError::Decode(format!("CollateralReserved: {}", e)))?;

    let last_timestamp = to_u64(uint(&data[4])?)?;
    let expires_at = Utc
        .timestamp_opt(last_timestamp as i64, 0)
        .single()
        .ok_or_else(|| BackendError::Decode(format!("invalid payment deadline {}", last_timestamp)))?;
    let payment_address = data[5]
        .clone()
        .into_string()
        .ok_or_else(|| BackendError::Decode("payment address".into()))?;
    let payment_reference = data[6]
        .clone()
        .into_fixed_bytes()
        .ok_or_else(|| BackendError::Decode("payment reference".into()))?;

    Ok(CollateralReservation {
        reservation_id: reservation_id.to_string(),
        agent_vault_address: hex_of(&agent_vault),
        agent_source_address: payment_address,
        payment_reference: format!("0x{}", hex::encode(payment_reference)),
        value_raw: to_u128(uint(&data[0])?)?,
        fee_raw: to_u128(uint(&data[1])?)?,
        expires_at,
    })
}

fn decode_redemption_requested(log: &Log, tx_hash: &str) -> Result<RedemptionTicket, BackendError> {
    let agent_vault = topic_address(log, 1)?;
    let request_id = topic_u256(log, 3)?;
    let data = abi::decode(
        &[
            ParamType::String,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::FixedBytes(32),
            ParamType::Address,
            ParamType::Uint(256),
        ],
        &log.data,
    )
    .map_err(|e| BackendError::Decode(format!("RedemptionRequested: {}", e)))?;

    let value = to_u128(uint(&data[1])?)?;
    let fee = to_u128(uint(&data[2])?)?;
    let payment_reference = data[6]
        .clone()
        .into_fixed_bytes()
        .ok_or_else(|| BackendError::Decode("payment reference".into()))?;

    Ok(RedemptionTicket {
        request_id: request_id.to_string(),
        redemption_tx_hash: tx_hash.to_string(),
        agent_vault_address: hex_of(&agent_vault),
        // The event carries the redeemer's address, not the agent's.
        agent_source_address: String::new(),
        payment_reference: format!("0x{}", hex::encode(payment_reference)),
        expected_payout_raw: value.saturating_sub(fee),
    })
}

/// Sum of tokens minted (transferred from the zero address) to `recipient`.
fn minted_to(receipt: &TransactionReceipt, token: Address, recipient: Address) -> Result<Option<U256>, BackendError> {
    let mut total: Option<U256> = None;
    for log in event_logs(receipt, token, TRANSFER) {
        if topic_address(log, 1)? != Address::zero() || topic_address(log, 2)? != recipient {
            continue;
        }
        let value = U256::from_big_endian(&log.data);
        total = Some(total.unwrap_or_default() + value);
    }
    Ok(total)
}

/// `(assets, shares)` from the first ERC-4626 `Deposit` or `Withdraw` event
/// `vault` emitted; both put the two amounts last in their data.
fn vault_amounts(
    receipt: &TransactionReceipt,
    vault: Address,
    signature: &str,
    event: &'static str,
) -> Result<(U256, U256), BackendError> {
    let log = event_logs(receipt, vault, signature)
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::MissingEvent {
            event,
            tx_hash: hex_of(&receipt.transaction_hash),
        })?;
    let data = abi::decode(&[ParamType::Uint(256), ParamType::Uint(256)], &log.data)
        .map_err(|e| BackendError::Decode(format!("{}: {}", event, e)))?;
    Ok((uint(&data[0])?, uint(&data[1])?))
}

fn classify_hub_error(message: String) -> HubError {
    if message.to_ascii_lowercase().contains("already known") {
        HubError::AlreadyKnown
    } else {
        HubError::Rpc(message)
    }
}

fn decode_agents(tokens: Vec<Token>) -> Result<Vec<AgentInfo>, BackendError> {
    let list = tokens
        .into_iter()
        .next()
        .and_then(Token::into_array)
        .ok_or_else(|| BackendError::Decode("agent list".into()))?;

    let mut agents = Vec::with_capacity(list.len());
    for entry in list {
        let fields = entry
            .into_tuple()
            .ok_or_else(|| BackendError::Decode("agent entry".into()))?;
        if fields.len() < 7 {
            return Err(BackendError::Decode("agent entry too short".into()));
        }
        if to_u64(uint(&fields[6])?)? != AGENT_STATUS_NORMAL {
            continue;
        }
        let vault = fields[0]
            .clone()
            .into_address()
            .ok_or_else(|| BackendError::Decode("agent vault".into()))?;
        agents.push(AgentInfo {
            vault_address: hex_of(&vault),
            fee_bips: u32::try_from(to_u64(uint(&fields[2])?)?)
                .map_err(|e| BackendError::Decode(e.to_string()))?,
            free_lots: to_u64(uint(&fields[5])?)?,
        });
    }
    Ok(agents)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ATTESTATION HUB
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl AttestationHub for EvmGateway {
    async fn request_fee(&self, request_bytes: &str) -> Result<u128, HubError> {
        let bytes = decode_request(request_bytes).map_err(|e| HubError::Rpc(e.to_string()))?;
        let tokens = self
            .call_decode(
                self.fee_config,
                calldata("getRequestFee(bytes)", &[Token::Bytes(bytes)]),
                &[ParamType::Uint(256)],
            )
            .await
            .map_err(|e| HubError::Rpc(e.to_string()))?;
        tokens
            .first()
            .ok_or_else(|| HubError::Rpc("empty fee response".into()))
            .and_then(|t| uint(t).map_err(|e| HubError::Rpc(e.to_string())))
            .and_then(|fee| to_u128(fee).map_err(|e| HubError::Rpc(e.to_string())))
    }

    async fn submit_request(&self, request_bytes: &str, fee: u128) -> Result<HubSubmission, HubError> {
        let bytes = decode_request(request_bytes).map_err(|e| HubError::Rpc(e.to_string()))?;
        let tx_hash = self
            .send(
                self.fdc_hub,
                calldata("requestAttestation(bytes)", &[Token::Bytes(bytes)]),
                U256::from(fee),
            )
            .await
            .map_err(classify_hub_error)?;
        info!(tx_hash = ?tx_hash, "Attestation request broadcast");

        let receipt = self.wait_receipt(tx_hash).await.map_err(|e| match e {
            BackendError::Reverted { tx_hash } => HubError::Reverted(tx_hash),
            other => HubError::Rpc(other.to_string()),
        })?;
        let block_number = receipt
            .block_number
            .ok_or_else(|| HubError::Rpc("receipt without block number".into()))?
            .as_u64();
        let block_timestamp = self
            .block_timestamp(block_number)
            .await
            .map_err(|e| HubError::Rpc(e.to_string()))?;

        Ok(HubSubmission {
            tx_hash: hex_of(&tx_hash),
            block_number,
            block_timestamp,
        })
    }

    async fn find_submission(
        &self,
        request_bytes: &str,
        lookback_blocks: u64,
    ) -> Result<Option<HubSubmission>, HubError> {
        let needle = decode_request(request_bytes).map_err(|e| HubError::Rpc(e.to_string()))?;
        let latest = self
            .client
            .get_block_number()
            .await
            .map_err(|e| HubError::Rpc(e.to_string()))?
            .as_u64();
        let earliest = latest.saturating_sub(lookback_blocks);

        for number in (earliest..=latest).rev() {
            let Some(block) = self
                .client
                .get_block_with_txs(number)
                .await
                .map_err(|e| HubError::Rpc(e.to_string()))?
            else {
                continue;
            };
            let found = block
                .transactions
                .iter()
                .find(|tx| tx.to == Some(self.fdc_hub) && contains_request(&tx.input, &needle));
            if let Some(tx) = found {
                let block_timestamp =
                    to_u64(block.timestamp).map_err(|e| HubError::Rpc(e.to_string()))?;
                return Ok(Some(HubSubmission {
                    tx_hash: hex_of(&tx.hash),
                    block_number: number,
                    block_timestamp,
                }));
            }
        }
        Ok(None)
    }

    async fn round_schedule(&self) -> Result<RoundSchedule, HubError> {
        let read = |signature: &'static str| async move {
            let tokens = self
                .call_decode(self.systems_manager, calldata(signature, &[]), &[ParamType::Uint(64)])
                .await
                .map_err(|e| HubError::Rpc(e.to_string()))?;
            tokens
                .first()
                .ok_or_else(|| HubError::Rpc(format!("empty {} response", signature)))
                .and_then(|t| uint(t).map_err(|e| HubError::Rpc(e.to_string())))
                .map(|v| v.as_u64())
        };
        let first_round_start = read("firstVotingRoundStartTs()").await?;
        let round_duration = read("votingEpochDurationSeconds()").await?;
        Ok(RoundSchedule::new(first_round_start, round_duration))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DESTINATION GATEWAY
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl DestinationGateway for EvmGateway {
    async fn available_agents(&self) -> Result<Vec<AgentInfo>, BackendError> {
        let agent_tuple = ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(8),
        ]);
        let tokens = self
            .call_decode(
                self.asset_manager,
                calldata(
                    "getAvailableAgentsDetailedList(uint256,uint256)",
                    &[Token::Uint(U256::zero()), Token::Uint(U256::from(AGENT_PAGE_SIZE))],
                ),
                &[ParamType::Array(Box::new(agent_tuple)), ParamType::Uint(256)],
            )
            .await?;
        decode_agents(tokens)
    }

    async fn collateral_reservation_fee(&self, lots: u64) -> Result<u128, BackendError> {
        let tokens = self
            .call_decode(
                self.asset_manager,
                calldata("collateralReservationFee(uint256)", &[Token::Uint(U256::from(lots))]),
                &[ParamType::Uint(256)],
            )
            .await?;
        tokens
            .first()
            .ok_or_else(|| BackendError::Decode("empty fee response".into()))
            .and_then(uint)
            .and_then(to_u128)
    }

    async fn reserve_collateral(
        &self,
        agent_vault: &str,
        lots: u64,
        max_minting_fee_bips: u32,
        reservation_fee: u128,
    ) -> Result<CollateralReservation, BackendError> {
        let data = calldata(
            "reserveCollateral(address,uint256,uint256,address)",
            &[
                Token::Address(parse_address("agent vault", agent_vault)?),
                Token::Uint(U256::from(lots)),
                Token::Uint(U256::from(max_minting_fee_bips)),
                Token::Address(Address::zero()),
            ],
        );
        let tx_hash = self
            .send(self.asset_manager, data, U256::from(reservation_fee))
            .await
            .map_err(BackendError::Rpc)?;
        let receipt = self.wait_receipt(tx_hash).await?;

        let log = event_logs(&receipt, self.asset_manager, COLLATERAL_RESERVED)
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::MissingEvent {
                event: "CollateralReserved",
                tx_hash: hex_of(&tx_hash),
            })?;
        decode_collateral_reserved(log)
    }

    async fn submit_mint(
        &self,
        reservation_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError> {
        let data = calldata(
            &format!("executeMinting({},uint256)", PROOF_TUPLE),
            &[proof_token(proof)?, Token::Uint(parse_id(reservation_id)?)],
        );
        let tx_hash = self
            .send(self.asset_manager, data, U256::zero())
            .await
            .map_err(BackendError::Rpc)?;
        info!(reservation_id, tx_hash = ?tx_hash, "Minting transaction broadcast");
        Ok(hex_of(&tx_hash))
    }

    async fn minted_amount(&self, tx_hash: &str) -> Result<Amount, BackendError> {
        let hash = parse_hash(tx_hash)?;
        let receipt = self.wait_receipt(hash).await?;
        let minted = minted_to(&receipt, self.fxrp_token, self.signer())?.ok_or_else(|| {
            BackendError::MissingEvent {
                event: "Transfer",
                tx_hash: tx_hash.to_string(),
            }
        })?;
        Ok(Amount::from_raw(to_u128(minted)?))
    }

    async fn request_redemption(
        &self,
        lots: u64,
        receiver_source_address: &str,
    ) -> Result<RedemptionTicket, BackendError> {
        let data = calldata(
            "redeem(uint256,string,address)",
            &[
                Token::Uint(U256::from(lots)),
                Token::String(receiver_source_address.to_string()),
                Token::Address(Address::zero()),
            ],
        );
        let tx_hash = self
            .send(self.asset_manager, data, U256::zero())
            .await
            .map_err(BackendError::Rpc)?;
        let receipt = self.wait_receipt(tx_hash).await?;
        let tx_hash = hex_of(&tx_hash);

        let logs = event_logs(&receipt, self.asset_manager, REDEMPTION_REQUESTED);
        if logs.len() > 1 {
            warn!(%tx_hash, requests = logs.len(), "Redemption split across agents, tracking the first");
        }
        let log = logs.first().ok_or_else(|| BackendError::MissingEvent {
            event: "RedemptionRequested",
            tx_hash: tx_hash.clone(),
        })?;
        decode_redemption_requested(log, &tx_hash)
    }

    async fn confirm_redemption_payment(
        &self,
        request_id: &str,
        proof: &AttestationProof,
    ) -> Result<String, BackendError> {
        let data = calldata(
            &format!("confirmRedemptionPayment({},uint256)", PROOF_TUPLE),
            &[proof_token(proof)?, Token::Uint(parse_id(request_id)?)],
        );
        let tx_hash = self
            .send(self.asset_manager, data, U256::zero())
            .await
            .map_err(BackendError::Rpc)?;
        self.wait_receipt(tx_hash).await?;
        Ok(normalize_hex(&hex_of(&tx_hash)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARE ACCOUNTING
// ═══════════════════════════════════════════════════════════════════════════════

/// ERC-4626 deposits and withdrawals. Vault shares are held by the signer;
/// each user's position is booked in the record store in asset units, so a
/// redemption withdraws exactly the assets it books out.
#[async_trait]
impl ShareAccounting for EvmGateway {
    async fn mint_shares(
        &self,
        vault_id: &str,
        user_address: &str,
        amount: Amount,
    ) -> Result<MintedShares, BackendError> {
        let vault = self.vault(vault_id)?;
        let assets = U256::from(amount.raw());

        let approve = self
            .send(
                self.fxrp_token,
                calldata("approve(address,uint256)", &[Token::Address(vault), Token::Uint(assets)]),
                U256::zero(),
            )
            .await
            .map_err(BackendError::Vault)?;
        self.wait_receipt(approve).await?;

        let tx_hash = self
            .send(
                vault,
                calldata(
                    "deposit(uint256,address)",
                    &[Token::Uint(assets), Token::Address(self.signer())],
                ),
                U256::zero(),
            )
            .await
            .map_err(BackendError::Vault)?;
        let receipt = self.wait_receipt(tx_hash).await?;
        let (deposited, shares) = vault_amounts(&receipt, vault, VAULT_DEPOSIT, "Deposit")?;
        info!(
            vault = vault_id,
            user = user_address,
            assets = %deposited,
            shares = %shares,
            tx_hash = ?tx_hash,
            "Deposited into vault"
        );

        Ok(MintedShares {
            tx_hash: hex_of(&tx_hash),
            position_id: position_id_for(vault_id, user_address),
        })
    }

    async fn redeem_shares(
        &self,
        vault_id: &str,
        user_address: &str,
        share_amount: Amount,
    ) -> Result<RedeemedShares, BackendError> {
        let vault = self.vault(vault_id)?;
        let signer = self.signer();

        let tx_hash = self
            .send(
                vault,
                calldata(
                    "withdraw(uint256,address,address)",
                    &[
                        Token::Uint(U256::from(share_amount.raw())),
                        Token::Address(signer),
                        Token::Address(signer),
                    ],
                ),
                U256::zero(),
            )
            .await
            .map_err(BackendError::Vault)?;
        let receipt = self.wait_receipt(tx_hash).await?;
        let (assets, shares) = vault_amounts(&receipt, vault, VAULT_WITHDRAW, "Withdraw")?;
        info!(
            vault = vault_id,
            user = user_address,
            assets = %assets,
            shares = %shares,
            tx_hash = ?tx_hash,
            "Withdrew from vault"
        );

        Ok(RedeemedShares {
            tx_hash: hex_of(&tx_hash),
            assets_redeemed: Amount::from_raw(to_u128(assets)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    fn topic_for(address: Address) -> H256 {
        H256::from(address)
    }

    fn response_token() -> Token {
        Token::Tuple(vec![
            Token::FixedBytes(vec![1; 32]),
            Token::FixedBytes(vec![2; 32]),
            Token::Uint(U256::from(12_345u64)),
            Token::Uint(U256::from(1_700_000_000u64)),
            Token::Tuple(vec![
                Token::FixedBytes(vec![3; 32]),
                Token::Uint(U256::zero()),
                Token::Uint(U256::zero()),
            ]),
            Token::Tuple(vec![
                Token::Uint(U256::from(90_000_000u64)),
                Token::Uint(U256::from(1_700_000_000u64)),
                Token::FixedBytes(vec![4; 32]),
                Token::FixedBytes(vec![5; 32]),
                Token::FixedBytes(vec![6; 32]),
                Token::FixedBytes(vec![7; 32]),
                Token::Int(U256::from(100_000_000u64)),
                Token::Int(U256::from(100_000_000u64)),
                Token::Int(U256::from(100_000_000u64)),
                Token::Int(U256::from(100_000_000u64)),
                Token::FixedBytes(vec![8; 32]),
                Token::Bool(true),
                Token::Uint(U256::zero()),
            ]),
        ])
    }

    #[test]
    fn selectors_match_known_values() {
        assert_eq!(hex::encode(id("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(
            hex::encode(keccak256(TRANSFER.as_bytes())),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn proof_wraps_decoded_response() {
        let proof = AttestationProof {
            voting_round_id: 12_345,
            response_hex: format!("0x{}", hex::encode(abi::encode(&[response_token()]))),
            merkle_proof: vec![format!("0x{}", "ab".repeat(32))],
        };
        let token = proof_token(&proof).unwrap();
        let Token::Tuple(parts) = token else {
            panic!("proof must be a tuple");
        };
        assert_eq!(parts[0], Token::Array(vec![Token::FixedBytes(vec![0xab; 32])]));
        assert_eq!(parts[1], response_token());

        let short = AttestationProof {
            merkle_proof: vec!["0xabcd".into()],
            ..proof
        };
        assert!(proof_token(&short).is_err());
    }

    #[test]
    fn collateral_reserved_is_decoded() {
        let reference = [0x46u8; 32];
        let log = Log {
            address: address(0xaa),
            topics: vec![
                H256::from(keccak256(COLLATERAL_RESERVED.as_bytes())),
                topic_for(address(0x51)),
                topic_for(address(0x77)),
                H256::from_low_u64_be(42),
            ],
            data: Bytes::from(abi::encode(&[
                Token::Uint(U256::from(99_750_000u64)),
                Token::Uint(U256::from(250_000u64)),
                Token::Uint(U256::from(10u64)),
                Token::Uint(U256::from(20u64)),
                Token::Uint(U256::from(1_700_000_900u64)),
                Token::String("rAgentAddress".into()),
                Token::FixedBytes(reference.to_vec()),
                Token::Address(Address::zero()),
                Token::Uint(U256::zero()),
            ])),
            ..Default::default()
        };

        let reservation = decode_collateral_reserved(&log).unwrap();
        assert_eq!(reservation.reservation_id, "42");
        assert_eq!(reservation.agent_vault_address, hex_of(&address(0x51)));
        assert_eq!(reservation.agent_source_address, "rAgentAddress");
        assert_eq!(reservation.total_raw(), 100_000_000);
        assert_eq!(reservation.payment_reference, format!("0x{}", "46".repeat(32)));
        assert_eq!(reservation.expires_at.timestamp(), 1_700_000_900);
    }

    #[test]
    fn minted_amount_reads_transfer_from_zero_address() {
        let token = address(0xf0);
        let me = address(0x01);
        let transfer = |from: Address, to: Address, value: u64| Log {
            address: token,
            topics: vec![
                H256::from(keccak256(TRANSFER.as_bytes())),
                topic_for(from),
                topic_for(to),
            ],
            data: Bytes::from(abi::encode(&[Token::Uint(U256::from(value))])),
            ..Default::default()
        };
        let receipt = TransactionReceipt {
            logs: vec![
                transfer(Address::zero(), me, 19_995_000),
                transfer(Address::zero(), address(0x02), 5_000),
                transfer(me, address(0x03), 1),
            ],
            ..Default::default()
        };

        assert_eq!(minted_to(&receipt, token, me).unwrap(), Some(U256::from(19_995_000u64)));
        assert_eq!(minted_to(&receipt, address(0xee), me).unwrap(), None);
    }

    #[test]
    fn vault_events_yield_assets_and_shares() {
        let vault = address(0xa1);
        let signer = address(0x01);
        let withdraw = Log {
            address: vault,
            topics: vec![
                H256::from(keccak256(VAULT_WITHDRAW.as_bytes())),
                topic_for(signer),
                topic_for(signer),
                topic_for(signer),
            ],
            data: Bytes::from(abi::encode(&[
                Token::Uint(U256::from(9_000_000u64)),
                Token::Uint(U256::from(8_700_000u64)),
            ])),
            ..Default::default()
        };
        let receipt = TransactionReceipt {
            logs: vec![withdraw],
            ..Default::default()
        };

        let (assets, shares) = vault_amounts(&receipt, vault, VAULT_WITHDRAW, "Withdraw").unwrap();
        assert_eq!(assets, U256::from(9_000_000u64));
        assert_eq!(shares, U256::from(8_700_000u64));
        assert!(matches!(
            vault_amounts(&receipt, vault, VAULT_DEPOSIT, "Deposit"),
            Err(BackendError::MissingEvent { event: "Deposit", .. })
        ));
        assert!(matches!(
            vault_amounts(&receipt, address(0xa2), VAULT_WITHDRAW, "Withdraw"),
            Err(BackendError::MissingEvent { .. })
        ));
    }

    #[test]
    fn already_known_is_classified() {
        assert!(matches!(
            classify_hub_error("(code: -32000, message: already known, data: None)".into()),
            HubError::AlreadyKnown
        ));
        assert!(matches!(
            classify_hub_error("nonce too low".into()),
            HubError::Rpc(_)
        ));
    }

    #[test]
    fn agents_filtered_by_status() {
        let entry = |vault: u8, fee: u64, lots: u64, status: u64| {
            Token::Tuple(vec![
                Token::Address(address(vault)),
                Token::Address(address(0x99)),
                Token::Uint(U256::from(fee)),
                Token::Uint(U256::from(20_000u64)),
                Token::Uint(U256::from(20_000u64)),
                Token::Uint(U256::from(lots)),
                Token::Uint(U256::from(status)),
            ])
        };
        let agents = decode_agents(vec![
            Token::Array(vec![entry(0x10, 25, 100, 0), entry(0x11, 10, 100, 2)]),
            Token::Uint(U256::from(2u64)),
        ])
        .unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].fee_bips, 25);
        assert_eq!(agents[0].free_lots, 100);
    }
}
