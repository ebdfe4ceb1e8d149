//! Persistent record store backed by sled.
//!
//! Records are stored as JSON under their id, one tree per record type. Every
//! mutation goes through a compare-and-swap loop so a concurrent writer can
//! never be silently overwritten: the closure sees the latest persisted state
//! and decides again.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;
use tracing::debug;

use fxrp_common::{
    Amount, BridgeRecord, BridgeStatus, Position, RedemptionRecord, RedemptionStatus, Withdrawal,
};

const BRIDGES_TREE: &str = "bridges";
const REDEMPTIONS_TREE: &str = "redemptions";
const POSITIONS_TREE: &str = "positions";
const WITHDRAWALS_TREE: &str = "withdrawals";

/// Compare-and-swap attempts before reporting contention.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Errors from the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("{kind} {id} kept changing under concurrent updates")]
    Contention { kind: &'static str, id: String },

    #[error("position {position_id} would overflow")]
    Overflow { position_id: String },

    #[error("position {position_id} holds {available}, cannot debit {requested}")]
    InsufficientShares {
        position_id: String,
        available: Amount,
        requested: Amount,
    },
}

/// Durable store for bridge records, redemption records, positions and withdrawals.
#[derive(Clone)]
pub struct RecordStore {
    db: Db,
    bridges: Tree,
    redemptions: Tree,
    positions: Tree,
    withdrawals: Tree,
}

impl RecordStore {
    /// Open (or create) a store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::Database(e.into()))?;
            }
        }
        Self::from_db(sled::open(path_ref)?)
    }

    /// Temporary store, removed on drop.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            bridges: db.open_tree(BRIDGES_TREE)?,
            redemptions: db.open_tree(REDEMPTIONS_TREE)?,
            positions: db.open_tree(POSITIONS_TREE)?,
            withdrawals: db.open_tree(WITHDRAWALS_TREE)?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BRIDGES
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn insert_bridge(&self, record: &BridgeRecord) -> Result<(), StoreError> {
        insert_new(&self.bridges, "bridge", &record.id, record)
    }

    pub fn get_bridge(&self, id: &str) -> Result<Option<BridgeRecord>, StoreError> {
        get(&self.bridges, id)
    }

    pub fn bridge(&self, id: &str) -> Result<BridgeRecord, StoreError> {
        self.get_bridge(id)?.ok_or_else(|| StoreError::NotFound {
            kind: "bridge",
            id: id.to_string(),
        })
    }

    /// Apply `apply` to the latest persisted record and write it back atomically.
    pub fn update_bridge<F, E>(&self, id: &str, mut apply: F) -> Result<BridgeRecord, E>
    where
        F: FnMut(&mut BridgeRecord) -> Result<(), E>,
        E: From<StoreError>,
    {
        self.try_update_bridge(id, |record| apply(record).map(|_| true))
            .map(|(record, _)| record)
    }

    /// Like [`update_bridge`](Self::update_bridge), but `apply` may decline to
    /// write by returning `false`. The flag is returned alongside the record.
    pub fn try_update_bridge<F, E>(&self, id: &str, apply: F) -> Result<(BridgeRecord, bool), E>
    where
        F: FnMut(&mut BridgeRecord) -> Result<bool, E>,
        E: From<StoreError>,
    {
        cas_update(&self.bridges, "bridge", id, apply)
    }

    pub fn all_bridges(&self) -> Result<Vec<BridgeRecord>, StoreError> {
        scan(&self.bridges, |_: &BridgeRecord| true)
    }

    pub fn bridges_in(&self, statuses: &[BridgeStatus]) -> Result<Vec<BridgeRecord>, StoreError> {
        scan(&self.bridges, |r: &BridgeRecord| statuses.contains(&r.status))
    }

    /// Non-terminal bridges whose payment window closed at or before `now`.
    pub fn expired_bridges(&self, now: DateTime<Utc>) -> Result<Vec<BridgeRecord>, StoreError> {
        scan(&self.bridges, |r: &BridgeRecord| r.is_expired(now))
    }

    /// Bridges reconciliation should resume: timed-out proofs, failed vault
    /// mints, and failures tagged with a recoverable kind.
    pub fn recoverable_bridges(&self) -> Result<Vec<BridgeRecord>, StoreError> {
        scan(&self.bridges, |r: &BridgeRecord| match r.status {
            BridgeStatus::FdcTimeout | BridgeStatus::VaultMintFailed => true,
            BridgeStatus::Failed => r.failure_kind.map_or(false, |k| k.is_recoverable()),
            _ => false,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // REDEMPTIONS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn insert_redemption(&self, record: &RedemptionRecord) -> Result<(), StoreError> {
        insert_new(&self.redemptions, "redemption", &record.id, record)
    }

    pub fn get_redemption(&self, id: &str) -> Result<Option<RedemptionRecord>, StoreError> {
        get(&self.redemptions, id)
    }

    pub fn redemption(&self, id: &str) -> Result<RedemptionRecord, StoreError> {
        self.get_redemption(id)?.ok_or_else(|| StoreError::NotFound {
            kind: "redemption",
            id: id.to_string(),
        })
    }

    pub fn update_redemption<F, E>(&self, id: &str, mut apply: F) -> Result<RedemptionRecord, E>
    where
        F: FnMut(&mut RedemptionRecord) -> Result<(), E>,
        E: From<StoreError>,
    {
        cas_update(&self.redemptions, "redemption", id, |record| {
            apply(record).map(|_| true)
        })
        .map(|(record, _)| record)
    }

    pub fn redemptions_in(
        &self,
        statuses: &[RedemptionStatus],
    ) -> Result<Vec<RedemptionRecord>, StoreError> {
        scan(&self.redemptions, |r: &RedemptionRecord| {
            statuses.contains(&r.status)
        })
    }

    pub fn recoverable_redemptions(&self) -> Result<Vec<RedemptionRecord>, StoreError> {
        scan(&self.redemptions, |r: &RedemptionRecord| match r.status {
            RedemptionStatus::AwaitingProof => true,
            RedemptionStatus::Failed => r.failure_kind.map_or(false, |k| k.is_recoverable()),
            _ => false,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // POSITIONS & WITHDRAWALS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn get_position(&self, id: &str) -> Result<Option<Position>, StoreError> {
        get(&self.positions, id)
    }

    pub fn positions_for(&self, wallet_address: &str) -> Result<Vec<Position>, StoreError> {
        let wallet = wallet_address.to_ascii_lowercase();
        scan(&self.positions, |p: &Position| {
            p.wallet_address.to_ascii_lowercase() == wallet
        })
    }

    /// Credit `shares` minted for `bridge_id` to a position, creating it on
    /// first use. A bridge already credited leaves the position untouched.
    pub fn credit_position(
        &self,
        position_id: &str,
        wallet_address: &str,
        vault_id: &str,
        bridge_id: &str,
        shares: Amount,
        now: DateTime<Utc>,
    ) -> Result<Position, StoreError> {
        loop_cas(&self.positions, "position", position_id, |current| {
            let mut position = match current {
                Some(position) => position,
                None => Position {
                    id: position_id.to_string(),
                    wallet_address: wallet_address.to_string(),
                    vault_id: vault_id.to_string(),
                    shares: Amount::ZERO,
                    bridge_ids: Vec::new(),
                    reserved: BTreeMap::new(),
                    created_at: now,
                    updated_at: now,
                },
            };
            if position.bridge_ids.iter().any(|id| id == bridge_id) {
                return Ok((position, false));
            }
            position.shares = position
                .shares
                .checked_add(shares)
                .ok_or_else(|| StoreError::Overflow {
                    position_id: position_id.to_string(),
                })?;
            position.bridge_ids.push(bridge_id.to_string());
            position.updated_at = now;
            Ok((position, true))
        })
    }

    /// Hold `shares` of the position for `redemption_id`.
    ///
    /// Fails with [`StoreError::InsufficientShares`] when the shares not already
    /// held for other redemptions cannot cover the request. Reserving again for
    /// the same redemption is a no-op.
    pub fn reserve_shares(
        &self,
        position_id: &str,
        redemption_id: &str,
        shares: Amount,
        now: DateTime<Utc>,
    ) -> Result<Position, StoreError> {
        loop_cas(&self.positions, "position", position_id, |current| {
            let mut position: Position = current.ok_or_else(|| StoreError::NotFound {
                kind: "position",
                id: position_id.to_string(),
            })?;
            if position.reserved.contains_key(redemption_id) {
                return Ok((position, false));
            }
            let available = position.available_shares();
            if available < shares {
                return Err(StoreError::InsufficientShares {
                    position_id: position.id.clone(),
                    available,
                    requested: shares,
                });
            }
            position.reserved.insert(redemption_id.to_string(), shares);
            position.updated_at = now;
            Ok((position, true))
        })
    }

    /// Drop the hold placed for `redemption_id`, if any.
    pub fn release_shares(
        &self,
        position_id: &str,
        redemption_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Position, StoreError> {
        loop_cas(&self.positions, "position", position_id, |current| {
            let mut position: Position = current.ok_or_else(|| StoreError::NotFound {
                kind: "position",
                id: position_id.to_string(),
            })?;
            if position.reserved.remove(redemption_id).is_none() {
                return Ok((position, false));
            }
            position.updated_at = now;
            Ok((position, true))
        })
    }

    /// Debit the position and write the withdrawal in one transaction.
    ///
    /// The hold placed by [`reserve_shares`](Self::reserve_shares) for the
    /// redemption is consumed by the debit.
    ///
    /// Keyed on the redemption id: a second call for the same redemption
    /// returns the position as it stands without debiting again.
    pub fn record_withdrawal(&self, withdrawal: &Withdrawal) -> Result<Position, StoreError> {
        let result: Result<Position, TransactionError<StoreError>> = (&self.positions, &self.withdrawals)
            .transaction(|(positions, withdrawals)| {
                let abort = |e: StoreError| ConflictableTransactionError::Abort(e);

                let raw = positions
                    .get(withdrawal.position_id.as_bytes())?
                    .ok_or_else(|| {
                        abort(StoreError::NotFound {
                            kind: "position",
                            id: withdrawal.position_id.clone(),
                        })
                    })?;
                let mut position: Position =
                    serde_json::from_slice(&raw).map_err(|e| abort(e.into()))?;

                if withdrawals.get(withdrawal.redemption_id.as_bytes())?.is_some() {
                    return Ok(position);
                }

                position.shares = position.shares.checked_sub(withdrawal.shares).ok_or_else(|| {
                    abort(StoreError::InsufficientShares {
                        position_id: position.id.clone(),
                        available: position.shares,
                        requested: withdrawal.shares,
                    })
                })?;
                position.reserved.remove(&withdrawal.redemption_id);
                position.updated_at = withdrawal.created_at;

                let position_bytes = serde_json::to_vec(&position).map_err(|e| abort(e.into()))?;
                let withdrawal_bytes = serde_json::to_vec(withdrawal).map_err(|e| abort(e.into()))?;
                positions.insert(position.id.as_bytes(), position_bytes)?;
                withdrawals.insert(withdrawal.redemption_id.as_bytes(), withdrawal_bytes)?;
                Ok(position)
            });

        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StoreError::Database(e),
        })
    }

    pub fn withdrawal_for(&self, redemption_id: &str) -> Result<Option<Withdrawal>, StoreError> {
        get(&self.withdrawals, redemption_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TREE HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn get<T: DeserializeOwned>(tree: &Tree, id: &str) -> Result<Option<T>, StoreError> {
    match tree.get(id.as_bytes())? {
        Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        None => Ok(None),
    }
}

fn insert_new<T: Serialize>(
    tree: &Tree,
    kind: &'static str,
    id: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    tree.compare_and_swap(id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
        .map_err(|_| StoreError::AlreadyExists {
            kind,
            id: id.to_string(),
        })
}

fn scan<T, P>(tree: &Tree, predicate: P) -> Result<Vec<T>, StoreError>
where
    T: DeserializeOwned,
    P: Fn(&T) -> bool,
{
    let mut out = Vec::new();
    for item in tree.iter() {
        let (_, raw) = item?;
        let value: T = serde_json::from_slice(&raw)?;
        if predicate(&value) {
            out.push(value);
        }
    }
    Ok(out)
}

/// CAS loop over an existing value.
fn cas_update<T, F, E>(tree: &Tree, kind: &'static str, id: &str, mut apply: F) -> Result<(T, bool), E>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(&mut T) -> Result<bool, E>,
    E: From<StoreError>,
{
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let raw = tree
            .get(id.as_bytes())
            .map_err(StoreError::from)?
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        let mut value: T = serde_json::from_slice(&raw).map_err(StoreError::from)?;

        if !apply(&mut value)? {
            return Ok((value, false));
        }

        let bytes = serde_json::to_vec(&value).map_err(StoreError::from)?;
        match tree
            .compare_and_swap(id.as_bytes(), Some(&raw), Some(bytes))
            .map_err(StoreError::from)?
        {
            Ok(()) => return Ok((value, true)),
            Err(_) => debug!(kind, id, attempt, "Concurrent update, retrying"),
        }
    }

    Err(StoreError::Contention {
        kind,
        id: id.to_string(),
    }
    .into())
}

/// CAS loop over a value that may not exist yet.
fn loop_cas<T, F>(tree: &Tree, kind: &'static str, id: &str, mut apply: F) -> Result<T, StoreError>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Result<(T, bool), StoreError>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let raw = tree.get(id.as_bytes())?;
        let current = match &raw {
            Some(raw) => Some(serde_json::from_slice(raw)?),
            None => None,
        };

        let (value, changed) = apply(current)?;
        if !changed {
            return Ok(value);
        }

        let bytes = serde_json::to_vec(&value)?;
        if tree.compare_and_swap(id.as_bytes(), raw, Some(bytes))?.is_ok() {
            return Ok(value);
        }
    }

    Err(StoreError::Contention {
        kind,
        id: id.to_string(),
    })
}
