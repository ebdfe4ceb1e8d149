//! Payment-watch subscription registry.
//!
//! The source-ledger listener lives outside the engine; it reads this registry
//! to decide which addresses to follow. Several bridges can share one agent
//! address, so subscriptions are reference counted and an address is only
//! dropped when its last bridge lets go.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::traits::PaymentWatcher;

/// Change notification for listeners that keep their own subscriptions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchChange {
    AgentAdded(String),
    AgentRemoved(String),
    UserAdded(String),
    UserRemoved(String),
}

#[derive(Default)]
struct Subscriptions {
    agents: HashMap<String, usize>,
    users: HashMap<String, usize>,
}

/// Reference-counted set of watched agent and user addresses.
pub struct SubscriptionRegistry {
    inner: Mutex<Subscriptions>,
    changes: broadcast::Sender<WatchChange>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Subscriptions::default()),
            changes,
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<WatchChange> {
        self.changes.subscribe()
    }

    pub fn agent_addresses(&self) -> Vec<String> {
        let mut out: Vec<_> = self.lock().agents.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn user_addresses(&self) -> Vec<String> {
        let mut out: Vec<_> = self.lock().users.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn is_watching_agent(&self, address: &str) -> bool {
        self.lock().agents.contains_key(address)
    }

    pub fn is_watching_user(&self, address: &str) -> bool {
        self.lock().users.contains_key(address)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscriptions> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, change: WatchChange) {
        debug!(?change, "Watch set changed");
        // No receivers is fine.
        let _ = self.changes.send(change);
    }
}

fn increment(map: &mut HashMap<String, usize>, address: &str) -> bool {
    let count = map.entry(address.to_string()).or_insert(0);
    *count += 1;
    *count == 1
}

fn decrement(map: &mut HashMap<String, usize>, address: &str) -> bool {
    match map.get_mut(address) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => {
            map.remove(address);
            true
        }
        None => false,
    }
}

#[async_trait]
impl PaymentWatcher for SubscriptionRegistry {
    async fn add_agent_address(&self, address: &str) {
        let added = increment(&mut self.lock().agents, address);
        if added {
            self.notify(WatchChange::AgentAdded(address.to_string()));
        }
    }

    async fn remove_agent_address(&self, address: &str) {
        let removed = decrement(&mut self.lock().agents, address);
        if removed {
            self.notify(WatchChange::AgentRemoved(address.to_string()));
        }
    }

    async fn subscribe_user_for_redemption(&self, address: &str) {
        let added = increment(&mut self.lock().users, address);
        if added {
            self.notify(WatchChange::UserAdded(address.to_string()));
        }
    }

    async fn unsubscribe_user_address(&self, address: &str) {
        let removed = decrement(&mut self.lock().users, address);
        if removed {
            self.notify(WatchChange::UserRemoved(address.to_string()));
        }
    }
}
