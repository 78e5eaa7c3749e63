//! The node command interface.
//!
//! [`NodeDriver`] is the only way the library talks to a node. It is
//! stateless with respect to topology: every call names the node it is
//! aimed at. [`ManagedDriver`] wraps any driver with bounded retries for
//! transient failures and a list of [`Middleware`] hooks run before each
//! call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::DriverError;
use crate::topology::{NodeAddr, NodeInfo};

/// Target state for `CLUSTER SETSLOT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    /// Clear any migrating or importing marker.
    Stable,
    /// Hand the slot off to the named node.
    Migrating(String),
    /// Accept the slot from the named node.
    Importing(String),
    /// Record the named node as the slot's owner.
    Node(String),
}

impl SlotState {
    pub fn action(&self) -> &'static str {
        match self {
            SlotState::Stable => "STABLE",
            SlotState::Migrating(_) => "MIGRATING",
            SlotState::Importing(_) => "IMPORTING",
            SlotState::Node(_) => "NODE",
        }
    }

    pub fn peer(&self) -> Option<&str> {
        match self {
            SlotState::Stable => None,
            SlotState::Migrating(p) | SlotState::Importing(p) | SlotState::Node(p) => Some(p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverMode {
    /// Promote without the primary's agreement.
    Force,
    /// Promote without agreement from the rest of the cluster either.
    Takeover,
}

impl FailoverMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverMode::Force => "FORCE",
            FailoverMode::Takeover => "TAKEOVER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Also forget the node's name and reset epochs.
    Hard,
    Soft,
}

impl ResetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetMode::Hard => "HARD",
            ResetMode::Soft => "SOFT",
        }
    }
}

/// Options for a single-key `MIGRATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub timeout_ms: u64,
    /// Leave the key on the source.
    pub copy: bool,
    /// Overwrite an existing key on the destination.
    pub replace: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            copy: false,
            replace: false,
        }
    }
}

/// Replication role reported by `ROLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Primary,
    /// `link` is the replication link state: `connect`, `connecting`,
    /// `sync` or `connected`.
    Replica { link: String },
}

impl Role {
    /// True once a replica has finished its initial full sync.
    pub fn is_synced_replica(&self) -> bool {
        matches!(self, Role::Replica { link } if link == "connected")
    }
}

/// Administrative and data commands against a single node.
///
/// Implementations must be cheap to share across tasks; the library holds
/// one driver behind an `Arc` for the whole cluster.
#[async_trait]
pub trait NodeDriver: Send + Sync {
    /// Raw topology listing (`CLUSTER NODES`).
    async fn list_topology(&self, addr: &NodeAddr) -> Result<String, DriverError>;

    async fn set_slot(&self, addr: &NodeAddr, slot: u16, state: &SlotState)
        -> Result<(), DriverError>;

    async fn add_slots(&self, addr: &NodeAddr, slots: &[u16]) -> Result<(), DriverError>;

    async fn remove_slots(&self, addr: &NodeAddr, slots: &[u16]) -> Result<(), DriverError>;

    async fn keys_in_slot(
        &self,
        addr: &NodeAddr,
        slot: u16,
        limit: usize,
    ) -> Result<Vec<Bytes>, DriverError>;

    async fn count_keys_in_slot(&self, addr: &NodeAddr, slot: u16) -> Result<u64, DriverError>;

    /// Atomically moves one key from `addr` to `dest`.
    async fn transfer_key(
        &self,
        addr: &NodeAddr,
        dest: &NodeAddr,
        key: &Bytes,
        options: &TransferOptions,
    ) -> Result<(), DriverError>;

    /// Tells the node at `addr` to handshake with `peer`.
    async fn meet(&self, addr: &NodeAddr, peer: &NodeAddr) -> Result<(), DriverError>;

    async fn replicate_from(&self, addr: &NodeAddr, primary: &str) -> Result<(), DriverError>;

    async fn forget(&self, addr: &NodeAddr, name: &str) -> Result<(), DriverError>;

    async fn failover(&self, addr: &NodeAddr, mode: FailoverMode) -> Result<(), DriverError>;

    async fn reset(&self, addr: &NodeAddr, mode: ResetMode) -> Result<(), DriverError>;

    async fn set_config_epoch(&self, addr: &NodeAddr, epoch: u64) -> Result<(), DriverError>;

    async fn info(&self, addr: &NodeAddr) -> Result<NodeInfo, DriverError>;

    async fn role(&self, addr: &NodeAddr) -> Result<Role, DriverError>;

    async fn flush_all(&self, addr: &NodeAddr) -> Result<(), DriverError>;

    async fn config_set(&self, addr: &NodeAddr, name: &str, value: &str)
        -> Result<(), DriverError>;

    async fn config_rewrite(&self, addr: &NodeAddr) -> Result<(), DriverError>;
}

/// A driver shared by every node handle.
pub type SharedDriver = Arc<dyn NodeDriver>;

/// Hook invoked once before every logical driver call, retries excluded.
pub trait Middleware: Send + Sync {
    fn before(&self, addr: &NodeAddr, op: &'static str);
}

/// Logs every call at debug level.
#[derive(Debug, Default)]
pub struct TraceCalls;

impl Middleware for TraceCalls {
    fn before(&self, addr: &NodeAddr, op: &'static str) {
        debug!(node = %addr, op, "node call");
    }
}

/// How transient failures are retried.
///
/// Transport errors and busy-loading replies have separate budgets: a node
/// loading its dataset is alive and usually needs longer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub transport_retries: u32,
    pub transport_backoff: Duration,
    pub loading_retries: u32,
    pub loading_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transport_retries: 10,
            transport_backoff: Duration::from_secs(1),
            loading_retries: 10,
            loading_backoff: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn none() -> Self {
        Self {
            transport_retries: 0,
            transport_backoff: Duration::ZERO,
            loading_retries: 0,
            loading_backoff: Duration::ZERO,
        }
    }

    /// Records a failure and returns how long to wait before the next try,
    /// or `None` if the error should be surfaced.
    fn next_delay(&self, err: &DriverError, attempts: &mut Attempts) -> Option<Duration> {
        match err {
            DriverError::Transport(_) if attempts.transport < self.transport_retries => {
                attempts.transport += 1;
                Some(self.transport_backoff)
            }
            DriverError::BusyLoading if attempts.loading < self.loading_retries => {
                attempts.loading += 1;
                Some(self.loading_backoff)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Attempts {
    transport: u32,
    loading: u32,
}

/// Retrying, hook-running wrapper around a driver.
pub struct ManagedDriver<D> {
    inner: D,
    policy: RetryPolicy,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl<D: NodeDriver + 'static> ManagedDriver<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            policy: RetryPolicy::default(),
            middleware: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_middleware(mut self, hook: Arc<dyn Middleware>) -> Self {
        self.middleware.push(hook);
        self
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_shared(self) -> SharedDriver {
        Arc::new(self)
    }

    async fn call<T, F, Fut>(&self, addr: &NodeAddr, op: &'static str, f: F) -> Result<T, DriverError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        for hook in &self.middleware {
            hook.before(addr, op);
        }

        let mut attempts = Attempts::default();
        loop {
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(delay) = self.policy.next_delay(&err, &mut attempts) else {
                return Err(err);
            };
            warn!(
                node = %addr,
                op,
                transport_retries = attempts.transport,
                loading_retries = attempts.loading,
                "{err}, retrying in {delay:?}"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl<D: NodeDriver + 'static> NodeDriver for ManagedDriver<D> {
    async fn list_topology(&self, addr: &NodeAddr) -> Result<String, DriverError> {
        self.call(addr, "cluster nodes", || self.inner.list_topology(addr))
            .await
    }

    async fn set_slot(
        &self,
        addr: &NodeAddr,
        slot: u16,
        state: &SlotState,
    ) -> Result<(), DriverError> {
        self.call(addr, "cluster setslot", || self.inner.set_slot(addr, slot, state))
            .await
    }

    async fn add_slots(&self, addr: &NodeAddr, slots: &[u16]) -> Result<(), DriverError> {
        self.call(addr, "cluster addslots", || self.inner.add_slots(addr, slots))
            .await
    }

    async fn remove_slots(&self, addr: &NodeAddr, slots: &[u16]) -> Result<(), DriverError> {
        self.call(addr, "cluster delslots", || self.inner.remove_slots(addr, slots))
            .await
    }

    async fn keys_in_slot(
        &self,
        addr: &NodeAddr,
        slot: u16,
        limit: usize,
    ) -> Result<Vec<Bytes>, DriverError> {
        self.call(addr, "cluster getkeysinslot", || {
            self.inner.keys_in_slot(addr, slot, limit)
        })
        .await
    }

    async fn count_keys_in_slot(&self, addr: &NodeAddr, slot: u16) -> Result<u64, DriverError> {
        self.call(addr, "cluster countkeysinslot", || {
            self.inner.count_keys_in_slot(addr, slot)
        })
        .await
    }

    async fn transfer_key(
        &self,
        addr: &NodeAddr,
        dest: &NodeAddr,
        key: &Bytes,
        options: &TransferOptions,
    ) -> Result<(), DriverError> {
        self.call(addr, "migrate", || {
            self.inner.transfer_key(addr, dest, key, options)
        })
        .await
    }

    async fn meet(&self, addr: &NodeAddr, peer: &NodeAddr) -> Result<(), DriverError> {
        self.call(addr, "cluster meet", || self.inner.meet(addr, peer))
            .await
    }

    async fn replicate_from(&self, addr: &NodeAddr, primary: &str) -> Result<(), DriverError> {
        self.call(addr, "cluster replicate", || {
            self.inner.replicate_from(addr, primary)
        })
        .await
    }

    async fn forget(&self, addr: &NodeAddr, name: &str) -> Result<(), DriverError> {
        self.call(addr, "cluster forget", || self.inner.forget(addr, name))
            .await
    }

    async fn failover(&self, addr: &NodeAddr, mode: FailoverMode) -> Result<(), DriverError> {
        self.call(addr, "cluster failover", || self.inner.failover(addr, mode))
            .await
    }

    async fn reset(&self, addr: &NodeAddr, mode: ResetMode) -> Result<(), DriverError> {
        self.call(addr, "cluster reset", || self.inner.reset(addr, mode))
            .await
    }

    async fn set_config_epoch(&self, addr: &NodeAddr, epoch: u64) -> Result<(), DriverError> {
        self.call(addr, "cluster set-config-epoch", || {
            self.inner.set_config_epoch(addr, epoch)
        })
        .await
    }

    async fn info(&self, addr: &NodeAddr) -> Result<NodeInfo, DriverError> {
        self.call(addr, "info", || self.inner.info(addr)).await
    }

    async fn role(&self, addr: &NodeAddr) -> Result<Role, DriverError> {
        self.call(addr, "role", || self.inner.role(addr)).await
    }

    async fn flush_all(&self, addr: &NodeAddr) -> Result<(), DriverError> {
        self.call(addr, "flushall", || self.inner.flush_all(addr))
            .await
    }

    async fn config_set(
        &self,
        addr: &NodeAddr,
        name: &str,
        value: &str,
    ) -> Result<(), DriverError> {
        self.call(addr, "config set", || self.inner.config_set(addr, name, value))
            .await
    }

    async fn config_rewrite(&self, addr: &NodeAddr) -> Result<(), DriverError> {
        self.call(addr, "config rewrite", || self.inner.config_rewrite(addr))
            .await
    }
}
