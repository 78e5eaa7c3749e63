//! Cached handle to one cluster member.
//!
//! A [`Node`] pairs an address with the shared driver and remembers the
//! last topology listing it fetched. Reads of name, role or slots hit that
//! cache; mutating helpers leave it alone, so callers flush after changing
//! a node and before relying on its new state. Clones share one cache.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::driver::{FailoverMode, ResetMode, Role, SharedDriver, SlotState, TransferOptions};
use crate::error::{ClusterError, DriverError, ParseError};
use crate::topology::{parse_cluster_nodes, NodeAddr, NodeEntry, NodeInfo};

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    addr: NodeAddr,
    driver: SharedDriver,
    cache: Mutex<NodeCache>,
}

#[derive(Default)]
struct NodeCache {
    /// This node's own line.
    entry: Option<Arc<NodeEntry>>,
    /// The full listing, own line first.
    view: Option<Arc<[NodeEntry]>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node<{}>", self.inner.addr)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.inner.addr == other.inner.addr
    }
}

impl Eq for Node {}

impl Node {
    pub fn new(addr: NodeAddr, driver: SharedDriver) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                addr,
                driver,
                cache: Mutex::new(NodeCache::default()),
            }),
        }
    }

    /// Builds a handle whose own line is already known, e.g. from a peer's
    /// listing.
    pub fn from_entry(entry: NodeEntry, driver: SharedDriver) -> Self {
        let node = Self::new(entry.addr.clone(), driver);
        node.cache().entry = Some(Arc::new(entry));
        node
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.inner.addr
    }

    pub fn host(&self) -> &str {
        &self.inner.addr.host
    }

    pub fn driver(&self) -> &SharedDriver {
        &self.inner.driver
    }

    fn cache(&self) -> MutexGuard<'_, NodeCache> {
        match self.inner.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drops the cached listing and own line.
    pub fn flush_cache(&self) {
        *self.cache() = NodeCache::default();
    }

    /// Queries the node's listing, bypassing and then refreshing the cache.
    pub async fn fetch_view(&self) -> Result<Arc<[NodeEntry]>, ClusterError> {
        let text = self.call(self.driver().list_topology(self.addr())).await?;
        let mut entries = parse_cluster_nodes(&text)?;

        // a node that never met anyone doesn't know its own host
        if let Some(me) = entries.first_mut() {
            if me.addr.host.is_empty() {
                me.addr.host = self.host().to_owned();
            }
        }

        let view: Arc<[NodeEntry]> = entries.into();
        let mut cache = self.cache();
        cache.entry = view.first().cloned().map(Arc::new);
        cache.view = Some(view.clone());
        Ok(view)
    }

    /// The node's listing, from cache when available.
    pub async fn view(&self) -> Result<Arc<[NodeEntry]>, ClusterError> {
        let cached = self.cache().view.clone();
        if let Some(view) = cached {
            return Ok(view);
        }
        self.fetch_view().await
    }

    /// The node's own line, from cache when available.
    pub async fn entry(&self) -> Result<Arc<NodeEntry>, ClusterError> {
        let cached = self.cache().entry.clone();
        if let Some(entry) = cached {
            return Ok(entry);
        }
        let view = self.fetch_view().await?;
        view.first()
            .cloned()
            .map(Arc::new)
            .ok_or(ClusterError::Parse(ParseError::NoSelf))
    }

    pub async fn name(&self) -> Result<String, ClusterError> {
        Ok(self.entry().await?.name.clone())
    }

    pub async fn is_primary(&self) -> Result<bool, ClusterError> {
        Ok(self.entry().await?.is_primary())
    }

    pub async fn slots(&self) -> Result<BTreeSet<u16>, ClusterError> {
        Ok(self.entry().await?.slots.clone())
    }

    /// Counts the replicas of this node in its own listing.
    pub async fn replica_count(&self) -> Result<usize, ClusterError> {
        let name = self.name().await?;
        Ok(self
            .view()
            .await?
            .iter()
            .filter(|e| e.is_replica_of(&name))
            .count())
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, DriverError>>,
    ) -> Result<T, ClusterError> {
        fut.await.map_err(|e| ClusterError::driver(self.addr(), e))
    }

    // -- commands, errors tagged with this node's address --

    pub async fn set_slot(&self, slot: u16, state: SlotState) -> Result<(), ClusterError> {
        self.call(self.driver().set_slot(self.addr(), slot, &state))
            .await
    }

    pub async fn add_slots(&self, slots: &[u16]) -> Result<(), ClusterError> {
        if slots.is_empty() {
            return Ok(());
        }
        self.call(self.driver().add_slots(self.addr(), slots)).await
    }

    pub async fn remove_slots(&self, slots: &[u16]) -> Result<(), ClusterError> {
        if slots.is_empty() {
            return Ok(());
        }
        self.call(self.driver().remove_slots(self.addr(), slots))
            .await
    }

    pub async fn keys_in_slot(&self, slot: u16, limit: usize) -> Result<Vec<Bytes>, ClusterError> {
        self.call(self.driver().keys_in_slot(self.addr(), slot, limit))
            .await
    }

    pub async fn count_keys_in_slot(&self, slot: u16) -> Result<u64, ClusterError> {
        self.call(self.driver().count_keys_in_slot(self.addr(), slot))
            .await
    }

    pub async fn transfer_key(
        &self,
        dest: &Node,
        key: &Bytes,
        options: &TransferOptions,
    ) -> Result<(), ClusterError> {
        self.call(self.driver().transfer_key(self.addr(), dest.addr(), key, options))
            .await
    }

    pub async fn meet(&self, peer: &Node) -> Result<(), ClusterError> {
        self.call(self.driver().meet(self.addr(), peer.addr())).await
    }

    pub async fn replicate_from(&self, primary: &str) -> Result<(), ClusterError> {
        self.call(self.driver().replicate_from(self.addr(), primary))
            .await
    }

    pub async fn forget(&self, name: &str) -> Result<(), ClusterError> {
        self.call(self.driver().forget(self.addr(), name)).await
    }

    pub async fn failover(&self, mode: FailoverMode) -> Result<(), ClusterError> {
        self.call(self.driver().failover(self.addr(), mode)).await
    }

    pub async fn reset(&self, mode: ResetMode) -> Result<(), ClusterError> {
        self.call(self.driver().reset(self.addr(), mode)).await
    }

    pub async fn set_config_epoch(&self, epoch: u64) -> Result<(), ClusterError> {
        self.call(self.driver().set_config_epoch(self.addr(), epoch))
            .await
    }

    pub async fn info(&self) -> Result<NodeInfo, ClusterError> {
        self.call(self.driver().info(self.addr())).await
    }

    pub async fn role(&self) -> Result<Role, ClusterError> {
        self.call(self.driver().role(self.addr())).await
    }

    pub async fn flush_all(&self) -> Result<(), ClusterError> {
        self.call(self.driver().flush_all(self.addr())).await
    }

    pub async fn config_set(&self, name: &str, value: &str) -> Result<(), ClusterError> {
        self.call(self.driver().config_set(self.addr(), name, value))
            .await
    }

    pub async fn config_rewrite(&self) -> Result<(), ClusterError> {
        self.call(self.driver().config_rewrite(self.addr())).await
    }
}
