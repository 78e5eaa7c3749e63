//! An in-memory cluster that answers node commands like a real server.
//!
//! Gossip is instantaneous: a MEET merges the known-node sets of everyone
//! involved, and slot ownership is a single shared truth, so listings only
//! disagree on membership unless a node is told to believe a different
//! owner for some slot. That is enough to exercise every orchestration path
//! without sockets.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use shardctl_cluster::{
    key_slot, Cluster, ClusterConfig, DriverError, FailoverMode, ManagedDriver, MigrationConfig, Node,
    NodeAddr, NodeDriver, NodeEntry, NodeInfo, PollConfig, ResetMode, RetryPolicy, Role,
    SharedDriver, SlotState, StopSignal, TransferOptions, SLOT_COUNT,
};

#[derive(Debug, Clone)]
pub struct FakeNode {
    pub name: String,
    pub addr: NodeAddr,
    pub version: String,
    pub cluster_enabled: bool,
    /// Names this node knows, itself included.
    pub known: BTreeSet<String>,
    pub primary: Option<String>,
    pub slots: BTreeSet<u16>,
    pub migrating: BTreeMap<u16, String>,
    pub importing: BTreeMap<u16, String>,
    pub keys: BTreeSet<Bytes>,
    pub epoch: u64,
    pub config: BTreeMap<String, String>,
    /// Slots this node lists under a different owner than the truth.
    believed: BTreeMap<u16, String>,
    sync_left: u32,
    down: bool,
    flaky: u32,
    loading: u32,
    ignore_failovers: u32,
    reject: Option<&'static str>,
}

impl FakeNode {
    pub fn is_primary(&self) -> bool {
        self.primary.is_none()
    }
}

#[derive(Default)]
struct World {
    nodes: BTreeMap<NodeAddr, FakeNode>,
    log: Vec<(NodeAddr, String)>,
    next_id: u64,
    sync_polls: u32,
    transfer_budget: Option<usize>,
}

impl World {
    fn fresh_name(&mut self) -> String {
        self.next_id += 1;
        format!("{:040x}", self.next_id)
    }

    fn addr_of(&self, name: &str) -> Option<NodeAddr> {
        self.nodes
            .values()
            .find(|n| n.name == name)
            .map(|n| n.addr.clone())
    }

    fn by_name(&self, name: &str) -> Option<&FakeNode> {
        self.nodes.values().find(|n| n.name == name)
    }

    fn me(&mut self, addr: &NodeAddr) -> &mut FakeNode {
        // exec() has already checked the address exists
        self.nodes.get_mut(addr).expect("node checked by exec")
    }

    fn entry(&self, node: &FakeNode, myself: bool) -> NodeEntry {
        let mut entry = NodeEntry::primary(node.name.clone(), node.addr.clone());
        entry.flags.myself = myself;
        entry.config_epoch = node.epoch;
        match &node.primary {
            Some(primary) => {
                entry.flags.master = false;
                entry.flags.slave = true;
                entry.replicates = Some(primary.clone());
            }
            None => entry.slots = node.slots.clone(),
        }
        if myself {
            entry.migrating = node.migrating.clone();
            entry.importing = node.importing.clone();
        } else if node.down {
            entry.flags.fail = true;
            entry.link = shardctl_cluster::LinkState::Disconnected;
        }
        entry
    }

    fn listing(&self, addr: &NodeAddr) -> String {
        let me = &self.nodes[addr];
        let mut entries = vec![self.entry(me, true)];
        for name in &me.known {
            if *name == me.name {
                continue;
            }
            if let Some(peer) = self.by_name(name) {
                entries.push(self.entry(peer, false));
            }
        }
        for (slot, owner) in &me.believed {
            for entry in &mut entries {
                if entry.name == *owner {
                    entry.slots.insert(*slot);
                } else {
                    entry.slots.remove(slot);
                }
            }
        }
        entries
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn owner_of(&self, slot: u16) -> Option<NodeAddr> {
        self.nodes
            .values()
            .find(|n| n.is_primary() && n.slots.contains(&slot))
            .map(|n| n.addr.clone())
    }
}

fn reply(msg: impl Into<String>) -> DriverError {
    DriverError::Reply(msg.into())
}

/// Applies injected faults before a command reaches the node.
fn gate(node: Option<&mut FakeNode>, op: &'static str) -> Result<(), DriverError> {
    let Some(node) = node.filter(|n| !n.down) else {
        return Err(DriverError::Transport("connection refused".into()));
    };
    if node.flaky > 0 {
        node.flaky -= 1;
        return Err(DriverError::Transport("connection reset by peer".into()));
    }
    if node.loading > 0 {
        node.loading -= 1;
        return Err(DriverError::BusyLoading);
    }
    if node.reject == Some(op) {
        return Err(reply(format!("ERR injected failure for {op}")));
    }
    Ok(())
}

/// Handle to a simulated cluster. Clones share state.
#[derive(Clone, Default)]
pub struct FakeCluster {
    world: Arc<Mutex<World>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        match self.world.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A driver over this cluster that never retries.
    pub fn driver(&self) -> SharedDriver {
        ManagedDriver::new(self.clone())
            .with_policy(RetryPolicy::none())
            .into_shared()
    }

    pub fn node(&self, addr: &NodeAddr) -> Node {
        Node::new(addr.clone(), self.driver())
    }

    // -- building --

    /// A fresh, empty instance in cluster mode that knows only itself.
    pub fn spawn(&self, host: &str, port: u16) -> NodeAddr {
        let mut world = self.lock();
        let name = world.fresh_name();
        let addr = NodeAddr::new(host, port);
        world.nodes.insert(
            addr.clone(),
            FakeNode {
                name: name.clone(),
                addr: addr.clone(),
                version: "7.2.4".into(),
                cluster_enabled: true,
                known: BTreeSet::from([name]),
                primary: None,
                slots: BTreeSet::new(),
                migrating: BTreeMap::new(),
                importing: BTreeMap::new(),
                keys: BTreeSet::new(),
                epoch: 0,
                config: BTreeMap::new(),
                believed: BTreeMap::new(),
                sync_left: 0,
                down: false,
                flaky: 0,
                loading: 0,
                ignore_failovers: 0,
                reject: None,
            },
        );
        addr
    }

    /// A formed cluster: one primary per address, slots split evenly in
    /// contiguous ranges.
    pub fn with_primaries(addrs: &[(&str, u16)]) -> (Self, Vec<NodeAddr>) {
        let cluster = Self::new();
        let total = SLOT_COUNT as usize;
        let n = addrs.len();
        let mut layout = Vec::new();
        let mut start = 0;
        for (i, (host, port)) in addrs.iter().enumerate() {
            let size = total / n + usize::from(i < total % n);
            layout.push(((*host, *port), (start as u16)..((start + size) as u16)));
            start += size;
        }
        let primaries = cluster.with_layout(&layout);
        (cluster, primaries)
    }

    /// Adds joined primaries owning the given slot ranges.
    pub fn with_layout(&self, layout: &[((&str, u16), std::ops::Range<u16>)]) -> Vec<NodeAddr> {
        let addrs: Vec<NodeAddr> = layout
            .iter()
            .map(|((host, port), _)| self.spawn(host, *port))
            .collect();
        {
            let mut world = self.lock();
            for (addr, (_, range)) in addrs.iter().zip(layout) {
                world.me(addr).slots.extend(range.clone());
            }
        }
        self.join(&addrs);
        addrs
    }

    /// A synced replica of `primary`, already a member.
    pub fn add_replica(&self, host: &str, port: u16, primary: &NodeAddr) -> NodeAddr {
        let addr = self.spawn(host, port);
        let mut world = self.lock();
        let name = world.nodes[primary].name.clone();
        world.me(&addr).primary = Some(name);
        drop(world);
        self.join(std::slice::from_ref(&addr));
        addr
    }

    /// Makes `addrs` members of the existing cluster, everyone knowing
    /// everyone.
    pub fn join(&self, addrs: &[NodeAddr]) {
        let mut world = self.lock();
        let mut members: BTreeSet<String> = world
            .nodes
            .values()
            .filter(|n| n.known.len() > 1 || !n.slots.is_empty() || n.primary.is_some())
            .map(|n| n.name.clone())
            .collect();
        members.extend(addrs.iter().map(|a| world.nodes[a].name.clone()));
        for node in world.nodes.values_mut() {
            if members.contains(&node.name) {
                node.known = members.clone();
            }
        }
    }

    /// Stores each key on the primary owning its slot.
    pub fn put_keys<'a>(&self, keys: impl IntoIterator<Item = &'a str>) {
        let mut world = self.lock();
        for key in keys {
            let slot = key_slot(key.as_bytes());
            if let Some(owner) = world.owner_of(slot) {
                world.me(&owner).keys.insert(Bytes::copy_from_slice(key.as_bytes()));
            }
        }
    }

    /// Stores a key on `addr` regardless of slot ownership.
    pub fn put_key_on(&self, addr: &NodeAddr, key: &str) {
        self.lock()
            .me(addr)
            .keys
            .insert(Bytes::copy_from_slice(key.as_bytes()));
    }

    // -- fault injection --

    pub fn set_down(&self, addr: &NodeAddr, down: bool) {
        self.lock().me(addr).down = down;
    }

    /// The next `n` calls to `addr` fail with a transport error.
    pub fn set_flaky(&self, addr: &NodeAddr, n: u32) {
        self.lock().me(addr).flaky = n;
    }

    /// The next `n` calls to `addr` answer `-LOADING`.
    pub fn set_loading(&self, addr: &NodeAddr, n: u32) {
        self.lock().me(addr).loading = n;
    }

    /// New replicas report `sync` for this many ROLE polls.
    pub fn set_sync_polls(&self, n: u32) {
        self.lock().sync_polls = n;
    }

    /// The next `n` failovers on `addr` answer OK but change nothing.
    pub fn ignore_failovers(&self, addr: &NodeAddr, n: u32) {
        self.lock().me(addr).ignore_failovers = n;
    }

    /// After `n` more successful MIGRATEs, every MIGRATE fails.
    pub fn fail_transfers_after(&self, n: usize) {
        self.lock().transfer_budget = Some(n);
    }

    pub fn allow_transfers(&self) {
        self.lock().transfer_budget = None;
    }

    /// Every `op` sent to `addr` fails with an error reply.
    pub fn reject(&self, addr: &NodeAddr, op: &'static str) {
        self.lock().me(addr).reject = Some(op);
    }

    pub fn set_version(&self, addr: &NodeAddr, version: &str) {
        self.lock().me(addr).version = version.to_owned();
    }

    pub fn forget_locally(&self, addr: &NodeAddr, other: &NodeAddr) {
        let mut world = self.lock();
        let name = world.nodes[other].name.clone();
        world.me(addr).known.remove(&name);
    }

    /// `observer` lists `slot` as owned by `owner`, whatever the truth is.
    pub fn believe_owner(&self, observer: &NodeAddr, slot: u16, owner: &NodeAddr) {
        let mut world = self.lock();
        let name = world.nodes[owner].name.clone();
        world.me(observer).believed.insert(slot, name);
    }

    pub fn mark_migrating(&self, addr: &NodeAddr, slot: u16, to: &NodeAddr) {
        let mut world = self.lock();
        let name = world.nodes[to].name.clone();
        world.me(addr).migrating.insert(slot, name);
    }

    pub fn mark_importing(&self, addr: &NodeAddr, slot: u16, from: &NodeAddr) {
        let mut world = self.lock();
        let name = world.nodes[from].name.clone();
        world.me(addr).importing.insert(slot, name);
    }

    // -- inspection --

    pub fn state(&self, addr: &NodeAddr) -> FakeNode {
        self.lock().nodes[addr].clone()
    }

    pub fn name_of(&self, addr: &NodeAddr) -> String {
        self.state(addr).name
    }

    pub fn slot_count(&self, addr: &NodeAddr) -> usize {
        self.state(addr).slots.len()
    }

    /// The primary holding `slot`.
    pub fn owner_of(&self, slot: u16) -> Option<NodeAddr> {
        self.lock().owner_of(slot)
    }

    pub fn keys_on(&self, addr: &NodeAddr) -> usize {
        self.state(addr).keys.len()
    }

    /// Address of the primary `addr` replicates.
    pub fn primary_of(&self, addr: &NodeAddr) -> Option<NodeAddr> {
        let world = self.lock();
        let name = world.nodes[addr].primary.clone()?;
        world.addr_of(&name)
    }

    /// Primaries by address, as the simulation sees them.
    pub fn primaries(&self) -> Vec<NodeAddr> {
        self.lock()
            .nodes
            .values()
            .filter(|n| n.is_primary() && n.known.len() > 1)
            .map(|n| n.addr.clone())
            .collect()
    }

    pub fn replicas_of(&self, primary: &NodeAddr) -> Vec<NodeAddr> {
        let world = self.lock();
        let name = world.nodes[primary].name.clone();
        world
            .nodes
            .values()
            .filter(|n| n.primary.as_deref() == Some(name.as_str()))
            .map(|n| n.addr.clone())
            .collect()
    }

    /// Every command that reached a node, in order.
    pub fn log(&self) -> Vec<(NodeAddr, String)> {
        self.lock().log.clone()
    }

    /// Position of the first command sent to `addr` that starts with `op`.
    pub fn position(&self, addr: &NodeAddr, op: &str) -> Option<usize> {
        self.log().iter().position(|(a, o)| a == addr && o.starts_with(op))
    }

    pub fn count_ops(&self, prefix: &str) -> usize {
        self.log().iter().filter(|(_, o)| o.starts_with(prefix)).count()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    // -- dispatch --

    fn exec<T>(
        &self,
        addr: &NodeAddr,
        op: &'static str,
        detail: String,
        f: impl FnOnce(&mut World) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut world = self.lock();
        gate(world.nodes.get_mut(addr), op)?;
        let entry = if detail.is_empty() {
            op.to_owned()
        } else {
            format!("{op} {detail}")
        };
        world.log.push((addr.clone(), entry));
        f(&mut world)
    }
}

/// Connects through `seed` with [`fast_config`].
pub async fn connect(fake: &FakeCluster, seed: &NodeAddr) -> Cluster {
    Cluster::connect(&fake.node(seed), fast_config(), StopSignal::new())
        .await
        .expect("connect to fake cluster")
}

/// The topology's handle for `addr`, sharing its cache.
pub fn member(cluster: &Cluster, addr: &NodeAddr) -> Node {
    cluster
        .topology()
        .get_by_addr(addr)
        .unwrap_or_else(|| panic!("{addr} is not a member"))
}

/// `n` distinct keys hashing into `slots`.
pub fn keys_in(slots: std::ops::Range<u16>, n: usize) -> Vec<String> {
    (0u32..)
        .map(|i| format!("key:{i}"))
        .filter(|k| slots.contains(&key_slot(k.as_bytes())))
        .take(n)
        .collect()
}

/// Tight polling so tests finish quickly, with a deadline so a broken
/// orchestration fails instead of hanging.
pub fn fast_config() -> ClusterConfig {
    ClusterConfig {
        migration: MigrationConfig::default(),
        poll: PollConfig {
            interval: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(5)),
        },
    }
}

#[async_trait]
impl NodeDriver for FakeCluster {
    async fn list_topology(&self, addr: &NodeAddr) -> Result<String, DriverError> {
        self.exec(addr, "nodes", String::new(), |w| Ok(w.listing(addr)))
    }

    async fn set_slot(&self, addr: &NodeAddr, slot: u16, state: &SlotState) -> Result<(), DriverError> {
        let detail = format!("{slot} {}", state.action().to_lowercase());
        self.exec(addr, "setslot", detail, |w| {
            let me = w.nodes[addr].clone();
            match state {
                SlotState::Importing(src) => {
                    if !me.is_primary() {
                        return Err(reply("ERR Please use SETSLOT only with masters."));
                    }
                    if me.slots.contains(&slot) {
                        return Err(reply(format!("ERR I'm already the owner of hash slot {slot}")));
                    }
                    w.me(addr).importing.insert(slot, src.clone());
                }
                SlotState::Migrating(dst) => {
                    if !me.slots.contains(&slot) {
                        return Err(reply(format!("ERR I'm not the owner of hash slot {slot}")));
                    }
                    w.me(addr).migrating.insert(slot, dst.clone());
                }
                SlotState::Stable => {
                    let node = w.me(addr);
                    node.migrating.remove(&slot);
                    node.importing.remove(&slot);
                }
                SlotState::Node(name) => {
                    let Some(target) = w.addr_of(name) else {
                        return Err(reply(format!("ERR I don't know about node {name}")));
                    };
                    let holds_keys = me.keys.iter().any(|k| key_slot(k) == slot);
                    if me.slots.contains(&slot) && *name != me.name && holds_keys {
                        return Err(reply(format!(
                            "ERR Can't assign hashslot {slot} to a different node while I still hold keys for this hash slot."
                        )));
                    }
                    for node in w.nodes.values_mut() {
                        node.slots.remove(&slot);
                    }
                    w.me(&target).slots.insert(slot);
                    let node = w.me(addr);
                    if *name == me.name {
                        node.importing.remove(&slot);
                    } else {
                        node.migrating.remove(&slot);
                    }
                }
            }
            Ok(())
        })
    }

    async fn add_slots(&self, addr: &NodeAddr, slots: &[u16]) -> Result<(), DriverError> {
        self.exec(addr, "addslots", slots.len().to_string(), |w| {
            let me = w.nodes[addr].clone();
            for slot in slots {
                let busy = me
                    .known
                    .iter()
                    .filter_map(|n| w.by_name(n))
                    .any(|n| n.is_primary() && n.slots.contains(slot));
                if busy {
                    return Err(reply(format!("ERR Slot {slot} is already busy")));
                }
            }
            w.me(addr).slots.extend(slots.iter().copied());
            Ok(())
        })
    }

    async fn remove_slots(&self, addr: &NodeAddr, slots: &[u16]) -> Result<(), DriverError> {
        self.exec(addr, "delslots", slots.len().to_string(), |w| {
            let me = w.me(addr);
            for slot in slots {
                me.slots.remove(slot);
            }
            Ok(())
        })
    }

    async fn keys_in_slot(&self, addr: &NodeAddr, slot: u16, limit: usize) -> Result<Vec<Bytes>, DriverError> {
        self.exec(addr, "getkeysinslot", slot.to_string(), |w| {
            Ok(w.nodes[addr]
                .keys
                .iter()
                .filter(|k| key_slot(k) == slot)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    async fn count_keys_in_slot(&self, addr: &NodeAddr, slot: u16) -> Result<u64, DriverError> {
        self.exec(addr, "countkeysinslot", slot.to_string(), |w| {
            Ok(w.nodes[addr].keys.iter().filter(|k| key_slot(k) == slot).count() as u64)
        })
    }

    async fn transfer_key(
        &self,
        addr: &NodeAddr,
        dest: &NodeAddr,
        key: &Bytes,
        options: &TransferOptions,
    ) -> Result<(), DriverError> {
        self.exec(addr, "migrate", dest.to_string(), |w| {
            match w.transfer_budget {
                Some(0) => {
                    return Err(DriverError::Transport(
                        "IOERR error or timeout writing to target instance".into(),
                    ))
                }
                Some(ref mut left) => *left -= 1,
                None => {}
            }
            match w.nodes.get(dest) {
                Some(d) if !d.down => {}
                _ => return Err(reply("IOERR error or timeout connecting to the client")),
            }
            if !w.nodes[addr].keys.contains(key) {
                return Ok(());
            }
            if !options.copy {
                w.me(addr).keys.remove(key);
            }
            w.me(dest).keys.insert(key.clone());
            Ok(())
        })
    }

    async fn meet(&self, addr: &NodeAddr, peer: &NodeAddr) -> Result<(), DriverError> {
        self.exec(addr, "meet", peer.to_string(), |w| {
            let Some(other) = w.nodes.get(peer).filter(|p| !p.down) else {
                return Ok(());
            };
            let group: BTreeSet<String> = w.nodes[addr].known.union(&other.known).cloned().collect();
            for node in w.nodes.values_mut() {
                if group.contains(&node.name) {
                    node.known = group.clone();
                }
            }
            Ok(())
        })
    }

    async fn replicate_from(&self, addr: &NodeAddr, primary: &str) -> Result<(), DriverError> {
        self.exec(addr, "replicate", primary.to_owned(), |w| {
            let me = w.nodes[addr].clone();
            if primary == me.name {
                return Err(reply("ERR Can't replicate myself"));
            }
            if !me.known.contains(primary) {
                return Err(reply(format!("ERR Unknown node {primary}")));
            }
            match w.by_name(primary) {
                Some(p) if p.is_primary() => {}
                _ => return Err(reply("ERR I can only replicate a master, not a replica.")),
            }
            if me.is_primary() && (!me.slots.is_empty() || !me.keys.is_empty()) {
                return Err(reply(
                    "ERR To set a master the node must be empty and without assigned slots.",
                ));
            }
            let polls = w.sync_polls;
            let node = w.me(addr);
            node.primary = Some(primary.to_owned());
            node.slots.clear();
            node.sync_left = polls;
            Ok(())
        })
    }

    async fn forget(&self, addr: &NodeAddr, name: &str) -> Result<(), DriverError> {
        self.exec(addr, "forget", name.to_owned(), |w| {
            let me = w.me(addr);
            if me.name == name {
                return Err(reply("ERR I tried hard but I can't forget myself..."));
            }
            if me.primary.as_deref() == Some(name) {
                return Err(reply("ERR Can't forget my master!"));
            }
            if !me.known.remove(name) {
                return Err(reply(format!("ERR Unknown node {name}")));
            }
            Ok(())
        })
    }

    async fn failover(&self, addr: &NodeAddr, mode: FailoverMode) -> Result<(), DriverError> {
        self.exec(addr, "failover", mode.as_str().to_lowercase(), |w| {
            let me = w.nodes[addr].clone();
            let Some(old_name) = me.primary.clone() else {
                return Err(reply("ERR You should send CLUSTER FAILOVER to a replica"));
            };
            if me.ignore_failovers > 0 {
                w.me(addr).ignore_failovers -= 1;
                return Ok(());
            }
            let Some(old) = w.addr_of(&old_name) else {
                return Err(reply("ERR Cannot failover a node with no master"));
            };
            let slots = std::mem::take(&mut w.me(&old).slots);
            let keys = w.nodes[&old].keys.clone();
            for node in w.nodes.values_mut() {
                if node.primary.as_deref() == Some(old_name.as_str()) {
                    node.primary = Some(me.name.clone());
                }
            }
            w.me(&old).primary = Some(me.name.clone());
            let node = w.me(addr);
            node.primary = None;
            node.slots = slots;
            node.keys = keys;
            Ok(())
        })
    }

    async fn reset(&self, addr: &NodeAddr, mode: ResetMode) -> Result<(), DriverError> {
        self.exec(addr, "reset", mode.as_str().to_lowercase(), |w| {
            let me = w.nodes[addr].clone();
            if me.is_primary() && !me.keys.is_empty() {
                return Err(reply(
                    "ERR CLUSTER RESET can't be called with master nodes containing keys",
                ));
            }
            let name = match mode {
                ResetMode::Hard => w.fresh_name(),
                ResetMode::Soft => me.name.clone(),
            };
            let node = w.me(addr);
            node.known = BTreeSet::from([name.clone()]);
            node.name = name;
            node.primary = None;
            node.slots.clear();
            node.migrating.clear();
            node.importing.clear();
            node.keys.clear();
            if mode == ResetMode::Hard {
                node.epoch = 0;
            }
            Ok(())
        })
    }

    async fn set_config_epoch(&self, addr: &NodeAddr, epoch: u64) -> Result<(), DriverError> {
        self.exec(addr, "set-config-epoch", epoch.to_string(), |w| {
            let me = w.me(addr);
            if me.known.len() > 1 {
                return Err(reply(
                    "ERR The user can assign a config epoch only when the node does not know any other node.",
                ));
            }
            if me.epoch != 0 {
                return Err(reply("ERR Node config epoch is already non-zero"));
            }
            me.epoch = epoch;
            Ok(())
        })
    }

    async fn info(&self, addr: &NodeAddr) -> Result<NodeInfo, DriverError> {
        self.exec(addr, "info", String::new(), |w| {
            let me = &w.nodes[addr];
            Ok(NodeInfo {
                version: me.version.clone(),
                cluster_enabled: me.cluster_enabled,
                known_nodes: me.known.len(),
                has_data: !me.keys.is_empty(),
            })
        })
    }

    async fn role(&self, addr: &NodeAddr) -> Result<Role, DriverError> {
        let mut world = self.lock();
        gate(world.nodes.get_mut(addr), "role")?;
        let me = world.me(addr);
        let role = match me.primary {
            None => Role::Primary,
            Some(_) if me.sync_left > 0 => {
                me.sync_left -= 1;
                Role::Replica { link: "sync".into() }
            }
            Some(_) => Role::Replica {
                link: "connected".into(),
            },
        };
        let shown = match &role {
            Role::Primary => "role master".to_owned(),
            Role::Replica { link } => format!("role {link}"),
        };
        world.log.push((addr.clone(), shown));
        Ok(role)
    }

    async fn flush_all(&self, addr: &NodeAddr) -> Result<(), DriverError> {
        self.exec(addr, "flushall", String::new(), |w| {
            let me = w.me(addr);
            if !me.is_primary() {
                return Err(reply("READONLY You can't write against a read only replica."));
            }
            me.keys.clear();
            Ok(())
        })
    }

    async fn config_set(&self, addr: &NodeAddr, name: &str, value: &str) -> Result<(), DriverError> {
        self.exec(addr, "config-set", format!("{name} {value}"), |w| {
            w.me(addr).config.insert(name.to_owned(), value.to_owned());
            Ok(())
        })
    }

    async fn config_rewrite(&self, addr: &NodeAddr) -> Result<(), DriverError> {
        self.exec(addr, "config-rewrite", String::new(), |_| Ok(()))
    }
}
