//! Operator-facing cluster operations.
//!
//! [`Cluster`] owns a topology snapshot and sequences the lower layers:
//! slot moves go through [`SlotMover`], slot-count plans come from
//! [`rebalance`](crate::rebalance), replica layouts from
//! [`placement`](crate::placement). Every multi-step operation checks the
//! [`StopSignal`] between steps and every cross-node wait is polled under
//! [`PollConfig`].
//!
//! Two operations against the same cluster must not run at once; nothing
//! here enforces that.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::driver::{FailoverMode, ResetMode};
use crate::error::ClusterError;
use crate::migration::{FixReport, MigrationConfig, SlotMover};
use crate::node::Node;
use crate::placement::{
    plan_master_moves, plan_replica_rearrangement, Placement, ReplicaSolver,
};
use crate::rebalance::{plan_node_drain, slot_balance, Transfer};
use crate::slots::{divide, format_slots, SLOT_COUNT};
use crate::topology::{NodeAddr, Topology};

// ---------------------------------------------------------------------------
// control
// ---------------------------------------------------------------------------

/// Cooperative stop flag, shared between the operation and whoever may
/// want to interrupt it (a signal handler, usually).
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Stopped)` once a stop has been requested.
    pub fn check(&self) -> Result<(), ClusterError> {
        if self.is_requested() {
            Err(ClusterError::Stopped)
        } else {
            Ok(())
        }
    }
}

/// How cross-node waits are polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// No deadline when unset.
    pub timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

impl PollConfig {
    /// Polls `probe` until it returns true, the deadline passes, or a stop
    /// is requested.
    pub async fn until<F, Fut>(
        &self,
        waiting_for: &str,
        stop: &StopSignal,
        mut probe: F,
    ) -> Result<(), ClusterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, ClusterError>>,
    {
        let start = Instant::now();
        loop {
            if probe().await? {
                debug!(elapsed = ?start.elapsed(), "done waiting for {waiting_for}");
                return Ok(());
            }
            stop.check()?;
            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    return Err(ClusterError::Timeout {
                        waiting_for: waiting_for.to_owned(),
                        elapsed: start.elapsed(),
                    });
                }
            }
            debug!("waiting for {waiting_for}");
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    pub migration: MigrationConfig,
    pub poll: PollConfig,
}

// ---------------------------------------------------------------------------
// operation inputs and outputs
// ---------------------------------------------------------------------------

/// A node joining the cluster.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub node: Node,
    pub role: JoinRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRole {
    Primary,
    /// Replicate the named primary, or the one with the fewest replicas.
    Replica { primary: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReshardOutcome {
    /// The cluster was not consistent; nothing moved.
    Skipped,
    Applied(Vec<Transfer<NodeAddr>>),
}

/// A placement and the live node behind each arena index.
#[derive(Debug, Clone)]
pub struct Distribution {
    pub placement: Placement,
    pub nodes: Vec<Node>,
}

/// Before and after views of a planned placement change.
#[derive(Debug, Clone)]
pub struct Preview {
    pub before: Placement,
    pub after: Placement,
}

/// A replica attachment that was carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
    pub replica: NodeAddr,
    pub primary: NodeAddr,
}

// ---------------------------------------------------------------------------
// cluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Cluster {
    topology: Topology,
    config: ClusterConfig,
    stop: StopSignal,
}

impl Cluster {
    pub fn new(topology: Topology, config: ClusterConfig, stop: StopSignal) -> Self {
        Self {
            topology,
            config,
            stop,
        }
    }

    /// Builds a cluster from the seed's listing.
    pub async fn connect(
        seed: &Node,
        config: ClusterConfig,
        stop: StopSignal,
    ) -> Result<Self, ClusterError> {
        let topology = Topology::fetch(seed).await?;
        Ok(Self::new(topology, config, stop))
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    fn mover(&self) -> SlotMover<'_> {
        SlotMover::new(&self.topology, &self.config.migration, &self.stop)
    }

    fn first(&self) -> Result<&Node, ClusterError> {
        self.topology
            .first()
            .ok_or_else(|| ClusterError::precondition("cluster has no members"))
    }

    /// Waits until every primary agrees on the topology, then requires the
    /// slot space to be fully covered.
    pub async fn wait(&self) -> Result<(), ClusterError> {
        let topology = &self.topology;
        let start = Instant::now();
        self.config
            .poll
            .until("cluster consistency", &self.stop, move || async move {
                topology.consistent().await
            })
            .await?;
        info!(elapsed = ?start.elapsed(), "cluster is consistent");

        topology.flush_all();
        match topology.coverage_problems().await? {
            Some(problems) => Err(ClusterError::NotHealthy(problems)),
            None => Ok(()),
        }
    }

    /// Checks nodes before they join: cluster mode on, knowing only
    /// themselves, holding no data, and running the same server version as
    /// each other and the existing members.
    pub async fn check_new_nodes(new: &[Node], existing: &[Node]) -> Result<(), ClusterError> {
        let mut versions = BTreeMap::new();
        for node in new {
            let info = node.info().await?;
            if !info.cluster_enabled {
                return Err(ClusterError::precondition(format!(
                    "{} is not running in cluster mode",
                    node.addr()
                )));
            }
            if info.known_nodes != 1 {
                return Err(ClusterError::precondition(format!(
                    "{} already knows {} other nodes",
                    node.addr(),
                    info.known_nodes.saturating_sub(1)
                )));
            }
            if info.has_data {
                return Err(ClusterError::precondition(format!(
                    "{} is not empty",
                    node.addr()
                )));
            }
            versions.entry(info.version).or_insert_with(|| node.addr().clone());
        }
        for node in existing {
            let info = node.info().await?;
            versions.entry(info.version).or_insert_with(|| node.addr().clone());
        }
        if versions.len() > 1 {
            let found: Vec<String> = versions
                .iter()
                .map(|(version, addr)| format!("{version} on {addr}"))
                .collect();
            return Err(ClusterError::precondition(format!(
                "mixed server versions: {}",
                found.join(", ")
            )));
        }
        Ok(())
    }

    /// Polls every member until each lists all of `addrs`.
    async fn wait_nodes_updated(&self, addrs: &[NodeAddr]) -> Result<(), ClusterError> {
        let members = self.topology.nodes();
        self.config
            .poll
            .until("new nodes to be listed", &self.stop, move || async move {
                for member in members {
                    let view = member.fetch_view().await?;
                    let listed: BTreeSet<&NodeAddr> = view.iter().map(|e| &e.addr).collect();
                    if !addrs.iter().all(|a| listed.contains(a)) {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
            .await
    }

    /// Introduces nodes through the first member and waits until the
    /// cluster has absorbed them.
    async fn join(&mut self, nodes: &[Node]) -> Result<(), ClusterError> {
        let first = self.first()?.clone();
        for node in nodes {
            node.meet(&first).await?;
            info!(node = %node.addr(), via = %first.addr(), "node met");
        }
        let addrs: Vec<NodeAddr> = nodes.iter().map(|n| n.addr().clone()).collect();
        self.wait_nodes_updated(&addrs).await?;
        for node in nodes {
            node.flush_cache();
            self.topology.push(node.clone());
        }
        self.wait().await
    }

    /// The primary with the fewest replicas, skipping `exclude`.
    async fn least_replicated_primary(&self, exclude: Option<&str>) -> Result<Node, ClusterError> {
        let mut best: Option<(usize, Node)> = None;
        for primary in self.topology.primaries().await? {
            let name = primary.name().await?;
            if exclude == Some(name.as_str()) {
                continue;
            }
            let count = self.topology.replicas_of(&name).await?.len();
            if best.as_ref().map_or(true, |(c, _)| count < *c) {
                best = Some((count, primary));
            }
        }
        best.map(|(_, node)| node)
            .ok_or_else(|| ClusterError::precondition("no primary available"))
    }

    /// Adds nodes in one step: all join, then those declared as replicas
    /// start replicating.
    pub async fn add_nodes(&mut self, specs: Vec<NewNode>) -> Result<(), ClusterError> {
        let nodes: Vec<Node> = specs.iter().map(|s| s.node.clone()).collect();
        Self::check_new_nodes(&nodes, &[self.first()?.clone()]).await?;
        self.join(&nodes).await?;

        for spec in specs {
            let JoinRole::Replica { primary } = spec.role else {
                continue;
            };
            let target = match primary {
                Some(name) => self.topology.require(&name).await?,
                None => self.least_replicated_primary(None).await?,
            };
            let name = target.name().await?;
            spec.node.replicate_from(&name).await?;
            info!(replica = %spec.node.addr(), primary = %target.addr(), "replica attached");
            spec.node.flush_cache();
            target.flush_cache();
        }
        Ok(())
    }

    /// Attaches new nodes as replicas of the named primaries.
    ///
    /// Each replica joins, starts replicating, and is polled until its
    /// initial sync finishes. By default one sync runs per host at a time;
    /// `fast` starts them all at once. A stop request lets in-flight syncs
    /// finish and then returns [`ClusterError::Stopped`].
    pub async fn add_replicas(
        &mut self,
        pairs: Vec<(Node, String)>,
        fast: bool,
    ) -> Result<Vec<Attached>, ClusterError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let nodes: Vec<Node> = pairs.iter().map(|(n, _)| n.clone()).collect();
        Self::check_new_nodes(&nodes, &[self.first()?.clone()]).await?;

        let mut queues: BTreeMap<String, VecDeque<(Node, String)>> = BTreeMap::new();
        for (node, primary) in pairs {
            queues
                .entry(node.host().to_owned())
                .or_default()
                .push_back((node, primary));
        }

        let start = Instant::now();
        let mut syncing: Vec<(Node, NodeAddr)> = Vec::new();
        let mut attached = Vec::new();
        let mut stopping = false;

        while !queues.is_empty() || !syncing.is_empty() {
            if !stopping && self.stop.is_requested() {
                warn!(in_flight = syncing.len(), "stop requested, waiting for in-flight syncs");
                stopping = true;
            }

            if !stopping {
                let hosts: Vec<String> = queues.keys().cloned().collect();
                for host in hosts {
                    let busy = syncing.iter().any(|(n, _)| n.host() == host);
                    if busy && !fast {
                        continue;
                    }
                    let Some(queue) = queues.get_mut(&host) else {
                        continue;
                    };
                    let batch: Vec<(Node, String)> = if fast {
                        queue.drain(..).collect()
                    } else {
                        queue.pop_front().into_iter().collect()
                    };
                    if queue.is_empty() {
                        queues.remove(&host);
                    }
                    for (node, primary_name) in batch {
                        self.join(std::slice::from_ref(&node)).await?;
                        let primary = self.topology.require(&primary_name).await?;
                        node.replicate_from(&primary_name).await?;
                        info!(replica = %node.addr(), primary = %primary.addr(), "replication started");
                        syncing.push((node, primary.addr().clone()));
                    }
                }
            }

            let mut still_syncing = Vec::with_capacity(syncing.len());
            for (node, primary) in syncing.drain(..) {
                if node.role().await?.is_synced_replica() {
                    info!(replica = %node.addr(), primary = %primary, "replica in sync");
                    node.flush_cache();
                    attached.push(Attached {
                        replica: node.addr().clone(),
                        primary,
                    });
                } else {
                    still_syncing.push((node, primary));
                }
            }
            syncing = still_syncing;

            if stopping && syncing.is_empty() {
                return Err(ClusterError::Stopped);
            }
            if queues.is_empty() && syncing.is_empty() {
                break;
            }
            if let Some(timeout) = self.config.poll.timeout {
                if start.elapsed() >= timeout {
                    return Err(ClusterError::Timeout {
                        waiting_for: format!("{} replicas to sync", syncing.len()),
                        elapsed: start.elapsed(),
                    });
                }
            }
            debug!(syncing = syncing.len(), queued = queues.values().map(VecDeque::len).sum::<usize>(), "sync wait");
            tokio::time::sleep(self.config.poll.interval).await;
        }

        self.topology.flush_all();
        Ok(attached)
    }

    /// Removes a node from the cluster.
    ///
    /// A primary's slots are drained to the other primaries and its
    /// replicas re-pointed at the least replicated remaining primary. Every
    /// other member then forgets it, and the node resets itself.
    ///
    /// A primary with open migration markers, or with slots the drain could
    /// not move, is refused before any replica or member is touched.
    pub async fn delete_node(&mut self, node: &Node) -> Result<(), ClusterError> {
        self.topology.flush_all();
        node.flush_cache();
        let entry = node.entry().await?;

        if entry.is_primary() {
            let open: BTreeSet<u16> = entry
                .migrating
                .keys()
                .chain(entry.importing.keys())
                .copied()
                .collect();
            if !open.is_empty() {
                return Err(ClusterError::precondition(format!(
                    "{} has open slots {}, run fix first",
                    node.addr(),
                    format_slots(&open)
                )));
            }
            if !entry.slots.is_empty() {
                self.migrate_node(node, None, false).await?;
                node.flush_cache();
                let left = node.slots().await?;
                if !left.is_empty() {
                    return Err(ClusterError::precondition(format!(
                        "{} still owns slots {} after draining",
                        node.addr(),
                        format_slots(&left)
                    )));
                }
            }
            let replicas = self.topology.replicas_of(&entry.name).await?;
            if !replicas.is_empty() {
                let target = self.least_replicated_primary(Some(&entry.name)).await?;
                let target_name = target.name().await?;
                for replica in &replicas {
                    replica.replicate_from(&target_name).await?;
                    info!(replica = %replica.addr(), primary = %target.addr(), "replica re-pointed");
                }
            }
        }

        self.topology.remove(&entry.name).await?;
        for other in self.topology.nodes() {
            other.forget(&entry.name).await?;
        }
        info!(node = %node.addr(), name = %entry.name, "node forgotten");
        self.topology.flush_all();

        node.reset(ResetMode::Hard).await?;
        info!(node = %node.addr(), "node reset");
        Ok(())
    }

    /// Resolves every primary's open migration markers.
    pub async fn fix_open_slots(&self) -> Result<FixReport, ClusterError> {
        self.mover().fix_open_slots().await
    }

    pub async fn migrate_slot(&self, src: &Node, dst: &Node, slot: u16) -> Result<usize, ClusterError> {
        self.mover().migrate_slot(src, dst, slot).await
    }

    pub async fn migrate(&self, src: &Node, dst: &Node, count: usize) -> Result<Vec<u16>, ClusterError> {
        self.mover().migrate(src, dst, count).await
    }

    /// Moves slots off `node` to the other primaries, or onto it when
    /// `income` is set.
    ///
    /// Without a count, draining moves every slot and income pulls the
    /// node up to its fair share of the assigned slots.
    pub async fn migrate_node(
        &self,
        node: &Node,
        count: Option<usize>,
        income: bool,
    ) -> Result<Vec<Transfer<NodeAddr>>, ClusterError> {
        node.flush_cache();
        let name = node.name().await?;
        let own = node.slots().await?.len();

        let mut others = Vec::new();
        for primary in self.topology.primaries().await? {
            if primary.name().await? != name {
                let slots = primary.slots().await?.len();
                others.push((primary, slots));
            }
        }
        if others.is_empty() {
            return Err(ClusterError::precondition("no other primary to exchange slots with"));
        }

        let count = if income {
            let available: usize = others.iter().map(|(_, s)| s).sum();
            let share = (available + own) / (others.len() + 1);
            count.unwrap_or(share.saturating_sub(own)).min(available)
        } else {
            count.map_or(own, |c| c.min(own))
        };
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut applied = Vec::new();
        for (other, share) in plan_node_drain(count, &others, income) {
            self.stop.check()?;
            let (src, dst) = if income { (&other, node) } else { (node, &other) };
            let moved = self.migrate(src, dst, share).await?;
            applied.push(Transfer {
                from: src.addr().clone(),
                to: dst.addr().clone(),
                count: moved.len(),
            });
        }
        Ok(applied)
    }

    /// Assigns uncovered slots to primaries, fewest slots first.
    pub async fn fill_slots(&self) -> Result<usize, ClusterError> {
        self.topology.flush_all();
        let missing: Vec<u16> = self.topology.missing_slots().await?.into_iter().collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let mut primaries = Vec::new();
        for primary in self.topology.primaries().await? {
            let slots = primary.slots().await?.len();
            primaries.push((slots, primary));
        }
        if primaries.is_empty() {
            return Err(ClusterError::precondition("no primaries to take slots"));
        }
        primaries.sort_by_key(|(slots, _)| *slots);

        let mut rest = missing.as_slice();
        for ((_, primary), share) in primaries.iter().zip(divide(missing.len(), primaries.len())) {
            let (chunk, tail) = rest.split_at(share);
            primary.add_slots(chunk).await?;
            primary.flush_cache();
            if !chunk.is_empty() {
                info!(node = %primary.addr(), slots = chunk.len(), "uncovered slots assigned");
            }
            rest = tail;
        }
        Ok(missing.len())
    }

    /// Evens out slot counts across primaries.
    ///
    /// Skipped when the primaries disagree about the topology, since the
    /// plan would be built on a view that may already be stale.
    pub async fn reshard(&self) -> Result<ReshardOutcome, ClusterError> {
        self.topology.flush_all();
        if !self.topology.consistent().await? {
            warn!("cluster is not consistent, skipping reshard");
            return Ok(ReshardOutcome::Skipped);
        }

        let primaries = self.topology.primaries().await?;
        if primaries.is_empty() {
            return Err(ClusterError::precondition("cluster has no primaries"));
        }
        if primaries.len() > SLOT_COUNT as usize {
            return Err(ClusterError::precondition(format!(
                "{} primaries for {SLOT_COUNT} slots",
                primaries.len()
            )));
        }

        let mut counts = Vec::with_capacity(primaries.len());
        for (i, primary) in primaries.iter().enumerate() {
            counts.push((i, primary.slots().await?.len()));
        }
        let total: usize = counts.iter().map(|(_, c)| c).sum();
        let plan = slot_balance(&counts, total);

        let mut applied = Vec::with_capacity(plan.len());
        for transfer in plan {
            self.stop.check()?;
            let (src, dst) = (&primaries[transfer.from], &primaries[transfer.to]);
            info!(from = %src.addr(), to = %dst.addr(), count = transfer.count, "resharding");
            let moved = self.migrate(src, dst, transfer.count).await?;
            applied.push(Transfer {
                from: src.addr().clone(),
                to: dst.addr().clone(),
                count: moved.len(),
            });
        }
        Ok(ReshardOutcome::Applied(applied))
    }

    /// Builds the placement arena for the current members plus `new` nodes
    /// as free capacity.
    pub async fn distribution(&self, new: &[Node]) -> Result<Distribution, ClusterError> {
        self.topology.flush_all();
        let mut placement = Placement::new();
        let mut nodes = Vec::new();
        let mut by_name = BTreeMap::new();

        for primary in self.topology.primaries().await? {
            let entry = primary.entry().await?;
            let id = placement.add_primary(entry.name.clone(), primary.addr().clone());
            by_name.insert(entry.name.clone(), id);
            nodes.push(primary);
        }
        for node in self.topology.nodes() {
            let entry = node.entry().await?;
            if !entry.is_replica() {
                continue;
            }
            let Some(&primary) = entry.replicates.as_ref().and_then(|p| by_name.get(p)) else {
                warn!(node = %node.addr(), "replica of an unknown primary, left out of placement");
                continue;
            };
            placement.add_replica(entry.name.clone(), node.addr().clone(), primary);
            nodes.push(node.clone());
        }
        for node in new {
            placement.add_free(node.addr().to_string(), node.addr().clone());
            nodes.push(node.clone());
        }
        Ok(Distribution { placement, nodes })
    }

    fn pairs(dist: &Distribution, moves: impl IntoIterator<Item = (usize, usize)>) -> Vec<(Node, String)> {
        moves
            .into_iter()
            .map(|(replica, primary)| {
                (
                    dist.nodes[replica].clone(),
                    dist.placement.node(primary).tag.clone(),
                )
            })
            .collect()
    }

    /// Shows where the solver would put `new` nodes.
    pub async fn preview_replicas(&self, new: &[Node], limit: Option<usize>) -> Result<Preview, ClusterError> {
        let dist = self.distribution(new).await?;
        let mut solver = ReplicaSolver::new(dist.placement.clone(), limit);
        solver.solve()?;
        Ok(Preview {
            before: dist.placement,
            after: solver.placement().clone(),
        })
    }

    /// Attaches `new` nodes where the placement solver puts them.
    pub async fn add_replicas_balanced(
        &mut self,
        new: &[Node],
        limit: Option<usize>,
        fast: bool,
    ) -> Result<Vec<Attached>, ClusterError> {
        let dist = self.distribution(new).await?;
        let mut solver = ReplicaSolver::new(dist.placement.clone(), limit);
        let solution = solver.solve()?;
        if !solution.frees.is_empty() {
            info!(unused = solution.frees.len(), "some free nodes were not needed");
        }
        let pairs = Self::pairs(&dist, solution.matches.iter().map(|m| (m.replica, m.primary)));
        self.add_replicas(pairs, fast).await
    }

    pub async fn preview_master_moves(&self, new: &[Node]) -> Result<Preview, ClusterError> {
        let dist = self.distribution(new).await?;
        let plan = plan_master_moves(&dist.placement);
        let mut after = dist.placement.clone();
        for m in &plan.moves {
            after.attach(m.replica, m.primary);
            after.promote(m.replica);
        }
        Ok(Preview {
            before: dist.placement,
            after,
        })
    }

    /// Moves primaries onto new hosts.
    ///
    /// Free nodes on the new hosts join as replicas of primaries taken from
    /// the most crowded hosts, then take over with `FAILOVER TAKEOVER`.
    /// Takeovers that don't stick are retried for up to five rounds.
    /// Returns the nodes that became primaries.
    pub async fn move_masters(&mut self, new: &[Node], fast: bool) -> Result<Vec<NodeAddr>, ClusterError> {
        const ROUNDS: usize = 5;

        let dist = self.distribution(new).await?;
        let plan = plan_master_moves(&dist.placement);
        if plan.moves.is_empty() {
            info!("no primaries need to move");
            return Ok(Vec::new());
        }
        let pairs = Self::pairs(&dist, plan.moves.iter().map(|m| (m.replica, m.primary)));
        let mut pending: Vec<Node> = pairs.iter().map(|(n, _)| n.clone()).collect();
        self.add_replicas(pairs, fast).await?;
        self.wait().await?;

        let mut promoted = Vec::new();
        for round in 1..=ROUNDS {
            self.stop.check()?;
            for node in &pending {
                if let Err(e) = node.failover(FailoverMode::Takeover).await {
                    warn!(node = %node.addr(), "takeover failed: {e}");
                }
            }
            self.wait().await?;

            let mut still = Vec::new();
            for node in pending {
                node.flush_cache();
                if node.is_primary().await? {
                    info!(node = %node.addr(), "promoted to primary");
                    promoted.push(node.addr().clone());
                } else {
                    still.push(node);
                }
            }
            pending = still;
            if pending.is_empty() {
                break;
            }
            let addrs: Vec<String> = pending.iter().map(|n| n.addr().to_string()).collect();
            warn!(round, "still replicas: {}", addrs.join(", "));
        }
        self.topology.flush_all();
        Ok(promoted)
    }

    pub async fn preview_rearrangement(&self, new: &[Node]) -> Result<Preview, ClusterError> {
        let dist = self.distribution(new).await?;
        let plan = plan_replica_rearrangement(&dist.placement)?;
        let mut after = dist.placement.clone();
        for &r in &plan.delete {
            after.release(r);
        }
        for m in &plan.add {
            after.attach(m.replica, m.primary);
        }
        Ok(Preview {
            before: dist.placement,
            after,
        })
    }

    /// Gives every primary exactly one replica on another host.
    ///
    /// Planned replicas are added before redundant ones are deleted, so the
    /// cluster never has fewer replicas than it started with; `fast`
    /// deletes first and adds with full parallelism.
    pub async fn rearrange_replicas(&mut self, new: &[Node], fast: bool) -> Result<(), ClusterError> {
        let dist = self.distribution(new).await?;
        let plan = plan_replica_rearrangement(&dist.placement)?;
        let pairs = Self::pairs(&dist, plan.add.iter().map(|m| (m.replica, m.primary)));
        let doomed: Vec<Node> = plan.delete.iter().map(|&r| dist.nodes[r].clone()).collect();
        info!(add = pairs.len(), delete = doomed.len(), "rearranging replicas");

        if fast {
            self.delete_all(&doomed).await?;
            self.add_replicas(pairs, true).await?;
        } else {
            self.add_replicas(pairs, false).await?;
            self.delete_all(&doomed).await?;
        }
        Ok(())
    }

    async fn delete_all(&mut self, nodes: &[Node]) -> Result<(), ClusterError> {
        for node in nodes {
            self.stop.check()?;
            self.delete_node(node).await?;
        }
        Ok(())
    }

    /// Points `replica` at the named primary, adding it to the cluster
    /// first if it isn't a member.
    pub async fn replicate(&mut self, replica: &Node, primary: &str) -> Result<(), ClusterError> {
        let target = self.topology.require(primary).await?;
        if self.topology.get_by_addr(replica.addr()).is_none() {
            self.add_replicas(vec![(replica.clone(), primary.to_owned())], false)
                .await?;
            return Ok(());
        }
        replica.replicate_from(primary).await?;
        info!(replica = %replica.addr(), primary = %target.addr(), "replica re-pointed");
        replica.flush_cache();
        target.flush_cache();
        self.wait().await
    }

    /// Empties every primary and hard-resets every member.
    pub async fn destroy(&self) -> Result<(), ClusterError> {
        for node in self.topology.nodes() {
            if node.is_primary().await? {
                node.flush_all().await?;
            }
        }
        for node in self.topology.nodes() {
            node.reset(ResetMode::Hard).await?;
            info!(node = %node.addr(), "node reset");
        }
        self.topology.flush_all();
        Ok(())
    }

    /// Deletes every key on every primary.
    pub async fn flush_all(&self) -> Result<(), ClusterError> {
        for primary in self.topology.primaries().await? {
            primary.flush_all().await?;
            info!(node = %primary.addr(), "flushed");
        }
        Ok(())
    }

    /// Sets a config parameter on every member, optionally persisting it.
    pub async fn reconfigure(&self, name: &str, value: &str, rewrite: bool) -> Result<(), ClusterError> {
        for node in self.topology.nodes() {
            node.config_set(name, value).await?;
            if rewrite {
                node.config_rewrite().await?;
            }
            debug!(node = %node.addr(), name, value, "config set");
        }
        info!(name, value, members = self.topology.len(), "reconfigured");
        Ok(())
    }
}
