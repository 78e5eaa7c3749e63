//! Replica placement across hosts.
//!
//! Nodes are grouped by host into an arena ([`Placement`]); relationships
//! between primaries and replicas are index lists into that arena. The
//! planners here are pure: they read a placement, decide which free node
//! goes where, and leave execution to the orchestrator.
//!
//! Both replica planners reduce to max-flow on the same bipartite graph:
//!
//! ```text
//!            supply (spare hosts)     demand (primary hosts)
//!   s ──┬──▶  host 0  ──┬───────────▶  host 0' ──┬──▶ t
//!       ├──▶  host 1  ──┼─(i != j)──▶  host 1' ──┤
//!       └──▶  host 2  ──┴───────────▶  host 2' ──┘
//! ```
//!
//! Same-host edges are never added, so no flow can ever place a replica on
//! its primary's host.

use std::collections::{HashSet, VecDeque};

use crate::error::PlacementError;
use crate::topology::NodeAddr;

// ---------------------------------------------------------------------------
// arena
// ---------------------------------------------------------------------------

/// One node in a placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementNode {
    /// Node name for members, address for free nodes.
    pub tag: String,
    pub addr: NodeAddr,
    /// Index into [`Placement::hosts`].
    pub host: usize,
    /// Arena index of the primary, for replicas.
    pub primary: Option<usize>,
    /// Arena indices of this node's replicas, for primaries.
    pub replicas: Vec<usize>,
}

/// Nodes of a cluster and its candidate nodes, grouped by host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    hosts: Vec<String>,
    nodes: Vec<PlacementNode>,
    primaries: Vec<Vec<usize>>,
    replicas: Vec<Vec<usize>>,
    frees: Vec<Vec<usize>>,
}

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    fn host_index(&mut self, host: &str) -> usize {
        if let Some(i) = self.hosts.iter().position(|h| h == host) {
            return i;
        }
        self.hosts.push(host.to_owned());
        self.primaries.push(Vec::new());
        self.replicas.push(Vec::new());
        self.frees.push(Vec::new());
        self.hosts.len() - 1
    }

    fn insert(&mut self, tag: impl Into<String>, addr: NodeAddr, primary: Option<usize>) -> usize {
        let host = self.host_index(&addr.host);
        self.nodes.push(PlacementNode {
            tag: tag.into(),
            addr,
            host,
            primary,
            replicas: Vec::new(),
        });
        self.nodes.len() - 1
    }

    /// Registers a host with no nodes yet, so it appears in renders.
    pub fn add_host(&mut self, host: &str) -> usize {
        self.host_index(host)
    }

    pub fn add_primary(&mut self, tag: impl Into<String>, addr: NodeAddr) -> usize {
        let id = self.insert(tag, addr, None);
        self.primaries[self.nodes[id].host].push(id);
        id
    }

    /// Adds a replica of `primary`, which must already be in the arena.
    pub fn add_replica(&mut self, tag: impl Into<String>, addr: NodeAddr, primary: usize) -> usize {
        let id = self.insert(tag, addr, Some(primary));
        self.replicas[self.nodes[id].host].push(id);
        self.nodes[primary].replicas.push(id);
        id
    }

    pub fn add_free(&mut self, tag: impl Into<String>, addr: NodeAddr) -> usize {
        let id = self.insert(tag, addr, None);
        self.frees[self.nodes[id].host].push(id);
        id
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn node(&self, id: usize) -> &PlacementNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[PlacementNode] {
        &self.nodes
    }

    /// Primaries per host.
    pub fn primaries(&self) -> &[Vec<usize>] {
        &self.primaries
    }

    /// Replicas per host.
    pub fn replicas(&self) -> &[Vec<usize>] {
        &self.replicas
    }

    /// Free nodes per host.
    pub fn frees(&self) -> &[Vec<usize>] {
        &self.frees
    }

    pub fn primary_count(&self) -> usize {
        self.primaries.iter().map(Vec::len).sum()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.iter().map(Vec::len).sum()
    }

    /// Turns a free node into a replica of `primary`.
    pub fn attach(&mut self, free: usize, primary: usize) {
        let host = self.nodes[free].host;
        self.frees[host].retain(|&f| f != free);
        self.replicas[host].push(free);
        self.nodes[free].primary = Some(primary);
        self.nodes[primary].replicas.push(free);
    }

    /// Detaches a replica from its primary and returns it to the free pool.
    pub fn release(&mut self, replica: usize) {
        let host = self.nodes[replica].host;
        if let Some(primary) = self.nodes[replica].primary.take() {
            self.nodes[primary].replicas.retain(|&r| r != replica);
        }
        self.replicas[host].retain(|&r| r != replica);
        self.frees[host].push(replica);
    }

    /// Swaps roles after a takeover: `replica` becomes a primary and the
    /// old primary, with its other replicas, follows it.
    pub fn promote(&mut self, replica: usize) {
        let Some(old) = self.nodes[replica].primary else {
            return;
        };
        let (new_host, old_host) = (self.nodes[replica].host, self.nodes[old].host);

        self.replicas[new_host].retain(|&r| r != replica);
        self.primaries[new_host].push(replica);
        self.primaries[old_host].retain(|&p| p != old);
        self.replicas[old_host].push(old);

        let followers: Vec<usize> = std::mem::take(&mut self.nodes[old].replicas)
            .into_iter()
            .filter(|&r| r != replica)
            .collect();
        for &r in &followers {
            self.nodes[r].primary = Some(replica);
        }
        self.nodes[replica].primary = None;
        self.nodes[replica].replicas = followers;
        self.nodes[replica].replicas.push(old);
        self.nodes[old].primary = Some(replica);
    }

    /// One column of labels per host: primaries as `m<port>`, replicas as
    /// `s<port>->(<primary host>):<primary port>`, frees as `f<port>`.
    pub fn columns(&self) -> Vec<Vec<String>> {
        (0..self.hosts.len())
            .map(|h| {
                let primaries = self.primaries[h]
                    .iter()
                    .map(|&id| format!("m{}", self.nodes[id].addr.port));
                let replicas = self.replicas[h].iter().map(|&id| {
                    let node = &self.nodes[id];
                    match node.primary.map(|p| &self.nodes[p]) {
                        Some(p) => format!("s{}->({}):{}", node.addr.port, p.host, p.addr.port),
                        None => format!("s{}", node.addr.port),
                    }
                });
                let frees = self.frees[h]
                    .iter()
                    .map(|&id| format!("f{}", self.nodes[id].addr.port));
                primaries.chain(replicas).chain(frees).collect()
            })
            .collect()
    }

    /// Plain-text column view, hosts side by side.
    pub fn render(&self) -> String {
        let columns = self.columns();
        let height = columns.iter().map(Vec::len).max().unwrap_or(0);
        let mut out = String::new();
        for (i, host) in self.hosts.iter().enumerate() {
            out.push_str(&format!("{:<20}", format!("{host}({i})")));
        }
        out.push('\n');
        for row in 0..height {
            for column in &columns {
                out.push_str(&format!("{:<20}", column.get(row).map_or("", String::as_str)));
            }
            out.push('\n');
        }
        out
    }
}

// ---------------------------------------------------------------------------
// max-flow
// ---------------------------------------------------------------------------

/// Dense flow network solved with Edmonds-Karp. The graphs here have
/// `2 * hosts + 2` vertices, so an adjacency matrix is plenty.
#[derive(Debug, Clone)]
struct FlowNetwork {
    capacity: Vec<Vec<usize>>,
    residual: Vec<Vec<usize>>,
}

impl FlowNetwork {
    fn new(vertices: usize) -> Self {
        let matrix = vec![vec![0; vertices]; vertices];
        Self {
            capacity: matrix.clone(),
            residual: matrix,
        }
    }

    fn set_capacity(&mut self, u: usize, v: usize, c: usize) {
        self.capacity[u][v] = c;
        self.residual[u][v] = c;
    }

    fn max_flow(&mut self, s: usize, t: usize) -> usize {
        let n = self.capacity.len();
        let mut total = 0;
        loop {
            let mut parent = vec![usize::MAX; n];
            parent[s] = s;
            let mut queue = VecDeque::from([s]);
            while let Some(u) = queue.pop_front() {
                if u == t {
                    break;
                }
                for v in 0..n {
                    if parent[v] == usize::MAX && self.residual[u][v] > 0 {
                        parent[v] = u;
                        queue.push_back(v);
                    }
                }
            }
            if parent[t] == usize::MAX {
                return total;
            }

            let mut bottleneck = usize::MAX;
            let mut v = t;
            while v != s {
                let u = parent[v];
                bottleneck = bottleneck.min(self.residual[u][v]);
                v = u;
            }
            let mut v = t;
            while v != s {
                let u = parent[v];
                self.residual[u][v] -= bottleneck;
                self.residual[v][u] += bottleneck;
                v = u;
            }
            total += bottleneck;
        }
    }

    /// Flow on a forward edge. No edge pair here is antiparallel.
    fn flow(&self, u: usize, v: usize) -> usize {
        self.capacity[u][v].saturating_sub(self.residual[u][v])
    }

    fn conserved(&self, s: usize, t: usize) -> bool {
        let n = self.capacity.len();
        (0..n).filter(|&v| v != s && v != t).all(|v| {
            let inflow: usize = (0..n).map(|u| self.flow(u, v)).sum();
            let outflow: usize = (0..n).map(|w| self.flow(v, w)).sum();
            inflow == outflow
        })
    }
}

/// The supply-host to demand-host graph shared by both replica planners.
struct HostGraph {
    hosts: usize,
    net: FlowNetwork,
}

impl HostGraph {
    fn new(hosts: usize) -> Self {
        Self {
            hosts,
            net: FlowNetwork::new(2 * hosts + 2),
        }
    }

    fn source(&self) -> usize {
        2 * self.hosts
    }

    fn sink(&self) -> usize {
        2 * self.hosts + 1
    }

    fn supply(&mut self, host: usize, c: usize) {
        let s = self.source();
        self.net.set_capacity(s, host, c);
    }

    fn demand(&mut self, host: usize, c: usize) {
        let t = self.sink();
        self.net.set_capacity(self.hosts + host, t, c);
    }

    /// Cross-host edge; same-host edges are refused.
    fn edge(&mut self, from: usize, to: usize, c: usize) {
        if from != to {
            self.net.set_capacity(from, self.hosts + to, c);
        }
    }

    fn solve(&mut self) -> Result<usize, PlacementError> {
        let (s, t) = (self.source(), self.sink());
        let value = self.net.max_flow(s, t);
        if !self.net.conserved(s, t) {
            return Err(PlacementError::Defective("flow is not conserved".into()));
        }
        Ok(value)
    }

    /// `(from, to, flow)` for every cross-host edge, in host order.
    fn edges(&self) -> Vec<(usize, usize, usize)> {
        let mut edges = Vec::new();
        for i in 0..self.hosts {
            for j in (0..self.hosts).filter(|&j| j != i) {
                edges.push((i, j, self.net.flow(i, self.hosts + j)));
            }
        }
        edges
    }

    fn inflow(&self, to: usize) -> usize {
        (0..self.hosts)
            .map(|i| self.net.flow(i, self.hosts + to))
            .sum()
    }
}

// ---------------------------------------------------------------------------
// replica solver
// ---------------------------------------------------------------------------

/// A free node assigned to a primary, as arena indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaMatch {
    pub replica: usize,
    pub primary: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSolution {
    pub matches: Vec<ReplicaMatch>,
    /// Free nodes left unassigned.
    pub frees: Vec<usize>,
}

/// Assigns free nodes as replicas in two max-flow passes.
///
/// The first pass covers every primary without a replica and fails with the
/// per-host shortfall if it can't. The second spreads what is left, at most
/// `limit` replicas per primary when a limit is set. The result is computed
/// once and reused.
pub struct ReplicaSolver {
    placement: Placement,
    limit: Option<usize>,
    /// Primaries replicated by a node on each host, to avoid giving one
    /// primary two replicas from the same host.
    served: Vec<HashSet<usize>>,
    frees: Vec<VecDeque<usize>>,
    result: Option<ReplicaSolution>,
}

impl ReplicaSolver {
    pub fn new(placement: Placement, limit: Option<usize>) -> Self {
        let served = placement
            .replicas
            .iter()
            .map(|on_host| {
                on_host
                    .iter()
                    .filter_map(|&r| placement.nodes[r].primary)
                    .collect()
            })
            .collect();
        let frees = placement
            .frees
            .iter()
            .map(|f| f.iter().copied().collect())
            .collect();
        Self {
            placement,
            limit,
            served,
            frees,
            result: None,
        }
    }

    /// The placement, including any assignments made by [`solve`](Self::solve).
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn solve(&mut self) -> Result<&ReplicaSolution, PlacementError> {
        if self.result.is_none() {
            let mut matches = self.fill_orphans()?;
            matches.extend(self.fill_remaining()?);
            let frees = self.frees.iter().flatten().copied().collect();
            self.result = Some(ReplicaSolution { matches, frees });
        }
        match &self.result {
            Some(result) => Ok(result),
            None => Err(PlacementError::Defective("solution missing".into())),
        }
    }

    fn assign(&mut self, from: usize, primary: usize) -> Result<ReplicaMatch, PlacementError> {
        let free = self.frees[from]
            .pop_front()
            .ok_or_else(|| PlacementError::Defective(format!("host {from} ran out of free nodes")))?;
        self.placement.attach(free, primary);
        self.served[from].insert(primary);
        Ok(ReplicaMatch {
            replica: free,
            primary,
        })
    }

    fn fill_orphans(&mut self) -> Result<Vec<ReplicaMatch>, PlacementError> {
        let hosts = self.placement.hosts.len();
        let mut orphans: Vec<Vec<usize>> = self
            .placement
            .primaries
            .iter()
            .map(|on_host| {
                on_host
                    .iter()
                    .copied()
                    .filter(|&p| self.placement.nodes[p].replicas.is_empty())
                    .collect()
            })
            .collect();
        let orphan_count: usize = orphans.iter().map(Vec::len).sum();
        if orphan_count == 0 {
            return Ok(Vec::new());
        }

        let mut graph = HostGraph::new(hosts);
        for i in 0..hosts {
            graph.supply(i, self.frees[i].len());
            graph.demand(i, orphans[i].len());
            for j in 0..hosts {
                graph.edge(i, j, self.frees[i].len());
            }
        }

        if graph.solve()? < orphan_count {
            let missing = (0..hosts)
                .filter_map(|j| {
                    let short = orphans[j].len().saturating_sub(graph.inflow(j));
                    (short > 0).then(|| (self.placement.hosts[j].clone(), short))
                })
                .collect();
            return Err(PlacementError::MissingReplicas(missing));
        }

        let mut matches = Vec::with_capacity(orphan_count);
        for (i, j, flow) in graph.edges() {
            for _ in 0..flow {
                let orphan = orphans[j]
                    .pop()
                    .ok_or_else(|| PlacementError::Defective(format!("host {j} over-served")))?;
                matches.push(self.assign(i, orphan)?);
            }
        }
        Ok(matches)
    }

    fn fill_remaining(&mut self) -> Result<Vec<ReplicaMatch>, PlacementError> {
        let hosts = self.placement.hosts.len();
        let total_frees: usize = self.frees.iter().map(VecDeque::len).sum();
        if total_frees == 0 {
            return Ok(Vec::new());
        }

        let mut graph = HostGraph::new(hosts);
        for i in 0..hosts {
            graph.supply(i, self.frees[i].len());
            let demand = match self.limit {
                None => total_frees,
                Some(limit) => self.placement.primaries[i]
                    .iter()
                    .map(|&p| limit.saturating_sub(self.placement.nodes[p].replicas.len()))
                    .sum(),
            };
            graph.demand(i, demand);
        }
        for i in 0..hosts {
            for j in 0..hosts {
                let already = self
                    .served[i]
                    .iter()
                    .filter(|&&p| self.placement.nodes[p].host == j)
                    .count();
                let room = self.placement.primaries[j].len().saturating_sub(already);
                graph.edge(i, j, self.frees[i].len().min(room));
            }
        }
        graph.solve()?;

        let mut by_load = self.placement.primaries.clone();
        for on_host in &mut by_load {
            on_host.sort_by_key(|&p| self.placement.nodes[p].replicas.len());
        }

        let mut matches = Vec::new();
        for (i, j, flow) in graph.edges() {
            for _ in 0..flow {
                let primary = by_load[j]
                    .iter()
                    .copied()
                    .find(|p| !self.served[i].contains(p))
                    .ok_or_else(|| {
                        PlacementError::Defective(format!(
                            "no primary on {} left for a replica from {}",
                            self.placement.hosts[j], self.placement.hosts[i]
                        ))
                    })?;
                matches.push(self.assign(i, primary)?);
                let nodes = &self.placement.nodes;
                by_load[j].sort_by_key(|&p| nodes[p].replicas.len());
            }
        }
        Ok(matches)
    }
}

// ---------------------------------------------------------------------------
// grow by host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterMovePlan {
    /// Free nodes to attach as temporary replicas and then promote.
    pub moves: Vec<ReplicaMatch>,
    pub frees: Vec<usize>,
}

/// Plans which primaries move onto hosts that only have free nodes.
///
/// Enough primaries move that every host ends up with its share. Free nodes
/// are taken round-robin across hosts, and each move takes the last primary
/// of the currently most crowded host.
pub fn plan_master_moves(placement: &Placement) -> MasterMovePlan {
    let hosts = placement.hosts.len();
    if hosts == 0 {
        return MasterMovePlan::default();
    }
    let total = placement.primary_count();
    let new_hosts = placement.frees.iter().filter(|f| !f.is_empty()).count();
    let stay = total / hosts * (hosts - new_hosts) + total % hosts;
    let mut to_move = total.saturating_sub(stay);

    let mut frees: VecDeque<usize> = interleave(&placement.frees).into();
    let mut primaries = placement.primaries.clone();
    let mut moves = Vec::new();
    while to_move > 0 {
        let Some(free) = frees.pop_front() else {
            break;
        };
        let Some(primary) = pop_from_most_crowded(&mut primaries) else {
            frees.push_front(free);
            break;
        };
        moves.push(ReplicaMatch {
            replica: free,
            primary,
        });
        to_move -= 1;
    }

    MasterMovePlan {
        moves,
        frees: frees.into(),
    }
}

/// `[[a, b], [c], [d, e, f]]` becomes `[a, c, d, b, e, f]`.
fn interleave(groups: &[Vec<usize>]) -> Vec<usize> {
    let depth = groups.iter().map(Vec::len).max().unwrap_or(0);
    (0..depth)
        .flat_map(|row| groups.iter().filter_map(move |g| g.get(row).copied()))
        .collect()
}

fn pop_from_most_crowded(primaries: &mut [Vec<usize>]) -> Option<usize> {
    let most = primaries.iter().map(Vec::len).max()?;
    primaries.iter_mut().find(|p| p.len() == most)?.pop()
}

// ---------------------------------------------------------------------------
// one replica per primary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RearrangePlan {
    pub add: Vec<ReplicaMatch>,
    /// Replicas to remove from the cluster.
    pub delete: Vec<usize>,
    pub frees: Vec<usize>,
}

/// Plans a layout where every primary has exactly one replica.
///
/// Replicas sharing a host with their primary, and every replica after a
/// primary's first, are deleted up front. The flow then decides how many
/// replicas each host should hold for each other host's primaries; existing
/// replicas beyond that are deleted too, and free nodes are attached to the
/// primaries left without one.
pub fn plan_replica_rearrangement(placement: &Placement) -> Result<RearrangePlan, PlacementError> {
    let hosts = placement.hosts.len();
    let total = placement.primary_count();
    if hosts == 0 {
        return Ok(RearrangePlan::default());
    }
    let per_host = total.div_ceil(hosts);
    let limit = 1 + per_host / hosts;

    let mut graph = HostGraph::new(hosts);
    for i in 0..hosts {
        graph.supply(i, placement.frees[i].len());
        graph.demand(i, placement.primaries[i].len());
        for j in 0..hosts {
            let c = placement.frees[i]
                .len()
                .min(limit)
                .min(placement.primaries[j].len());
            graph.edge(i, j, c);
        }
    }
    if graph.solve()? < total {
        let missing = (0..hosts)
            .filter_map(|j| {
                let short = placement.primaries[j].len().saturating_sub(graph.inflow(j));
                (short > 0).then(|| (placement.hosts[j].clone(), short))
            })
            .collect();
        return Err(PlacementError::MissingReplicas(missing));
    }

    let mut working = placement.clone();
    let mut delete = Vec::new();
    for &primary in placement.primaries.iter().flatten() {
        let home = placement.nodes[primary].host;
        let mut kept = false;
        for &r in &placement.nodes[primary].replicas {
            if !kept && placement.nodes[r].host != home {
                kept = true;
            } else {
                delete.push(r);
            }
        }
    }
    for &r in &delete {
        working.release(r);
    }

    // current[i][j]: replicas on host i of primaries on host j
    let mut current = vec![vec![0usize; hosts]; hosts];
    for (i, on_host) in working.replicas.iter().enumerate() {
        for &r in on_host {
            if let Some(p) = working.nodes[r].primary {
                current[i][working.nodes[p].host] += 1;
            }
        }
    }

    let edges = graph.edges();
    for &(i, j, flow) in &edges {
        let excess = current[i][j].saturating_sub(flow);
        let doomed: Vec<usize> = working.replicas[i]
            .iter()
            .copied()
            .filter(|&r| {
                working.nodes[r]
                    .primary
                    .is_some_and(|p| working.nodes[p].host == j)
            })
            .take(excess)
            .collect();
        for &r in &doomed {
            working.release(r);
        }
        current[i][j] -= doomed.len();
        delete.extend(doomed);
    }

    let mut frees: Vec<VecDeque<usize>> = placement
        .frees
        .iter()
        .map(|f| f.iter().copied().collect())
        .collect();
    let mut by_load: Vec<VecDeque<usize>> = working
        .primaries
        .iter()
        .map(|on_host| {
            let mut sorted = on_host.clone();
            sorted.sort_by_key(|&p| working.nodes[p].replicas.len());
            VecDeque::from(sorted)
        })
        .collect();

    let mut add = Vec::new();
    for &(i, j, flow) in &edges {
        for _ in 0..flow.saturating_sub(current[i][j]) {
            let Some(primary) = by_load[j].pop_front() else {
                break;
            };
            if !working.nodes[primary].replicas.is_empty() {
                break;
            }
            let free = frees[i]
                .pop_front()
                .ok_or_else(|| PlacementError::Defective(format!("host {i} ran out of free nodes")))?;
            working.attach(free, primary);
            add.push(ReplicaMatch {
                replica: free,
                primary,
            });
        }
    }

    let replicas = placement.replica_count() - delete.len() + add.len();
    if replicas != total {
        return Err(PlacementError::Defective(format!(
            "{replicas} replicas planned for {total} primaries"
        )));
    }

    Ok(RearrangePlan {
        add,
        delete,
        frees: frees.into_iter().flatten().collect(),
    })
}
