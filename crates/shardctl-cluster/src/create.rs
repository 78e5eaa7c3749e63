//! Building a new cluster from empty instances.
//!
//! [`plan_create`] decides roles and slot ranges without touching the
//! network; [`create`] checks the instances and then carries the plan out
//! as a [`Task`] sequence:
//!
//! ```text
//! addslots     one ADDSLOTS per primary, in parallel
//! config-epoch SET-CONFIG-EPOCH 1..n, failures ignored
//! meet         every instance meets the first one
//! wait         until all primaries agree and every slot is covered
//! replicate    replicas attach to their primaries
//! wait
//! ```
//!
//! If any step fails, every instance is hard-reset so the create can be
//! retried on the same instances.

use std::collections::VecDeque;
use std::fmt;

use tracing::{info, warn};

use crate::driver::{ResetMode, SharedDriver};
use crate::error::ClusterError;
use crate::node::Node;
use crate::orchestrator::{Cluster, ClusterConfig, StopSignal};
use crate::slots::{divide, SlotRange, SLOT_COUNT};
use crate::task::{Task, TaskReport};
use crate::topology::{NodeAddr, Topology};

/// Fewest primaries a cluster may be created with.
pub const MIN_PRIMARIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPrimary {
    pub addr: NodeAddr,
    pub slots: SlotRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedReplica {
    pub addr: NodeAddr,
    /// Index into [`CreatePlan::primaries`].
    pub primary: usize,
}

/// Roles and slot ranges for a new cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatePlan {
    pub primaries: Vec<PlannedPrimary>,
    pub replicas: Vec<PlannedReplica>,
    /// Instances left out because no replicas were requested.
    pub unused: Vec<NodeAddr>,
}

impl CreatePlan {
    /// Every instance that will be a member, primaries first.
    pub fn members(&self) -> impl Iterator<Item = &NodeAddr> {
        self.primaries
            .iter()
            .map(|p| &p.addr)
            .chain(self.replicas.iter().map(|r| &r.addr))
    }
}

impl fmt::Display for CreatePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for primary in &self.primaries {
            writeln!(f, "M {}", primary.addr)?;
            writeln!(f, "   slots: {}", primary.slots)?;
        }
        for replica in &self.replicas {
            writeln!(f, "S {}", replica.addr)?;
            writeln!(f, "   replicates: {}", self.primaries[replica.primary].addr)?;
        }
        Ok(())
    }
}

/// Takes instances round-robin across hosts, in first-seen host order.
fn spread(instances: &[NodeAddr]) -> Vec<NodeAddr> {
    let mut hosts: Vec<(&str, VecDeque<&NodeAddr>)> = Vec::new();
    for addr in instances {
        match hosts.iter_mut().find(|(h, _)| *h == addr.host) {
            Some((_, queue)) => queue.push_back(addr),
            None => hosts.push((&addr.host, VecDeque::from([addr]))),
        }
    }

    let mut out = Vec::with_capacity(instances.len());
    while out.len() < instances.len() {
        for (_, queue) in hosts.iter_mut() {
            if let Some(addr) = queue.pop_front() {
                out.push(addr.clone());
            }
        }
    }
    out
}

/// Plans a cluster over `instances`.
///
/// Without an explicit count there are `instances / (replicas + 1)`
/// primaries. Primaries are spread across hosts and take contiguous slot
/// ranges. With `replicas > 0` every other instance becomes a replica,
/// handed out round-robin over the primaries and preferring a host other
/// than its primary's.
pub fn plan_create(
    instances: &[NodeAddr],
    replicas: usize,
    primaries: Option<usize>,
) -> Result<CreatePlan, ClusterError> {
    let count = primaries.unwrap_or(instances.len() / (replicas + 1));
    if count < MIN_PRIMARIES {
        return Err(ClusterError::precondition(format!(
            "a cluster needs at least {MIN_PRIMARIES} primaries, got {count}"
        )));
    }
    if count > instances.len() || count > SLOT_COUNT as usize {
        return Err(ClusterError::precondition(format!(
            "{count} primaries requested from {} instances",
            instances.len()
        )));
    }
    for (i, addr) in instances.iter().enumerate() {
        if instances[..i].contains(addr) {
            return Err(ClusterError::precondition(format!("{addr} listed twice")));
        }
    }

    let mut order = spread(instances).into_iter();
    let mut plan = CreatePlan::default();
    let mut start = 0usize;
    for size in divide(SLOT_COUNT as usize, count) {
        let Some(addr) = order.next() else { break };
        let end = start + size - 1;
        // bounded by SLOT_COUNT, which fits u16
        let slots = SlotRange::new(start as u16, end as u16)?;
        plan.primaries.push(PlannedPrimary { addr, slots });
        start = end + 1;
    }

    let mut rest: Vec<NodeAddr> = order.collect();
    if replicas == 0 {
        plan.unused = rest;
        return Ok(plan);
    }

    let mut next = 0;
    while !rest.is_empty() {
        let primary = next % plan.primaries.len();
        let host = &plan.primaries[primary].addr.host;
        let pick = rest.iter().position(|a| &a.host != host).unwrap_or(0);
        let addr = rest.remove(pick);
        plan.replicas.push(PlannedReplica { addr, primary });
        next += 1;
    }
    separate_cohosted(&mut plan);
    Ok(plan)
}

/// Swaps replicas between primaries so that a replica sharing its
/// primary's host moves elsewhere, where a swap keeps both pairs apart.
fn separate_cohosted(plan: &mut CreatePlan) {
    let host_of = |plan: &CreatePlan, r: usize| plan.primaries[plan.replicas[r].primary].addr.host.clone();
    for i in 0..plan.replicas.len() {
        let home = host_of(plan, i);
        if plan.replicas[i].addr.host != home {
            continue;
        }
        let swap = (0..plan.replicas.len()).find(|&j| {
            let other = host_of(plan, j);
            j != i && plan.replicas[j].addr.host != home && plan.replicas[i].addr.host != other
        });
        if let Some(j) = swap {
            let addr = plan.replicas[i].addr.clone();
            plan.replicas[i].addr = std::mem::replace(&mut plan.replicas[j].addr, addr);
        }
    }
}

fn reset_all(nodes: &[Node]) -> Task {
    let tasks = nodes
        .iter()
        .map(|node| {
            let node = node.clone();
            Task::new(format!("reset({})", node.addr()), move || async move {
                node.reset(ResetMode::Hard).await.map(|_| "ok")
            })
        })
        .collect();
    Task::parallel("reset", tasks)
}

/// Creates the planned cluster.
///
/// Instances are checked first; a failed check returns an error and nothing
/// is changed. After that, the outcome of every step is in the report.
pub async fn create(
    driver: SharedDriver,
    plan: &CreatePlan,
    config: ClusterConfig,
    stop: StopSignal,
) -> Result<TaskReport, ClusterError> {
    let primaries: Vec<Node> = plan
        .primaries
        .iter()
        .map(|p| Node::new(p.addr.clone(), driver.clone()))
        .collect();
    let replicas: Vec<Node> = plan
        .replicas
        .iter()
        .map(|r| Node::new(r.addr.clone(), driver.clone()))
        .collect();
    let members: Vec<Node> = primaries.iter().chain(&replicas).cloned().collect();

    Cluster::check_new_nodes(&members, &[]).await?;
    let mut primary_names = Vec::with_capacity(primaries.len());
    for primary in &primaries {
        primary_names.push(primary.name().await?);
    }
    let Some(first) = members.first().cloned() else {
        return Err(ClusterError::precondition("no instances to create a cluster from"));
    };
    info!(
        primaries = primaries.len(),
        replicas = replicas.len(),
        "creating cluster"
    );

    let addslots = plan
        .primaries
        .iter()
        .zip(&primaries)
        .map(|(planned, node)| {
            let node = node.clone();
            let slots: Vec<u16> = planned.slots.iter().collect();
            Task::new(format!("addslots({})", planned.slots), move || async move {
                node.add_slots(&slots).await.map(|_| slots.len())
            })
        })
        .collect();

    let epochs = members
        .iter()
        .zip(1u64..)
        .map(|(node, epoch)| {
            let node = node.clone();
            Task::new(format!("epoch({})", node.addr()), move || async move {
                match node.set_config_epoch(epoch).await {
                    Ok(()) => Ok::<_, ClusterError>(epoch.to_string()),
                    Err(e) => {
                        warn!(node = %node.addr(), "config epoch not set: {e}");
                        Ok("ignored".to_owned())
                    }
                }
            })
        })
        .collect();

    let meets = members
        .iter()
        .skip(1)
        .map(|node| {
            let node = node.clone();
            let first = first.clone();
            Task::new(format!("meet({})", node.addr()), move || async move {
                node.meet(&first).await.map(|_| first.addr().to_string())
            })
        })
        .collect();

    let cluster = Cluster::new(Topology::new(members.clone()), config, stop);
    let wait = |name: &str| {
        let cluster = cluster.clone();
        Task::new(name, move || async move {
            cluster.topology().flush_all();
            cluster.wait().await.map(|_| "consistent")
        })
    };

    let replicate = plan
        .replicas
        .iter()
        .zip(&replicas)
        .map(|(planned, node)| {
            let node = node.clone();
            let primary = primary_names[planned.primary].clone();
            let target = plan.primaries[planned.primary].addr.clone();
            Task::new(format!("replicate({})", node.addr()), move || async move {
                node.replicate_from(&primary).await.map(|_| target)
            })
        })
        .collect();

    let job = Task::sequence(
        format!("create({} primaries)", primaries.len()),
        vec![
            Task::parallel("addslots", addslots),
            Task::sequence("config-epoch", epochs),
            Task::parallel("meet", meets),
            wait("wait"),
            Task::parallel("replicate", replicate),
            wait("wait-replicas"),
        ],
    )
    .with_guard(reset_all(&members));

    let report = job.run().await;
    if report.is_ok() {
        info!("cluster created");
    } else if let Some(failed) = report.first_failure() {
        warn!(step = %failed.name, "create failed, instances were reset");
    }
    Ok(report)
}
