//! Cross-node view comparison.
//!
//! Every reachable node reports what it believes about every other node.
//! For each attribute we keep only the addresses on which reporters
//! disagree, then group reporters whose remaining beliefs are identical.
//! Each group becomes one row of the report:
//!
//! ```text
//! role:
//!   [10.0.0.1:7000, 10.0.0.3:7000]  10.0.0.1:7000 => master
//!   [10.0.0.2:7000]                 10.0.0.1:7000 => slave
//! ```
//!
//! A healthy cluster produces no rows and has no unreachable nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::driver::SharedDriver;
use crate::node::Node;
use crate::slots::format_slots;
use crate::topology::{NodeAddr, NodeEntry};

/// One attribute compared across reporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Check {
    /// Whether the address is listed at all.
    NodeList,
    Name,
    Role,
    Connect,
    Slot,
    Replicate,
    FailFlag,
}

impl Check {
    pub const ALL: [Check; 7] = [
        Check::NodeList,
        Check::Name,
        Check::Role,
        Check::Connect,
        Check::Slot,
        Check::Replicate,
        Check::FailFlag,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Check::NodeList => "node_list",
            Check::Name => "name",
            Check::Role => "role",
            Check::Connect => "connect",
            Check::Slot => "slot",
            Check::Replicate => "replicate",
            Check::FailFlag => "fail_flag",
        }
    }

    /// A reporter that doesn't list an address doesn't count as
    /// disagreeing about it.
    fn ignore_missing_when_classify(&self) -> bool {
        !matches!(self, Check::NodeList)
    }

    /// Addresses a group doesn't list are left out of its diff rather than
    /// shown as absent.
    fn ignore_missing_in_result(&self) -> bool {
        matches!(self, Check::NodeList | Check::FailFlag)
    }

    fn value(&self, entry: &NodeEntry) -> String {
        match self {
            Check::NodeList => "listed".to_owned(),
            Check::Name => entry.name.clone(),
            Check::Role if entry.is_primary() => "master".to_owned(),
            Check::Role => "slave".to_owned(),
            Check::Connect => entry.link.as_str().to_owned(),
            Check::Slot => format_slots(&entry.slots),
            Check::Replicate => entry
                .replicates
                .clone()
                .unwrap_or_else(|| "master".to_owned()),
            Check::FailFlag => entry.fail_flag().to_owned(),
        }
    }
}

/// What one group of reporters believes, restricted to contested addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Diff {
    /// Node-list rows carry just the addresses the group lists.
    Listed(Vec<NodeAddr>),
    /// `None` means the group does not list the address.
    Values(BTreeMap<NodeAddr, Option<String>>),
}

impl Diff {
    pub fn len(&self) -> usize {
        match self {
            Diff::Listed(addrs) => addrs.len(),
            Diff::Values(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        match self {
            Diff::Listed(addrs) => addrs.contains(addr),
            Diff::Values(values) => values.contains_key(addr),
        }
    }

    /// The value this group reports for `addr`, if any.
    pub fn value(&self, addr: &NodeAddr) -> Option<&str> {
        match self {
            Diff::Listed(_) => None,
            Diff::Values(values) => values.get(addr).and_then(|v| v.as_deref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffGroup {
    /// Reporters sharing this view.
    pub nodes: Vec<NodeAddr>,
    pub diff: Diff,
}

/// Result of a health check. Empty when the cluster is healthy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    #[serde(flatten)]
    pub checks: BTreeMap<&'static str, Vec<DiffGroup>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub down_nodes: Vec<NodeAddr>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.checks.is_empty() && self.down_nodes.is_empty()
    }

    pub fn check(&self, check: Check) -> Option<&[DiffGroup]> {
        self.checks.get(check.name()).map(Vec::as_slice)
    }
}

/// Views gathered from every node reachable from the seeds.
#[derive(Debug, Clone, Default)]
pub struct HealthCheck {
    views: Vec<(NodeAddr, Arc<[NodeEntry]>)>,
    addrs: BTreeSet<NodeAddr>,
    down: BTreeSet<NodeAddr>,
}

impl HealthCheck {
    /// Queries the seeds, then every address they list, until no new
    /// address turns up.
    ///
    /// Nodes that can't be queried are recorded as down. The driver is used
    /// as given; pass one without retries to keep a check on a broken
    /// cluster fast.
    pub async fn discover(driver: SharedDriver, seeds: &[NodeAddr]) -> Self {
        let mut check = HealthCheck::default();
        let mut pending: Vec<NodeAddr> = seeds.to_vec();
        check.addrs.extend(seeds.iter().cloned());

        while !pending.is_empty() {
            let mut found = Vec::new();
            for addr in pending.drain(..) {
                let node = Node::new(addr.clone(), driver.clone());
                match node.fetch_view().await {
                    Ok(view) => {
                        for entry in view.iter().filter(|e| !e.flags.noaddr) {
                            if check.addrs.insert(entry.addr.clone()) {
                                found.push(entry.addr.clone());
                            }
                        }
                        check.views.push((addr, view));
                    }
                    Err(e) => {
                        warn!(node = %addr, "unreachable: {e}");
                        check.down.insert(addr);
                    }
                }
            }
            debug!(new = found.len(), known = check.addrs.len(), "discovery round");
            pending = found;
        }
        check
    }

    /// Builds a check from views already in hand.
    pub fn from_views(views: Vec<(NodeAddr, Arc<[NodeEntry]>)>) -> Self {
        let mut addrs = BTreeSet::new();
        for (reporter, view) in &views {
            addrs.insert(reporter.clone());
            addrs.extend(view.iter().filter(|e| !e.flags.noaddr).map(|e| e.addr.clone()));
        }
        Self {
            views,
            addrs,
            down: BTreeSet::new(),
        }
    }

    /// Every address seen, reachable or not.
    pub fn addrs(&self) -> &BTreeSet<NodeAddr> {
        &self.addrs
    }

    pub fn report(&self) -> HealthReport {
        let checks = Check::ALL
            .iter()
            .filter_map(|check| self.diff(*check).map(|groups| (check.name(), groups)))
            .collect();
        HealthReport {
            checks,
            down_nodes: self.down.iter().cloned().collect(),
        }
    }

    /// Groups reporters by what they believe about contested addresses.
    /// `None` when every group's diff is empty.
    pub fn diff(&self, check: Check) -> Option<Vec<DiffGroup>> {
        let mut beliefs: Vec<BTreeMap<&NodeAddr, String>> = self
            .views
            .iter()
            .map(|(_, view)| {
                view.iter()
                    .filter(|e| !e.flags.noaddr)
                    .map(|e| (&e.addr, check.value(e)))
                    .collect()
            })
            .collect();

        for addr in &self.addrs {
            let mut seen = BTreeSet::new();
            for belief in &beliefs {
                match belief.get(addr) {
                    None if check.ignore_missing_when_classify() => {}
                    value => {
                        seen.insert(value.cloned());
                    }
                }
            }
            if seen.len() <= 1 {
                for belief in &mut beliefs {
                    belief.remove(addr);
                }
            }
        }

        let contested: BTreeSet<&NodeAddr> = beliefs.iter().flat_map(|b| b.keys().copied()).collect();

        let mut groups: Vec<(BTreeMap<&NodeAddr, String>, Vec<NodeAddr>)> = Vec::new();
        for ((reporter, _), belief) in self.views.iter().zip(beliefs) {
            match groups.iter_mut().find(|(b, _)| *b == belief) {
                Some((_, members)) => members.push(reporter.clone()),
                None => groups.push((belief, vec![reporter.clone()])),
            }
        }

        let rows: Vec<DiffGroup> = groups
            .into_iter()
            .map(|(belief, nodes)| {
                let diff = if check == Check::NodeList {
                    Diff::Listed(
                        contested
                            .iter()
                            .filter(|addr| belief.contains_key(*addr))
                            .map(|addr| (*addr).clone())
                            .collect(),
                    )
                } else {
                    Diff::Values(
                        contested
                            .iter()
                            .filter_map(|addr| match belief.get(*addr) {
                                None if check.ignore_missing_in_result() => None,
                                value => Some(((*addr).clone(), value.cloned())),
                            })
                            .collect(),
                    )
                };
                DiffGroup { nodes, diff }
            })
            .collect();

        if rows.iter().all(|row| row.diff.is_empty()) {
            None
        } else {
            Some(rows)
        }
    }
}
