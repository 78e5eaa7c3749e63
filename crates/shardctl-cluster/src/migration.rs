//! Slot migration between two primaries.
//!
//! Moving a slot follows the standard handoff:
//!
//! 1. Destination marks the slot IMPORTING from the source
//! 2. Source marks the slot MIGRATING to the destination
//! 3. Keys are drained from the source in batches, one `MIGRATE` per key
//! 4. Every primary is told the destination now owns the slot
//!
//! ```text
//! CLUSTER SETSLOT 100 IMPORTING <source-name>     (on destination)
//! CLUSTER SETSLOT 100 MIGRATING <destination-name> (on source)
//! CLUSTER GETKEYSINSLOT 100 10                     (on source, repeated)
//! MIGRATE <dst-host> <dst-port> <key> 0 15000      (per key)
//! CLUSTER SETSLOT 100 NODE <destination-name>      (on every primary)
//! ```
//!
//! No migration log is kept. The markers on the two nodes are the durable
//! state, and [`SlotMover::fix_open_slots`] reads them back to either
//! finish an interrupted move or clear a one-sided marker.

use tracing::{debug, info, warn};

use crate::driver::{SlotState, TransferOptions};
use crate::error::ClusterError;
use crate::node::Node;
use crate::orchestrator::StopSignal;
use crate::rebalance::pick_cheapest_slots;
use crate::topology::{NodeAddr, Topology};

/// Tunables for key draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Keys requested per `GETKEYSINSLOT` round.
    pub batch_size: usize,
    pub transfer: TransferOptions,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            transfer: TransferOptions::default(),
        }
    }
}

/// What a fix pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixReport {
    /// One-sided markers cleared back to stable, by node and slot.
    pub reverted: Vec<(NodeAddr, u16)>,
    /// Slots whose interrupted migration was carried to completion.
    pub resumed: Vec<u16>,
}

impl FixReport {
    pub fn is_empty(&self) -> bool {
        self.reverted.is_empty() && self.resumed.is_empty()
    }

    fn merge(&mut self, other: FixReport) {
        self.reverted.extend(other.reverted);
        self.resumed.extend(other.resumed);
    }
}

/// Drives slot moves against one topology snapshot.
pub struct SlotMover<'a> {
    topology: &'a Topology,
    config: &'a MigrationConfig,
    stop: &'a StopSignal,
}

impl<'a> SlotMover<'a> {
    pub fn new(topology: &'a Topology, config: &'a MigrationConfig, stop: &'a StopSignal) -> Self {
        Self {
            topology,
            config,
            stop,
        }
    }

    /// Moves one slot and its keys from `src` to `dst`.
    ///
    /// Returns the number of keys transferred. A key transfer error aborts
    /// the move with both markers still set; a later fix pass resumes it.
    pub async fn migrate_slot(&self, src: &Node, dst: &Node, slot: u16) -> Result<usize, ClusterError> {
        self.stop.check()?;

        let src_name = src.name().await?;
        let dst_name = dst.name().await?;

        dst.set_slot(slot, SlotState::Importing(src_name)).await?;
        src.set_slot(slot, SlotState::Migrating(dst_name.clone()))
            .await?;

        let mut moved = 0;
        loop {
            let keys = src.keys_in_slot(slot, self.config.batch_size).await?;
            if keys.is_empty() {
                break;
            }
            for key in &keys {
                debug!(slot, key = %String::from_utf8_lossy(key), to = %dst.addr(), "migrating key");
                src.transfer_key(dst, key, &self.config.transfer).await?;
                moved += 1;
            }
        }

        // destination first so it never refuses redirected clients
        let mut owners = vec![dst.clone(), src.clone()];
        for primary in self.topology.primaries().await? {
            if !owners.contains(&primary) {
                owners.push(primary);
            }
        }
        for owner in &owners {
            owner.set_slot(slot, SlotState::Node(dst_name.clone()))
                .await?;
            owner.flush_cache();
        }

        info!(slot, from = %src.addr(), to = %dst.addr(), keys = moved, "slot migrated");
        Ok(moved)
    }

    /// Moves up to `count` slots from `src` to `dst`, cheapest first.
    ///
    /// Slots carrying a migration marker on either side are skipped; the
    /// fix pass owns those. Returns the slots that moved.
    pub async fn migrate(&self, src: &Node, dst: &Node, count: usize) -> Result<Vec<u16>, ClusterError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        // markers only show on a node's own line, never in a peer's listing
        src.flush_cache();
        dst.flush_cache();
        let src_entry = src.entry().await?;
        let dst_entry = dst.entry().await?;
        let marked = |slot: &u16| {
            src_entry.migrating.contains_key(slot)
                || src_entry.importing.contains_key(slot)
                || dst_entry.migrating.contains_key(slot)
                || dst_entry.importing.contains_key(slot)
        };

        let mut key_counts = Vec::new();
        for &slot in src_entry.slots.iter().filter(|s| !marked(*s)) {
            key_counts.push((slot, src.count_keys_in_slot(slot).await?));
        }
        let chosen = pick_cheapest_slots(&key_counts, count);
        if chosen.len() < count {
            warn!(
                src = %src.addr(),
                requested = count,
                eligible = chosen.len(),
                "fewer movable slots than requested"
            );
        }

        for &slot in &chosen {
            self.migrate_slot(src, dst, slot).await?;
        }
        src.flush_cache();
        dst.flush_cache();
        Ok(chosen)
    }

    /// Resolves the migration markers a single primary reports.
    ///
    /// A marker whose counterpart is gone, or no longer holds the matching
    /// marker, is cleared to stable on this node. A marker both sides agree
    /// on is resumed.
    pub async fn fix_node(&self, node: &Node) -> Result<FixReport, ClusterError> {
        let entry = node.entry().await?;
        let mut report = FixReport::default();

        for (&slot, target_name) in &entry.migrating {
            let target = self.topology.get(target_name).await?;
            let agrees = match &target {
                Some(t) => t.entry().await?.importing.get(&slot) == Some(&entry.name),
                None => false,
            };
            match target {
                Some(target) if agrees => {
                    self.migrate_slot(node, &target, slot).await?;
                    target.flush_cache();
                    report.resumed.push(slot);
                }
                _ => {
                    warn!(node = %node.addr(), slot, to = %target_name, "clearing one-sided migrating marker");
                    node.set_slot(slot, SlotState::Stable).await?;
                    report.reverted.push((node.addr().clone(), slot));
                }
            }
        }

        for (&slot, source_name) in &entry.importing {
            let source = self.topology.get(source_name).await?;
            let agrees = match &source {
                Some(s) => s.entry().await?.migrating.get(&slot) == Some(&entry.name),
                None => false,
            };
            match source {
                Some(source) if agrees => {
                    self.migrate_slot(&source, node, slot).await?;
                    source.flush_cache();
                    report.resumed.push(slot);
                }
                _ => {
                    warn!(node = %node.addr(), slot, from = %source_name, "clearing one-sided importing marker");
                    node.set_slot(slot, SlotState::Stable).await?;
                    report.reverted.push((node.addr().clone(), slot));
                }
            }
        }

        node.flush_cache();
        Ok(report)
    }

    /// Runs [`fix_node`](Self::fix_node) on every primary from fresh views.
    pub async fn fix_open_slots(&self) -> Result<FixReport, ClusterError> {
        self.topology.flush_all();
        let mut report = FixReport::default();
        for primary in self.topology.primaries().await? {
            report.merge(self.fix_node(&primary).await?);
        }
        Ok(report)
    }
}
