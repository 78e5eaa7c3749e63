//! shardctl-cluster: administration of hash-slot clusters.
//!
//! This crate holds everything between an operator command and the wire:
//! it reads cluster topology, plans slot and replica moves, and carries
//! them out through a [`NodeDriver`] supplied by the caller.
//!
//! # Architecture
//!
//! - **Topology**: `CLUSTER NODES` parsing, cached [`Node`] handles and the
//!   [`Topology`] snapshot with its consistency check
//! - **Migration**: the IMPORTING/MIGRATING handoff and the fix pass that
//!   resumes or clears interrupted moves
//! - **Planning**: slot rebalancing and max-flow replica placement, both
//!   pure functions over plain data
//! - **Health**: cross-node comparison of what every member reports
//! - **Orchestration**: [`Cluster`], which sequences the above into
//!   add/delete/fix/reshard/grow operations, and [`create`] for new clusters
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use shardctl_cluster::{Cluster, ClusterConfig, ManagedDriver, Node, NodeAddr, StopSignal};
//!
//! let driver = ManagedDriver::new(my_driver).into_shared();
//! let seed = Node::new(NodeAddr::parse("10.0.0.1:7000")?, driver);
//! let cluster = Cluster::connect(&seed, ClusterConfig::default(), StopSignal::new()).await?;
//! cluster.fix_open_slots().await?;
//! cluster.reshard().await?;
//! ```

mod create;
mod driver;
mod error;
mod health;
mod migration;
mod node;
mod orchestrator;
mod placement;
mod rebalance;
mod slots;
mod task;
mod topology;

pub use create::{create, plan_create, CreatePlan, PlannedPrimary, PlannedReplica, MIN_PRIMARIES};
pub use driver::{
    FailoverMode, ManagedDriver, Middleware, NodeDriver, ResetMode, RetryPolicy, Role,
    SharedDriver, SlotState, TraceCalls, TransferOptions,
};
pub use error::{ClusterError, DriverError, ParseError, PlacementError};
pub use health::{Check, Diff, DiffGroup, HealthCheck, HealthReport};
pub use migration::{FixReport, MigrationConfig, SlotMover};
pub use node::Node;
pub use orchestrator::{
    Attached, Cluster, ClusterConfig, Distribution, JoinRole, NewNode, PollConfig, Preview,
    ReshardOutcome, StopSignal,
};
pub use placement::{
    plan_master_moves, plan_replica_rearrangement, MasterMovePlan, Placement, PlacementNode,
    RearrangePlan, ReplicaMatch, ReplicaSolution, ReplicaSolver,
};
pub use rebalance::{pick_cheapest_slots, plan_node_drain, slot_balance, Transfer};
pub use slots::{compress, divide, format_slots, key_slot, SlotMap, SlotRange, SLOT_COUNT};
pub use task::{PinFuture, Task, TaskReport};
pub use topology::{
    assigned_slot_count, info_field, parse_cluster_nodes, LinkState, NodeAddr, NodeEntry,
    NodeFlags, NodeInfo, Topology,
};
