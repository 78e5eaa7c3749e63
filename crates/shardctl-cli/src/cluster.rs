//! Subcommands and their execution.
//!
//! Each subcommand parses its addresses, builds a [`Cluster`] from a seed
//! node, runs one library operation, and prints the result. Anything that
//! goes wrong comes back as a [`CliError`] for `main` to report.

use std::sync::Arc;

use clap::Subcommand;
use colored::Colorize;
use shardctl_cluster::{
    assigned_slot_count, create, plan_create, Cluster, ClusterError, HealthCheck, JoinRole,
    ManagedDriver, NewNode, Node, NodeAddr, NodeEntry, ParseError, ReshardOutcome, RetryPolicy,
    SharedDriver, StopSignal, TraceCalls,
};
use tracing::info;

use crate::config::{AdminConfig, ConfigError};
use crate::driver::RespDriver;
use crate::format;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("invalid address: {0}")]
    Address(#[from] ParseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to encode report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Usage(String),
}

/// Cluster administration commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a cluster from empty instances.
    Create {
        /// Replicas per primary.
        #[arg(short = 's', long, default_value_t = 0)]
        replicas: usize,

        /// Number of primaries. Defaults to instances / (replicas + 1).
        #[arg(short = 'm', long)]
        primaries: Option<usize>,

        /// Print the plan without touching the instances.
        #[arg(long)]
        dry_run: bool,

        /// Instance addresses in host:port form.
        #[arg(required = true, num_args = 3..)]
        instances: Vec<String>,
    },

    /// Add nodes and rebalance slots onto the new primaries.
    ///
    /// A node given as `host:port,primary-host:port` joins as a replica of
    /// that primary; otherwise it joins as a primary.
    Add {
        cluster: String,
        #[arg(required = true, num_args = 1..)]
        nodes: Vec<String>,
    },

    /// Drain and remove nodes.
    Delete {
        cluster: String,
        #[arg(required = true, num_args = 1..)]
        nodes: Vec<String>,
    },

    /// Finish or clear interrupted migrations, then cover missing slots.
    Fix { cluster: String },

    /// Move slots off a node, or between two nodes.
    Migrate {
        src: String,

        #[arg(short, long)]
        dst: Option<String>,

        /// Move exactly this slot (requires --dst).
        #[arg(short, long, requires = "dst")]
        slot: Option<u16>,

        /// Number of slots to move.
        #[arg(short, long)]
        count: Option<usize>,

        /// Pull slots onto `src` from the other primaries instead.
        #[arg(short, long, conflicts_with = "dst")]
        income: bool,
    },

    /// Even out slot counts across primaries.
    Reshard { cluster: String },

    /// Make a node replicate the given primary.
    Replicate { node: String, primary: String },

    /// Show primaries, their slots and replicas.
    Info { cluster: String },

    /// Compare what every reachable node reports about the cluster.
    Check {
        #[arg(required = true, num_args = 1..)]
        nodes: Vec<String>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the per-host layout of primaries and replicas.
    Peek { cluster: String },

    /// Attach new nodes as replicas, spread across hosts.
    AddReplicas {
        #[arg(short, long)]
        peek: bool,

        /// Most replicas any primary may end up with.
        #[arg(short, long)]
        limit: Option<usize>,

        /// Sync every new replica at once instead of one per host.
        #[arg(short, long)]
        fast: bool,

        cluster: String,
        #[arg(required = true, num_args = 1..)]
        nodes: Vec<String>,
    },

    /// Move primaries onto new hosts.
    MoveMasters {
        #[arg(short, long)]
        peek: bool,
        #[arg(short, long)]
        fast: bool,
        cluster: String,
        #[arg(required = true, num_args = 1..)]
        nodes: Vec<String>,
    },

    /// Give every primary exactly one replica on another host.
    RearrangeReplicas {
        #[arg(short, long)]
        peek: bool,
        #[arg(short, long)]
        fast: bool,
        cluster: String,
        nodes: Vec<String>,
    },

    /// Flush and hard-reset every member.
    Destroy { cluster: String },

    /// Delete every key on every primary.
    Flushall { cluster: String },

    /// Set a config parameter on every member.
    Reconfigure {
        cluster: String,
        name: String,
        value: String,

        /// Persist with CONFIG REWRITE.
        #[arg(long)]
        rewrite: bool,
    },
}

/// What every command needs: configuration, a driver and the stop flag.
pub struct Context {
    pub cfg: AdminConfig,
    pub driver: SharedDriver,
    pub stop: StopSignal,
}

impl Context {
    pub fn new(cfg: AdminConfig, retry: bool, stop: StopSignal) -> Self {
        let driver = build_driver(&cfg, retry);
        Self { cfg, driver, stop }
    }

    fn node(&self, addr: &str) -> Result<Node, CliError> {
        Ok(Node::new(NodeAddr::parse(addr)?, self.driver.clone()))
    }

    fn nodes(&self, addrs: &[String]) -> Result<Vec<Node>, CliError> {
        addrs.iter().map(|a| self.node(a)).collect()
    }

    async fn cluster(&self, seed: &str) -> Result<Cluster, CliError> {
        let seed = self.node(seed)?;
        Ok(Cluster::connect(&seed, self.cfg.cluster_config(), self.stop.clone()).await?)
    }
}

pub fn build_driver(cfg: &AdminConfig, retry: bool) -> SharedDriver {
    let policy = if retry {
        cfg.retry_policy()
    } else {
        RetryPolicy::none()
    };
    ManagedDriver::new(RespDriver::new(cfg.connect_settings()))
        .with_policy(policy)
        .with_middleware(Arc::new(TraceCalls))
        .into_shared()
}

/// A member of `cluster` by address.
fn member(cluster: &Cluster, addr: &str) -> Result<Node, CliError> {
    let addr = NodeAddr::parse(addr)?;
    cluster
        .topology()
        .get_by_addr(&addr)
        .ok_or_else(|| ClusterError::NodeNotFound(addr.to_string()).into())
}

/// Runs one command. `Ok(false)` means it ran but the outcome is a failure
/// the user should see in the exit code.
pub async fn run(command: Command, ctx: &Context) -> Result<bool, CliError> {
    match command {
        Command::Create {
            replicas,
            primaries,
            dry_run,
            instances,
        } => {
            let addrs = instances
                .iter()
                .map(|a| NodeAddr::parse(a))
                .collect::<Result<Vec<_>, _>>()?;
            let plan = plan_create(&addrs, replicas, primaries)?;
            print!("{plan}");
            for unused in &plan.unused {
                println!("{}", format!("unused: {unused}").yellow());
            }
            if dry_run {
                return Ok(true);
            }
            let report = create(
                ctx.driver.clone(),
                &plan,
                ctx.cfg.cluster_config(),
                ctx.stop.clone(),
            )
            .await?;
            println!("{}", format::task_tree(&report));
            Ok(report.is_ok())
        }

        Command::Add { cluster, nodes } => {
            let mut cluster = ctx.cluster(&cluster).await?;
            if !cluster.topology().healthy().await? {
                return Err(CliError::Usage("cluster is not healthy, run fix first".into()));
            }
            let mut specs = Vec::with_capacity(nodes.len());
            for spec in &nodes {
                let (addr, primary) = match spec.split_once(',') {
                    Some((addr, primary)) => (addr, Some(primary)),
                    None => (spec.as_str(), None),
                };
                let role = match primary {
                    Some(primary) => {
                        let name = member(&cluster, primary)?.name().await?;
                        JoinRole::Replica { primary: Some(name) }
                    }
                    None => JoinRole::Primary,
                };
                specs.push(NewNode {
                    node: ctx.node(addr)?,
                    role,
                });
            }
            cluster.add_nodes(specs).await?;
            if let ReshardOutcome::Applied(moves) = cluster.reshard().await? {
                println!("{}", format::transfers(&moves));
            }
            cluster.wait().await?;
            print_distribution(&cluster).await?;
            Ok(true)
        }

        Command::Delete { cluster, nodes } => {
            let mut cluster = ctx.cluster(&cluster).await?;
            for addr in &nodes {
                let node = member(&cluster, addr)?;
                cluster.delete_node(&node).await?;
                cluster.wait().await?;
                println!("{}", format!("deleted {addr}").green());
            }
            Ok(true)
        }

        Command::Fix { cluster } => {
            let cluster = ctx.cluster(&cluster).await?;
            let report = cluster.fix_open_slots().await?;
            for (addr, slot) in &report.reverted {
                println!("cleared marker on slot {slot} of {addr}");
            }
            for slot in &report.resumed {
                println!("finished migration of slot {slot}");
            }
            let filled = cluster.fill_slots().await?;
            if filled > 0 {
                println!("assigned {filled} uncovered slots");
            }
            if report.is_empty() && filled == 0 {
                println!("{}", "nothing to fix".green());
            }
            Ok(true)
        }

        Command::Migrate {
            src,
            dst,
            slot,
            count,
            income,
        } => {
            let cluster = ctx.cluster(&src).await?;
            let src = member(&cluster, &src)?;
            let dst = dst.map(|d| member(&cluster, &d)).transpose()?;
            match (dst, slot) {
                (Some(dst), Some(slot)) => {
                    let keys = cluster.migrate_slot(&src, &dst, slot).await?;
                    println!("slot {slot}: {keys} keys moved");
                }
                (Some(dst), None) => {
                    let count = match count {
                        Some(c) => c,
                        None => src.slots().await?.len(),
                    };
                    let moved = cluster.migrate(&src, &dst, count).await?;
                    println!("{} slots moved", moved.len());
                }
                (None, _) => {
                    let moves = cluster.migrate_node(&src, count, income).await?;
                    println!("{}", format::transfers(&moves));
                }
            }
            cluster.wait().await?;
            Ok(true)
        }

        Command::Reshard { cluster } => {
            let cluster = ctx.cluster(&cluster).await?;
            match cluster.reshard().await? {
                ReshardOutcome::Skipped => {
                    println!("{}", "cluster is not consistent, nothing moved".yellow());
                    Ok(false)
                }
                ReshardOutcome::Applied(moves) => {
                    println!("{}", format::transfers(&moves));
                    Ok(true)
                }
            }
        }

        Command::Replicate { node, primary } => {
            let mut cluster = ctx.cluster(&primary).await?;
            let target = member(&cluster, &primary)?;
            if !target.is_primary().await? {
                return Err(CliError::Usage(format!("{primary} is not a primary")));
            }
            let name = target.name().await?;
            let replica = match member(&cluster, &node) {
                Ok(existing) => existing,
                Err(_) => ctx.node(&node)?,
            };
            cluster.replicate(&replica, &name).await?;
            println!("{}", format!("{node} now replicates {primary}").green());
            Ok(true)
        }

        Command::Info { cluster } => {
            let cluster = ctx.cluster(&cluster).await?;
            print_distribution(&cluster).await?;
            Ok(true)
        }

        Command::Check { nodes, json } => {
            let seeds = nodes
                .iter()
                .map(|a| NodeAddr::parse(a))
                .collect::<Result<Vec<_>, _>>()?;
            // a broken cluster should be reported, not retried against
            let driver = build_driver(&ctx.cfg, false);
            let report = HealthCheck::discover(driver, &seeds).await.report();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", format::health(&report));
            }
            Ok(report.is_healthy())
        }

        Command::Peek { cluster } => {
            let cluster = ctx.cluster(&cluster).await?;
            if !cluster.topology().consistent().await? {
                return Err(CliError::Usage("cluster is not consistent".into()));
            }
            let dist = cluster.distribution(&[]).await?;
            println!("{}", dist.placement.render());
            Ok(true)
        }

        Command::AddReplicas {
            peek,
            limit,
            fast,
            cluster,
            nodes,
        } => {
            let mut cluster = ctx.cluster(&cluster).await?;
            let new = ctx.nodes(&nodes)?;
            if peek {
                println!("{}", format::preview(&cluster.preview_replicas(&new, limit).await?));
                return Ok(true);
            }
            for attached in cluster.add_replicas_balanced(&new, limit, fast).await? {
                println!("{} -> {}", attached.replica, attached.primary);
            }
            Ok(true)
        }

        Command::MoveMasters {
            peek,
            fast,
            cluster,
            nodes,
        } => {
            let mut cluster = ctx.cluster(&cluster).await?;
            let new = ctx.nodes(&nodes)?;
            if peek {
                println!("{}", format::preview(&cluster.preview_master_moves(&new).await?));
                return Ok(true);
            }
            let promoted = cluster.move_masters(&new, fast).await?;
            for addr in &promoted {
                println!("{}", format!("{addr} is now a primary").green());
            }
            Ok(true)
        }

        Command::RearrangeReplicas {
            peek,
            fast,
            cluster,
            nodes,
        } => {
            let mut cluster = ctx.cluster(&cluster).await?;
            let new = ctx.nodes(&nodes)?;
            if peek {
                println!("{}", format::preview(&cluster.preview_rearrangement(&new).await?));
                return Ok(true);
            }
            cluster.rearrange_replicas(&new, fast).await?;
            print_distribution(&cluster).await?;
            Ok(true)
        }

        Command::Destroy { cluster } => {
            let cluster = ctx.cluster(&cluster).await?;
            cluster.destroy().await?;
            println!("{}", format!("{} nodes reset", cluster.topology().len()).green());
            Ok(true)
        }

        Command::Flushall { cluster } => {
            let cluster = ctx.cluster(&cluster).await?;
            cluster.flush_all().await?;
            Ok(true)
        }

        Command::Reconfigure {
            cluster,
            name,
            value,
            rewrite,
        } => {
            let cluster = ctx.cluster(&cluster).await?;
            cluster.reconfigure(&name, &value, rewrite).await?;
            info!(name = %name, "reconfigured {} nodes", cluster.topology().len());
            Ok(true)
        }
    }
}

/// Prints each primary with its replicas, then totals.
async fn print_distribution(cluster: &Cluster) -> Result<(), CliError> {
    cluster.topology().flush_all();
    let mut entries: Vec<NodeEntry> = Vec::with_capacity(cluster.topology().len());
    for node in cluster.topology().nodes() {
        entries.push(node.entry().await?.as_ref().clone());
    }
    for primary in entries.iter().filter(|e| e.is_primary()) {
        let replicas: Vec<&NodeEntry> = entries
            .iter()
            .filter(|e| e.is_replica_of(&primary.name))
            .collect();
        println!("{}", format::primary_line(primary, &replicas));
    }
    println!("{}", format::slot_summary(&entries));
    println!("instances: {}", entries.len());
    println!("assigned: {}", assigned_slot_count(&entries));
    Ok(())
}
