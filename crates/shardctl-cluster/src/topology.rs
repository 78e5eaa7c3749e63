//! Cluster topology as reported by the nodes themselves.
//!
//! A node describes the cluster through its topology listing: one line per
//! known peer with its name, address, flags, replication target, link state,
//! owned slots and in-flight migration markers. This module parses that
//! listing into [`NodeEntry`] values and assembles a [`Topology`] snapshot
//! from one seed node.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ClusterError, ParseError};
use crate::node::Node;
use crate::slots::{compress, format_slots, SlotMap, SlotRange, SLOT_COUNT};

/// Network address of a node's client port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, `[v6]:port` or `redis://[user:pass@]host:port`.
    ///
    /// A trailing `@cport` (the cluster bus port in topology listings) is
    /// dropped. The host may be empty: a node that has never met a peer
    /// lists itself as `:port`.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let addr = Self::parse_any_port(s)?;
        if addr.port == 0 {
            return Err(ParseError::Address(s.to_owned()));
        }
        Ok(addr)
    }

    /// Like [`NodeAddr::parse`], but keeps the `:0` placeholder a listing
    /// shows for a `noaddr` peer.
    fn parse_any_port(s: &str) -> Result<Self, ParseError> {
        let bad = || ParseError::Address(s.to_owned());
        let trimmed = s.trim();

        let hostport = match trimmed.strip_prefix("redis://") {
            Some(uri) => {
                let uri = uri.trim_end_matches('/');
                uri.rsplit_once('@').map_or(uri, |(_, rest)| rest)
            }
            None => trimmed.split('@').next().unwrap_or(trimmed),
        };

        let (host, port) = match hostport.strip_prefix('[') {
            Some(rest) => {
                let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
                (host, tail.strip_prefix(':').ok_or_else(bad)?)
            }
            None => hostport.rsplit_once(':').ok_or_else(bad)?,
        };

        let port: u16 = port.parse().map_err(|_| bad())?;
        Ok(Self::new(host, port))
    }
}

impl FromStr for NodeAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeAddr::parse(s)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Serialize for NodeAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Status flags attached to a listing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags {
    /// The line describes the node that produced the listing.
    pub myself: bool,
    pub master: bool,
    pub slave: bool,
    /// Suspected failing by the reporting node (`fail?`).
    pub pfail: bool,
    /// Failure agreed on by a majority of primaries.
    pub fail: bool,
    pub handshake: bool,
    pub noaddr: bool,
    pub nofailover: bool,
}

impl NodeFlags {
    fn parse(s: &str) -> Self {
        let mut flags = Self::default();
        for flag in s.split(',') {
            match flag {
                "myself" => flags.myself = true,
                "master" => flags.master = true,
                "slave" => flags.slave = true,
                "fail?" => flags.pfail = true,
                "fail" => flags.fail = true,
                "handshake" => flags.handshake = true,
                "noaddr" => flags.noaddr = true,
                "nofailover" => flags.nofailover = true,
                _ => {}
            }
        }
        flags
    }
}

impl fmt::Display for NodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags: Vec<&str> = [
            (self.myself, "myself"),
            (self.master, "master"),
            (self.slave, "slave"),
            (self.pfail, "fail?"),
            (self.fail, "fail"),
            (self.handshake, "handshake"),
            (self.noaddr, "noaddr"),
            (self.nofailover, "nofailover"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();

        if flags.is_empty() {
            write!(f, "noflags")
        } else {
            write!(f, "{}", flags.join(","))
        }
    }
}

/// State of the cluster bus link between the reporter and a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
        }
    }
}

/// One line of a topology listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    /// 40-character node name, stable for the node's lifetime in a cluster.
    pub name: String,
    pub addr: NodeAddr,
    pub flags: NodeFlags,
    /// Name of the primary this node replicates, if any.
    pub replicates: Option<String>,
    pub ping_sent: u64,
    pub pong_recv: u64,
    pub config_epoch: u64,
    pub link: LinkState,
    pub slots: BTreeSet<u16>,
    /// Slots this node is handing off, keyed to the destination name.
    pub migrating: BTreeMap<u16, String>,
    /// Slots this node is receiving, keyed to the source name.
    pub importing: BTreeMap<u16, String>,
}

impl NodeEntry {
    /// Builds a connected primary entry with no slots.
    pub fn primary(name: impl Into<String>, addr: NodeAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            flags: NodeFlags {
                master: true,
                ..NodeFlags::default()
            },
            replicates: None,
            ping_sent: 0,
            pong_recv: 0,
            config_epoch: 0,
            link: LinkState::Connected,
            slots: BTreeSet::new(),
            migrating: BTreeMap::new(),
            importing: BTreeMap::new(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.flags.master
    }

    pub fn is_replica(&self) -> bool {
        self.flags.slave
    }

    /// True if this entry is a replica of the named primary.
    pub fn is_replica_of(&self, primary: &str) -> bool {
        self.flags.slave && self.replicates.as_deref() == Some(primary)
    }

    /// `fail?`, `fail` or `alive`, with suspicion taking precedence.
    pub fn fail_flag(&self) -> &'static str {
        if self.flags.pfail {
            "fail?"
        } else if self.flags.fail {
            "fail"
        } else {
            "alive"
        }
    }

    /// Parses a single listing line.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let bad = |reason: &str| ParseError::NodeLine {
            line: line.to_owned(),
            reason: reason.to_owned(),
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(bad("expected at least 8 fields"));
        }

        let flags = NodeFlags::parse(fields[2]);
        let addr = if flags.noaddr {
            NodeAddr::parse_any_port(fields[1])
        } else {
            NodeAddr::parse(fields[1])
        }
        .map_err(|e| bad(&e.to_string()))?;
        let number = |idx: usize, what: &str| -> Result<u64, ParseError> {
            fields[idx].parse().map_err(|_| bad(what))
        };
        let link = match fields[7] {
            "connected" => LinkState::Connected,
            "disconnected" => LinkState::Disconnected,
            _ => return Err(bad("unknown link state")),
        };

        let mut entry = Self {
            name: fields[0].to_owned(),
            addr,
            flags,
            replicates: (fields[3] != "-").then(|| fields[3].to_owned()),
            ping_sent: number(4, "ping-sent is not a number")?,
            pong_recv: number(5, "pong-recv is not a number")?,
            config_epoch: number(6, "config epoch is not a number")?,
            link,
            slots: BTreeSet::new(),
            migrating: BTreeMap::new(),
            importing: BTreeMap::new(),
        };

        for token in &fields[8..] {
            if let Some(marker) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
                if let Some((slot, dst)) = marker.split_once("->-") {
                    let slot = slot.parse().map_err(|_| bad("bad migrating marker"))?;
                    entry.migrating.insert(slot, dst.to_owned());
                } else if let Some((slot, src)) = marker.split_once("-<-") {
                    let slot = slot.parse().map_err(|_| bad("bad importing marker"))?;
                    entry.importing.insert(slot, src.to_owned());
                } else {
                    return Err(bad("unknown slot marker"));
                }
            } else {
                let range: SlotRange = token.parse().map_err(|e: ParseError| bad(&e.to_string()))?;
                entry.slots.extend(range.iter());
            }
        }

        Ok(entry)
    }
}

impl fmt::Display for NodeEntry {
    /// Formats the entry back into listing syntax.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}@{} {} {} {} {} {} {}",
            self.name,
            self.addr,
            u32::from(self.addr.port) + 10000,
            self.flags,
            self.replicates.as_deref().unwrap_or("-"),
            self.ping_sent,
            self.pong_recv,
            self.config_epoch,
            self.link.as_str(),
        )?;
        for range in compress(self.slots.iter().copied()) {
            write!(f, " {range}")?;
        }
        for (slot, dst) in &self.migrating {
            write!(f, " [{slot}->-{dst}]")?;
        }
        for (slot, src) in &self.importing {
            write!(f, " [{slot}-<-{src}]")?;
        }
        Ok(())
    }
}

/// Parses a full topology listing.
///
/// The `myself` line is moved to the front regardless of where it appears,
/// so callers can treat the first entry as the reporting node.
pub fn parse_cluster_nodes(text: &str) -> Result<Vec<NodeEntry>, ParseError> {
    let mut entries = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let entry = NodeEntry::parse(line)?;
        if entry.flags.myself {
            entries.insert(0, entry);
        } else {
            entries.push(entry);
        }
    }
    match entries.first() {
        Some(first) if first.flags.myself => Ok(entries),
        _ => Err(ParseError::NoSelf),
    }
}

/// Server facts needed before a node may join a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub version: String,
    pub cluster_enabled: bool,
    /// Peers the node knows about, itself included.
    pub known_nodes: usize,
    /// True if the node holds keys in database 0.
    pub has_data: bool,
}

impl NodeInfo {
    /// Builds node facts from `INFO` and `CLUSTER INFO` replies.
    pub fn parse(info: &str, cluster_info: &str) -> Result<Self, ParseError> {
        let version = info_field(info, "redis_version")
            .ok_or(ParseError::MissingField("redis_version"))?
            .to_owned();
        let cluster_enabled = info_field(info, "cluster_enabled") == Some("1");
        let known_nodes = info_field(cluster_info, "cluster_known_nodes")
            .and_then(|v| v.parse().ok())
            .ok_or(ParseError::MissingField("cluster_known_nodes"))?;
        let has_data = info_field(info, "db0").is_some();

        Ok(Self {
            version,
            cluster_enabled,
            known_nodes,
            has_data,
        })
    }
}

/// Looks up `key` in `key:value` lines.
pub fn info_field<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .filter_map(|line| line.trim().split_once(':'))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// The set of nodes known by consulting one member.
///
/// Each [`Node`] carries its own cached view; the snapshot itself only
/// tracks membership.
#[derive(Clone, Default)]
pub struct Topology {
    nodes: Vec<Node>,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(Node::addr))
            .finish()
    }
}

impl Topology {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// Builds a snapshot from the seed's listing.
    ///
    /// Peers whose link is `disconnected` from the seed's point of view are
    /// left out. The seed itself comes first.
    pub async fn fetch(seed: &Node) -> Result<Self, ClusterError> {
        let view = seed.fetch_view().await?;
        let driver = seed.driver().clone();
        let nodes: Vec<Node> = view
            .iter()
            .filter(|entry| entry.link != LinkState::Disconnected)
            .map(|entry| Node::from_entry(entry.clone(), driver.clone()))
            .collect();
        debug!(seed = %seed.addr(), members = nodes.len(), "fetched topology");
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// First member, used as the meeting point for new nodes.
    pub fn first(&self) -> Option<&Node> {
        self.nodes.first()
    }

    pub fn push(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Drops the named node from the working set.
    ///
    /// Names are resolved before anything is dropped, so a failed lookup
    /// leaves the working set untouched.
    pub async fn remove(&mut self, name: &str) -> Result<(), ClusterError> {
        let mut names = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            names.push(node.name().await?);
        }
        let mut names = names.into_iter();
        self.nodes.retain(|_| names.next().as_deref() != Some(name));
        Ok(())
    }

    /// Invalidates every node's cached view.
    pub fn flush_all(&self) {
        for node in &self.nodes {
            node.flush_cache();
        }
    }

    pub async fn primaries(&self) -> Result<Vec<Node>, ClusterError> {
        let mut primaries = Vec::new();
        for node in &self.nodes {
            if node.entry().await?.is_primary() {
                primaries.push(node.clone());
            }
        }
        Ok(primaries)
    }

    /// Replicas of the named primary, according to each member's own view.
    pub async fn replicas_of(&self, primary: &str) -> Result<Vec<Node>, ClusterError> {
        let mut replicas = Vec::new();
        for node in &self.nodes {
            if node.entry().await?.is_replica_of(primary) {
                replicas.push(node.clone());
            }
        }
        Ok(replicas)
    }

    pub async fn get(&self, name: &str) -> Result<Option<Node>, ClusterError> {
        for node in &self.nodes {
            if node.entry().await?.name == name {
                return Ok(Some(node.clone()));
            }
        }
        Ok(None)
    }

    /// Like [`get`](Self::get) but fails with `NodeNotFound`.
    pub async fn require(&self, name: &str) -> Result<Node, ClusterError> {
        self.get(name)
            .await?
            .ok_or_else(|| ClusterError::NodeNotFound(name.to_owned()))
    }

    pub fn get_by_addr(&self, addr: &NodeAddr) -> Option<Node> {
        self.nodes.iter().find(|n| n.addr() == addr).cloned()
    }

    /// Slot claims of every primary, taken from each primary's own line.
    pub async fn slot_map(&self) -> Result<SlotMap, ClusterError> {
        let mut map = SlotMap::new();
        for node in self.primaries().await? {
            let entry = node.entry().await?;
            map.claim(&entry.name, &entry.slots);
        }
        Ok(map)
    }

    pub async fn missing_slots(&self) -> Result<BTreeSet<u16>, ClusterError> {
        Ok(self.slot_map().await?.unassigned())
    }

    /// True when every primary reports the same names and slot assignment.
    ///
    /// Always queries the primaries live; a cached view can't tell whether
    /// gossip has converged.
    pub async fn consistent(&self) -> Result<bool, ClusterError> {
        let mut digests = HashSet::new();
        for node in self.primaries().await? {
            let view = node.fetch_view().await?;
            digests.insert(view_digest(&view));
        }
        Ok(digests.len() == 1)
    }

    /// Consistent, and every slot owned by exactly one primary.
    pub async fn healthy(&self) -> Result<bool, ClusterError> {
        self.flush_all();
        let map = self.slot_map().await?;
        if !map.is_partition() {
            return Ok(false);
        }
        self.consistent().await
    }

    /// Describes what keeps the slot space from being a partition.
    pub async fn coverage_problems(&self) -> Result<Option<String>, ClusterError> {
        let map = self.slot_map().await?;
        let missing = map.unassigned();
        let conflicts = map.conflicts();
        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing slots {}", format_slots(&missing)));
        }
        if !conflicts.is_empty() {
            problems.push(format!("slots owned twice {}", format_slots(&conflicts)));
        }
        Ok((!problems.is_empty()).then(|| problems.join("; ")))
    }
}

/// Canonical digest of one node's view: sorted names with sorted slots.
fn view_digest(view: &[NodeEntry]) -> Vec<u8> {
    let mut assignment: Vec<(&str, &BTreeSet<u16>)> =
        view.iter().map(|e| (e.name.as_str(), &e.slots)).collect();
    assignment.sort();

    let mut hasher = Sha256::new();
    for (name, slots) in assignment {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(format_slots(slots).as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_vec()
}

/// Number of slots a listing assigns overall, for display.
pub fn assigned_slot_count(view: &[NodeEntry]) -> usize {
    view.iter().map(|e| e.slots.len()).sum::<usize>().min(SLOT_COUNT as usize)
}
