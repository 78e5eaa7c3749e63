//! RESP-over-TCP implementation of the node command interface.
//!
//! One connection per node, opened lazily and dropped after any transport
//! failure so the next call reconnects. Retries are left to the
//! `ManagedDriver` wrapped around this.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use shardctl_cluster::{
    DriverError, FailoverMode, NodeAddr, NodeDriver, NodeInfo, ResetMode, Role, SlotState,
    TransferOptions,
};
use shardctl_protocol::Frame;
use tokio::sync::Mutex as AsyncMutex;

use crate::connection::{Connection, ConnectionError};

/// Settings shared by every connection the driver opens.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub timeout: Duration,
    pub password: Option<String>,
}

type Slot = Arc<AsyncMutex<Option<Connection>>>;

pub struct RespDriver {
    settings: ConnectSettings,
    conns: Mutex<HashMap<NodeAddr, Slot>>,
}

impl RespDriver {
    pub fn new(settings: ConnectSettings) -> Self {
        Self {
            settings,
            conns: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, addr: &NodeAddr) -> Slot {
        let mut conns = match self.conns.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        conns.entry(addr.clone()).or_default().clone()
    }

    async fn open(&self, addr: &NodeAddr) -> Result<Connection, DriverError> {
        let mut conn = Connection::connect(&addr.host, addr.port, self.settings.timeout)
            .await
            .map_err(transport)?;
        if let Some(password) = &self.settings.password {
            conn.authenticate(password).await.map_err(|e| match e {
                ConnectionError::AuthFailed(msg) => DriverError::Reply(msg),
                other => transport(other),
            })?;
        }
        Ok(conn)
    }

    /// Sends one command. Error replies become `Reply`, or `BusyLoading`
    /// for `-LOADING`.
    async fn command(&self, addr: &NodeAddr, parts: Vec<Bytes>) -> Result<Frame, DriverError> {
        let slot = self.slot(addr);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(self.open(addr).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(DriverError::Transport("no connection".into()));
        };
        let reply = match conn.send(parts).await {
            Ok(reply) => reply,
            Err(e) => {
                *guard = None;
                return Err(transport(e));
            }
        };
        match reply {
            Frame::Error(msg) if msg.starts_with("LOADING") => Err(DriverError::BusyLoading),
            Frame::Error(msg) => Err(DriverError::Reply(msg)),
            frame => Ok(frame),
        }
    }

    async fn expect_ok(&self, addr: &NodeAddr, parts: Vec<Bytes>) -> Result<(), DriverError> {
        let reply = self.command(addr, parts).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(unexpected(&reply))
        }
    }

    async fn text(&self, addr: &NodeAddr, parts: Vec<Bytes>) -> Result<String, DriverError> {
        let reply = self.command(addr, parts).await?;
        reply.as_text().ok_or_else(|| unexpected(&reply))
    }

    async fn integer(&self, addr: &NodeAddr, parts: Vec<Bytes>) -> Result<i64, DriverError> {
        let reply = self.command(addr, parts).await?;
        reply.as_integer().ok_or_else(|| unexpected(&reply))
    }
}

fn transport(e: ConnectionError) -> DriverError {
    DriverError::Transport(e.to_string())
}

fn unexpected(frame: &Frame) -> DriverError {
    DriverError::Protocol(format!("{frame:?}"))
}

/// Builds a command from mixed static and owned parts.
macro_rules! cmd {
    ($($part:expr),+ $(,)?) => {
        vec![$(Bytes::from($part)),+]
    };
}

fn num(n: impl ToString) -> Bytes {
    Bytes::from(n.to_string())
}

/// Parses a `ROLE` reply.
pub fn parse_role(reply: &Frame) -> Result<Role, DriverError> {
    let Frame::Array(items) = reply else {
        return Err(unexpected(reply));
    };
    let kind = items.first().and_then(Frame::as_text).ok_or_else(|| unexpected(reply))?;
    match kind.as_str() {
        "master" => Ok(Role::Primary),
        "slave" | "replica" => {
            let link = items.get(3).and_then(Frame::as_text).ok_or_else(|| unexpected(reply))?;
            Ok(Role::Replica { link })
        }
        other => Err(DriverError::Protocol(format!("unknown role {other}"))),
    }
}

#[async_trait]
impl NodeDriver for RespDriver {
    async fn list_topology(&self, addr: &NodeAddr) -> Result<String, DriverError> {
        self.text(addr, cmd!["CLUSTER", "NODES"]).await
    }

    async fn set_slot(&self, addr: &NodeAddr, slot: u16, state: &SlotState) -> Result<(), DriverError> {
        let mut parts = cmd!["CLUSTER", "SETSLOT", num(slot), state.action()];
        if let Some(peer) = state.peer() {
            parts.push(Bytes::copy_from_slice(peer.as_bytes()));
        }
        self.expect_ok(addr, parts).await
    }

    async fn add_slots(&self, addr: &NodeAddr, slots: &[u16]) -> Result<(), DriverError> {
        if slots.is_empty() {
            return Ok(());
        }
        let mut parts = cmd!["CLUSTER", "ADDSLOTS"];
        parts.extend(slots.iter().map(num));
        self.expect_ok(addr, parts).await
    }

    async fn remove_slots(&self, addr: &NodeAddr, slots: &[u16]) -> Result<(), DriverError> {
        if slots.is_empty() {
            return Ok(());
        }
        let mut parts = cmd!["CLUSTER", "DELSLOTS"];
        parts.extend(slots.iter().map(num));
        self.expect_ok(addr, parts).await
    }

    async fn keys_in_slot(&self, addr: &NodeAddr, slot: u16, limit: usize) -> Result<Vec<Bytes>, DriverError> {
        let reply = self
            .command(addr, cmd!["CLUSTER", "GETKEYSINSLOT", num(slot), num(limit)])
            .await?;
        match &reply {
            Frame::Array(items) => items
                .iter()
                .map(|item| item.as_bytes().ok_or_else(|| unexpected(item)))
                .collect(),
            _ => Err(unexpected(&reply)),
        }
    }

    async fn count_keys_in_slot(&self, addr: &NodeAddr, slot: u16) -> Result<u64, DriverError> {
        let n = self
            .integer(addr, cmd!["CLUSTER", "COUNTKEYSINSLOT", num(slot)])
            .await?;
        u64::try_from(n).map_err(|_| DriverError::Protocol(format!("negative key count {n}")))
    }

    async fn transfer_key(
        &self,
        addr: &NodeAddr,
        dest: &NodeAddr,
        key: &Bytes,
        options: &TransferOptions,
    ) -> Result<(), DriverError> {
        let mut parts = cmd![
            "MIGRATE",
            dest.host.clone(),
            num(dest.port),
            key.clone(),
            "0",
            num(options.timeout_ms),
        ];
        if options.copy {
            parts.push(Bytes::from_static(b"COPY"));
        }
        if options.replace {
            parts.push(Bytes::from_static(b"REPLACE"));
        }
        match self.command(addr, parts).await? {
            // the key expired or was deleted between listing and migrating
            Frame::Simple(s) if s == "OK" || s == "NOKEY" => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn meet(&self, addr: &NodeAddr, peer: &NodeAddr) -> Result<(), DriverError> {
        self.expect_ok(addr, cmd!["CLUSTER", "MEET", peer.host.clone(), num(peer.port)])
            .await
    }

    async fn replicate_from(&self, addr: &NodeAddr, primary: &str) -> Result<(), DriverError> {
        self.expect_ok(addr, cmd!["CLUSTER", "REPLICATE", primary.to_owned()])
            .await
    }

    async fn forget(&self, addr: &NodeAddr, name: &str) -> Result<(), DriverError> {
        self.expect_ok(addr, cmd!["CLUSTER", "FORGET", name.to_owned()])
            .await
    }

    async fn failover(&self, addr: &NodeAddr, mode: FailoverMode) -> Result<(), DriverError> {
        self.expect_ok(addr, cmd!["CLUSTER", "FAILOVER", mode.as_str()])
            .await
    }

    async fn reset(&self, addr: &NodeAddr, mode: ResetMode) -> Result<(), DriverError> {
        self.expect_ok(addr, cmd!["CLUSTER", "RESET", mode.as_str()])
            .await
    }

    async fn set_config_epoch(&self, addr: &NodeAddr, epoch: u64) -> Result<(), DriverError> {
        self.expect_ok(addr, cmd!["CLUSTER", "SET-CONFIG-EPOCH", num(epoch)])
            .await
    }

    async fn info(&self, addr: &NodeAddr) -> Result<NodeInfo, DriverError> {
        let info = self.text(addr, cmd!["INFO"]).await?;
        let cluster_info = self.text(addr, cmd!["CLUSTER", "INFO"]).await?;
        NodeInfo::parse(&info, &cluster_info).map_err(|e| DriverError::Protocol(e.to_string()))
    }

    async fn role(&self, addr: &NodeAddr) -> Result<Role, DriverError> {
        let reply = self.command(addr, cmd!["ROLE"]).await?;
        parse_role(&reply)
    }

    async fn flush_all(&self, addr: &NodeAddr) -> Result<(), DriverError> {
        self.expect_ok(addr, cmd!["FLUSHALL"]).await
    }

    async fn config_set(&self, addr: &NodeAddr, name: &str, value: &str) -> Result<(), DriverError> {
        self.expect_ok(addr, cmd!["CONFIG", "SET", name.to_owned(), value.to_owned()])
            .await
    }

    async fn config_rewrite(&self, addr: &NodeAddr) -> Result<(), DriverError> {
        self.expect_ok(addr, cmd!["CONFIG", "REWRITE"]).await
    }
}
