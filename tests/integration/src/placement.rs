//! Host-aware replica placement and primary moves against a live cluster.

use shardctl_cluster::{ClusterError, Node, NodeAddr, PlacementError};

use crate::helpers::{connect, FakeCluster};

fn one_primary_per_host() -> (FakeCluster, Vec<NodeAddr>) {
    FakeCluster::with_primaries(&[("a", 7000), ("b", 7000), ("c", 7000)])
}

fn spawn_all(fake: &FakeCluster, spec: &[(&str, u16)]) -> (Vec<NodeAddr>, Vec<Node>) {
    let addrs: Vec<NodeAddr> = spec.iter().map(|(h, p)| fake.spawn(h, *p)).collect();
    let nodes = addrs.iter().map(|a| fake.node(a)).collect();
    (addrs, nodes)
}

fn assert_one_offhost_replica_each(fake: &FakeCluster, primaries: &[NodeAddr]) {
    for primary in primaries {
        let replicas = fake.replicas_of(primary);
        assert_eq!(replicas.len(), 1, "{primary} has {replicas:?}");
        assert_ne!(replicas[0].host, primary.host, "{primary} is replicated on its own host");
    }
}

// -- replica placement --

#[tokio::test]
async fn balanced_replicas_avoid_their_primary_host() {
    let (fake, p) = one_primary_per_host();
    let (_, new) = spawn_all(&fake, &[("a", 7001), ("b", 7001), ("c", 7001)]);
    let mut cluster = connect(&fake, &p[0]).await;

    let attached = cluster.add_replicas_balanced(&new, None, false).await.unwrap();

    assert_eq!(attached.len(), 3);
    for a in &attached {
        assert_ne!(a.replica.host, a.primary.host);
    }
    assert_one_offhost_replica_each(&fake, &p);
}

#[tokio::test]
async fn preview_changes_nothing() {
    let (fake, p) = one_primary_per_host();
    let (_, new) = spawn_all(&fake, &[("a", 7001), ("b", 7001), ("c", 7001)]);
    let cluster = connect(&fake, &p[0]).await;
    fake.clear_log();

    let preview = cluster.preview_replicas(&new, None).await.unwrap();

    assert_eq!(preview.before.replica_count(), 0);
    assert_eq!(preview.after.replica_count(), 3);
    assert_eq!(fake.count_ops("replicate"), 0);
    assert_eq!(fake.count_ops("meet"), 0);
}

#[tokio::test]
async fn shortfall_is_reported_per_host() {
    let (fake, p) = one_primary_per_host();
    let (_, new) = spawn_all(&fake, &[("a", 7001), ("a", 7002)]);
    let cluster = connect(&fake, &p[0]).await;

    let err = cluster.preview_replicas(&new, None).await.unwrap_err();

    match err {
        ClusterError::Placement(PlacementError::MissingReplicas(missing)) => {
            assert_eq!(missing, vec![("a".to_owned(), 1)]);
        }
        other => panic!("expected a shortfall, got {other}"),
    }
}

// -- moving primaries --

fn two_hosts_two_primaries_each() -> (FakeCluster, Vec<NodeAddr>) {
    FakeCluster::with_primaries(&[("a", 7000), ("a", 7001), ("b", 7000), ("b", 7001)])
}

#[tokio::test]
async fn primary_moves_onto_new_host() {
    let (fake, p) = two_hosts_two_primaries_each();
    let (c, new) = spawn_all(&fake, &[("c", 7000)]);
    let mut cluster = connect(&fake, &p[0]).await;

    let preview = cluster.preview_master_moves(&new).await.unwrap();
    assert_eq!(preview.after.primary_count(), 4);

    let promoted = cluster.move_masters(&new, false).await.unwrap();

    assert_eq!(promoted, c);
    assert!(fake.state(&c[0]).is_primary());
    assert!(fake.slot_count(&c[0]) > 0);
    let demoted: Vec<&NodeAddr> = p.iter().filter(|a| !fake.state(a).is_primary()).collect();
    assert_eq!(demoted.len(), 1);
    assert_eq!(fake.primary_of(demoted[0]), Some(c[0].clone()));
    cluster.wait().await.unwrap();
}

#[tokio::test]
async fn ignored_takeover_is_retried() {
    let (fake, p) = two_hosts_two_primaries_each();
    let (c, new) = spawn_all(&fake, &[("c", 7000)]);
    fake.ignore_failovers(&c[0], 1);
    let mut cluster = connect(&fake, &p[0]).await;

    let promoted = cluster.move_masters(&new, true).await.unwrap();

    assert_eq!(promoted, c);
    assert_eq!(fake.count_ops("failover"), 2);
}

#[tokio::test]
async fn without_free_nodes_nothing_moves() {
    let (fake, p) = two_hosts_two_primaries_each();
    let mut cluster = connect(&fake, &p[0]).await;

    assert!(cluster.move_masters(&[], false).await.unwrap().is_empty());
    assert_eq!(fake.count_ops("replicate"), 0);
    assert_eq!(fake.count_ops("failover"), 0);
}

// -- rearranging --

#[tokio::test]
async fn rearrange_leaves_one_offhost_replica_per_primary() {
    let (fake, p) = one_primary_per_host();
    let cohosted = fake.add_replica("a", 7001, &p[0]);
    let (_, new) = spawn_all(&fake, &[("a", 7002), ("b", 7002), ("c", 7002)]);
    let mut cluster = connect(&fake, &p[0]).await;

    let preview = cluster.preview_rearrangement(&new).await.unwrap();
    assert_eq!(preview.after.replica_count(), 3);

    cluster.rearrange_replicas(&new, false).await.unwrap();

    assert_one_offhost_replica_each(&fake, &p);
    assert_eq!(fake.state(&cohosted).known.len(), 1);
    assert!(cluster.topology().get_by_addr(&cohosted).is_none());
}

#[tokio::test]
async fn fast_rearrange_deletes_first() {
    let (fake, p) = one_primary_per_host();
    let cohosted = fake.add_replica("a", 7001, &p[0]);
    let (new_addrs, new) = spawn_all(&fake, &[("a", 7002), ("b", 7002), ("c", 7002)]);
    let mut cluster = connect(&fake, &p[0]).await;

    cluster.rearrange_replicas(&new, true).await.unwrap();

    let reset = fake.position(&cohosted, "reset").unwrap();
    for addr in &new_addrs {
        assert!(fake.position(addr, "replicate").unwrap() > reset);
    }
    assert_one_offhost_replica_each(&fake, &p);
}
