//! Joining, leaving and cluster-wide maintenance.

use std::time::Duration;

use shardctl_cluster::{
    Cluster, ClusterError, JoinRole, NewNode, NodeAddr, StopSignal, Topology, SLOT_COUNT,
};

use crate::helpers::{connect, fast_config, keys_in, member, FakeCluster};

fn three() -> (FakeCluster, Vec<NodeAddr>) {
    FakeCluster::with_primaries(&[("a", 7000), ("b", 7000), ("c", 7000)])
}

fn first_position(fake: &FakeCluster, op: &str) -> Option<usize> {
    fake.log().iter().position(|(_, o)| o == op)
}

// -- waiting --

#[tokio::test]
async fn wait_reports_missing_coverage() {
    let fake = FakeCluster::new();
    let p = fake.with_layout(&[(("a", 7000), 0..4), (("b", 7000), 4..8)]);
    let cluster = connect(&fake, &p[0]).await;

    match cluster.wait().await {
        Err(ClusterError::NotHealthy(problems)) => assert!(problems.contains("missing slots")),
        other => panic!("expected NotHealthy, got {other:?}"),
    }
}

#[tokio::test]
async fn wait_gives_up_at_deadline() {
    let (fake, p) = three();
    let mut config = fast_config();
    config.poll.timeout = Some(Duration::from_millis(30));
    let cluster = Cluster::connect(&fake.node(&p[0]), config, StopSignal::new())
        .await
        .unwrap();
    fake.forget_locally(&p[1], &p[2]);

    let err = cluster.wait().await.unwrap_err();
    assert!(matches!(err, ClusterError::Timeout { .. }), "{err}");
}

#[tokio::test]
async fn wait_stops_on_request() {
    let (fake, p) = three();
    let stop = StopSignal::new();
    let mut config = fast_config();
    config.poll.timeout = None;
    let cluster = Cluster::connect(&fake.node(&p[0]), config, stop.clone())
        .await
        .unwrap();
    fake.forget_locally(&p[1], &p[2]);

    let waiting = tokio::spawn(async move { cluster.wait().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    stop.request();

    let result = waiting.await.unwrap();
    assert!(matches!(result, Err(ClusterError::Stopped)));
}

// -- new node checks --

#[tokio::test]
async fn nodes_with_data_are_rejected() {
    let (fake, p) = three();
    let x = fake.spawn("x", 7000);
    fake.put_key_on(&x, "leftover");

    let err = Cluster::check_new_nodes(&[fake.node(&x)], &[fake.node(&p[0])])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not empty"), "{err}");
}

#[tokio::test]
async fn nodes_already_clustered_are_rejected() {
    let fake = FakeCluster::new();
    let x = fake.spawn("x", 7000);
    let y = fake.spawn("y", 7000);
    fake.node(&x).meet(&fake.node(&y)).await.unwrap();

    let err = Cluster::check_new_nodes(&[fake.node(&x)], &[]).await.unwrap_err();
    assert!(err.to_string().contains("already knows 1 other"), "{err}");
}

#[tokio::test]
async fn mixed_versions_are_rejected() {
    let (fake, p) = three();
    let x = fake.spawn("x", 7000);
    fake.set_version(&x, "6.2.14");

    let err = Cluster::check_new_nodes(&[fake.node(&x)], &[fake.node(&p[0])])
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("mixed server versions"), "{msg}");
    assert!(msg.contains("6.2.14 on x:7000"), "{msg}");
}

// -- adding --

#[tokio::test]
async fn add_primary_and_named_replica() {
    let (fake, p) = three();
    let d = fake.spawn("d", 7000);
    let e = fake.spawn("e", 7000);
    let mut cluster = connect(&fake, &p[0]).await;

    cluster
        .add_nodes(vec![
            NewNode {
                node: fake.node(&d),
                role: JoinRole::Primary,
            },
            NewNode {
                node: fake.node(&e),
                role: JoinRole::Replica {
                    primary: Some(fake.name_of(&p[1])),
                },
            },
        ])
        .await
        .unwrap();

    assert_eq!(cluster.topology().len(), 5);
    assert!(fake.state(&p[0]).known.contains(&fake.name_of(&d)));
    assert!(fake.state(&d).is_primary());
    assert_eq!(fake.slot_count(&d), 0);
    assert_eq!(fake.primary_of(&e), Some(p[1].clone()));
}

#[tokio::test]
async fn unnamed_replica_goes_to_least_replicated() {
    let (fake, p) = three();
    fake.add_replica("x", 7000, &p[0]);
    fake.add_replica("x", 7001, &p[1]);
    let r = fake.spawn("y", 7000);
    let mut cluster = connect(&fake, &p[0]).await;

    cluster
        .add_nodes(vec![NewNode {
            node: fake.node(&r),
            role: JoinRole::Replica { primary: None },
        }])
        .await
        .unwrap();

    assert_eq!(fake.primary_of(&r), Some(p[2].clone()));
}

#[tokio::test]
async fn replicas_sync_one_per_host() {
    let (fake, p) = three();
    fake.set_sync_polls(2);
    let x1 = fake.spawn("x", 7001);
    let x2 = fake.spawn("x", 7002);
    let y1 = fake.spawn("y", 7001);
    let mut cluster = connect(&fake, &p[0]).await;

    let attached = cluster
        .add_replicas(
            vec![
                (fake.node(&x1), fake.name_of(&p[0])),
                (fake.node(&x2), fake.name_of(&p[1])),
                (fake.node(&y1), fake.name_of(&p[2])),
            ],
            false,
        )
        .await
        .unwrap();

    assert_eq!(attached.len(), 3);
    assert_eq!(fake.primary_of(&x2), Some(p[1].clone()));

    let x1_synced = fake.position(&x1, "role connected").unwrap();
    // the second node on host x waits for the first to finish syncing
    assert!(fake.position(&x2, "replicate").unwrap() > x1_synced);
    // host y doesn't
    assert!(fake.position(&y1, "replicate").unwrap() < x1_synced);
}

#[tokio::test]
async fn fast_replicas_start_together() {
    let (fake, p) = three();
    fake.set_sync_polls(2);
    let x1 = fake.spawn("x", 7001);
    let x2 = fake.spawn("x", 7002);
    let mut cluster = connect(&fake, &p[0]).await;

    cluster
        .add_replicas(
            vec![
                (fake.node(&x1), fake.name_of(&p[0])),
                (fake.node(&x2), fake.name_of(&p[1])),
            ],
            true,
        )
        .await
        .unwrap();

    let first_synced = first_position(&fake, "role connected").unwrap();
    assert!(fake.position(&x2, "replicate").unwrap() < first_synced);
}

#[tokio::test]
async fn stop_before_replicas_start() {
    let (fake, p) = three();
    let x1 = fake.spawn("x", 7001);
    let stop = StopSignal::new();
    let mut cluster = Cluster::connect(&fake.node(&p[0]), fast_config(), stop.clone())
        .await
        .unwrap();
    stop.request();

    let err = cluster
        .add_replicas(vec![(fake.node(&x1), fake.name_of(&p[0]))], false)
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::Stopped));
    assert_eq!(fake.count_ops("meet"), 0);
    assert_eq!(fake.count_ops("replicate"), 0);
}

#[tokio::test]
async fn replicate_repoints_member() {
    let (fake, p) = three();
    let r = fake.add_replica("x", 7000, &p[0]);
    let mut cluster = connect(&fake, &p[0]).await;

    cluster
        .replicate(&member(&cluster, &r), &fake.name_of(&p[2]))
        .await
        .unwrap();

    assert_eq!(fake.primary_of(&r), Some(p[2].clone()));
}

#[tokio::test]
async fn replicate_adds_outsider() {
    let (fake, p) = three();
    let r = fake.spawn("x", 7000);
    let mut cluster = connect(&fake, &p[0]).await;

    cluster
        .replicate(&fake.node(&r), &fake.name_of(&p[1]))
        .await
        .unwrap();

    assert_eq!(fake.primary_of(&r), Some(p[1].clone()));
    assert!(cluster.topology().get_by_addr(&r).is_some());
}

#[tokio::test]
async fn replicate_unknown_primary() {
    let (fake, p) = three();
    let r = fake.add_replica("x", 7000, &p[0]);
    let mut cluster = connect(&fake, &p[0]).await;

    let err = cluster
        .replicate(&member(&cluster, &r), "no-such-node")
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::NodeNotFound(_)));
}

// -- removing --

#[tokio::test]
async fn delete_primary_hands_off_slots_keys_and_replicas() {
    let fake = FakeCluster::new();
    let p = fake.with_layout(&[
        (("a", 7000), 0..6),
        (("b", 7000), 6..12),
        (("c", 7000), 12..18),
    ]);
    let r = fake.add_replica("b", 7001, &p[0]);
    let keys = keys_in(0..6, 5);
    fake.put_keys(keys.iter().map(String::as_str));
    let old_name = fake.name_of(&p[0]);
    let mut cluster = connect(&fake, &p[0]).await;

    let doomed = member(&cluster, &p[0]);
    cluster.delete_node(&doomed).await.unwrap();

    // each survivor takes half of the departed primary's slots
    assert_eq!(fake.slot_count(&p[1]), 9);
    assert_eq!(fake.slot_count(&p[2]), 9);
    assert_eq!(fake.keys_on(&p[1]) + fake.keys_on(&p[2]), 5);
    let new_primary = fake.primary_of(&r).unwrap();
    assert!(new_primary == p[1] || new_primary == p[2]);

    for addr in [&p[1], &p[2], &r] {
        assert!(!fake.state(addr).known.contains(&old_name), "{addr} still knows it");
    }
    let gone = fake.state(&p[0]);
    assert_ne!(gone.name, old_name);
    assert_eq!(gone.known.len(), 1);
    assert!(cluster.topology().get_by_addr(&p[0]).is_none());
}

#[tokio::test]
async fn delete_refuses_primary_with_open_slot() {
    let (fake, p) = three();
    let r = fake.add_replica("x", 7000, &p[0]);
    fake.mark_migrating(&p[0], 0, &p[1]);
    let name = fake.name_of(&p[0]);
    let mut cluster = connect(&fake, &p[0]).await;

    let doomed = member(&cluster, &p[0]);
    let err = cluster.delete_node(&doomed).await.unwrap_err();

    assert!(matches!(err, ClusterError::Precondition(ref msg) if msg.contains("open slots 0")), "{err}");
    assert_eq!(fake.owner_of(0), Some(p[0].clone()));
    assert_eq!(fake.count_ops("setslot"), 0);
    assert_eq!(fake.count_ops("forget"), 0);
    assert_eq!(fake.primary_of(&r), Some(p[0].clone()));
    for addr in &p[1..] {
        assert!(fake.state(addr).known.contains(&name));
    }
}

#[tokio::test]
async fn delete_stops_when_a_slot_cannot_leave() {
    let fake = FakeCluster::new();
    let p = fake.with_layout(&[
        (("a", 7000), 0..6),
        (("b", 7000), 6..12),
        (("c", 7000), 12..18),
    ]);
    // both possible destinations are busy importing slot 0 already
    fake.mark_importing(&p[1], 0, &p[0]);
    fake.mark_importing(&p[2], 0, &p[0]);
    let name = fake.name_of(&p[0]);
    let mut cluster = connect(&fake, &p[0]).await;

    let doomed = member(&cluster, &p[0]);
    let err = cluster.delete_node(&doomed).await.unwrap_err();

    assert!(matches!(err, ClusterError::Precondition(ref msg) if msg.contains("still owns slots 0")), "{err}");
    assert_eq!(fake.owner_of(0), Some(p[0].clone()));
    assert_eq!(fake.count_ops("forget"), 0);
    assert_eq!(fake.count_ops("reset"), 0);
    for addr in &p[1..] {
        assert!(fake.state(addr).known.contains(&name));
    }
    assert!(cluster.topology().get_by_addr(&p[0]).is_some());
}

#[tokio::test]
async fn delete_replica() {
    let (fake, p) = three();
    let r = fake.add_replica("x", 7000, &p[0]);
    let name = fake.name_of(&r);
    let mut cluster = connect(&fake, &p[0]).await;

    let doomed = member(&cluster, &r);
    cluster.delete_node(&doomed).await.unwrap();

    assert_eq!(fake.count_ops("setslot"), 0);
    assert!(fake.replicas_of(&p[0]).is_empty());
    for addr in &p {
        assert!(!fake.state(addr).known.contains(&name));
    }
    cluster.wait().await.unwrap();
}

#[tokio::test]
async fn failed_lookup_keeps_working_set() {
    let (fake, p) = three();
    let mut topology = Topology::fetch(&fake.node(&p[0])).await.unwrap();
    let name = fake.name_of(&p[1]);
    topology.flush_all();
    fake.set_down(&p[2], true);

    assert!(topology.remove(&name).await.is_err());
    assert_eq!(topology.len(), 3);

    fake.set_down(&p[2], false);
    topology.remove(&name).await.unwrap();
    assert_eq!(topology.len(), 2);
    assert!(topology.get_by_addr(&p[1]).is_none());
}

// -- maintenance --

#[tokio::test]
async fn destroy_resets_every_member() {
    let (fake, p) = three();
    let r = fake.add_replica("x", 7000, &p[0]);
    fake.put_keys(keys_in(0..SLOT_COUNT, 10).iter().map(String::as_str));
    let cluster = connect(&fake, &p[0]).await;

    cluster.destroy().await.unwrap();

    for addr in p.iter().chain([&r]) {
        let state = fake.state(addr);
        assert_eq!(state.known.len(), 1, "{addr}");
        assert!(state.slots.is_empty());
        assert!(state.keys.is_empty());
        assert!(state.is_primary());
    }
}

#[tokio::test]
async fn flush_only_touches_primaries() {
    let (fake, p) = three();
    fake.add_replica("x", 7000, &p[0]);
    fake.put_keys(keys_in(0..SLOT_COUNT, 10).iter().map(String::as_str));
    let cluster = connect(&fake, &p[0]).await;

    cluster.flush_all().await.unwrap();

    assert_eq!(fake.count_ops("flushall"), 3);
    assert!(p.iter().all(|a| fake.keys_on(a) == 0));
}

#[tokio::test]
async fn reconfigure_every_member() {
    let (fake, p) = three();
    let r = fake.add_replica("x", 7000, &p[0]);
    let cluster = connect(&fake, &p[0]).await;

    cluster.reconfigure("maxmemory", "1gb", true).await.unwrap();

    for addr in p.iter().chain([&r]) {
        assert_eq!(fake.state(addr).config.get("maxmemory").map(String::as_str), Some("1gb"));
    }
    assert_eq!(fake.count_ops("config-rewrite"), 4);

    cluster.reconfigure("timeout", "0", false).await.unwrap();
    assert_eq!(fake.count_ops("config-rewrite"), 4);
}
