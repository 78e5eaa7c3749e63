//! Rebalancing, draining and filling slots.

use shardctl_cluster::{NodeAddr, ReshardOutcome, SLOT_COUNT};

use crate::helpers::{connect, keys_in, member, FakeCluster};

fn uneven() -> (FakeCluster, Vec<NodeAddr>) {
    let fake = FakeCluster::new();
    let p = fake.with_layout(&[
        (("a", 7000), 0..3),
        (("b", 7000), 3..9),
        (("c", 7000), 9..12),
    ]);
    (fake, p)
}

// -- reshard --

#[tokio::test]
async fn three_six_three_evens_out() {
    let (fake, p) = uneven();
    let cluster = connect(&fake, &p[0]).await;

    let ReshardOutcome::Applied(moves) = cluster.reshard().await.unwrap() else {
        panic!("consistent cluster was skipped");
    };

    for addr in &p {
        assert_eq!(fake.slot_count(addr), 4, "{addr}");
    }
    assert!(moves.iter().all(|t| t.from == p[1]));
    assert_eq!(moves.iter().map(|t| t.count).sum::<usize>(), 2);
}

#[tokio::test]
async fn balanced_cluster_moves_nothing() {
    let fake = FakeCluster::new();
    let p = fake.with_layout(&[(("a", 7000), 0..4), (("b", 7000), 4..8)]);
    let cluster = connect(&fake, &p[0]).await;

    assert_eq!(cluster.reshard().await.unwrap(), ReshardOutcome::Applied(Vec::new()));
    assert_eq!(fake.count_ops("setslot"), 0);
}

#[tokio::test]
async fn disagreeing_views_skip_reshard() {
    let (fake, p) = uneven();
    let cluster = connect(&fake, &p[0]).await;
    fake.forget_locally(&p[0], &p[2]);

    assert_eq!(cluster.reshard().await.unwrap(), ReshardOutcome::Skipped);
    assert_eq!(fake.count_ops("setslot"), 0);
    assert_eq!(fake.slot_count(&p[1]), 6);
}

#[tokio::test]
async fn one_flipped_owner_breaks_consistency() {
    let (fake, p) = uneven();
    let cluster = connect(&fake, &p[0]).await;
    assert!(cluster.topology().consistent().await.unwrap());

    // b alone thinks slot 0 moved to c
    fake.believe_owner(&p[1], 0, &p[2]);

    assert!(!cluster.topology().consistent().await.unwrap());
    assert_eq!(cluster.reshard().await.unwrap(), ReshardOutcome::Skipped);
    assert_eq!(fake.count_ops("setslot"), 0);
}

#[tokio::test]
async fn keys_follow_their_slots() {
    let (fake, p) = uneven();
    let keys = keys_in(3..9, 20);
    fake.put_keys(keys.iter().map(String::as_str));
    let cluster = connect(&fake, &p[0]).await;

    cluster.reshard().await.unwrap();

    let total: usize = p.iter().map(|a| fake.keys_on(a)).sum();
    assert_eq!(total, 20);
    for key in &keys {
        let slot = shardctl_cluster::key_slot(key.as_bytes());
        let owner = fake.owner_of(slot).unwrap();
        assert!(fake.state(&owner).keys.iter().any(|k| k.as_ref() == key.as_bytes()));
    }
}

// -- one node --

#[tokio::test]
async fn drain_empties_node() {
    let fake = FakeCluster::new();
    let p = fake.with_layout(&[
        (("a", 7000), 0..6),
        (("b", 7000), 6..12),
        (("c", 7000), 12..18),
    ]);
    let cluster = connect(&fake, &p[0]).await;

    let moves = cluster
        .migrate_node(&member(&cluster, &p[0]), None, false)
        .await
        .unwrap();

    assert_eq!(fake.slot_count(&p[0]), 0);
    assert_eq!(fake.slot_count(&p[1]) + fake.slot_count(&p[2]), 18);
    assert_eq!(moves.iter().map(|t| t.count).sum::<usize>(), 6);
    assert!(moves.iter().all(|t| t.from == p[0]));
}

#[tokio::test]
async fn drain_with_count_is_partial() {
    let fake = FakeCluster::new();
    let p = fake.with_layout(&[(("a", 7000), 0..6), (("b", 7000), 6..12)]);
    let cluster = connect(&fake, &p[0]).await;

    cluster
        .migrate_node(&member(&cluster, &p[0]), Some(2), false)
        .await
        .unwrap();

    assert_eq!(fake.slot_count(&p[0]), 4);
    assert_eq!(fake.slot_count(&p[1]), 8);
}

#[tokio::test]
async fn income_takes_fair_share() {
    let fake = FakeCluster::new();
    let p = fake.with_layout(&[
        (("a", 7000), 0..6),
        (("b", 7000), 6..12),
        (("d", 7000), 0..0),
    ]);
    let cluster = connect(&fake, &p[0]).await;

    let moves = cluster
        .migrate_node(&member(&cluster, &p[2]), None, true)
        .await
        .unwrap();

    assert_eq!(fake.slot_count(&p[2]), 4);
    assert!(moves.iter().all(|t| t.to == p[2]));
    assert_eq!(fake.slot_count(&p[0]) + fake.slot_count(&p[1]), 8);
}

#[tokio::test]
async fn lone_primary_cannot_drain() {
    let fake = FakeCluster::new();
    let p = fake.with_layout(&[(("a", 7000), 0..6)]);
    fake.add_replica("b", 7000, &p[0]);
    let cluster = connect(&fake, &p[0]).await;

    assert!(cluster
        .migrate_node(&member(&cluster, &p[0]), None, false)
        .await
        .is_err());
    assert_eq!(fake.slot_count(&p[0]), 6);
}

// -- coverage --

#[tokio::test]
async fn fill_covers_every_slot_fewest_first() {
    let fake = FakeCluster::new();
    let p = fake.with_layout(&[(("a", 7000), 0..4), (("b", 7000), 4..6)]);
    let cluster = connect(&fake, &p[0]).await;

    let filled = cluster.fill_slots().await.unwrap();

    assert_eq!(filled, SLOT_COUNT as usize - 6);
    assert!(cluster.topology().missing_slots().await.unwrap().is_empty());
    // b had fewer slots, so it took the first chunk
    assert!(fake.state(&p[1]).slots.contains(&6));
    assert_eq!(fake.slot_count(&p[0]) + fake.slot_count(&p[1]), SLOT_COUNT as usize);
    cluster.wait().await.unwrap();
}

#[tokio::test]
async fn fill_on_full_cluster_is_noop() {
    let (fake, p) = FakeCluster::with_primaries(&[("a", 7000), ("b", 7000), ("c", 7000)]);
    let cluster = connect(&fake, &p[0]).await;
    assert_eq!(cluster.fill_slots().await.unwrap(), 0);
    assert_eq!(fake.count_ops("addslots"), 0);
}
