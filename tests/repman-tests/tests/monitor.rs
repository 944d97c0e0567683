use anyhow::Result;
use repman::bus::EventBody;
use repman::cluster::{code, ClusterState};
use repman::journal::Marker;
use repman::replication::ReplicationMutator;
use repman::topology::{Role, Shape};
use repman::Error;
use repman_tests::*;
use serial_test::serial;

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn discovers_the_primary() -> Result<()> {
    let env = Builder::new().build().await?;
    let c = monitor(&env, 1, env.config()).await?;

    let st = c.shared().status();
    assert_eq!(st.shape, Shape::SingleTier);
    assert_eq!(st.lease_holder_uid, Some(1));
    assert_eq!(st.servers.len(), 3);
    for s in &st.servers {
        assert!(s.reachable);
        let role = if s.endpoint == db(1) {
            Role::Primary
        } else {
            Role::Replica
        };
        assert_eq!(s.role, role);
    }
    assert!(st.open_states.is_empty(), "{:?}", st.open_states);
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn durability_settings_are_enforced() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut config = env.config();
    config.force.sync_binlog = true;
    let mut c = monitor(&env, 1, config).await?;

    env.world.set_sync_binlog(&db(2), false);
    c.tick().await;
    assert!(env.world.ops(&db(2)).contains(&"set_sync_binlog".to_owned()));
    let before = env.world.ops(&db(2)).len();
    ticks(&mut c, 2).await;
    // Nothing left to correct.
    let after = env.world.ops(&db(2));
    assert!(!after[before..].contains(&"set_sync_binlog".to_owned()));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn writable_replica_is_made_read_only() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;

    env.instance(&db(2)).set_read_only(false).await?;
    assert!(!env.world.read_only(&db(2)));
    c.tick().await;
    assert!(env.world.read_only(&db(2)));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn detached_server_writes_one_suspect_record() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;

    env.world.detach(&db(3));
    c.tick().await;
    assert_eq!(c.state(), ClusterState::Suspect);
    // The primary is fine, so the cluster goes back to watching.
    tick_until(&mut c, 3, |st| st.state == ClusterState::Monitor).await?;
    ticks(&mut c, 3).await;
    assert_eq!(c.state(), ClusterState::Monitor);
    assert!(open_codes(&c).contains(&"ERR00022".to_owned()));

    let recs = env.crash_records().await?;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].marker, Some(Marker::Suspect));
    assert_eq!(recs[0].old_primary, db(1));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn write_between_reads_is_not_a_replica_ahead() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;

    // Replicas read after the primary see a transaction the primary's
    // snapshot does not hold yet.
    env.world.write_after(&db(1), "gtid_sets", 20);
    ticks(&mut c, 6).await;

    let st = c.shared().status();
    assert_eq!(st.state, ClusterState::Monitor, "{}", st.reason);
    assert!(st.servers.iter().all(|s| !s.diverged));
    assert!(!open_codes(&c).contains(&"ERR00024".to_owned()));
    assert!(env.crash_records().await?.is_empty());
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn frozen_cluster_takes_no_action() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    let shared = c.shared();

    shared.freeze();
    c.tick().await;
    assert_eq!(c.state(), ClusterState::Frozen);
    env.world.kill(&db(1));
    ticks(&mut c, 5).await;
    let st = shared.status();
    assert_eq!(st.state, ClusterState::Frozen);
    assert_eq!(st.elected_primary, Some(db(1)));
    assert!(open_codes(&c).contains(&code::FROZEN.to_owned()));

    let ticket = shared.switchover(None)?;
    c.tick().await;
    assert!(matches!(ticket.await?, Err(Error::Operator(_))));

    shared.unfreeze();
    let st = tick_until(&mut c, 10, |st| st.elected_primary == Some(db(2))).await?;
    assert_eq!(st.failover_count, 1);
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn transitions_are_published_in_order() -> Result<()> {
    let env = Builder::new().with_logging(false).build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    let watch = env.watch();
    env.world.kill(&db(1));
    tick_until(&mut c, 10, |st| {
        st.state == ClusterState::Monitor && st.elected_primary == Some(db(2))
    })
    .await?;

    let events = drain(&watch).await;
    let path: Vec<ClusterState> = events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::Transition { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        path,
        vec![
            ClusterState::Suspect,
            ClusterState::Failover,
            ClusterState::Rejoin,
            ClusterState::Monitor
        ]
    );
    assert!(events.iter().any(|e| matches!(
        &e.body,
        EventBody::PrimaryChanged { new, .. } if new == &db(2)
    )));
    assert!(events
        .iter()
        .any(|e| matches!(&e.body, EventBody::CrashRecorded { marker: None, .. })));
    assert!(events.iter().all(|e| e.cluster == "c1"));
    Ok(())
}
