use anyhow::Result;
use repman::cluster::{code, ClusterState};
use repman::config::FailoverMode;
use repman::journal::Marker;
use repman::Error;
use repman_tests::*;
use serial_test::serial;

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn dead_primary_is_replaced() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.world.write(&db(1), 5)?;
    env.world.kill(&db(1));

    let st = tick_until(&mut c, 10, |st| {
        st.state == ClusterState::Monitor && st.elected_primary == Some(db(2))
    })
    .await?;
    assert_eq!(st.failover_count, 1);
    assert!(!env.world.read_only(&db(2)));
    assert_eq!(env.world.upstream(&db(2)), None);
    assert_eq!(env.world.upstream(&db(3)), Some((db(2), true)));

    // Nothing committed on the old primary is lost.
    env.world.write(&db(2), 3)?;
    assert_eq!(env.world.executed(&db(3)), env.world.executed(&db(2)));
    assert_eq!(transactions(&env.world.executed(&db(2))), 8);

    let recs = env.crash_records().await?;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].old_primary, db(1));
    assert_eq!(recs[0].elected_primary, Some(db(2)));
    assert_eq!(recs[0].marker, None);

    eventually(|| env.router.changes().len() == 1).await?;
    let change = &env.router.changes()[0];
    assert_eq!(change.old, Some(db(1)));
    assert_eq!(change.new, db(2));
    eventually(|| env.metrics.snapshot("c1").failovers == 1).await?;
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn most_advanced_replica_wins() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.world.write(&db(1), 2)?;
    env.world.partition(&db(1), &db(2), true);
    env.world.write(&db(1), 4)?;
    env.world.kill(&db(1));

    tick_until(&mut c, 10, |st| {
        st.state == ClusterState::Monitor && st.elected_primary == Some(db(3))
    })
    .await?;
    // The lagging replica follows the winner and receives what it missed.
    assert_eq!(env.world.upstream(&db(2)), Some((db(3), true)));
    assert_eq!(env.world.executed(&db(2)), env.world.executed(&db(3)));
    assert_eq!(transactions(&env.world.executed(&db(2))), 6);
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn old_primary_rejoins_after_restart() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.world.write(&db(1), 3)?;
    env.world.kill(&db(1));
    tick_until(&mut c, 10, |st| {
        st.state == ClusterState::Monitor && st.elected_primary == Some(db(2))
    })
    .await?;
    assert!(open_codes(&c).contains(&code::REJOIN_DEFERRED.to_owned()));

    env.world.restart(&db(1));
    tick_until(&mut c, 5, |_| env.world.upstream(&db(1)).is_some()).await?;
    assert_eq!(env.world.upstream(&db(1)), Some((db(2), true)));
    assert!(env.world.read_only(&db(1)));

    env.world.write(&db(2), 2)?;
    assert_eq!(env.world.executed(&db(1)), env.world.executed(&db(2)));
    let st = tick_until(&mut c, 5, |st| {
        st.state == ClusterState::Monitor
            && !st.open_states.iter().any(|x| x.code == code::REJOIN_DEFERRED)
    })
    .await?;
    let view = st.servers.iter().find(|s| s.endpoint == db(1)).unwrap();
    assert!(!view.needs_manual_intervention);
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn divergent_old_primary_is_left_to_the_operator() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.world.write(&db(1), 3)?;
    env.world.kill(&db(1));
    tick_until(&mut c, 10, |st| st.elected_primary == Some(db(2))).await?;

    // Committed on the old primary after the replicas lost it.
    env.world.errant_write(&db(1));
    env.world.restart(&db(1));
    let st = tick_until(&mut c, 5, |st| {
        st.servers
            .iter()
            .any(|s| s.endpoint == db(1) && s.needs_manual_intervention)
    })
    .await?;
    assert_eq!(st.elected_primary, Some(db(2)));
    assert_eq!(env.world.upstream(&db(1)), None);

    let recs = env.crash_records().await?;
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[1].old_primary, db(1));
    assert_eq!(recs[1].marker, Some(Marker::Divergent));
    assert!(!env.world.ops(&db(1)).contains(&"change_primary".to_owned()));

    ticks(&mut c, 2).await;
    assert!(open_codes(&c).contains(&code::MANUAL_INTERVENTION.to_owned()));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn primary_seen_by_replicas_is_not_failed_over() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.world.hide(&db(1), true);

    tick_until(&mut c, 5, |st| st.state == ClusterState::Suspect).await?;
    ticks(&mut c, 3).await;
    let st = c.shared().status();
    assert_eq!(st.state, ClusterState::Suspect);
    assert_eq!(st.elected_primary, Some(db(1)));
    assert!(open_codes(&c).contains(&code::FALSE_POSITIVE.to_owned()));
    assert!(!env.world.read_only(&db(1)));
    assert!(env.crash_records().await?.is_empty());

    env.world.hide(&db(1), false);
    tick_until(&mut c, 3, |st| st.state == ClusterState::Monitor).await?;
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn manual_mode_never_fails_over() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut config = env.config();
    config.failover_mode = FailoverMode::Manual;
    let mut c = monitor(&env, 1, config).await?;
    env.world.kill(&db(1));

    ticks(&mut c, 6).await;
    let st = c.shared().status();
    assert_eq!(st.state, ClusterState::Suspect);
    assert_eq!(st.elected_primary, Some(db(1)));
    assert!(open_codes(&c).contains(&code::MANUAL_MODE.to_owned()));
    assert_eq!(env.world.upstream(&db(2)).map(|x| x.0), Some(db(1)));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn failover_limit_is_honored() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut config = env.config();
    config.failover_limit = 1;
    let mut c = monitor(&env, 1, config).await?;
    env.world.kill(&db(1));
    tick_until(&mut c, 10, |st| {
        st.state == ClusterState::Monitor && st.elected_primary == Some(db(2))
    })
    .await?;
    env.world.restart(&db(1));
    tick_until(&mut c, 5, |_| env.world.upstream(&db(1)).is_some()).await?;

    env.world.kill(&db(2));
    ticks(&mut c, 6).await;
    let st = c.shared().status();
    assert_eq!(st.state, ClusterState::Suspect);
    assert_eq!(st.elected_primary, Some(db(2)));
    assert_eq!(st.failover_count, 1);
    assert!(open_codes(&c).contains(&code::FAILOVER_LIMIT.to_owned()));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn unreachable_replica_is_orphaned() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.world.write(&db(1), 2)?;
    env.world.kill(&db(3));
    env.world.kill(&db(1));

    let st = tick_until(&mut c, 10, |st| st.elected_primary == Some(db(2))).await?;
    let view = st.servers.iter().find(|s| s.endpoint == db(3)).unwrap();
    assert!(view.orphan);

    let recs = env.crash_records().await?;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].marker, Some(Marker::Partial));
    assert_eq!(recs[0].orphans, vec![db(3)]);
    eventually(|| env.metrics.snapshot("c1").orphans == 1).await?;

    ticks(&mut c, 1).await;
    assert!(open_codes(&c).contains(&code::ORPHAN.to_owned()));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn second_failover_waits_for_cooldown() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut config = env.config();
    config.cooldown_secs = 3600;
    let mut c = monitor(&env, 1, config).await?;
    env.world.kill(&db(1));
    tick_until(&mut c, 10, |st| {
        st.state == ClusterState::Monitor && st.elected_primary == Some(db(2))
    })
    .await?;

    env.world.kill(&db(2));
    ticks(&mut c, 6).await;
    let st = c.shared().status();
    assert_eq!(st.elected_primary, Some(db(2)));
    assert_eq!(st.failover_count, 1);
    assert!(open_codes(&c).contains(&code::COOLDOWN.to_owned()));
    assert_eq!(env.world.upstream(&db(3)), Some((db(2), true)));
    assert_eq!(env.crash_records().await?.len(), 1);
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn critical_fault_overrides_cooldown() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut config = env.config();
    config.cooldown_secs = 3600;
    // db3 keeps reading from db2, which only fails to answer the manager.
    config.false_positive_check = false;
    let mut c = monitor(&env, 1, config).await?;
    env.world.kill(&db(1));
    tick_until(&mut c, 10, |st| {
        st.state == ClusterState::Monitor && st.elected_primary == Some(db(2))
    })
    .await?;

    env.world.fail(&db(2), "ping", Error::runtime(1021, "disk full"), 1000);
    let st = tick_until(&mut c, 10, |st| {
        st.state == ClusterState::Monitor && st.elected_primary == Some(db(3))
    })
    .await?;
    assert_eq!(st.failover_count, 2);
    assert!(!env.world.read_only(&db(3)));
    let recs = env.crash_records().await?;
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[1].old_primary, db(2));
    assert_eq!(recs[1].elected_primary, Some(db(3)));
    Ok(())
}
