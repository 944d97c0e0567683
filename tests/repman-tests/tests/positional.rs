use anyhow::Result;
use repman::cluster::{code, ClusterState};
use repman::journal::Marker;
use repman::replication::ReplicationMutator;
use repman_tests::*;
use serial_test::serial;

/// Without GTIDs, replicas are moved by matching pseudo-GTID tokens.
#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn failover_by_pseudo_gtid() -> Result<()> {
    let env = Builder::new()
        .flavor(Flavor::MySql { gtid: false })
        .build()
        .await?;
    let mut config = env.config();
    config.servers[1].rank = -1;
    let mut c = monitor(&env, 1, config).await?;

    env.world.write(&db(1), 2)?;
    env.instance(&db(1)).inject_pseudo_gtid("6b1f0c2e").await?;
    env.world.write(&db(1), 2)?;
    env.world.partition(&db(1), &db(3), true);
    env.world.write(&db(1), 3)?;
    assert_eq!(env.world.data_events(&db(3)).len(), 5);
    env.world.kill(&db(1));

    let st = tick_until(&mut c, 10, |st| {
        st.state == ClusterState::Monitor && st.elected_primary == Some(db(2))
    })
    .await?;
    assert!(st.servers.iter().all(|s| !s.orphan));
    assert_eq!(env.world.upstream(&db(3)), Some((db(2), true)));
    // db3 resumed right after the last event it had applied.
    assert_eq!(env.world.data_events(&db(3)), env.world.data_events(&db(2)));

    let recs = env.crash_records().await?;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].new_binlog_file, BINLOG);
    assert!(recs[0].new_binlog_pos > 0);

    env.world.restart(&db(1));
    tick_until(&mut c, 5, |_| env.world.upstream(&db(1)).is_some()).await?;
    env.world.write(&db(2), 2)?;
    for i in 1..=3 {
        assert_eq!(env.world.data_events(&db(i)), env.world.data_events(&db(2)));
    }
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn replica_without_token_is_orphaned() -> Result<()> {
    let env = Builder::new()
        .flavor(Flavor::MySql { gtid: false })
        .build()
        .await?;
    let mut config = env.config();
    config.servers[1].rank = -1;
    let mut c = monitor(&env, 1, config).await?;

    env.world.write(&db(1), 2)?;
    env.world.kill(&db(1));

    let st = tick_until(&mut c, 10, |st| st.elected_primary == Some(db(2))).await?;
    let view = st.servers.iter().find(|s| s.endpoint == db(3)).unwrap();
    assert!(view.orphan);
    let recs = env.crash_records().await?;
    assert_eq!(recs[0].orphans, vec![db(3)]);
    assert!(recs[0].warnings.iter().any(|w| w.contains("pseudo-GTID")));
    Ok(())
}

/// Rows the old primary logged after its replicas lost it make it divergent
/// even though no GTID tells them apart.
#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn old_primary_written_past_read_position_is_not_rejoined() -> Result<()> {
    let env = Builder::new()
        .flavor(Flavor::MySql { gtid: false })
        .build()
        .await?;
    let mut config = env.config();
    config.servers[1].rank = -1;
    let mut c = monitor(&env, 1, config).await?;

    env.world.write(&db(1), 2)?;
    env.world.partition(&db(1), &db(2), true);
    env.world.partition(&db(1), &db(3), true);
    env.world.write(&db(1), 3)?;
    assert_eq!(env.world.data_events(&db(2)).len(), 2);
    env.world.kill(&db(1));
    tick_until(&mut c, 10, |st| st.elected_primary == Some(db(2))).await?;

    let recs = env.crash_records().await?;
    assert!(recs[0].old_binlog_pos > 0);

    env.world.restart(&db(1));
    let st = tick_until(&mut c, 5, |st| {
        st.servers
            .iter()
            .any(|s| s.endpoint == db(1) && s.needs_manual_intervention)
    })
    .await?;
    assert_eq!(st.elected_primary, Some(db(2)));
    assert_eq!(env.world.upstream(&db(1)), None);
    assert!(!env.world.ops(&db(1)).contains(&"change_primary".to_owned()));

    let recs = env.crash_records().await?;
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[1].old_primary, db(1));
    assert_eq!(recs[1].marker, Some(Marker::Divergent));
    assert!(recs[1].warnings.iter().any(|w| w.contains("3 events")));

    ticks(&mut c, 2).await;
    assert!(open_codes(&c).contains(&code::MANUAL_INTERVENTION.to_owned()));
    Ok(())
}
