use anyhow::Result;
use repman::cluster::{code, ClusterState};
use repman_tests::*;
use serial_test::serial;

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn two_managers_fail_over_once() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut a = env.manager(1, env.config()).await?;
    let mut b = env.manager(2, env.config()).await?;
    for _ in 0..2 {
        a.tick().await;
        b.tick().await;
    }
    assert_eq!(a.state(), ClusterState::Monitor);
    assert_eq!(b.state(), ClusterState::Monitor);

    env.world.write(&db(1), 3)?;
    env.world.kill(&db(1));
    for _ in 0..10 {
        a.tick().await;
        b.tick().await;
    }

    let sa = a.shared().status();
    let sb = b.shared().status();
    assert_eq!(sa.state, ClusterState::Monitor);
    assert_eq!(sb.state, ClusterState::Monitor);
    assert_eq!(sa.elected_primary, Some(db(2)));
    assert_eq!(sb.elected_primary, Some(db(2)));
    assert_eq!(sa.failover_count + sb.failover_count, 1);

    let recs = env.crash_records().await?;
    assert_eq!(recs.len(), 1);
    eventually(|| env.router.changes().len() == 1).await?;
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn one_lease_holder_at_a_time() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut a = env.manager(1, env.config()).await?;
    let mut b = env.manager(2, env.config()).await?;
    for _ in 0..3 {
        a.tick().await;
        b.tick().await;
        let holders = [a.arbitrator(), b.arbitrator()];
        for x in holders {
            // Both read the same rows.
            assert_eq!(x.lease_holder().await?, Some(2));
        }
    }
    a.shutdown().await;
    b.shutdown().await;
    assert_eq!(a.arbitrator().lease_holder().await?, None);
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn unreachable_store_blocks_failover() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.store.set_down(true);
    env.world.kill(&db(1));

    ticks(&mut c, 6).await;
    let st = c.shared().status();
    assert_eq!(st.state, ClusterState::Suspect);
    assert_eq!(st.elected_primary, Some(db(1)));
    assert_eq!(st.lease_holder_uid, None);
    assert!(open_codes(&c).contains(&code::NO_LEASE.to_owned()));
    assert!(env.crash_records().await?.is_empty());
    assert_eq!(env.world.upstream(&db(2)).map(|x| x.0), Some(db(1)));

    env.store.set_down(false);
    tick_until(&mut c, 3, |st| st.elected_primary == Some(db(2))).await?;
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn unreachable_store_with_live_primary_keeps_it() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.store.set_down(true);
    env.world.hide(&db(1), true);

    tick_until(&mut c, 5, |st| st.state == ClusterState::Suspect).await?;
    ticks(&mut c, 3).await;
    assert_eq!(c.state(), ClusterState::Suspect);

    env.world.hide(&db(1), false);
    env.store.set_down(false);
    let st = tick_until(&mut c, 3, |st| st.state == ClusterState::Monitor).await?;
    assert_eq!(st.elected_primary, Some(db(1)));
    assert!(!env.world.read_only(&db(1)));
    assert!(env.crash_records().await?.is_empty());
    Ok(())
}
