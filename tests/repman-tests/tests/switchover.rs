use anyhow::Result;
use repman::cluster::{code, ClusterState};
use repman::Error;
use repman_tests::*;
use serial_test::serial;

fn operator_error(e: &Error) -> String {
    match e {
        Error::Operator(msg) => msg.clone(),
        e => panic!("unexpected error: {e}"),
    }
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn switchover_to_preferred_target() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.world.write(&db(1), 4)?;

    let ticket = c.shared().switchover(Some(db(3)))?;
    c.tick().await;
    assert_eq!(ticket.await??, db(3));

    assert!(!env.world.read_only(&db(3)));
    assert!(env.world.read_only(&db(1)));
    assert_eq!(env.world.upstream(&db(1)), Some((db(3), true)));
    assert_eq!(env.world.upstream(&db(2)), Some((db(3), true)));

    env.world.write(&db(3), 2)?;
    for i in 1..=3 {
        assert_eq!(env.world.executed(&db(i)), env.world.executed(&db(3)));
    }

    let st = tick_until(&mut c, 3, |st| st.state == ClusterState::Monitor).await?;
    assert_eq!(st.elected_primary, Some(db(3)));
    let recs = env.crash_records().await?;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].old_primary, db(1));
    assert_eq!(recs[0].elected_primary, Some(db(3)));
    eventually(|| env.metrics.snapshot("c1").switchovers == 1).await?;
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn switchover_elects_when_no_preference() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut config = env.config();
    config.servers[2].rank = -1;
    let mut c = monitor(&env, 1, config).await?;

    let ticket = c.shared().switchover(None)?;
    c.tick().await;
    assert_eq!(ticket.await??, db(3));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn switchover_on_mysql_with_auto_position() -> Result<()> {
    let env = Builder::new()
        .flavor(Flavor::MySql { gtid: true })
        .build()
        .await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.world.write(&db(1), 3)?;

    let ticket = c.shared().switchover(Some(db(2)))?;
    c.tick().await;
    assert_eq!(ticket.await??, db(2));
    assert_eq!(env.world.upstream(&db(1)), Some((db(2), true)));

    env.world.write(&db(2), 3)?;
    assert_eq!(env.world.executed(&db(1)), env.world.executed(&db(2)));
    assert_eq!(env.world.executed(&db(3)), env.world.executed(&db(2)));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn only_one_switchover_at_a_time() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    let shared = c.shared();

    let first = shared.switchover(None)?;
    let e = shared.switchover(None).unwrap_err();
    assert!(matches!(Error::find(&e), Some(Error::Busy(_))));

    c.tick().await;
    first.await??;
    // Accepted again once the first one completed.
    let third = shared.switchover(Some(db(1)))?;
    tick_until(&mut c, 3, |st| st.state == ClusterState::Monitor).await?;
    c.tick().await;
    assert_eq!(third.await??, db(1));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn ineligible_target_is_rejected() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut config = env.config();
    config.servers[2].ignored = true;
    let mut c = monitor(&env, 1, config).await?;

    let ticket = c.shared().switchover(Some(db(3)))?;
    c.tick().await;
    let e = ticket.await?.unwrap_err();
    assert!(operator_error(&e).contains("not an eligible"));

    let st = c.shared().status();
    assert_eq!(st.state, ClusterState::Monitor);
    assert_eq!(st.elected_primary, Some(db(1)));
    assert!(!env.world.read_only(&db(1)));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn long_writes_block_switchover() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.world.set_long_writes(&db(1), 2);

    let ticket = c.shared().switchover(None)?;
    c.tick().await;
    let e = ticket.await?.unwrap_err();
    assert!(operator_error(&e).contains("long running writes"));
    assert!(!env.world.ops(&db(1)).contains(&"set_read_only".to_owned()));
    assert!(env.crash_records().await?.is_empty());
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn failed_catch_up_gives_writes_back() -> Result<()> {
    let env = Builder::new().build().await?;
    let mut c = monitor(&env, 1, env.config()).await?;
    env.world
        .fail(&db(2), "wait_gtid", Error::runtime(1317, "query interrupted"), 1);

    let ticket = c.shared().switchover(Some(db(3)))?;
    c.tick().await;
    let e = ticket.await?.unwrap_err();
    assert!(operator_error(&e).contains("switchover aborted"));

    // The old primary was frozen and is writable again.
    assert!(env.world.ops(&db(1)).contains(&"set_read_only".to_owned()));
    assert!(!env.world.read_only(&db(1)));
    env.world.write(&db(1), 1)?;
    assert_eq!(env.world.upstream(&db(3)), Some((db(1), true)));

    let st = c.shared().status();
    assert_eq!(st.state, ClusterState::Monitor);
    assert_eq!(st.elected_primary, Some(db(1)));
    assert!(open_codes(&c).contains(&code::SWITCHOVER_ABORTED.to_owned()));
    assert!(env.crash_records().await?.is_empty());
    Ok(())
}
