use anyhow::Result;
use repman::arbitration::ArbitrationStore;
use repman::bus::{EventBody, RouteObserver};
use repman::cluster::ClusterState;
use repman::config::{ManagerConfig, ManagerSection};
use repman::manager::ConnectorFactory;
use repman::replication::Connector;
use repman::{Endpoint, Error, Manager};
use repman_tests::*;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

async fn start(env: &Env) -> Result<Manager> {
    let config = ManagerConfig {
        manager: ManagerSection {
            uid: 7,
            crash_dir: env.crash_dir().to_owned(),
            heartbeat_ms: 100,
            ..Default::default()
        },
        clusters: vec![env.config()],
    };
    let world = env.world.clone();
    let connectors: ConnectorFactory =
        Arc::new(move |_| Arc::new(world.clone()) as Arc<dyn Connector>);
    let store: Arc<dyn ArbitrationStore> = env.store.clone();
    let router: Arc<dyn RouteObserver> = env.router.clone();
    Manager::start_with(config, store, connectors, Some(router)).await
}

fn state_of(m: &Manager) -> (ClusterState, Option<Endpoint>) {
    m.status("c1")
        .map(|r| (r.status.state, r.status.elected_primary))
        .unwrap_or((ClusterState::Frozen, None))
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn manager_fails_over_in_background() -> Result<()> {
    let env = Builder::new().build().await?;
    let m = start(&env).await?;
    assert_eq!(m.cluster_names(), vec!["c1".to_owned()]);
    eventually(|| state_of(&m) == (ClusterState::Monitor, Some(db(1)))).await?;
    assert_eq!(m.status("c1")?.status.lease_holder_uid, Some(7));

    env.world.kill(&db(1));
    eventually(|| state_of(&m) == (ClusterState::Monitor, Some(db(2)))).await?;
    assert_eq!(m.crash_records("c1").await?.len(), 1);
    eventually(|| m.status("c1").map(|r| r.counters.failovers == 1).unwrap_or(false)).await?;
    eventually(|| env.router.changes().len() == 1).await?;

    m.shutdown().await;
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn operator_commands() -> Result<()> {
    let env = Builder::new().build().await?;
    let m = start(&env).await?;
    eventually(|| state_of(&m) == (ClusterState::Monitor, Some(db(1)))).await?;

    let e = m.status("nope").unwrap_err();
    assert!(matches!(Error::find(&e), Some(Error::ClusterNotFound(_))));

    let primary = m.switchover("c1", Some(db(3)))?.await??;
    assert_eq!(primary, db(3));
    eventually(|| state_of(&m) == (ClusterState::Monitor, Some(db(3)))).await?;

    m.freeze("c1")?;
    eventually(|| state_of(&m).0 == ClusterState::Frozen).await?;
    let e = m.switchover("c1", None).unwrap_err();
    assert!(matches!(Error::find(&e), Some(Error::Operator(_))));
    m.unfreeze("c1")?;
    eventually(|| state_of(&m).0 == ClusterState::Monitor).await?;

    let recs = m.crash_records("c1").await?;
    assert_eq!(recs.len(), 1);
    assert!(recs[0].0.ends_with(".json"));

    assert!(m.forget_arbitration("repman").await? >= 1);
    m.shutdown().await;
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn watch_sees_the_failover() -> Result<()> {
    let env = Builder::new().with_logging(false).build().await?;
    let m = start(&env).await?;
    let watch = m.watch();
    eventually(|| state_of(&m) == (ClusterState::Monitor, Some(db(1)))).await?;

    env.world.kill(&db(1));
    let mut changed = false;
    for _ in 0..50 {
        for e in watch.next_batch(Duration::from_millis(100)).await {
            if let EventBody::PrimaryChanged { new, .. } = e.body {
                assert_eq!(new, db(2));
                changed = true;
            }
        }
        if changed {
            break;
        }
    }
    assert!(changed);
    assert_eq!(watch.dropped(), 0);
    m.shutdown().await;
    Ok(())
}
