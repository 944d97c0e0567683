use super::*;

use ::redb::{Database, ReadableTable, Table, TableDefinition};

mod value {
    use super::*;

    pub fn ser(x: &HeartbeatRow) -> Result<Vec<u8>> {
        Ok(bincode::serialize(x)?)
    }

    pub fn desr(bin: &[u8]) -> Result<HeartbeatRow> {
        Ok(bincode::deserialize(bin)?)
    }
}

/// Keyed by `(secret, cluster, uid)`.
const TABLE: TableDefinition<(&str, &str, u32), Vec<u8>> = TableDefinition::new("heartbeat");

type Key = (&'static str, &'static str, u32);
type HeartbeatTable<'a> = Table<'a, Key, Vec<u8>>;

/// Arbitration store in an embedded redb file.
///
/// redb allows one write transaction at a time, so every operation is
/// serial.
pub struct RedbArbitrationStore {
    db: Database,
    fresh: Duration,
}

impl RedbArbitrationStore {
    pub fn new(db: Database, fresh: Duration) -> Result<Self> {
        let tx = db.begin_write()?;
        tx.open_table(TABLE)?;
        tx.commit()?;
        Ok(Self { db, fresh })
    }

    pub fn open(path: &std::path::Path, fresh: Duration) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Self::new(db, fresh)
    }

    pub fn in_memory(fresh: Duration) -> Result<Self> {
        let mem = ::redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(mem)?;
        Self::new(db, fresh)
    }
}

fn load(
    tbl: &impl ReadableTable<Key, Vec<u8>>,
    secret: &str,
    cluster: &str,
) -> Result<Vec<HeartbeatRow>> {
    let mut out = vec![];
    for item in tbl.iter()? {
        let (k, v) = item?;
        let (s, c, _) = k.value();
        if s == secret && c == cluster {
            out.push(value::desr(&v.value())?);
        }
    }
    Ok(out)
}

fn save(tbl: &mut HeartbeatTable<'_>, row: &HeartbeatRow) -> Result<()> {
    tbl.insert(
        (row.secret.as_str(), row.cluster.as_str(), row.uid),
        value::ser(row)?,
    )?;
    Ok(())
}

#[async_trait::async_trait]
impl ArbitrationStore for RedbArbitrationStore {
    async fn publish_heartbeat(&self, me: &Member, obs: &Observation) -> Result<()> {
        let now = unix_millis();
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(TABLE)?;
            let rows = load(&tbl, &me.secret, &me.cluster)?;
            let mine = rows.iter().find(|r| r.uid == me.uid);
            let row = obs.row(
                me,
                mine.map(|r| r.status).unwrap_or(Status::Unknown),
                now,
                mine.map(|r| r.arbitration_date).unwrap_or(0),
            );
            save(&mut tbl, &row)?;

            let rows = load(&tbl, &me.secret, &me.cluster)?;
            if protocol::converged(&rows, now, self.fresh) {
                for mut r in rows.into_iter().filter(|r| r.status == Status::Elected) {
                    debug!("cluster {} view converged, clear election of {}", me.cluster, r.uid);
                    r.status = Status::Unknown;
                    save(&mut tbl, &r)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn request_election(&self, me: &Member, obs: &Observation) -> Result<bool> {
        let now = unix_millis();
        let tx = self.db.begin_write()?;
        let granted = {
            let mut tbl = tx.open_table(TABLE)?;
            let rows = load(&tbl, &me.secret, &me.cluster)?;
            match protocol::refusal(&rows, me, obs) {
                Some(reason) => {
                    debug!("cluster {} election refused: {reason}", me.cluster);
                    false
                }
                None => {
                    save(&mut tbl, &obs.row(me, Status::Elected, now, now))?;
                    true
                }
            }
        };
        tx.commit()?;
        Ok(granted)
    }

    async fn release(&self, me: &Member) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(TABLE)?;
            let rows = load(&tbl, &me.secret, &me.cluster)?;
            if let Some(mut r) = rows.into_iter().find(|r| r.uid == me.uid) {
                r.status = Status::Unknown;
                save(&mut tbl, &r)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn rows(&self, secret: &str, cluster: &str) -> Result<Vec<HeartbeatRow>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TABLE)?;
        load(&tbl, secret, cluster)
    }

    async fn forget(&self, secret: &str) -> Result<u64> {
        let tx = self.db.begin_write()?;
        let n = {
            let mut tbl = tx.open_table(TABLE)?;
            let mut keys = vec![];
            for item in tbl.iter()? {
                let (k, _) = item?;
                let (s, c, uid) = k.value();
                if s == secret {
                    keys.push((c.to_owned(), uid));
                }
            }
            for (c, uid) in &keys {
                tbl.remove((secret, c.as_str(), *uid))?;
            }
            keys.len() as u64
        };
        tx.commit()?;
        Ok(n)
    }
}
