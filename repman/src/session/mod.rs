use super::*;

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};

#[cfg(test)]
pub(crate) mod mock;
mod mysql;
pub use mysql::MysqlDriver;

/// One result row. Column order is kept.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    cols: Vec<(String, Option<String>)>,
}

impl Row {
    pub fn new(cols: Vec<(String, Option<String>)>) -> Self {
        Self { cols }
    }

    pub fn from_pairs(xs: &[(&str, &str)]) -> Self {
        Self::new(
            xs.iter()
                .map(|(k, v)| (k.to_string(), Some(v.to_string())))
                .collect(),
        )
    }

    /// Column value by case-insensitive name. `None` if missing or NULL.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cols
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn string(&self, name: &str) -> String {
        self.get(name).unwrap_or_default().to_owned()
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    /// `Yes` in SHOW SLAVE STATUS.
    pub fn yes(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false)
    }

    /// `ON` or `1` in a variable.
    pub fn on(&self, name: &str) -> bool {
        self.get(name).map(is_on).unwrap_or(false)
    }

    pub fn first(&self) -> Option<&str> {
        self.cols.first().and_then(|(_, v)| v.as_deref())
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.cols.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }
}

pub(crate) fn is_on(v: &str) -> bool {
    v.eq_ignore_ascii_case("on") || v == "1"
}

/// A live connection owned by one `Session`.
#[async_trait::async_trait]
pub trait Connection: Send {
    async fn execute(&mut self, stmt: &str) -> Result<()>;
    async fn select(&mut self, stmt: &str) -> Result<Vec<Row>>;
}

/// Opens connections to one server.
///
/// Errors are reported as `Error` values so that the session can tell
/// connection faults from server-side faults.
#[async_trait::async_trait]
pub trait Driver: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Isolation {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    fn sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Clone, Copy)]
enum Op<'a> {
    Execute(&'a str),
    Select(&'a str),
}

type Slot = Option<Box<dyn Connection>>;

/// Session to one database server.
///
/// Calls are serialized. Each call carries a deadline and a connection fault
/// is retried once on a fresh connection before it surfaces.
pub struct Session {
    driver: Arc<dyn Driver>,
    conn: Mutex<Slot>,
    deadline: Duration,
    suppress_binlog: bool,
    pending_rollback: AtomicBool,
}

impl Session {
    pub fn new(driver: Arc<dyn Driver>, deadline: Duration) -> Self {
        Self {
            driver,
            conn: Mutex::new(None),
            deadline,
            suppress_binlog: false,
            pending_rollback: AtomicBool::new(false),
        }
    }

    /// Writes through this session are not written to the binary log.
    pub fn with_binlog_suppressed(self) -> Self {
        Self {
            suppress_binlog: true,
            ..self
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn execute(&self, stmt: &str) -> Result<()> {
        self.run(Op::Execute(stmt)).await?;
        Ok(())
    }

    pub async fn select(&self, stmt: &str) -> Result<Vec<Row>> {
        self.run(Op::Select(stmt)).await
    }

    pub async fn query_row(&self, stmt: &str) -> Result<Option<Row>> {
        let rows = self.select(stmt).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn ping(&self) -> Result<()> {
        self.select("SELECT 1").await?;
        Ok(())
    }

    pub async fn transaction(&self) -> Result<Transaction<'_>> {
        self.begin(None).await
    }

    pub async fn transaction_with(&self, isolation: Isolation) -> Result<Transaction<'_>> {
        self.begin(Some(isolation)).await
    }

    async fn begin(&self, isolation: Option<Isolation>) -> Result<Transaction<'_>> {
        let mut slot = self.conn.lock().await;
        let mut stmts = vec![];
        if let Some(i) = isolation {
            stmts.push(format!("SET TRANSACTION ISOLATION LEVEL {}", i.sql()));
        }
        stmts.push("START TRANSACTION".to_owned());

        let mut reconnected = false;
        loop {
            let mut res = Ok(vec![]);
            for stmt in &stmts {
                res = self.run_on(&mut slot, Op::Execute(stmt)).await;
                if res.is_err() {
                    break;
                }
            }
            match res {
                Ok(_) => break,
                Err(e) if !reconnected && Error::classify(&e) == FaultKind::Connection => {
                    debug!("reconnect before transaction: {e}");
                    *slot = None;
                    reconnected = true;
                }
                Err(e) => {
                    self.pending_rollback.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        Ok(Transaction {
            slot,
            session: self,
            done: false,
        })
    }

    async fn run(&self, op: Op<'_>) -> Result<Vec<Row>> {
        let mut slot = self.conn.lock().await;
        match self.run_on(&mut slot, op).await {
            Err(e) if Error::classify(&e) == FaultKind::Connection => {
                debug!("reconnect after connection fault: {e}");
                *slot = None;
                self.run_on(&mut slot, op).await
            }
            x => x,
        }
    }

    async fn open(&self) -> Result<Box<dyn Connection>> {
        let mut conn = self.driver.connect().await?;
        if self.suppress_binlog {
            conn.execute("SET sql_log_bin=0").await?;
        }
        Ok(conn)
    }

    async fn run_on(&self, slot: &mut Slot, op: Op<'_>) -> Result<Vec<Row>> {
        let fut = async {
            if slot.is_none() {
                *slot = Some(self.open().await?);
            }
            let conn = slot.as_mut().context("no connection")?;
            // A transaction guard was dropped without commit.
            if self.pending_rollback.swap(false, Ordering::SeqCst) {
                conn.execute("ROLLBACK").await?;
            }
            match op {
                Op::Execute(stmt) => {
                    conn.execute(stmt).await?;
                    Ok(vec![])
                }
                Op::Select(stmt) => conn.select(stmt).await,
            }
        };
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => {
                if Error::classify(&e) == FaultKind::Connection {
                    *slot = None;
                }
                Err(e)
            }
            Err(_) => {
                *slot = None;
                Err(Error::Connection(format!("deadline {:?} exceeded", self.deadline)).into())
            }
        }
    }
}

/// Scoped transaction. Dropping it without `commit` rolls it back.
pub struct Transaction<'a> {
    slot: MutexGuard<'a, Slot>,
    session: &'a Session,
    done: bool,
}

impl Transaction<'_> {
    pub async fn execute(&mut self, stmt: &str) -> Result<()> {
        self.session.run_on(&mut self.slot, Op::Execute(stmt)).await?;
        Ok(())
    }

    pub async fn select(&mut self, stmt: &str) -> Result<Vec<Row>> {
        self.session.run_on(&mut self.slot, Op::Select(stmt)).await
    }

    pub async fn query_row(&mut self, stmt: &str) -> Result<Option<Row>> {
        let rows = self.select(stmt).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn commit(mut self) -> Result<()> {
        self.session
            .run_on(&mut self.slot, Op::Execute("COMMIT"))
            .await?;
        self.done = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.session
            .run_on(&mut self.slot, Op::Execute("ROLLBACK"))
            .await?;
        self.done = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.session.pending_rollback.store(true, Ordering::SeqCst);
        }
    }
}
