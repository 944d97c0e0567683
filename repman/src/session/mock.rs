//! Recording driver for statement-level tests.

use super::*;

#[derive(Default)]
struct State {
    log: Vec<String>,
    responses: Vec<(String, Vec<Row>)>,
    failures: Vec<(String, Error, usize)>,
    stalls: Vec<(String, Duration)>,
    connects: usize,
}

#[derive(Clone, Default)]
pub(crate) struct MockDriver {
    state: Arc<spin::Mutex<State>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Session {
        Session::new(Arc::new(self.clone()), Duration::from_secs(5))
    }

    /// Statements starting with `prefix` return `rows`. Later registrations win.
    pub fn respond(&self, prefix: &str, rows: Vec<Row>) {
        self.state
            .lock()
            .responses
            .insert(0, (prefix.to_owned(), rows));
    }

    /// Statements starting with `prefix` fail `times` times.
    pub fn fail(&self, prefix: &str, err: Error, times: usize) {
        self.state
            .lock()
            .failures
            .push((prefix.to_owned(), err, times));
    }

    pub fn stall(&self, prefix: &str, d: Duration) {
        self.state.lock().stalls.push((prefix.to_owned(), d));
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    fn handle(&self, stmt: &str) -> std::result::Result<Vec<Row>, Error> {
        let mut st = self.state.lock();
        st.log.push(stmt.to_owned());
        if let Some(f) = st
            .failures
            .iter_mut()
            .find(|(p, _, n)| *n > 0 && stmt.starts_with(p.as_str()))
        {
            f.2 -= 1;
            return Err(f.1.clone());
        }
        let rows = st
            .responses
            .iter()
            .find(|(p, _)| stmt.starts_with(p.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        Ok(rows)
    }

    fn stall_of(&self, stmt: &str) -> Option<Duration> {
        self.state
            .lock()
            .stalls
            .iter()
            .find(|(p, _)| stmt.starts_with(p.as_str()))
            .map(|(_, d)| *d)
    }
}

struct MockConnection {
    driver: MockDriver,
}

#[async_trait::async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, stmt: &str) -> Result<()> {
        self.select(stmt).await?;
        Ok(())
    }

    async fn select(&mut self, stmt: &str) -> Result<Vec<Row>> {
        if let Some(d) = self.driver.stall_of(stmt) {
            tokio::time::sleep(d).await;
        }
        Ok(self.driver.handle(stmt)?)
    }
}

#[async_trait::async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        self.state.lock().connects += 1;
        Ok(Box::new(MockConnection {
            driver: self.clone(),
        }))
    }
}
