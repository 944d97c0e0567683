use super::*;

use std::path::PathBuf;
use tokio::sync::Mutex;

const PREFIX: &str = "failover-";
const SUFFIX: &str = ".json";

/// Why a record was written outside a plain primary change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    /// An invariant of the topology was broken while the primary was up.
    #[display("suspect")]
    Suspect,
    /// The demoted primary holds transactions the new primary lacks.
    #[display("divergent")]
    Divergent,
    /// Some replicas could not be re-attached.
    #[display("partial")]
    Partial,
}

/// Summary of one demotion.
///
/// Binlog coordinates of the old primary are the ones the elected replica had
/// read when it was promoted. The new coordinates are the elected server's
/// own binlog position at promotion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub old_primary: Endpoint,
    pub old_binlog_file: String,
    pub old_binlog_pos: u64,
    pub new_binlog_file: String,
    pub new_binlog_pos: u64,
    pub semisync_was_on: bool,
    /// GTID received from the old primary by the elected server.
    pub io_gtid: String,
    pub elected_primary: Option<Endpoint>,
    /// Unix millis.
    pub timestamp: u64,
    #[serde(default)]
    pub marker: Option<Marker>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub orphans: Vec<Endpoint>,
}

impl CrashRecord {
    pub fn new(old_primary: Endpoint) -> Self {
        Self {
            old_primary,
            old_binlog_file: String::new(),
            old_binlog_pos: 0,
            new_binlog_file: String::new(),
            new_binlog_pos: 0,
            semisync_was_on: false,
            io_gtid: String::new(),
            elected_primary: None,
            timestamp: unix_millis(),
            marker: None,
            warnings: vec![],
            orphans: vec![],
        }
    }

    pub fn with_marker(mut self, marker: Marker) -> Self {
        self.marker = Some(marker);
        self
    }
}

/// Append-only directory of crash records for one cluster.
///
/// Files are named `failover-<seq>.json` with a zero-padded sequence so that
/// the listing order is the append order. Only the newest `retention` files
/// are kept.
pub struct Journal {
    dir: PathBuf,
    retention: usize,
    lock: Mutex<()>,
}

fn seq_of(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?
        .strip_suffix(SUFFIX)?
        .parse()
        .ok()
}

impl Journal {
    pub async fn open(root: impl Into<PathBuf>, cluster: &str, retention: usize) -> Result<Self> {
        let dir = root.into().join(cluster);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self {
            dir,
            retention: retention.max(1),
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// Record file names, oldest first.
    async fn names(&self) -> Result<Vec<(u64, String)>> {
        let mut out = vec![];
        let mut rd = tokio::fs::read_dir(&self.dir).await?;
        while let Some(ent) = rd.next_entry().await? {
            let name = ent.file_name().to_string_lossy().into_owned();
            if let Some(seq) = seq_of(&name) {
                out.push((seq, name));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Persist `rec` and return its file name.
    pub async fn append(&self, rec: &CrashRecord) -> Result<String> {
        let _g = self.lock.lock().await;
        let names = self.names().await?;
        let seq = names.last().map(|(s, _)| s + 1).unwrap_or(1);
        let name = format!("{PREFIX}{seq:010}{SUFFIX}");

        let body = serde_json::to_vec_pretty(rec)?;
        let tmp = self.dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, self.dir.join(&name)).await?;
        info!(
            "crash record {name} written (old primary {}, marker {:?})",
            rec.old_primary, rec.marker
        );

        let n = names.len() + 1;
        if n > self.retention {
            for (_, old) in names.iter().take(n - self.retention) {
                debug!("remove crash record {old}");
                if let Err(e) = tokio::fs::remove_file(self.dir.join(old)).await {
                    warn!("failed to remove crash record {old}: {e}");
                }
            }
        }
        Ok(name)
    }

    /// Records with their file names, oldest first. Reads without the lock.
    pub async fn list(&self) -> Result<Vec<(String, CrashRecord)>> {
        let mut out = vec![];
        for (_, name) in self.names().await? {
            let bin = match tokio::fs::read(self.dir.join(&name)).await {
                Ok(x) => x,
                // Pruned by a concurrent append.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let rec = serde_json::from_slice(&bin)
                .with_context(|| format!("failed to parse {name}"))?;
            out.push((name, rec));
        }
        Ok(out)
    }

    /// Newest record of a demotion of `endpoint` that elected a successor.
    pub async fn last_demotion_of(&self, endpoint: &Endpoint) -> Result<Option<CrashRecord>> {
        let recs = self.list().await?;
        Ok(recs
            .into_iter()
            .rev()
            .map(|(_, r)| r)
            .find(|r| &r.old_primary == endpoint && r.elected_primary.is_some()))
    }
}
