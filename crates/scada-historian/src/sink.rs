//! ---
//! scada_section: "03-persistence-metrics"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Historian schema rows, sinks, and the batching writer."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::rows::HistorianRow;
use crate::Result;

/// Write-only destination for historian rows. The production deployment
/// points this at the external time-series store; tests and single-host runs
/// use [`NdjsonSink`].
#[async_trait]
pub trait HistorianSink: Send + Sync + 'static {
    /// Persist a batch atomically-enough: either the whole batch is accepted
    /// or an error is returned and the writer will retry it.
    async fn write_batch(&self, rows: &[HistorianRow]) -> Result<()>;
}

/// File-backed sink writing one NDJSON stream per table under a directory.
#[derive(Debug, Clone)]
pub struct NdjsonSink {
    root: PathBuf,
}

impl NdjsonSink {
    /// Create the sink, ensuring the directory exists.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{table}.ndjson"))
    }

    /// Read every row of a table back, oldest first. Test and CLI helper;
    /// the production store answers range queries instead.
    pub fn read_table(&self, table: &str) -> Result<Vec<HistorianRow>> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        for line in BufReader::new(fs::File::open(&path)?).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(&line)?);
        }
        Ok(rows)
    }
}

#[async_trait]
impl HistorianSink for NdjsonSink {
    async fn write_batch(&self, rows: &[HistorianRow]) -> Result<()> {
        for row in rows {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.table_path(row.table()))?;
            let line = serde_json::to_string(row)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}
