//! Simulation record log: one tab-delimited line per event, in
//! `sim_<mode>_<params>.log`, read by the offline analysis tooling.
//!
//! Line shape: unix timestamp (float seconds), node id, then numeric fields.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::NodeId;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: f64,
    pub node: NodeId,
    pub fields: Vec<f64>,
}

impl Record {
    /// Record stamped with the current wall-clock time.
    pub fn now(node: NodeId, fields: Vec<f64>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            timestamp,
            node,
            fields,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}\t{}", self.timestamp, self.node)?;
        for field in &self.fields {
            write!(f, "\t{}", field)?;
        }
        Ok(())
    }
}

/// Append-only log file. Each record is flushed as it is written.
pub struct RecordLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RecordLog {
    pub fn file_name(mode: &str, params: &str) -> String {
        format!("sim_{}_{}.log", mode, params)
    }

    /// Open (or create) `dir/sim_<mode>_<params>.log` for appending.
    pub fn create(dir: &Path, mode: &str, params: &str) -> io::Result<Self> {
        let path = dir.join(Self::file_name(mode, params));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        writeln!(self.writer, "{}", record)?;
        self.writer.flush()
    }
}
