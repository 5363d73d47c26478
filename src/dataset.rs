//! Per-loop dataset records and where they are persisted.
//!
//! A record is a plain text block, one element per line:
//!
//! ```text
//! 18                  <- record tag
//! 1                   <- loop index
//! scan                <- dataset name
//! 2026-01-01 12:00:00.000
//! ...                 <- configuration fields
//! 3 1                 <- header line: "{sense} {drive}"
//! 1.0 2.0             <- sample line: space separated floats
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::config::ExcitationPair;
use crate::errors::Result;

/// Literal first line of every record.
pub const RECORD_TAG: &str = "18";

/// One sweep loop worth of dataset lines.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRecord {
    dataset_name: String,
    loop_index: u32,
    preamble_len: usize,
    lines: Vec<String>,
}

impl DatasetRecord {
    /// Start a record with its preamble: tag, loop index, name, timestamp and
    /// configuration fields.
    pub fn open(
        dataset_name: &str,
        loop_index: u32,
        timestamp: &str,
        config_fields: &[String],
    ) -> Self {
        let mut lines = Vec::with_capacity(config_fields.len() + 16);
        lines.push(RECORD_TAG.to_string());
        lines.push(loop_index.to_string());
        lines.push(dataset_name.to_string());
        lines.push(timestamp.to_string());
        lines.extend(config_fields.iter().cloned());
        Self {
            dataset_name: dataset_name.to_string(),
            loop_index,
            preamble_len: lines.len(),
            lines,
        }
    }

    pub fn push_header(&mut self, pair: ExcitationPair) {
        self.lines.push(format!("{} {}", pair.sense, pair.drive));
    }

    /// Append one line of space-separated samples.
    ///
    /// Values are written in their shortest f32 form, so `0.1f32` is `0.1`
    /// rather than the widened `0.10000000149011612`. Readers expecting the
    /// widened digits see a different text for the same bits.
    pub fn push_samples(&mut self, values: &[f32]) {
        let line = values
            .iter()
            .map(|v| format!("{v:?}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.lines.push(line);
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    pub fn loop_index(&self) -> u32 {
        self.loop_index
    }

    /// Name of the persisted unit: `{dataset_name}_{loop_index}`.
    pub fn unit_name(&self) -> String {
        format!("{}_{}", self.dataset_name, self.loop_index)
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Header and sample lines, without the preamble.
    pub fn body_lines(&self) -> &[String] {
        &self.lines[self.preamble_len..]
    }
}

/// Destination for finished records.
pub trait DatasetSink {
    fn flush(&mut self, record: DatasetRecord) -> Result<()>;
}

/// Keeps records in memory, in flush order.
impl DatasetSink for Vec<DatasetRecord> {
    fn flush(&mut self, record: DatasetRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// Writes each record to `{dir}/{dataset_name}_{loop_index}.txt`.
#[derive(Debug, Clone)]
pub struct DatasetWriter {
    dir: PathBuf,
}

impl DatasetWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, record: &DatasetRecord) -> PathBuf {
        self.dir.join(format!("{}.txt", record.unit_name()))
    }
}

impl DatasetSink for DatasetWriter {
    fn flush(&mut self, record: DatasetRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record);
        let mut out = BufWriter::new(File::create(&path)?);
        for line in record.lines() {
            writeln!(out, "{line}")?;
        }
        out.flush()?;
        info!(
            "wrote loop {} of '{}' to {} ({} lines)",
            record.loop_index(),
            record.dataset_name(),
            path.display(),
            record.lines().len()
        );
        Ok(())
    }
}
