//! Append-only audit log mapping every generated document and job to the
//! exact values it used.
//!
//! One JSON object per line, written in a single call under one mutex, so the
//! file stays parseable even if the process dies mid-run.
use crate::sweep::Combination;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LEGEND_FILE: &str = "run.legend";

/// A single applied value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedValue {
    pub target: String,
    pub value: String,
}

impl AppliedValue {
    pub fn from_combination(combination: &Combination) -> Vec<Self> {
        combination
            .choices()
            .iter()
            .map(|choice| AppliedValue {
                target: choice.key.clone(),
                value: choice.value.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LegendRecord {
    /// A geometry variant, recorded as soon as it is written.
    Geometry {
        document: String,
        coordinates: Vec<usize>,
        applied: Vec<AppliedValue>,
    },
    /// The check command's verdict on a geometry variant.
    Verdict { document: String, accepted: bool },
    /// A generated simulation source document.
    Run {
        ordinal: usize,
        document: String,
        output: String,
        coordinates: Vec<usize>,
        applied: Vec<AppliedValue>,
    },
    /// A job dispatched for a run document.
    Job {
        ordinal: usize,
        document: String,
        seed: u32,
    },
}

/// Shared handle to the audit log.
#[derive(Debug)]
pub struct Legend {
    path: PathBuf,
    file: Mutex<File>,
}

impl Legend {
    /// Open (or create) the log for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open legend {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &LegendRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize legend record")?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())
            .with_context(|| format!("append to {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        Ok(())
    }
}
