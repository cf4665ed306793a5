//! Cycle report: one CSV row per attempted artifact, appended every cycle.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use tracing::debug;

use crate::ingest::{ArtifactStatus, CycleSummary};
use crate::modes::ArtifactKind;

#[derive(Debug, Serialize)]
pub struct ReportRecord {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub mode: Option<String>,
    pub kind: Option<ArtifactKind>,
    pub outcome: &'static str,
    pub bytes: Option<u64>,
    pub entities: Option<usize>,
    pub error: Option<String>,
}

impl ReportRecord {
    /// Rows for a finished cycle. An auth failure yields a single row with no mode.
    pub fn from_summary(summary: &CycleSummary) -> Vec<Self> {
        if let Some(err) = &summary.auth_error {
            return vec![ReportRecord {
                timestamp: summary.started_at,
                cycle: summary.cycle,
                mode: None,
                kind: None,
                outcome: err.label(),
                bytes: None,
                entities: None,
                error: Some(err.to_string()),
            }];
        }

        summary
            .outcomes
            .iter()
            .map(|o| {
                let (outcome, bytes, entities, error) = match &o.status {
                    ArtifactStatus::Published { bytes, entities, .. } => {
                        ("published", Some(*bytes), *entities, None)
                    }
                    ArtifactStatus::Failed(e) => (e.label(), None, None, Some(e.to_string())),
                };
                ReportRecord {
                    timestamp: summary.started_at,
                    cycle: summary.cycle,
                    mode: Some(o.mode_key.clone()),
                    kind: Some(o.kind),
                    outcome,
                    bytes,
                    entities,
                    error,
                }
            })
            .collect()
    }
}

/// Appends [`ReportRecord`]s to a CSV file, creating it with headers if absent.
#[derive(Debug, Clone)]
pub struct CycleReport {
    path: PathBuf,
}

impl CycleReport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, summary: &CycleSummary) -> Result<()> {
        append_records(&self.path, &ReportRecord::from_summary(summary))
    }
}

pub fn append_records(path: &Path, records: &[ReportRecord]) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, rows = records.len(), "Appending report rows");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(())
}
