//! Per-cycle results.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::HarvestError;
use crate::modes::ArtifactKind;

#[derive(Debug)]
pub enum ArtifactStatus {
    Published {
        path: PathBuf,
        bytes: u64,
        entities: Option<usize>,
    },
    Failed(HarvestError),
}

#[derive(Debug)]
pub struct ArtifactOutcome {
    pub mode_key: String,
    pub kind: ArtifactKind,
    pub status: ArtifactStatus,
}

impl ArtifactOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self.status, ArtifactStatus::Published { .. })
    }
}

#[derive(Debug)]
pub struct CycleSummary {
    /// Cycles started before this one.
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Set when the token refresh failed and no fetches were attempted.
    pub auth_error: Option<HarvestError>,
    pub outcomes: Vec<ArtifactOutcome>,
    /// True when a stop request arrived before every fetch had started.
    pub interrupted: bool,
}

impl CycleSummary {
    pub fn published(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_published()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.published()
    }

    pub fn outcome(&self, mode_key: &str, kind: ArtifactKind) -> Option<&ArtifactOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.mode_key == mode_key && o.kind == kind)
    }
}
