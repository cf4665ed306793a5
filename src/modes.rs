//! Static transit-mode table.
//!
//! A [`ModeTable`] lists every transit mode the harvester polls, in the order
//! they are processed each cycle, together with the artifact kinds each mode
//! exposes. The table is fixed for the lifetime of the process.
//!
//! A table can be loaded from a JSON file:
//! ```json
//! [
//!   { "key": "sydtrains", "api_path": "sydneytrains", "capabilities": ["alerts", "timetable"] },
//!   { "key": "ferries", "capabilities": ["timetable"] }
//! ]
//! ```
//! Stop-time updates and vehicle positions are implied for every mode.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// One of the data types fetched from a mode's API.
///
/// Variants are declared in per-mode fetch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Alerts,
    StopTimes,
    VehiclePositions,
    Timetable,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Alerts,
        ArtifactKind::StopTimes,
        ArtifactKind::VehiclePositions,
        ArtifactKind::Timetable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Alerts => "alerts",
            ArtifactKind::StopTimes => "stop_times",
            ArtifactKind::VehiclePositions => "vehicle_positions",
            ArtifactKind::Timetable => "timetable",
        }
    }

    /// Published filename suffix, appended to `{mode_key}_`.
    pub fn suffix(&self) -> &'static str {
        match self {
            ArtifactKind::Alerts => "alerts.pb",
            ArtifactKind::StopTimes => "stops.pb",
            ArtifactKind::VehiclePositions => "pos.pb",
            ArtifactKind::Timetable => "tt.zip",
        }
    }

    /// Upstream endpoint family serving this kind.
    pub fn endpoint(&self) -> &'static str {
        match self {
            ArtifactKind::Alerts => "alerts",
            ArtifactKind::StopTimes => "realtime",
            ArtifactKind::VehiclePositions => "vehiclepos",
            ArtifactKind::Timetable => "schedule",
        }
    }

    /// Whether the payload is a protobuf `FeedMessage` (as opposed to a ZIP archive).
    pub fn is_feed(&self) -> bool {
        !matches!(self, ArtifactKind::Timetable)
    }

    /// Kinds every mode supports.
    fn is_mandatory(&self) -> bool {
        matches!(self, ArtifactKind::StopTimes | ArtifactKind::VehiclePositions)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactKind::Alerts => "alerts",
            ArtifactKind::StopTimes => "stop times",
            ArtifactKind::VehiclePositions => "vehicle positions",
            ArtifactKind::Timetable => "timetable",
        };
        f.write_str(s)
    }
}

/// Static description of one transit mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeConfig {
    /// Key used in published filenames and logs.
    pub key: String,
    /// Path segment the upstream API serves the mode under.
    pub api_path: String,
    capabilities: BTreeSet<ArtifactKind>,
}

impl ModeConfig {
    /// A mode exposing only stop-time updates and vehicle positions.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            api_path: key.clone(),
            key,
            capabilities: ArtifactKind::ALL
                .into_iter()
                .filter(ArtifactKind::is_mandatory)
                .collect(),
        }
    }

    pub fn with_api_path(mut self, api_path: impl Into<String>) -> Self {
        self.api_path = api_path.into();
        self
    }

    pub fn with_alerts(mut self) -> Self {
        self.capabilities.insert(ArtifactKind::Alerts);
        self
    }

    pub fn with_timetable(mut self) -> Self {
        self.capabilities.insert(ArtifactKind::Timetable);
        self
    }

    pub fn supports(&self, kind: ArtifactKind) -> bool {
        self.capabilities.contains(&kind)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = ArtifactKind> + '_ {
        self.capabilities.iter().copied()
    }

    /// Kinds to fetch this cycle, in fetch order.
    pub fn kinds_for_cycle(&self, timetable_due: bool) -> Vec<ArtifactKind> {
        self.capabilities()
            .filter(|kind| *kind != ArtifactKind::Timetable || timetable_due)
            .collect()
    }

    fn validate(&self) -> Result<()> {
        let valid = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if !valid(&self.key) {
            return Err(HarvestError::Config(format!(
                "mode key '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                self.key
            )));
        }
        if !valid(&self.api_path) {
            return Err(HarvestError::Config(format!(
                "API path '{}' for mode '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                self.api_path, self.key
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct ModeEntry {
    key: String,
    #[serde(default)]
    api_path: Option<String>,
    #[serde(default)]
    capabilities: Vec<ArtifactKind>,
}

impl From<ModeEntry> for ModeConfig {
    fn from(entry: ModeEntry) -> Self {
        let mut mode = ModeConfig::new(entry.key);
        if let Some(api_path) = entry.api_path {
            mode.api_path = api_path;
        }
        mode.capabilities.extend(entry.capabilities);
        mode
    }
}

/// Ordered set of modes polled every cycle.
#[derive(Debug, Clone)]
pub struct ModeTable {
    modes: Vec<ModeConfig>,
}

impl ModeTable {
    /// Builds a table, rejecting duplicate or malformed keys.
    pub fn new(modes: Vec<ModeConfig>) -> Result<Self> {
        if modes.is_empty() {
            return Err(HarvestError::Config("mode table is empty".into()));
        }
        let mut seen = BTreeSet::new();
        for mode in &modes {
            mode.validate()?;
            if !seen.insert(mode.key.as_str()) {
                return Err(HarvestError::Config(format!(
                    "mode '{}' is listed more than once",
                    mode.key
                )));
            }
        }
        Ok(Self { modes })
    }

    /// Sydney Trains, light rail and ferries. Only Sydney Trains publishes alerts.
    pub fn builtin() -> Self {
        Self {
            modes: vec![
                ModeConfig::new("sydtrains")
                    .with_api_path("sydneytrains")
                    .with_alerts()
                    .with_timetable(),
                ModeConfig::new("lightrail").with_timetable(),
                ModeConfig::new("ferries").with_timetable(),
            ],
        }
    }

    /// Loads the table from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let entries: Vec<ModeEntry> = serde_json::from_str(content)
            .map_err(|e| HarvestError::Config(format!("invalid mode table: {e}")))?;
        Self::new(entries.into_iter().map(ModeConfig::from).collect())
    }

    pub fn get(&self, key: &str) -> Option<&ModeConfig> {
        self.modes.iter().find(|m| m.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModeConfig> {
        self.modes.iter()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}
