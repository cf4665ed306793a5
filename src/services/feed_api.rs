//! Trait and types for fetching artifacts from a transit mode's API.

use std::path::PathBuf;

use crate::error::Result;
use crate::modes::ArtifactKind;
use crate::token::Credential;

/// A freshly fetched artifact staged on disk, not yet published.
///
/// Handed to [`crate::publish::SnapshotWriter::publish`], which either moves
/// it into place or removes it.
#[derive(Debug)]
pub struct FetchResult {
    pub mode_key: String,
    pub kind: ArtifactKind,
    /// Staging location, on the same filesystem as the published snapshot.
    pub path: PathBuf,
    pub bytes: u64,
    /// Entity count for feed kinds; `None` for timetable archives.
    pub entities: Option<usize>,
}

/// Fetches one artifact kind for one mode.
#[async_trait::async_trait]
pub trait ModeFetcher: Send + Sync {
    /// Fails with [`crate::HarvestError::InvalidRequest`] when the mode is
    /// unknown or does not expose `kind`, and with
    /// [`crate::HarvestError::Fetch`] on HTTP or transport failures.
    async fn fetch(
        &self,
        mode_key: &str,
        kind: ArtifactKind,
        credential: &Credential,
    ) -> Result<FetchResult>;
}
