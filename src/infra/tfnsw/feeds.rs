use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::fetch::auth::Authorized;
use crate::fetch::{HttpClient, fetch_bytes};
use crate::modes::{ArtifactKind, ModeTable};
use crate::parser::validate_payload;
use crate::publish::{stage_artifact, staging_path};
use crate::services::feed_api::{FetchResult, ModeFetcher};
use crate::token::Credential;

const FEED_TIMEOUT: Duration = Duration::from_secs(30);
const TIMETABLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Fetches GTFS-realtime feeds and GTFS timetable bundles from
/// `{api_base}/{endpoint}/{api_path}`.
pub struct TfnswFeedFetcher<C> {
    http: C,
    api_base: String,
    modes: ModeTable,
    staging_dir: PathBuf,
}

impl<C: HttpClient> TfnswFeedFetcher<C> {
    /// `staging_dir` must be on the same filesystem as the published snapshots.
    pub fn new(
        http: C,
        api_base: impl Into<String>,
        modes: ModeTable,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            modes,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn url_for(&self, api_path: &str, kind: ArtifactKind) -> String {
        format!(
            "{}/{}/{}",
            self.api_base.trim_end_matches('/'),
            kind.endpoint(),
            api_path
        )
    }
}

fn accept_for(kind: ArtifactKind) -> &'static str {
    if kind.is_feed() {
        "application/x-google-protobuf"
    } else {
        "application/zip"
    }
}

#[async_trait]
impl<C: HttpClient> ModeFetcher for TfnswFeedFetcher<C> {
    #[tracing::instrument(skip(self, credential), fields(mode = %mode_key, kind = %kind))]
    async fn fetch(
        &self,
        mode_key: &str,
        kind: ArtifactKind,
        credential: &Credential,
    ) -> Result<FetchResult> {
        let mode = self
            .modes
            .get(mode_key)
            .ok_or_else(|| HarvestError::InvalidRequest(format!("unknown mode '{mode_key}'")))?;
        if !mode.supports(kind) {
            return Err(HarvestError::InvalidRequest(format!(
                "mode '{mode_key}' does not provide {kind}"
            )));
        }

        let url = self.url_for(&mode.api_path, kind);
        let timeout = if kind.is_feed() {
            FEED_TIMEOUT
        } else {
            TIMETABLE_TIMEOUT
        };

        let client = Authorized::new(&self.http, credential);
        let bytes = fetch_bytes(&client, &url, accept_for(kind), timeout)
            .await
            .map_err(|e| HarvestError::fetch(mode_key, kind, format!("{e:#}")))?;

        let info = validate_payload(kind, &bytes)
            .map_err(|e| HarvestError::fetch(mode_key, kind, format!("invalid payload: {e:#}")))?;
        debug!(bytes = bytes.len(), entities = ?info.entities, "Payload validated");

        let path = staging_path(&self.staging_dir, mode_key, kind);
        stage_artifact(&path, &bytes)
            .await
            .map_err(|e| HarvestError::io(&path, e))?;

        Ok(FetchResult {
            mode_key: mode_key.to_string(),
            kind,
            path,
            bytes: bytes.len() as u64,
            entities: info.entities,
        })
    }
}
