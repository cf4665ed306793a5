//! Sanity checks for downloaded payloads.
//!
//! Feed kinds must decode as a GTFS-realtime [`FeedMessage`]; timetables must
//! look like a ZIP archive. Gateways sometimes answer with an HTML or JSON
//! error page and a 200 status, which must never replace a good snapshot.

use anyhow::{Result, bail};
use prost::Message;

use crate::gtfs_rt::FeedMessage;
use crate::modes::ArtifactKind;

/// Local file header signature that starts every non-empty ZIP archive.
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    Ok(FeedMessage::decode(bytes)?)
}

/// What validation learned about a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadInfo {
    pub entities: Option<usize>,
}

/// Checks that `bytes` is plausibly a `kind` artifact.
pub fn validate_payload(kind: ArtifactKind, bytes: &[u8]) -> Result<PayloadInfo> {
    if bytes.is_empty() {
        bail!("empty payload");
    }

    if kind.is_feed() {
        let feed = parse_feed(bytes)?;
        if feed.header.gtfs_realtime_version.is_empty() {
            bail!("feed header has no gtfs_realtime_version");
        }
        Ok(PayloadInfo {
            entities: Some(feed.entity.len()),
        })
    } else {
        if !bytes.starts_with(ZIP_MAGIC) {
            bail!("timetable payload is not a ZIP archive");
        }
        Ok(PayloadInfo { entities: None })
    }
}
