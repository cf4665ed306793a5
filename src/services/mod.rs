//! Seams between the ingestion loop and the upstream APIs.

pub mod feed_api;
pub mod token_api;
