mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use std::time::Duration;

use anyhow::{Result, bail};
use bytes::Bytes;
use reqwest::header::{ACCEPT, HeaderValue};

/// Longest slice of an error body quoted in error messages.
const MAX_ERROR_BODY: usize = 200;

/// GETs `url` and returns the body, failing on any non-success status.
///
/// `timeout` overrides the client's default request timeout.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
    accept: &'static str,
    timeout: Duration,
) -> Result<Bytes> {
    let mut req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);
    req.headers_mut()
        .insert(ACCEPT, HeaderValue::from_static(accept));
    *req.timeout_mut() = Some(timeout);

    let resp = client.execute(req).await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {}: {}", status, truncate(&body, MAX_ERROR_BODY));
    }

    Ok(resp.bytes().await?)
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
