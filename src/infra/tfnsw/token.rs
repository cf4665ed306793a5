use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::fetch::HttpClient;
use crate::services::token_api::{TokenGrant, TokenSource};

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(u64),
    Text(String),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<ExpiresIn>,
}

/// OAuth2 client-credentials exchange against the TfNSW gateway.
///
/// Client id and secret travel as HTTP basic auth; the grant type and scope
/// are query parameters.
pub struct TfnswTokenSource<C> {
    http: C,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl<C: HttpClient> TfnswTokenSource<C> {
    pub fn new(
        http: C,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    fn build_request(&self) -> Result<reqwest::Request> {
        self.http
            .request(reqwest::Method::POST, &self.token_url)
            .query(&[("grant_type", "client_credentials"), ("scope", "user")])
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .body(Vec::new())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HarvestError::Auth(format!("failed to build token request: {e}")))
    }
}

#[async_trait]
impl<C: HttpClient> TokenSource for TfnswTokenSource<C> {
    #[tracing::instrument(skip(self), fields(token_url = %self.token_url))]
    async fn exchange(&self) -> Result<TokenGrant> {
        let request = self.build_request()?;

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| HarvestError::Auth(format!("failed to send token request: {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| HarvestError::Auth(format!("failed to read token response: {e}")))?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&body);
            return Err(HarvestError::Auth(format!(
                "token endpoint returned status {}: {}",
                status,
                crate::fetch::truncate(&body, 200)
            )));
        }

        debug!(bytes = body.len(), "Token response received");
        parse_token_response(&body)
    }
}

/// Validates a `{access_token, token_type, expires_in}` payload.
pub(crate) fn parse_token_response(body: &[u8]) -> Result<TokenGrant> {
    let parsed: TokenResponse = serde_json::from_slice(body)
        .map_err(|e| HarvestError::Auth(format!("malformed token response: {e}")))?;

    let missing = |field: &str| HarvestError::Auth(format!("token response is missing '{field}'"));

    let access_token = parsed.access_token.ok_or_else(|| missing("access_token"))?;
    let token_type = parsed.token_type.ok_or_else(|| missing("token_type"))?;
    let expires_in = match parsed.expires_in.ok_or_else(|| missing("expires_in"))? {
        ExpiresIn::Seconds(secs) => secs,
        ExpiresIn::Text(text) => text.trim().parse().map_err(|_| {
            HarvestError::Auth(format!("token response has non-numeric expires_in '{text}'"))
        })?,
    };

    Ok(TokenGrant {
        access_token,
        token_type,
        expires_in: Duration::from_secs(expires_in),
    })
}
