//! Bearer credential lifecycle.
//!
//! A [`Credential`] is immutable once issued. [`TokenManager`] decides whether
//! the current one is still good for at least the safety margin and, if not,
//! exchanges client credentials for a replacement.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{HarvestError, Result};
use crate::services::token_api::TokenSource;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    token_type: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        token_type: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: token_type.into(),
            expires_at,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Value of the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// True when the credential expires before `now + margin`.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(margin) {
            Some(deadline) => self.expires_at < deadline,
            None => true,
        }
    }
}

// Keep tokens out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Refreshes credentials lazily, only when the current one is inside the margin.
pub struct TokenManager<S> {
    source: S,
    clock: Arc<dyn Clock>,
}

impl<S: TokenSource> TokenManager<S> {
    pub fn new(source: S, clock: Arc<dyn Clock>) -> Self {
        Self { source, clock }
    }

    pub fn needs_refresh(current: Option<&Credential>, now: DateTime<Utc>, margin: Duration) -> bool {
        current.is_none_or(|c| c.expires_within(now, margin))
    }

    /// Returns `current` untouched while it outlives `margin`; otherwise
    /// exchanges for a new credential.
    ///
    /// # Errors
    ///
    /// [`HarvestError::Auth`] when the exchange fails or returns an unusable token.
    pub async fn ensure_valid_credential(
        &self,
        current: Option<Arc<Credential>>,
        margin: Duration,
    ) -> Result<Arc<Credential>> {
        let now = self.clock.now();
        if let Some(current) = current.as_ref()
            && !Self::needs_refresh(Some(current), now, margin)
        {
            debug!(expires_at = %current.expires_at(), "Credential still valid");
            return Ok(Arc::clone(current));
        }

        info!("Refreshing access token");
        let grant = self.source.exchange().await?;

        if grant.access_token.is_empty() || grant.token_type.is_empty() {
            return Err(HarvestError::Auth("token response has an empty token or type".into()));
        }
        if HeaderValue::from_str(&format!("{} {}", grant.token_type, grant.access_token)).is_err() {
            return Err(HarvestError::Auth("token is not a valid header value".into()));
        }

        // Anchor expiry to the time after the exchange returned.
        let issued_at = self.clock.now();
        let expires_in = chrono::Duration::from_std(grant.expires_in)
            .map_err(|_| HarvestError::Auth(format!("expires_in {:?} is out of range", grant.expires_in)))?;
        let expires_at = issued_at
            .checked_add_signed(expires_in)
            .ok_or_else(|| HarvestError::Auth(format!("expires_in {:?} is out of range", grant.expires_in)))?;
        if expires_at <= issued_at {
            return Err(HarvestError::Auth(format!(
                "token expired on arrival (expires_in {:?})",
                grant.expires_in
            )));
        }

        let credential = Credential::new(grant.access_token, grant.token_type, expires_at);
        if credential.expires_within(issued_at, margin) {
            warn!(
                expires_in_secs = grant.expires_in.as_secs(),
                margin_secs = margin.as_secs(),
                "Token lifetime is shorter than the refresh margin; it will be refreshed every cycle"
            );
        }
        info!(expires_at = %credential.expires_at(), "Access token refreshed");

        Ok(Arc::new(credential))
    }
}
