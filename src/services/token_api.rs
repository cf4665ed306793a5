//! Trait and types for obtaining bearer tokens.

use std::time::Duration;

use crate::error::Result;

/// A token as issued by the authentication endpoint, before it is anchored
/// to a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: Duration,
}

/// Exchanges client credentials for a bearer token.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// Performs one exchange. Non-success responses and malformed payloads
    /// are [`crate::HarvestError::Auth`].
    async fn exchange(&self) -> Result<TokenGrant>;
}
