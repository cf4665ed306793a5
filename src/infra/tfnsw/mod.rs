//! Transport for NSW open data API: OAuth2 client-credentials tokens and
//! GTFS / GTFS-realtime endpoints.

mod feeds;
mod token;

pub use feeds::TfnswFeedFetcher;
pub use token::TfnswTokenSource;

pub const DEFAULT_TOKEN_URL: &str = "https://api.transport.nsw.gov.au/auth/oauth/v2/token";
pub const DEFAULT_API_BASE: &str = "https://api.transport.nsw.gov.au/v1/gtfs";
