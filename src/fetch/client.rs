use async_trait::async_trait;
use reqwest::{Method, Request, RequestBuilder, Response};

/// Executes prepared requests. Implemented by the real reqwest client and by
/// wrappers that decorate requests (see [`crate::fetch::auth`]).
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Starts a request on the underlying client. Build it and pass the result
    /// to [`HttpClient::execute`] so wrappers still see it.
    fn request(&self, method: Method, url: &str) -> RequestBuilder;

    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
