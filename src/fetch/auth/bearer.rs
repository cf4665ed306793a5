use crate::fetch::client::HttpClient;
use crate::token::Credential;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderValue};

/// An [`HttpClient`] wrapper that sends `Authorization: {token_type} {access_token}`
/// from a borrowed [`Credential`].
///
/// Built per request so the credential travels explicitly with each fetch
/// instead of living in shared client state.
pub struct Authorized<'a, C: ?Sized> {
    inner: &'a C,
    credential: &'a Credential,
}

impl<'a, C: ?Sized> Authorized<'a, C> {
    pub fn new(inner: &'a C, credential: &'a Credential) -> Self {
        Self { inner, credential }
    }
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Authorized<'_, C> {
    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.inner.request(method, url)
    }

    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        // Tokens are opaque ASCII; a value that is not a valid header is sent without auth
        // and surfaces as a 401 from the upstream.
        match HeaderValue::from_str(&self.credential.authorization()) {
            Ok(mut value) => {
                value.set_sensitive(true);
                req.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("Credential is not a valid header value, sending request without it"),
        }
        self.inner.execute(req).await
    }
}
