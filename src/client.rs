//! Authenticated HTTP client for the Trellix ePO REST API.
//!
//! `EpoClient` wraps a `reqwest::Client` and a `TokenProvider` behind a
//! `Mutex` and owns all request resilience, so endpoint functions see
//! simple calls:
//!
//! - Token lifecycle: the first request with no cached token triggers a
//!   token exchange. [`EpoClient::reauthenticate`] replaces the token in
//!   place and can be called at any time.
//! - 401/403: one re-authentication, then the same request exactly once
//!   more. A second rejection is handed to [`EpoClient::check_response`]
//!   instead of looping.
//! - 500: up to [`RetryPolicy::server_error_retries`] further attempts with a
//!   fixed delay. Any non-500 answer ends the loop.
//! - [`EpoClient::check_response`] classifies the final response into a
//!   small closed set ([`ResponseClass`]) or a fatal error.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use secrecy::SecretString;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::TokenProvider;
use crate::config::{ConfigError, Profile};
use crate::error::{EpoError, Result};
use crate::resource::Document;

/// Connect timeout for API calls (TCP + TLS handshake only).
const API_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall timeout for one API round-trip. Device pages of 1000 entries
/// with every property selected can take a while to render server-side.
const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Message the API puts in a 401 body when the bearer token has expired.
const TOKEN_EXPIRED_MESSAGE: &str = "Unauthorized";

fn build_api_client(headers: HeaderMap) -> Result<Client> {
    Ok(Client::builder()
        .default_headers(headers)
        .connect_timeout(API_CONNECT_TIMEOUT)
        .timeout(API_REQUEST_TIMEOUT)
        .build()?)
}

// ── Policies ───────────────────────────────────────────────────────────

/// Retry bounds for authentication and server errors.
///
/// Defaults:
/// - `auth_attempts`: 5 token exchanges, `auth_delay` 10 seconds apart.
/// - `server_error_retries`: 5 further attempts after an HTTP 500,
///   `server_error_delay` 60 seconds apart. No jitter, no growth.
///
/// Most tests use [`RetryPolicy::without_delays`] and count requests on the
/// mock server; the default timing is checked on a paused tokio clock.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total token exchanges before giving up.
    pub auth_attempts: u32,
    /// Wait between consecutive token exchanges.
    pub auth_delay: Duration,
    /// Retries after the first HTTP 500 for one request.
    pub server_error_retries: u32,
    /// Wait before each server-error retry.
    pub server_error_delay: Duration,
}

impl RetryPolicy {
    /// Same attempt bounds as the default policy, with no waiting.
    pub fn without_delays() -> Self {
        RetryPolicy {
            auth_delay: Duration::ZERO,
            server_error_delay: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            auth_attempts: 5,
            auth_delay: Duration::from_secs(10),
            server_error_retries: 5,
            server_error_delay: Duration::from_secs(60),
        }
    }
}

/// Page sizes requested from the paginated endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub devices: u32,
    pub events: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        PageLimits {
            devices: 1000,
            events: 1000,
        }
    }
}

// ── Responses ──────────────────────────────────────────────────────────

/// A completed HTTP exchange. The body is read once, as text, so it can be
/// both logged on failure and deserialized on success.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Interpretation of a response status, as returned by
/// [`EpoClient::check_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Any status below 400.
    Success,
    /// 400: invalid filter or parameters.
    BadRequest,
    /// 401 for an expired token. The client has already re-authenticated;
    /// the request itself did not succeed and may be sent again.
    Unauthorized,
    /// 404: the resource does not exist.
    NotFound,
    /// 409: the relationship is already in the requested state.
    Conflict,
    /// 500 that persisted through the retry budget.
    ServerError,
}

/// Error body shape used by the API on 401.
#[derive(Deserialize)]
struct ErrorMessage {
    #[serde(default)]
    message: Option<String>,
}

fn is_auth_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

// ── Client ─────────────────────────────────────────────────────────────

/// Authenticated session to the ePO REST API.
///
/// - `auth` is behind a `Mutex` because refreshing needs `&mut` while API
///   methods only take `&self`. The lock is held for the token check or
///   refresh, never across an API round-trip.
/// - `base_url` always ends with `/` so endpoint paths and relative
///   `links.next` values join onto it.
/// - The client sends one request at a time and is not meant to be shared
///   between concurrent callers.
pub struct EpoClient {
    http: Client,
    base_url: Url,
    auth: Mutex<TokenProvider>,
    retry: RetryPolicy,
    limits: PageLimits,
}

impl EpoClient {
    /// Builds a client with no extra default headers.
    pub fn new(auth: TokenProvider, base_url: &str) -> Result<Self> {
        Self::with_headers(auth, base_url, HeaderMap::new())
    }

    /// Builds a client that sends `headers` (e.g. `x-api-key`) with every
    /// API request.
    pub fn with_headers(auth: TokenProvider, base_url: &str, headers: HeaderMap) -> Result<Self> {
        Ok(EpoClient {
            http: build_api_client(headers)?,
            base_url: normalize_base_url(base_url)?,
            auth: Mutex::new(auth),
            retry: RetryPolicy::default(),
            limits: PageLimits::default(),
        })
    }

    /// Builds a client from a profile without touching the network.
    pub fn from_profile(profile: &Profile) -> Result<Self> {
        let auth = TokenProvider::new(
            &profile.auth_url,
            &profile.client_id,
            SecretString::from(profile.client_secret.clone()),
            header_map(&profile.auth_headers, "auth_headers")?,
            profile.auth_payload.clone(),
        );
        let headers = header_map(&profile.api_headers, "api_headers")?;
        let client = Self::with_headers(auth, &profile.api_url, headers)?.with_page_limits(
            PageLimits {
                devices: profile.device_page_limit,
                events: profile.events_page_limit,
            },
        );
        Ok(client)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_limits(mut self, limits: PageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Builds a client from `profile`, authenticates and verifies the
    /// tenant. Fails rather than returning an unusable session.
    pub async fn open(profile: &Profile) -> Result<Self> {
        let client = Self::from_profile(profile)?;
        client.connect().await?;
        Ok(client)
    }

    /// Authenticates, then lists a single device to confirm the token is
    /// scoped to a reachable tenant.
    pub async fn connect(&self) -> Result<()> {
        self.reauthenticate().await?;

        let mut url = self.url_for("devices")?;
        url.query_pairs_mut()
            .append_pair("fields", "id")
            .append_pair("page[offset]", "0")
            .append_pair("page[limit]", "1");
        let (class, resp) = self.fetch::<()>(Method::GET, url, None).await?;
        debug!(status = %resp.status, "tenant check");

        if class != ResponseClass::Success {
            return Err(EpoError::Auth {
                message: format!("tenant check failed ({}): {}", resp.status, resp.body),
                source: None,
            });
        }
        info!("connected to ePO API at {}", self.base_url);
        Ok(())
    }

    pub fn limits(&self) -> PageLimits {
        self.limits
    }

    /// Resolves an endpoint path (`"devices"`) or a `links.next` value
    /// (absolute URL or host-relative path) against the base URL.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    // ── Token handling ────────────────────────────────────────────────

    /// Returns a valid bearer token, fetching one if none is cached or the
    /// cached one has expired.
    async fn bearer_token(&self) -> Result<String> {
        let mut auth = self.auth.lock().await;
        if auth.token().is_none() {
            auth.refresh_token(&self.retry).await?;
        }

        auth.token().map(str::to_owned).ok_or_else(|| EpoError::Auth {
            message: "token missing after refresh".to_string(),
            source: None,
        })
    }

    /// Performs the token exchange again and replaces the cached token.
    pub async fn reauthenticate(&self) -> Result<()> {
        let mut auth = self.auth.lock().await;
        auth.refresh_token(&self.retry).await
    }

    // ── Request execution ─────────────────────────────────────────────

    async fn send_once<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &Url,
        body: Option<&B>,
    ) -> Result<ApiResponse> {
        let token = self.bearer_token().await?;
        let mut req = self.http.request(method, url.clone()).bearer_auth(token);
        if let Some(payload) = body {
            req = req.json(payload);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        Ok(ApiResponse { status, body })
    }

    async fn reauthenticate_and_resend<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &Url,
        body: Option<&B>,
        rejected: StatusCode,
    ) -> Result<ApiResponse> {
        debug!(%rejected, %url, "request rejected, refreshing session");
        self.reauthenticate().await?;
        self.send_once(method, url, body).await
    }

    /// Sends a request with the session's resilience rules applied.
    ///
    /// - 401/403: re-authenticate once and resend once; that answer is
    ///   returned whatever it is.
    /// - 500: resend up to `server_error_retries` times, sleeping
    ///   `server_error_delay` before each. A 401/403 on a retry takes the
    ///   re-authentication path above; any other non-500 ends the loop.
    /// - Everything else is returned untouched for [`Self::check_response`].
    pub async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<ApiResponse> {
        debug!(%method, %url, "sending request");
        let mut resp = self.send_once(method.clone(), &url, body).await?;

        if is_auth_rejection(resp.status) {
            return self
                .reauthenticate_and_resend(method, &url, body, resp.status)
                .await;
        }

        if resp.status == StatusCode::INTERNAL_SERVER_ERROR {
            let retries = self.retry.server_error_retries;
            for retry in 1..=retries {
                warn!(
                    %url,
                    retry,
                    retries,
                    delay = ?self.retry.server_error_delay,
                    body = %resp.body,
                    "server error, retrying"
                );
                tokio::time::sleep(self.retry.server_error_delay).await;

                resp = self.send_once(method.clone(), &url, body).await?;
                if is_auth_rejection(resp.status) {
                    return self
                        .reauthenticate_and_resend(method, &url, body, resp.status)
                        .await;
                }
                if resp.status != StatusCode::INTERNAL_SERVER_ERROR {
                    return Ok(resp);
                }
            }
        }

        Ok(resp)
    }

    /// Classifies a response.
    ///
    /// A 401 whose body says the token expired triggers one more silent
    /// re-authentication and yields [`ResponseClass::Unauthorized`]. Any other
    /// 401 message means the credentials lack scopes (`Auth` error); an
    /// unparsable 401 body, or a status outside the known set, is an
    /// `UnexpectedResponse`.
    pub async fn check_response(&self, resp: &ApiResponse) -> Result<ResponseClass> {
        let status = resp.status;
        if status.as_u16() < 400 {
            debug!(%status, "request successful");
            return Ok(ResponseClass::Success);
        }

        match status {
            StatusCode::UNAUTHORIZED => self.interpret_unauthorized(resp).await,
            StatusCode::BAD_REQUEST => {
                info!(%status, body = %resp.body, "bad request, check filters and parameters");
                Ok(ResponseClass::BadRequest)
            }
            StatusCode::NOT_FOUND => {
                info!(%status, "resource not found");
                Ok(ResponseClass::NotFound)
            }
            StatusCode::CONFLICT => {
                info!(%status, "relationship already in requested state");
                Ok(ResponseClass::Conflict)
            }
            StatusCode::INTERNAL_SERVER_ERROR => {
                warn!(%status, body = %resp.body, "server error persisted after retries");
                Ok(ResponseClass::ServerError)
            }
            _ => Err(EpoError::UnexpectedResponse {
                status,
                body: resp.body.clone(),
            }),
        }
    }

    async fn interpret_unauthorized(&self, resp: &ApiResponse) -> Result<ResponseClass> {
        let message = serde_json::from_str::<ErrorMessage>(&resp.body)
            .ok()
            .and_then(|err| err.message);

        match message.as_deref() {
            Some(TOKEN_EXPIRED_MESSAGE) => {
                warn!("token has expired, refreshing");
                self.reauthenticate().await?;
                Ok(ResponseClass::Unauthorized)
            }
            Some(other) => Err(EpoError::Auth {
                message: format!("access denied: {other}; verify the account has the required scopes"),
                source: None,
            }),
            None => Err(EpoError::UnexpectedResponse {
                status: resp.status,
                body: resp.body.clone(),
            }),
        }
    }

    /// [`Self::execute`] followed by [`Self::check_response`].
    pub async fn fetch<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<(ResponseClass, ApiResponse)> {
        let resp = self.execute(method, url, body).await?;
        let class = self.check_response(&resp).await?;
        Ok((class, resp))
    }

    /// GETs a page that the caller cannot do without.
    ///
    /// An expired-token answer is retried once on the fresh token; any other
    /// non-success becomes [`EpoError::Api`]. This bounds every pagination
    /// loop: a page that keeps failing stops the walk instead of repeating.
    pub async fn get_page<T: DeserializeOwned>(&self, url: &Url) -> Result<T> {
        let mut reauthenticated = false;
        loop {
            let (class, resp) = self.fetch::<()>(Method::GET, url.clone(), None).await?;
            match class {
                ResponseClass::Success => return resp.json(),
                ResponseClass::Unauthorized if !reauthenticated => reauthenticated = true,
                _ => {
                    return Err(EpoError::Api {
                        status: resp.status,
                        body: resp.body,
                    });
                }
            }
        }
    }

    /// Walks a paginated collection from `first`, following `links.next`
    /// until the server stops sending one, and returns every item.
    pub async fn get_all_pages<T: DeserializeOwned>(&self, first: Url) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(first);
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            debug!(%url, "fetching page");
            let page: Document<Vec<T>> = self.get_page(&url).await?;
            pages += 1;
            if let Some(link) = page.next_link() {
                next = Some(self.url_for(link)?);
            }
            items.extend(page.data);
        }

        debug!(pages, items = items.len(), "pagination complete");
        Ok(items)
    }
}

fn normalize_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Converts a header template from the profile into a `HeaderMap`.
///
/// `Authorization` entries are dropped: the bearer token (API) and basic
/// credentials (IAM) are attached per request.
fn header_map(
    headers: &BTreeMap<String, String>,
    field: &str,
) -> std::result::Result<HeaderMap, ConfigError> {
    let mut map = HeaderMap::new();
    for (raw_name, raw_value) in headers {
        let name =
            HeaderName::from_bytes(raw_name.as_bytes()).map_err(|e| ConfigError::Validation {
                field: field.to_string(),
                reason: format!("header name {raw_name:?}: {e}"),
            })?;
        if name == AUTHORIZATION {
            debug!(field, "ignoring Authorization header template");
            continue;
        }
        let mut value = HeaderValue::from_str(raw_value).map_err(|e| ConfigError::Validation {
            field: field.to_string(),
            reason: format!("header {raw_name:?}: {e}"),
        })?;
        if name.as_str() == "x-api-key" {
            value.set_sensitive(true);
        }
        map.insert(name, value);
    }
    Ok(map)
}
