//! OAuth2 client-credentials authentication against the Trellix IAM service.
//!
//! The token endpoint takes the client id and secret as HTTP basic auth and
//! the grant type plus scopes as a form payload. The bearer token is cached
//! in [`TokenProvider`] and replaced in place on every refresh. Consumers
//! (e.g. `EpoClient`) read the cached token via `token()` and call
//! `refresh_token()` when it is absent, stale, or rejected by the API.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::client::RetryPolicy;
use crate::error::{EpoError, Result};

/// A token is dropped this long before IAM says it expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Fields of the IAM grant we use; `token_type`, `scope` etc. are ignored.
#[derive(Deserialize)]
struct IamGrant {
    access_token: String,
    /// Lifetime in seconds. Absent on some tenants, in which case the token
    /// is used until the API rejects it.
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Everything sent to the token endpoint.
struct IamCredentials {
    url: String,
    client_id: String,
    client_secret: SecretString,
    headers: HeaderMap,
    form: BTreeMap<String, String>,
}

struct CachedToken {
    value: String,
    /// `None` when IAM gave no lifetime.
    stale_at: Option<Instant>,
}

impl CachedToken {
    fn from_grant(grant: IamGrant) -> Self {
        let stale_at = grant
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs).saturating_sub(EXPIRY_MARGIN));
        CachedToken {
            value: grant.access_token,
            stale_at,
        }
    }

    fn is_stale(&self) -> bool {
        self.stale_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Caches the bearer token and performs the IAM exchange on demand.
///
/// A failed refresh leaves any previous token in place.
pub struct TokenProvider {
    http: reqwest::Client,
    iam: IamCredentials,
    cached: Option<CachedToken>,
}

impl TokenProvider {
    pub fn new(
        auth_url: &str,
        client_id: &str,
        client_secret: SecretString,
        headers: HeaderMap,
        payload: BTreeMap<String, String>,
    ) -> Self {
        TokenProvider {
            http: reqwest::Client::new(),
            iam: IamCredentials {
                url: auth_url.to_string(),
                client_id: client_id.to_string(),
                client_secret,
                headers,
                form: payload,
            },
            cached: None,
        }
    }

    /// Provider holding a fixed token with no lifetime. Any refresh fails,
    /// since there is no IAM endpoint to call.
    pub fn with_token(token: &str) -> Self {
        let mut provider = TokenProvider::new(
            "",
            "",
            SecretString::from(String::new()),
            HeaderMap::new(),
            BTreeMap::new(),
        );
        provider.cached = Some(CachedToken {
            value: token.to_string(),
            stale_at: None,
        });
        provider
    }

    /// One exchange. IAM error bodies (`error_description`) end up in the
    /// error message.
    async fn exchange(&self) -> Result<IamGrant> {
        let iam = &self.iam;
        let resp = self
            .http
            .post(&iam.url)
            .headers(iam.headers.clone())
            .basic_auth(&iam.client_id, Some(iam.client_secret.expose_secret()))
            .form(&iam.form)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(EpoError::Auth {
                message: format!("token request failed ({status}): {text}"),
                source: None,
            });
        }

        serde_json::from_str(&text).map_err(|e| EpoError::Auth {
            message: "IAM answered without a usable access_token".to_string(),
            source: Some(Box::new(e)),
        })
    }

    /// Fetches a new token, retrying with a fixed delay on any failure.
    ///
    /// Makes at most `policy.auth_attempts` exchanges and sleeps
    /// `policy.auth_delay` between consecutive attempts. The last failure is
    /// returned as the source of the final `Auth` error.
    pub async fn refresh_token(&mut self, policy: &RetryPolicy) -> Result<()> {
        let attempts = policy.auth_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!(attempt, attempts, url = %self.iam.url, "requesting access token");
            match self.exchange().await {
                Ok(grant) => {
                    debug!(expires_in = ?grant.expires_in, "authenticated");
                    self.cached = Some(CachedToken::from_grant(grant));
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "authentication attempt failed");
                    last_error = Some(err);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(policy.auth_delay).await;
            }
        }

        Err(EpoError::Auth {
            message: format!("unable to authenticate after {attempts} attempts"),
            source: last_error.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        })
    }

    /// The cached token, unless there is none or it is about to expire.
    pub fn token(&self) -> Option<&str> {
        self.cached
            .as_ref()
            .filter(|cached| !cached.is_stale())
            .map(|cached| cached.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(expires_in: Option<u64>) -> IamGrant {
        IamGrant {
            access_token: "tok".to_string(),
            expires_in,
        }
    }

    #[test]
    fn new_provider_has_no_token() {
        let tp = TokenProvider::new(
            "https://iam.example.com/token",
            "client",
            SecretString::from("secret".to_string()),
            HeaderMap::new(),
            BTreeMap::from([("grant_type".to_string(), "client_credentials".to_string())]),
        );
        assert!(tp.token().is_none());
    }

    #[test]
    fn scopes_are_form_encoded_with_plus() {
        let form = BTreeMap::from([
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("scope".to_string(), "epo.device.r epo.tags.w".to_string()),
        ]);
        let encoded = serde_urlencoded::to_string(&form).unwrap();
        assert_eq!(encoded, "grant_type=client_credentials&scope=epo.device.r+epo.tags.w");
    }

    #[test]
    fn iam_grant_ignores_extra_fields() {
        let grant: IamGrant = serde_json::from_str(
            r#"{"token_type": "Bearer", "expires_in": 599, "access_token": "eyJ.x.y", "scope": "epo.device.r"}"#,
        )
        .unwrap();
        assert_eq!(grant.access_token, "eyJ.x.y");
        assert_eq!(grant.expires_in, Some(599));
    }

    #[test]
    fn iam_error_body_is_not_a_grant() {
        assert!(serde_json::from_str::<IamGrant>(r#"{"error": "invalid_client"}"#).is_err());
    }

    #[test]
    fn preset_token_is_served() {
        assert_eq!(TokenProvider::with_token("preset").token(), Some("preset"));
    }

    #[test]
    fn grant_without_lifetime_never_goes_stale() {
        assert!(!CachedToken::from_grant(grant(None)).is_stale());
    }

    #[test]
    fn grant_inside_margin_is_stale_immediately() {
        // 60s lifetime minus the 60s margin leaves nothing.
        assert!(CachedToken::from_grant(grant(Some(60))).is_stale());
        assert!(!CachedToken::from_grant(grant(Some(599))).is_stale());
    }

    #[test]
    fn stale_token_is_withheld() {
        let mut tp = TokenProvider::with_token("old");
        tp.cached = Some(CachedToken {
            value: "old".to_string(),
            stale_at: Some(Instant::now()),
        });
        assert!(tp.token().is_none());
    }
}
