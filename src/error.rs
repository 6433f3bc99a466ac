//! Typed error hierarchy for the trellix-epo crate.
//!
//! `EpoError` is the single error type returned by the library. Variants map
//! to real system boundaries: the IAM token endpoint (`Auth`), the ePO REST
//! API (`Api`, `UnexpectedResponse`), the profile file (`Config`) and the
//! transport (`Network`).
//!
//! Benign outcomes are not errors here. A name that does not resolve is
//! [`Lookup::NotFound`](crate::resource::Lookup), and a tag that is already
//! in the requested state is
//! [`TagOutcome::AlreadySatisfied`](crate::tags::TagOutcome). Callers see
//! either a result or a terminal failure.

use reqwest::StatusCode;

use crate::config::ConfigError;

/// Unified error type for all trellix-epo library operations.
///
/// The `#[source]` attribute on inner errors enables `Error::source()`
/// chaining so the CLI can log the full cause chain before exiting.
#[derive(Debug, thiserror::Error)]
pub enum EpoError {
    /// Authentication failure at the IAM token endpoint, or an API response
    /// proving the credentials lack the required scopes.
    ///
    /// Raised once the token exchange has exhausted its retry budget, when
    /// the tenant sanity check fails, or when a 401 carries a message other
    /// than an expired token.
    #[error("authentication failed: {message}")]
    Auth {
        /// Human-readable description, including the last HTTP status and
        /// response body when available.
        message: String,
        /// The underlying transport or parse error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A request the caller could not do without (a pagination page, most
    /// often) still failed after the client's retries.
    #[error("API error {status}: {body}")]
    Api {
        /// The HTTP status code of the last attempt.
        status: StatusCode,
        /// The raw response body text.
        body: String,
    },

    /// The API answered with a status or body shape the client does not
    /// know how to interpret. The session may be inconsistent, so this is
    /// always fatal.
    #[error("unexpected response {status}: {body}")]
    UnexpectedResponse {
        /// The HTTP status code returned by the API.
        status: StatusCode,
        /// The raw response body, kept for diagnosis.
        body: String,
    },

    /// An exact-name filter matched more than one resource.
    #[error("{kind} name '{name}' matches {matches} resources")]
    AmbiguousName {
        /// Resource kind (`"device"` or `"tag"`).
        kind: &'static str,
        /// The name that was looked up.
        name: String,
        /// How many resources carry that name.
        matches: usize,
    },

    /// A tag to apply or clear does not exist. Tags are never created by
    /// this crate.
    #[error("tag '{0}' does not exist in ePO, create it in the console first")]
    UnknownTag(String),

    /// Missing or invalid profile, or an unsatisfiable field selection.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// JSON deserialization failed when parsing an API response body.
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// A network-level failure (DNS, TCP, TLS, timeout) with no HTTP status.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A `links.next` value or endpoint path did not form a valid URL.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Local I/O failure (device-list files, event sinks).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV rendering failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, EpoError>;
