//! Profile loading and event-cursor persistence.
//!
//! A profile is a TOML file describing one ePO SaaS tenant: API and IAM
//! endpoints, client credentials, header templates, page sizes, logging and
//! the persisted threat-event cursor. Values from `EPO_`-prefixed environment
//! variables override the file (e.g. `EPO_CLIENT_SECRET`).
//!
//! The profile is loaded once and handed to [`EpoClient`](crate::client::EpoClient).
//! The only write-back is [`persist_events_cursor`], which rewrites a single
//! key of the file atomically; comments, key order and formatting elsewhere
//! in the file are kept. Only one event puller may run per profile.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Profile path used when neither `--profile` nor `EPO_PROFILE` is given.
pub const DEFAULT_PROFILE: &str = "profile.toml";

/// Key of the persisted threat-event cursor inside the profile.
pub const EVENTS_CURSOR_KEY: &str = "events_cursor";

const ENV_PREFIX: &str = "EPO_";

/// Keys whose environment override is taken as raw text. figment would
/// otherwise type an all-digit `EPO_CLIENT_SECRET` as a number.
const VERBATIM_ENV_KEYS: [&str; 2] = ["client_id", "client_secret"];

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("profile file not found: {}", .path.display())]
    Missing { path: PathBuf },

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("none of the requested properties are available: {}", .requested.join(", "))]
    NoValidFields { requested: Vec<String> },

    #[error("profile loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("failed to parse profile: {0}")]
    Parse(#[from] toml_edit::TomlError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Profile ─────────────────────────────────────────────────────────

/// One tenant profile.
#[derive(Clone, Deserialize, Serialize)]
pub struct Profile {
    /// Base URL of the ePO REST API, e.g. `https://api.manage.trellix.com/epo/v2/`.
    pub api_url: String,

    /// IAM token endpoint for the client-credentials exchange.
    pub auth_url: String,

    pub client_id: String,

    /// Plaintext in the file; prefer `EPO_CLIENT_SECRET`.
    pub client_secret: String,

    /// Extra headers sent with the token request.
    #[serde(default)]
    pub auth_headers: BTreeMap<String, String>,

    /// Form fields of the token request (grant type, scopes).
    #[serde(default = "default_auth_payload")]
    pub auth_payload: BTreeMap<String, String>,

    /// Headers sent with every API request (`x-api-key`, content type).
    #[serde(default)]
    pub api_headers: BTreeMap<String, String>,

    #[serde(default = "default_page_limit")]
    pub device_page_limit: u32,

    #[serde(default = "default_page_limit")]
    pub events_page_limit: u32,

    /// `tracing` filter directive used when neither `RUST_LOG` nor `-v` is set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory receiving `trellix-epo.log`. Logs go to stderr when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Last pulled threat event as `<id>_:_<timestamp>`, empty before the
    /// first pull.
    #[serde(default)]
    pub events_cursor: String,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("api_url", &self.api_url)
            .field("auth_url", &self.auth_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("device_page_limit", &self.device_page_limit)
            .field("events_page_limit", &self.events_page_limit)
            .field("log_level", &self.log_level)
            .field("log_path", &self.log_path)
            .field("events_cursor", &self.events_cursor)
            .finish_non_exhaustive()
    }
}

fn default_auth_payload() -> BTreeMap<String, String> {
    BTreeMap::from([("grant_type".to_string(), "client_credentials".to_string())])
}
fn default_page_limit() -> u32 {
    1000
}
fn default_log_level() -> String {
    "info".into()
}

impl Profile {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("api_url", &self.api_url), ("auth_url", &self.auth_url)] {
            Url::parse(value).map_err(|e| ConfigError::Validation {
                field: field.into(),
                reason: format!("{e}: {value}"),
            })?;
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Validation {
                field: "client_id".into(),
                reason: "must not be empty".into(),
            });
        }
        for (field, value) in [
            ("device_page_limit", self.device_page_limit),
            ("events_page_limit", self.events_page_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation {
                    field: field.into(),
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }
}

// ── Loading ─────────────────────────────────────────────────────────

/// Load and validate the profile at `path`, applying `EPO_*` overrides.
///
/// A missing file is an error: no session can exist without a profile.
pub fn load_profile(path: &Path) -> Result<Profile, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::Missing {
            path: path.to_path_buf(),
        });
    }

    let mut figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).ignore(&VERBATIM_ENV_KEYS));
    for key in VERBATIM_ENV_KEYS {
        let var = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
        if let Ok(raw) = std::env::var(&var) {
            figment = figment.merge(Serialized::default(key, raw));
        }
    }

    let profile: Profile = figment.extract()?;
    profile.validate()?;
    Ok(profile)
}

// ── Cursor write-back ───────────────────────────────────────────────

/// Rewrite `events_cursor` in the profile file, leaving every other line as
/// the file had it, comments included (environment overrides are never
/// written back). A missing key is appended to the top-level table.
///
/// The new content goes to a temporary file in the same directory which is
/// then renamed over the profile, so readers never observe a torn file.
pub fn persist_events_cursor(path: &Path, cursor: &str) -> Result<(), ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let mut doc: toml_edit::DocumentMut = raw.parse()?;
    doc[EVENTS_CURSOR_KEY] = toml_edit::value(cursor);
    let rendered = doc.to_string();

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(rendered.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
