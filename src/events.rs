//! Threat-event pulling with a persisted cursor.
//!
//! Events are read in timestamp order from `events?sort=timestamp`. The
//! position in that stream is an [`EventCursor`], the id and timestamp of the
//! last event seen, serialized as `<id>_:_<timestamp>` into the profile's
//! `events_cursor` key.
//!
//! ## Progress guarantees
//!
//! - The cursor advances to the last event of each non-empty page and is
//!   persisted right away, so a crash mid-pull repeats at most one page.
//! - A page with no events ends the pull without touching the cursor.
//! - A page that keeps failing ends the pull with whatever was gathered and
//!   [`EventBatch::stalled`] set; the caller decides when to try again.
//! - Failing to persist the cursor is logged and does not stop the pull.
//!   Events pulled after that may be delivered again by a later run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::client::EpoClient;
use crate::config::{self, ConfigError, Profile};
use crate::error::{EpoError, Result};
use crate::resource::Document;

/// Separator between event id and timestamp in a serialized cursor.
const CURSOR_SEPARATOR: &str = "_:_";

// ── Cursor ─────────────────────────────────────────────────────────────

/// Position after the last consumed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCursor {
    pub last_event_id: String,
    pub last_event_timestamp: String,
}

impl fmt::Display for EventCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{CURSOR_SEPARATOR}{}",
            self.last_event_id, self.last_event_timestamp
        )
    }
}

impl FromStr for EventCursor {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once(CURSOR_SEPARATOR) {
            Some((id, timestamp)) if !id.is_empty() && !timestamp.is_empty() => Ok(EventCursor {
                last_event_id: id.to_string(),
                last_event_timestamp: timestamp.to_string(),
            }),
            _ => Err(ConfigError::Validation {
                field: config::EVENTS_CURSOR_KEY.to_string(),
                reason: format!("expected <id>{CURSOR_SEPARATOR}<timestamp>, got {s:?}"),
            }),
        }
    }
}

/// Writes the cursor back into a profile file.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CursorStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persist(&self, cursor: &EventCursor) -> std::result::Result<(), ConfigError> {
        config::persist_events_cursor(&self.path, &cursor.to_string())
    }
}

// ── Events ─────────────────────────────────────────────────────────────

/// A threat event. Only `id` and the `timestamp` attribute are interpreted;
/// everything else is passed through untouched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThreatEvent {
    pub id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ThreatEvent {
    /// The event timestamp as text. Numeric timestamps are rendered in
    /// decimal.
    pub fn timestamp(&self) -> Option<String> {
        match self.attributes.get("timestamp")? {
            Value::String(ts) => Some(ts.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Cursor pointing just past this event.
    pub fn cursor(&self) -> Option<EventCursor> {
        Some(EventCursor {
            last_event_id: self.id.clone(),
            last_event_timestamp: self.timestamp()?,
        })
    }
}

/// Events returned by one [`EventFeed::pull_new_events`] call.
#[derive(Debug, Default)]
pub struct EventBatch {
    pub events: Vec<ThreatEvent>,
    /// Status of the page that could not be fetched, if the pull stopped
    /// early. Events gathered before that page are still in `events`.
    pub stalled: Option<StatusCode>,
}

impl EventBatch {
    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }
}

// ── Feed ───────────────────────────────────────────────────────────────

/// Reader over the event stream that remembers where it stopped.
///
/// Only one feed may write to a given profile at a time; concurrent pullers
/// would overwrite each other's cursor.
#[derive(Debug, Default)]
pub struct EventFeed {
    cursor: Option<EventCursor>,
    store: Option<CursorStore>,
}

impl EventFeed {
    pub fn new(cursor: Option<EventCursor>, store: Option<CursorStore>) -> Self {
        EventFeed { cursor, store }
    }

    /// Starts from the profile's persisted cursor and persists progress back
    /// into `profile_path`.
    pub fn from_profile(profile: &Profile, profile_path: &Path) -> Result<Self> {
        let cursor = match profile.events_cursor.trim() {
            "" => None,
            raw => Some(raw.parse::<EventCursor>()?),
        };
        if let Some(cursor) = &cursor {
            info!(%cursor, "resuming threat events");
        }
        Ok(EventFeed::new(cursor, Some(CursorStore::new(profile_path))))
    }

    pub fn cursor(&self) -> Option<&EventCursor> {
        self.cursor.as_ref()
    }

    fn advance(&mut self, cursor: EventCursor) {
        debug!(%cursor, "threat event cursor advanced");
        if let Some(store) = &self.store {
            if let Err(e) = store.persist(&cursor) {
                warn!(
                    path = %store.path().display(),
                    error = %e,
                    "failed to persist threat event cursor, progress not saved and duplicates may follow"
                );
            }
        }
        self.cursor = Some(cursor);
    }

    /// Pulls every event newer than the cursor.
    ///
    /// # Errors
    ///
    /// Only fatal conditions (authentication, unexpected responses,
    /// transport failures, malformed pages) are errors. A page that keeps
    /// failing is reported through [`EventBatch::stalled`].
    pub async fn pull_new_events(&mut self, client: &EpoClient) -> Result<EventBatch> {
        let mut url = client.url_for("events")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("page[limit]", &client.limits().events.to_string());
            if let Some(cursor) = &self.cursor {
                query.append_pair("page[cursor]", &cursor.to_string());
            }
            query.append_pair("sort", "timestamp");
        }

        let mut batch = EventBatch::default();
        loop {
            debug!(%url, "pulling threat events");
            let page: Document<Vec<ThreatEvent>> = match client.get_page(&url).await {
                Ok(page) => page,
                Err(EpoError::Api { status, body }) => {
                    warn!(%status, %body, pulled = batch.events.len(), "threat event page failed");
                    batch.stalled = Some(status);
                    return Ok(batch);
                }
                Err(e) => return Err(e),
            };

            let Some(last) = page.data.last() else {
                debug!("no more threat events");
                break;
            };
            match last.cursor() {
                Some(cursor) => self.advance(cursor),
                None => warn!(event = %last.id, "last event has no timestamp, cursor not advanced"),
            }

            let next = page.next_link().map(|link| client.url_for(link)).transpose()?;
            batch.events.extend(page.data);
            match next {
                Some(next) => url = next,
                None => break,
            }
        }

        if batch.events.is_empty() {
            info!("no new threat events to pull");
        } else {
            info!(events = batch.events.len(), "new threat events pulled");
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips_through_text() {
        let cursor: EventCursor = "ev-3_:_2024-05-01T10:00:00.000Z".parse().unwrap();
        assert_eq!(cursor.last_event_id, "ev-3");
        assert_eq!(cursor.last_event_timestamp, "2024-05-01T10:00:00.000Z");
        assert_eq!(cursor.to_string(), "ev-3_:_2024-05-01T10:00:00.000Z");
    }

    #[test]
    fn cursor_splits_on_first_separator() {
        let cursor: EventCursor = "a_:_b_:_c".parse().unwrap();
        assert_eq!(cursor.last_event_id, "a");
        assert_eq!(cursor.last_event_timestamp, "b_:_c");
    }

    #[test]
    fn malformed_cursor_is_rejected() {
        for raw in ["", "no-separator", "_:_100", "ev1_:_"] {
            assert!(raw.parse::<EventCursor>().is_err(), "{raw:?} should fail");
        }
    }

    #[test]
    fn event_timestamp_accepts_strings_and_numbers() {
        let event: ThreatEvent = serde_json::from_str(
            r#"{"id": "ev1", "type": "threatEvents", "attributes": {"timestamp": 100}}"#,
        )
        .unwrap();
        assert_eq!(event.timestamp().as_deref(), Some("100"));
        assert_eq!(event.cursor().unwrap().to_string(), "ev1_:_100");

        let event: ThreatEvent = serde_json::from_str(
            r#"{"id": "ev2", "attributes": {"timestamp": "2024-01-01T00:00:00.000Z"}}"#,
        )
        .unwrap();
        assert_eq!(event.timestamp().as_deref(), Some("2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn event_without_timestamp_has_no_cursor() {
        let event: ThreatEvent = serde_json::from_str(r#"{"id": "ev1"}"#).unwrap();
        assert!(event.timestamp().is_none());
        assert!(event.cursor().is_none());
    }

    #[test]
    fn empty_profile_cursor_starts_from_beginning() {
        let profile: Profile = toml::from_str(
            r#"
api_url = "https://api.example.com/"
auth_url = "https://iam.example.com/token"
client_id = "cid"
client_secret = "secret"
"#,
        )
        .unwrap();
        let feed = EventFeed::from_profile(&profile, Path::new("profile.toml")).unwrap();
        assert!(feed.cursor().is_none());
    }

    #[test]
    fn corrupt_profile_cursor_is_config_error() {
        let profile: Profile = toml::from_str(
            r#"
api_url = "https://api.example.com/"
auth_url = "https://iam.example.com/token"
client_id = "cid"
client_secret = "secret"
events_cursor = "garbage"
"#,
        )
        .unwrap();
        let err = EventFeed::from_profile(&profile, Path::new("profile.toml")).unwrap_err();
        assert!(matches!(err, EpoError::Config(_)), "got {err:?}");
    }
}
