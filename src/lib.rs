//! Async Rust client library for the Trellix ePO SaaS REST API.
//!
//! Provides OAuth2 client-credentials authentication, an authenticated HTTP
//! session with re-authentication and bounded server-error retry, and the
//! endpoint families used for day-to-day device administration: tag
//! mutation, device listing, property and product inventory, and a
//! resumable threat-event feed.
//!
//! # Modules
//!
//! - [`auth`] — OAuth2 client credentials token provider with expiry tracking.
//! - [`client`] — Authenticated HTTP session, retry policy and response classification.
//! - [`config`] — Profile loading (TOML + `EPO_*` env) and cursor write-back.
//! - [`devices`] — Device lookup and the bulk device/tag index.
//! - [`error`] — Typed error hierarchy (`EpoError`) for all library operations.
//! - [`events`] — Threat-event pulling with a persisted cursor.
//! - [`properties`] — Device properties and installed products.
//! - [`report`] — JSON and CSV rendering.
//! - [`resource`] — Shared wire types, identifiers and name lookups.
//! - [`sink`] — File and syslog destinations for threat events.
//! - [`tags`] — Tag lookup and tag-to-device relationships.
//! - [`workflows`] — Multi-step flows behind the CLI subcommands.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::path::Path;
//! use trellix_epo::client::EpoClient;
//! use trellix_epo::config::load_profile;
//! use trellix_epo::devices::resolve_device_id;
//! use trellix_epo::tags::{apply_tag, resolve_tag_id};
//!
//! let profile = load_profile(Path::new("profile.toml"))?;
//! let client = EpoClient::open(&profile).await?;
//! let tag = resolve_tag_id(&client, "Quarantine").await?.found().unwrap();
//! let device = resolve_device_id(&client, "web-01").await?.found().unwrap();
//! let outcome = apply_tag(&client, tag, &[device]).await?;
//! assert!(outcome.is_success());
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod properties;
pub mod report;
pub mod resource;
pub mod sink;
pub mod tags;
pub mod workflows;
