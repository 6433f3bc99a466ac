//! Shared wire types for the ePO REST API.
//!
//! Every ePO endpoint answers with a JSON:API-style envelope:
//!
//! ```json
//! { "data": [ { "type": "devices", "id": "42", "attributes": { ... } } ],
//!   "links": { "next": "https://.../devices?page[offset]=1000&page[limit]=1000" } }
//! ```
//!
//! This module holds the envelope ([`Document`], [`Resource`], [`Links`]),
//! the numeric identifier newtypes ([`DeviceId`], [`TagId`]) and
//! [`Lookup`], the result of a name-to-id resolution.

use std::fmt;

use reqwest::Method;
use serde::{Deserialize, Deserializer, Serialize, de, de::DeserializeOwned};
use tracing::{debug, info};

use crate::client::{EpoClient, ResponseClass};
use crate::error::{EpoError, Result};

// ── Identifiers ────────────────────────────────────────────────────────

/// Accepts an id sent either as a JSON number or as a numeric string.
/// The API is not consistent about this across endpoints.
fn flexible_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid numeric id: {s:?}"))),
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                flexible_id(deserializer).map($name)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                $name(id)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a managed device in the ePO system tree.
    DeviceId
);

numeric_id!(
    /// Identifier of a tag in the ePO tag catalog.
    TagId
);

// ── Envelope ───────────────────────────────────────────────────────────

/// Top-level response document. `links` is absent on the last page.
#[derive(Debug, Deserialize)]
pub struct Document<T> {
    pub data: T,
    #[serde(default)]
    pub links: Option<Links>,
}

impl<T> Document<T> {
    /// The continuation link, if the server reported one.
    pub fn next_link(&self) -> Option<&str> {
        self.links
            .as_ref()
            .and_then(|links| links.next.as_deref())
            .filter(|next| !next.is_empty())
    }
}

/// Pagination links. Only `next` is used; it may be an absolute URL or a
/// path relative to the API host.
#[derive(Debug, Default, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub next: Option<String>,
}

/// A single resource object with a numeric id.
#[derive(Debug, Deserialize)]
pub struct Resource<I, A> {
    pub id: I,
    #[serde(default)]
    pub attributes: A,
}

/// Attributes of a resource when only its name was requested.
#[derive(Debug, Default, Deserialize)]
pub struct NameAttributes {
    #[serde(default)]
    pub name: Option<String>,
}

// ── Lookup result ──────────────────────────────────────────────────────

/// Outcome of resolving a name (or fetching by id) that may legitimately
/// have no match. Replaces the numeric-0 "not found" sentinel so that a
/// real id of 0 stays unambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// Resolves an exact resource name in `collection` (`"tags"`, `"devices"`)
/// with a fresh server-side `EQ` filter.
///
/// A failed lookup request that is not fatal counts as no match.
pub(crate) async fn resolve_by_name<I: DeserializeOwned>(
    client: &EpoClient,
    collection: &str,
    kind: &'static str,
    name: &str,
) -> Result<Lookup<I>> {
    let filter = serde_json::json!({ "EQ": { "name": name } }).to_string();
    let mut url = client.url_for(collection)?;
    url.query_pairs_mut()
        .append_pair("filter", &filter)
        .append_pair("fields", "id,name");
    debug!(kind, name, %url, "resolving name");

    let (class, resp) = client.fetch::<()>(Method::GET, url, None).await?;
    if class != ResponseClass::Success {
        info!(kind, name, status = %resp.status, "name lookup failed");
        return Ok(Lookup::NotFound);
    }

    let mut doc: Document<Vec<Resource<I, NameAttributes>>> = resp.json()?;
    match doc.data.len() {
        0 => {
            info!(kind, name, "no {kind} with this name");
            Ok(Lookup::NotFound)
        }
        1 => Ok(Lookup::Found(doc.data.remove(0).id)),
        matches => Err(EpoError::AmbiguousName {
            kind,
            name: name.to_string(),
            matches,
        }),
    }
}

// ── Relationship mutation body ─────────────────────────────────────────

/// Body of `POST`/`DELETE tags/{id}/relationships/devices`.
#[derive(Debug, Serialize)]
pub struct RelationshipRequest {
    pub data: Vec<ResourceRef>,
}

/// A `{"type": ..., "id": ...}` reference to another resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: u64,
}

impl RelationshipRequest {
    /// Build a body referencing each device once.
    pub fn devices(ids: &[DeviceId]) -> Self {
        RelationshipRequest {
            data: ids
                .iter()
                .map(|id| ResourceRef {
                    kind: "devices",
                    id: id.0,
                })
                .collect(),
        }
    }
}
