//! Tag lookup and tag-to-device relationship mutation.
//!
//! - [`resolve_tag_id`]: exact-name lookup in the tag catalog.
//! - [`apply_tag`] / [`clear_tag`]: add or remove a tag on one or many
//!   devices through `tags/{id}/relationships/devices`.
//!
//! Both mutations are idempotent from the caller's point of view: a tag that
//! is already in the requested state comes back as
//! [`TagOutcome::AlreadySatisfied`], which [`TagOutcome::is_success`] treats
//! like a change. Tags are never created here; a tag that does not resolve
//! must be created in the ePO console first.

use reqwest::Method;
use tracing::{info, warn};

use crate::client::{EpoClient, ResponseClass};
use crate::error::Result;
use crate::resource::{DeviceId, Lookup, RelationshipRequest, TagId, resolve_by_name};

/// Result of one tag mutation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    /// The server accepted the change for these devices.
    Changed { devices: usize },
    /// No devices were given, so no request was sent.
    NothingToDo,
    /// The relationship was already in the requested state (409, or 404 on
    /// clear).
    AlreadySatisfied,
    /// The server refused the change.
    Rejected(ResponseClass),
}

impl TagOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, TagOutcome::Rejected(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Apply,
    Clear,
}

impl Mutation {
    fn method(self) -> Method {
        match self {
            Mutation::Apply => Method::POST,
            Mutation::Clear => Method::DELETE,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Mutation::Apply => "apply",
            Mutation::Clear => "clear",
        }
    }
}

/// Looks up a tag id by exact name.
///
/// # Errors
///
/// - `EpoError::AmbiguousName` when more than one tag carries `name`.
/// - Fatal classifications from [`EpoClient::check_response`].
pub async fn resolve_tag_id(client: &EpoClient, name: &str) -> Result<Lookup<TagId>> {
    resolve_by_name(client, "tags", "tag", name).await
}

/// Applies `tag` to every device in `devices` with a single request.
pub async fn apply_tag(client: &EpoClient, tag: TagId, devices: &[DeviceId]) -> Result<TagOutcome> {
    mutate(client, Mutation::Apply, tag, devices).await
}

/// Removes `tag` from every device in `devices` with a single request.
pub async fn clear_tag(client: &EpoClient, tag: TagId, devices: &[DeviceId]) -> Result<TagOutcome> {
    mutate(client, Mutation::Clear, tag, devices).await
}

async fn mutate(
    client: &EpoClient,
    mutation: Mutation,
    tag: TagId,
    devices: &[DeviceId],
) -> Result<TagOutcome> {
    if devices.is_empty() {
        info!(%tag, "no devices to {}", mutation.verb());
        return Ok(TagOutcome::NothingToDo);
    }

    let url = client.url_for(&format!("tags/{tag}/relationships/devices"))?;
    let body = RelationshipRequest::devices(devices);
    let (class, resp) = client.fetch(mutation.method(), url, Some(&body)).await?;

    let outcome = match (class, mutation) {
        (ResponseClass::Success, _) => TagOutcome::Changed {
            devices: devices.len(),
        },
        (ResponseClass::Conflict, _) | (ResponseClass::NotFound, Mutation::Clear) => {
            TagOutcome::AlreadySatisfied
        }
        (rejected, _) => TagOutcome::Rejected(rejected),
    };

    match &outcome {
        TagOutcome::Changed { devices } => {
            info!(%tag, devices, "tag {} succeeded", mutation.verb());
        }
        TagOutcome::AlreadySatisfied => {
            info!(%tag, devices = devices.len(), "tag already in requested state");
        }
        TagOutcome::Rejected(class) => {
            warn!(%tag, ?class, status = %resp.status, body = %resp.body, "tag {} rejected", mutation.verb());
        }
        TagOutcome::NothingToDo => {}
    }
    Ok(outcome)
}
