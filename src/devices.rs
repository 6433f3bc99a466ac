//! Device lookup and the bulk device/tag index.
//!
//! - [`resolve_device_id`]: exact-name lookup, always a fresh request.
//! - [`list_all_devices`]: walks every page of `devices` once and returns a
//!   [`DeviceIndex`] of names and applied tags, used by batch tagging to
//!   decide which devices actually need a change.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::info;

use crate::client::EpoClient;
use crate::error::Result;
use crate::resource::{DeviceId, Lookup, Resource, resolve_by_name};

/// Attributes requested by [`list_all_devices`].
#[derive(Debug, Default, Deserialize)]
struct IndexAttributes {
    #[serde(default)]
    name: Option<String>,
    /// Comma-separated tag names, e.g. `"Server, Workstation"`.
    #[serde(default)]
    tags: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexedDevice {
    name: String,
    tags: String,
}

/// Snapshot of every device's name and applied tags, taken by one
/// [`list_all_devices`] call. Never refreshed in place.
#[derive(Debug, Clone, Default)]
pub struct DeviceIndex {
    devices: BTreeMap<DeviceId, IndexedDevice>,
}

impl DeviceIndex {
    /// Adds or replaces one device.
    pub fn insert(&mut self, id: DeviceId, name: impl Into<String>, tags: impl Into<String>) {
        self.devices.insert(
            id,
            IndexedDevice {
                name: name.into(),
                tags: tags.into(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn name(&self, id: DeviceId) -> Option<&str> {
        self.devices.get(&id).map(|d| d.name.as_str())
    }

    /// Raw comma-separated tag string of a device.
    pub fn tags(&self, id: DeviceId) -> Option<&str> {
        self.devices.get(&id).map(|d| d.tags.as_str())
    }

    /// Whether `tag` is among the device's applied tags. Matching is exact
    /// after trimming each comma-separated entry. Unknown ids are `false`.
    pub fn is_tag_applied(&self, id: DeviceId, tag: &str) -> bool {
        self.tags(id)
            .is_some_and(|tags| tags.split(',').any(|applied| applied.trim() == tag))
    }

    /// Ids of every device with exactly this name, in id order.
    pub fn ids_named(&self, name: &str) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|(_, d)| d.name == name)
            .map(|(id, _)| *id)
            .collect()
    }

    /// `(id, name)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &str)> {
        self.devices.iter().map(|(id, d)| (*id, d.name.as_str()))
    }
}

/// Looks up a device id by exact name.
///
/// # Errors
///
/// - `EpoError::AmbiguousName` when more than one device carries `name`.
/// - Fatal classifications from [`EpoClient::check_response`].
pub async fn resolve_device_id(client: &EpoClient, name: &str) -> Result<Lookup<DeviceId>> {
    resolve_by_name(client, "devices", "device", name).await
}

/// Lists every device with its name and applied tags.
///
/// The first request is
/// `devices?fields=id,name,tags&page[offset]=0&page[limit]=<device page size>`;
/// later pages come from `links.next`. A page that still fails after the
/// client's retries aborts the listing with `EpoError::Api`.
pub async fn list_all_devices(client: &EpoClient) -> Result<DeviceIndex> {
    let mut url = client.url_for("devices")?;
    url.query_pairs_mut()
        .append_pair("fields", "id,name,tags")
        .append_pair("page[offset]", "0")
        .append_pair("page[limit]", &client.limits().devices.to_string());

    let resources: Vec<Resource<DeviceId, IndexAttributes>> = client.get_all_pages(url).await?;

    let mut index = DeviceIndex::default();
    for device in resources {
        index.insert(
            device.id,
            device.attributes.name.unwrap_or_default(),
            device.attributes.tags.unwrap_or_default(),
        );
    }
    info!(devices = index.len(), "device index built");
    Ok(index)
}
