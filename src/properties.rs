//! Device property and installed-product collection.
//!
//! Properties are requested through a sparse `fields=` list that must come
//! from [`AVAILABLE_PROPERTIES`]. [`FieldSelection`] filters a user request
//! against that allow-list up front, so unknown names are reported once and
//! never sent to the server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::client::{EpoClient, ResponseClass};
use crate::config::ConfigError;
use crate::error::Result;
use crate::resource::{DeviceId, Document, Lookup, Resource};

/// Device properties the API accepts in `fields=`, in the order they are
/// requested and reported.
pub const AVAILABLE_PROPERTIES: [&str; 32] = [
    "id",
    "name",
    "parentId",
    "epoGroup",
    "agentGuid",
    "lastUpdate",
    "agentState",
    "nodePath",
    "agentPlatform",
    "agentVersion",
    "nodeCreatedDate",
    "managed",
    "tenantId",
    "tags",
    "excludedTags",
    "managedState",
    "computerName",
    "domainName",
    "ipAddress",
    "osType",
    "osVersion",
    "cpuType",
    "cpuSpeed",
    "numOfCpu",
    "totalPhysicalMemory",
    "macAddress",
    "userName",
    "osPlatform",
    "ipHostName",
    "isPortable",
    "installedProducts",
    "assignedTags",
];

/// Attribute map of one device, keyed by property name.
pub type Properties = Map<String, Value>;

// ── Field selection ────────────────────────────────────────────────────

/// Requested properties intersected with [`AVAILABLE_PROPERTIES`].
///
/// Invariant: `fields` is never empty and keeps allow-list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelection {
    fields: Vec<&'static str>,
    dropped: Vec<String>,
}

impl FieldSelection {
    /// Keeps the requested names that are on the allow-list. Names that are
    /// not are recorded in [`Self::dropped`] and logged.
    ///
    /// # Errors
    ///
    /// `ConfigError::NoValidFields` when nothing requested is available.
    pub fn new<S: AsRef<str>>(requested: &[S]) -> std::result::Result<Self, ConfigError> {
        let wanted = |prop: &str| requested.iter().any(|r| r.as_ref() == prop);
        let fields: Vec<&'static str> = AVAILABLE_PROPERTIES
            .iter()
            .copied()
            .filter(|prop| wanted(*prop))
            .collect();
        let dropped: Vec<String> = requested
            .iter()
            .map(|r| r.as_ref())
            .filter(|r: &&str| !AVAILABLE_PROPERTIES.contains(r))
            .map(str::to_string)
            .collect();

        if fields.is_empty() {
            return Err(ConfigError::NoValidFields {
                requested: requested.iter().map(|r| r.as_ref().to_string()).collect(),
            });
        }
        if !dropped.is_empty() {
            warn!(?dropped, "ignoring unknown properties");
        }
        info!(?fields, "properties selected for collection");
        Ok(FieldSelection { fields, dropped })
    }

    /// Every available property.
    pub fn all() -> Self {
        FieldSelection {
            fields: AVAILABLE_PROPERTIES.to_vec(),
            dropped: Vec::new(),
        }
    }

    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }

    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }

    fn query_value(&self) -> String {
        self.fields.join(",")
    }
}

// ── Properties ─────────────────────────────────────────────────────────

/// Fetches the selected properties of one device.
///
/// Any non-fatal failure (unknown id, bad request, persisting server error)
/// is reported as [`Lookup::NotFound`].
pub async fn collect_properties(
    client: &EpoClient,
    id: DeviceId,
    selection: &FieldSelection,
) -> Result<Lookup<Properties>> {
    let mut url = client.url_for(&format!("devices/{id}"))?;
    url.query_pairs_mut()
        .append_pair("fields", &selection.query_value());

    let (class, resp) = client.fetch::<()>(reqwest::Method::GET, url, None).await?;
    if class != ResponseClass::Success {
        info!(%id, status = %resp.status, "unable to collect device properties");
        return Ok(Lookup::NotFound);
    }

    let doc: Document<Resource<DeviceId, Properties>> = resp.json()?;
    debug!(%id, properties = doc.data.attributes.len(), "properties collected");
    Ok(Lookup::Found(doc.data.attributes))
}

/// Fetches the selected properties of every device, page by page.
pub async fn collect_all_properties(
    client: &EpoClient,
    selection: &FieldSelection,
) -> Result<Vec<Properties>> {
    let mut url = client.url_for("devices")?;
    url.query_pairs_mut()
        .append_pair("fields", &selection.query_value())
        .append_pair("page[offset]", "0")
        .append_pair("page[limit]", &client.limits().devices.to_string());

    let devices: Vec<Resource<DeviceId, Properties>> = client.get_all_pages(url).await?;
    info!(devices = devices.len(), "properties collected for all devices");
    Ok(devices.into_iter().map(|d| d.attributes).collect())
}

// ── Installed products ─────────────────────────────────────────────────

/// One Trellix product installed on a device. Attributes other than the
/// family name and version are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledProduct {
    #[serde(default)]
    pub product_family_name: String,
    #[serde(default)]
    pub product_version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct ProductResource {
    #[serde(default)]
    attributes: InstalledProduct,
}

/// Lists the products installed on a device. A failed request yields an
/// empty list.
pub async fn installed_products(client: &EpoClient, id: DeviceId) -> Result<Vec<InstalledProduct>> {
    let url = client.url_for(&format!("devices/{id}/installedProducts"))?;
    let (class, resp) = client.fetch::<()>(reqwest::Method::GET, url, None).await?;
    if class != ResponseClass::Success {
        debug!(%id, status = %resp.status, "no product collected");
        return Ok(Vec::new());
    }

    let doc: Document<Vec<ProductResource>> = resp.json()?;
    Ok(doc.data.into_iter().map(|p| p.attributes).collect())
}
