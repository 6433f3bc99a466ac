//! Multi-step flows behind the CLI subcommands.
//!
//! Each flow takes device names as read from a device-list file, resolves
//! them, and drives the endpoint modules. Per-device problems (unknown or
//! ambiguous names, rejected mutations) are collected and reported instead
//! of aborting the whole run; session-level failures still propagate.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::client::EpoClient;
use crate::devices::{list_all_devices, resolve_device_id};
use crate::error::{EpoError, Result};
use crate::properties::{self, FieldSelection, Properties};
use crate::report::DeviceInventory;
use crate::resource::{DeviceId, Lookup, TagId};
use crate::tags::{self, TagOutcome};

/// Keyword selecting every device (as FILE) or every property (as PROPS).
pub const ALL: &str = "all";

// ── Inputs ─────────────────────────────────────────────────────────────

/// Reads a device-list file: one name per line, trimmed, blank lines
/// skipped.
pub async fn read_device_names(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path).await?;
    let names: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    debug!(path = %path.display(), devices = names.len(), "device list loaded");
    Ok(names)
}

/// Parses a comma-separated property list. `all` anywhere in the list
/// selects every property.
pub fn parse_selection(raw: &str) -> Result<FieldSelection> {
    let requested: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if requested.iter().any(|p| p.eq_ignore_ascii_case(ALL)) {
        return Ok(FieldSelection::all());
    }
    Ok(FieldSelection::new(requested.as_slice())?)
}

/// Resolves a device for a read-only report. Unknown and ambiguous names
/// are logged and skipped.
async fn resolve_for_report(client: &EpoClient, name: &str) -> Result<Option<DeviceId>> {
    match resolve_device_id(client, name).await {
        Ok(Lookup::Found(id)) => {
            info!(device = name, %id, "device resolved");
            Ok(Some(id))
        }
        Ok(Lookup::NotFound) => {
            info!(device = name, "device not found");
            Ok(None)
        }
        Err(e @ EpoError::AmbiguousName { .. }) => {
            warn!(error = %e, "skipping device");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

// ── Tagging ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagAction {
    Apply,
    Clear,
}

impl TagAction {
    async fn run(self, client: &EpoClient, tag: TagId, devices: &[DeviceId]) -> Result<TagOutcome> {
        match self {
            TagAction::Apply => tags::apply_tag(client, tag, devices).await,
            TagAction::Clear => tags::clear_tag(client, tag, devices).await,
        }
    }

    /// Whether a device in this tag state needs the action.
    fn needed(self, applied: bool) -> bool {
        applied == (self == TagAction::Clear)
    }
}

/// Per-device results of a tagging run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TagSummary {
    /// Devices the server changed.
    pub changed: usize,
    /// Devices already in the requested state.
    pub already_satisfied: usize,
    /// Names with no device in the system tree.
    pub not_found: Vec<String>,
    /// Names matching more than one device (per-device mode only).
    pub ambiguous: Vec<String>,
    /// Devices whose change the server refused.
    pub rejected: Vec<String>,
}

impl TagSummary {
    /// `true` when no mutation was refused. Unknown names are not failures.
    pub fn is_success(&self) -> bool {
        self.rejected.is_empty()
    }
}

async fn require_tag(client: &EpoClient, name: &str) -> Result<TagId> {
    match tags::resolve_tag_id(client, name).await? {
        Lookup::Found(id) => {
            info!(tag = name, %id, "tag resolved");
            Ok(id)
        }
        Lookup::NotFound => Err(EpoError::UnknownTag(name.to_string())),
    }
}

/// Resolves and tags each device with its own request.
pub async fn tag_each_device(
    client: &EpoClient,
    tag_name: &str,
    devices: &[String],
    action: TagAction,
) -> Result<TagSummary> {
    let tag = require_tag(client, tag_name).await?;
    let mut summary = TagSummary::default();

    for name in devices {
        let id = match resolve_device_id(client, name).await {
            Ok(Lookup::Found(id)) => id,
            Ok(Lookup::NotFound) => {
                info!(device = %name, "device not found in system tree");
                summary.not_found.push(name.clone());
                continue;
            }
            Err(e @ EpoError::AmbiguousName { .. }) => {
                warn!(error = %e, "skipping device");
                summary.ambiguous.push(name.clone());
                continue;
            }
            Err(e) => return Err(e),
        };

        match action.run(client, tag, &[id]).await? {
            TagOutcome::Changed { devices } => summary.changed += devices,
            TagOutcome::AlreadySatisfied => summary.already_satisfied += 1,
            TagOutcome::NothingToDo => {}
            TagOutcome::Rejected(_) => summary.rejected.push(name.clone()),
        }
    }

    Ok(summary)
}

/// Lists every device once, keeps those whose tag state needs changing,
/// and mutates them all in one request.
///
/// Every device carrying a listed name is considered, so duplicate names
/// are tagged together rather than skipped.
pub async fn tag_devices_in_batch(
    client: &EpoClient,
    tag_name: &str,
    devices: &[String],
    action: TagAction,
) -> Result<TagSummary> {
    let tag = require_tag(client, tag_name).await?;
    let index = list_all_devices(client).await?;
    let mut summary = TagSummary::default();
    let mut selected: Vec<DeviceId> = Vec::new();

    for name in devices {
        let ids = index.ids_named(name);
        if ids.is_empty() {
            info!(device = %name, "device not found in system tree");
            summary.not_found.push(name.clone());
            continue;
        }
        for id in ids {
            if action.needed(index.is_tag_applied(id, tag_name)) {
                selected.push(id);
            } else {
                debug!(device = %name, %id, "tag already in requested state");
                summary.already_satisfied += 1;
            }
        }
    }
    selected.sort_unstable();
    selected.dedup();

    info!(devices = selected.len(), ?action, tag = tag_name, "starting batch tag change");
    match action.run(client, tag, &selected).await? {
        TagOutcome::Changed { devices } => summary.changed += devices,
        TagOutcome::AlreadySatisfied => summary.already_satisfied += selected.len(),
        TagOutcome::NothingToDo => {}
        TagOutcome::Rejected(_) => summary.rejected.extend(
            selected
                .iter()
                .map(|id| index.name(*id).unwrap_or_default().to_string()),
        ),
    }

    Ok(summary)
}

// ── Reports ────────────────────────────────────────────────────────────

/// Collects selected properties for each named device. Devices that cannot
/// be resolved or read are skipped.
pub async fn device_properties(
    client: &EpoClient,
    devices: &[String],
    selection: &FieldSelection,
) -> Result<Vec<Properties>> {
    info!(devices = devices.len(), "collecting device properties");
    let mut rows = Vec::new();
    for name in devices {
        let Some(id) = resolve_for_report(client, name).await? else {
            continue;
        };
        if let Lookup::Found(props) = properties::collect_properties(client, id, selection).await? {
            rows.push(props);
        }
    }
    Ok(rows)
}

/// Collects installed products for each named device.
pub async fn device_inventory(client: &EpoClient, devices: &[String]) -> Result<Vec<DeviceInventory>> {
    info!(devices = devices.len(), "collecting installed products");
    let mut inventory = Vec::new();
    for name in devices {
        let Some(id) = resolve_for_report(client, name).await? else {
            continue;
        };
        let products = properties::installed_products(client, id).await?;
        debug!(device = %name, products = products.len(), "products collected");
        inventory.push(DeviceInventory {
            name: name.clone(),
            id,
            products,
        });
    }
    Ok(inventory)
}
