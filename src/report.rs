//! JSON and CSV rendering of collected device data.
//!
//! JSON output wraps rows as `{"data": [...]}`. CSV output comes in two
//! shapes:
//!
//! - properties: one row per device, columns taken from the first row's keys
//!   in allow-list order;
//! - products: one row per device, a `System Name` column followed by one
//!   column per product family (sorted), each cell holding the version.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::properties::{AVAILABLE_PROPERTIES, InstalledProduct, Properties};
use crate::resource::DeviceId;

/// First column of the products CSV.
pub const SYSTEM_NAME_COLUMN: &str = "System Name";

/// Installed products of one named device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInventory {
    pub name: String,
    pub id: DeviceId,
    pub products: Vec<InstalledProduct>,
}

#[derive(Serialize)]
struct DataEnvelope<'a, T> {
    data: &'a [T],
}

/// Pretty-printed `{"data": [...]}`.
pub fn render_json<T: Serialize>(rows: &[T]) -> Result<String> {
    Ok(serde_json::to_string_pretty(&DataEnvelope { data: rows })?)
}

/// Strings verbatim, `null` as an empty cell, anything else as JSON text.
fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn write_csv(header: &[String], rows: impl Iterator<Item = Vec<String>>) -> Result<String> {
    let mut buf = Vec::new();
    {
        let mut wtr = csv::Writer::from_writer(&mut buf);
        wtr.write_record(header)?;
        for row in rows {
            wtr.write_record(&row)?;
        }
        wtr.flush()?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Device properties as CSV. Columns are the first row's keys ordered as in
/// [`AVAILABLE_PROPERTIES`], with any other key after them; later rows
/// missing a column get an empty cell. Empty input renders nothing.
pub fn properties_csv(rows: &[Properties]) -> Result<String> {
    let Some(first) = rows.first() else {
        return Ok(String::new());
    };
    let rank = |key: &str| {
        AVAILABLE_PROPERTIES
            .iter()
            .position(|prop| *prop == key)
            .unwrap_or(usize::MAX)
    };
    let mut header: Vec<String> = first.keys().cloned().collect();
    header.sort_by_key(|key| rank(key));
    write_csv(
        &header,
        rows.iter()
            .map(|row| header.iter().map(|key| cell(row.get(key))).collect()),
    )
}

/// Installed-product inventory as CSV. Empty input renders nothing.
pub fn products_csv(inventory: &[DeviceInventory]) -> Result<String> {
    if inventory.is_empty() {
        return Ok(String::new());
    }

    let families: BTreeSet<&str> = inventory
        .iter()
        .flat_map(|device| &device.products)
        .map(|p| p.product_family_name.as_str())
        .collect();

    let header: Vec<String> = std::iter::once(SYSTEM_NAME_COLUMN)
        .chain(families.iter().copied())
        .map(str::to_string)
        .collect();

    write_csv(
        &header,
        inventory.iter().map(|device| {
            let versions: BTreeMap<&str, &str> = device
                .products
                .iter()
                .map(|p| (p.product_family_name.as_str(), p.product_version.as_str()))
                .collect();
            std::iter::once(device.name.clone())
                .chain(
                    families
                        .iter()
                        .map(|family| versions.get(family).copied().unwrap_or_default().to_string()),
                )
                .collect()
        }),
    )
}
