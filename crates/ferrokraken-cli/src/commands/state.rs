use ferrokraken_core::{CursorStore, ResourceCatalog, ValidationError};
use ferrokraken_warehouse::Warehouse;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::cli::ResetArgs;
use crate::error::CliError;

use super::CommandOutcome;

#[derive(Debug, Serialize)]
struct ResourceState {
    resource: &'static str,
    incremental: bool,
    last_timestamp_ms: Option<i64>,
    last_timestamp: Option<String>,
    continuation_token: Option<String>,
    rows: i64,
}

pub fn show(warehouse: &Warehouse) -> Result<CommandOutcome, CliError> {
    let cursors = warehouse.list()?;
    let states = ResourceCatalog::standard()
        .iter()
        .map(|descriptor| {
            let cursor = cursors.get(descriptor.name);
            let last_timestamp = cursor.and_then(|cursor| cursor.last_timestamp);
            Ok(ResourceState {
                resource: descriptor.name,
                incremental: descriptor.is_incremental(),
                last_timestamp_ms: last_timestamp.map(|ts| ts.as_millis()),
                last_timestamp: last_timestamp.and_then(|ts| ts.format_rfc3339()),
                continuation_token: cursor.and_then(|cursor| cursor.continuation_token.clone()),
                rows: warehouse.row_count(descriptor.name)?,
            })
        })
        .collect::<Result<Vec<_>, CliError>>()?;

    Ok(CommandOutcome::ok(json!({
        "db_path": warehouse.db_path().display().to_string(),
        "resources": states,
    })))
}

pub fn reset(warehouse: &Warehouse, args: &ResetArgs) -> Result<CommandOutcome, CliError> {
    let catalog = ResourceCatalog::standard();
    let targets: Vec<&'static str> = match (&args.resource, args.all) {
        (_, true) => catalog.names(),
        (Some(name), false) => vec![
            catalog
                .get(name)
                .ok_or_else(|| ValidationError::UnknownResource { name: name.clone() })?
                .name,
        ],
        (None, false) => Vec::new(),
    };

    let mut removed = Vec::new();
    for resource in targets {
        if warehouse.reset(resource)? {
            removed.push(resource);
        }
    }
    info!(removed = removed.len(), "cursor reset finished");

    Ok(CommandOutcome::ok(json!({ "reset": removed })))
}
