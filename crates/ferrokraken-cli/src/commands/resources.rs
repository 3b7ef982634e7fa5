use ferrokraken_core::ResourceCatalog;
use serde_json::json;

use crate::error::CliError;

use super::CommandOutcome;

pub fn run() -> Result<CommandOutcome, CliError> {
    let catalog = ResourceCatalog::standard();
    let resources = catalog
        .iter()
        .map(|descriptor| {
            Ok(json!({
                "incremental": descriptor.is_incremental(),
                "descriptor": serde_json::to_value(descriptor)?,
            }))
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()?;
    Ok(CommandOutcome::ok(json!({ "resources": resources })))
}
