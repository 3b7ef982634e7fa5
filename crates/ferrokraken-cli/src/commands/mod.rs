mod resources;
mod state;
mod sync;

use std::path::Path;

use ferrokraken_warehouse::{Warehouse, WarehouseConfig};
use serde_json::Value;

use crate::cli::{Cli, Command, StateCommand};
use crate::error::CliError;

/// JSON document printed on stdout plus the process exit status.
#[derive(Debug)]
pub struct CommandOutcome {
    pub data: Value,
    pub exit_code: u8,
}

impl CommandOutcome {
    pub fn ok(data: Value) -> Self {
        Self { data, exit_code: 0 }
    }

    pub fn with_exit_code(mut self, exit_code: u8) -> Self {
        self.exit_code = exit_code;
        self
    }
}

pub async fn run(cli: &Cli) -> Result<CommandOutcome, CliError> {
    let db = cli.db.as_deref();
    match &cli.command {
        Command::Sync(args) => sync::run(args, db).await,
        Command::Resources => resources::run(),
        Command::State(args) => match &args.command {
            StateCommand::Show => state::show(&open_warehouse(db)?),
            StateCommand::Reset(reset) => state::reset(&open_warehouse(db)?, reset),
        },
    }
}

fn warehouse_config(db: Option<&Path>) -> WarehouseConfig {
    match db {
        Some(path) => WarehouseConfig::with_db_path(path),
        None => WarehouseConfig::default(),
    }
}

fn open_warehouse(db: Option<&Path>) -> Result<Warehouse, CliError> {
    Ok(Warehouse::open(warehouse_config(db))?)
}
