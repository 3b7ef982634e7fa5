mod cli;
mod commands;
mod error;
mod logging;
mod output;
mod shutdown;

use clap::Parser;
use std::process::ExitCode;

use crate::cli::Cli;
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let outcome = commands::run(&cli).await?;
    output::render(&outcome.data, cli.pretty)?;
    Ok(ExitCode::from(outcome.exit_code))
}
