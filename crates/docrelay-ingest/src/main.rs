//! docrelay ingest - SharePoint to Snowflake file relay

use anyhow::{Context, Result};
use clap::Parser;
use docrelay_common::logging::{init_logging, LogConfig};
use docrelay_ingest::config::JobConfig;
use docrelay_ingest::pipeline::{self, Pipeline};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "docrelay-ingest")]
#[command(author, version, about = "Relay a SharePoint file through S3 into Snowflake")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Fetch, stage and load the configured file
    Run,

    /// Print the load statements for the current configuration
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // .env has to be applied before LOG_* is read
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("Cannot read .env");
        }
    }

    // the flag can only raise verbosity
    let mut log_config = LogConfig::from_env().context("Invalid logging configuration")?;
    if cli.verbose {
        log_config = log_config.verbose();
    }
    let _guard = init_logging(&log_config)?;

    let config = JobConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Command::Run => {
            let pipeline = Pipeline::from_config(&config).await?;
            let message = pipeline.run(&config).await?;
            println!("{}", message);
        },
        Command::Plan => {
            let plan = pipeline::plan(&config);
            if let Err(e) = plan.check_schema() {
                info!(policy = %config.warehouse.schema_check, "{}", e);
            }
            for sql in plan.statements() {
                println!("{}", sql);
            }
        },
    }

    Ok(())
}
