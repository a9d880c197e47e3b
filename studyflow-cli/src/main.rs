mod commands;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use commands::process::ProcessArgs;
use commands::status::StatusArgs;
use commands::validate::ValidateArgs;

#[derive(Parser)]
#[command(
    name = "studyflow",
    version,
    about = "Dependency-driven scheduler for imaging study flows"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a flow definition and print its execution plan
    Validate(ValidateArgs),
    /// Feed JSON-lines broker messages through the scheduler
    Process(ProcessArgs),
    /// Show stored flow instances
    Status(StatusArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Process(args) => commands::process::execute(args).await,
        Commands::Status(args) => commands::status::execute(args),
    }
}
