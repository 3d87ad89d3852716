//! rowflow CLI - command-line front end for the rowflow workflow driver.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// rowflow - parallel table-sweeping workflow driver.
#[derive(Parser)]
#[command(name = "rowflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow configuration
    Run {
        /// Workflow configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Output container file
        #[arg(short, long)]
        output: PathBuf,

        /// Input container to loop over, optional with a custom generator
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Start position within the source dataset
        #[arg(short, long)]
        start: Option<u64>,

        /// End position within the source dataset
        #[arg(short, long)]
        end: Option<u64>,
    },

    /// Parse and check a workflow configuration without running it
    Validate {
        /// Workflow configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the dataset layout of a container file
    Inspect {
        /// Container file
        file: PathBuf,

        /// Also list reference tables and region indices
        #[arg(long)]
        refs: bool,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            config,
            output,
            input,
            start,
            end,
        } => commands::run::execute(config, output, input, start, end),
        Commands::Validate { config } => commands::validate::execute(config),
        Commands::Inspect { file, refs } => commands::inspect::execute(file, refs),
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        std::process::exit(err.exit_code());
    }
}
