use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use stevedore_core::CacheLevel;

mod commands;

#[derive(Parser)]
#[command(name = "stevedore")]
#[command(about = "Parallel, change-aware container image builds", long_about = None, version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover services and build their images
    Build(commands::build::BuildArgs),

    /// Write a sample build.yaml
    Init {
        /// Where to write the sample
        #[arg(short, long, default_value = stevedore_core::paths::DEFAULT_CONFIG_FILE)]
        output: PathBuf,

        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Inspect the build cache
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Remove expired entries
    Cleanup {
        /// Cache backend
        #[arg(long, default_value = "distributed", value_parser = commands::cache_level_parser())]
        cache_level: CacheLevel,
    },

    /// Remove the entry for one service
    Clear {
        /// Service name
        service: String,

        /// Cache backend
        #[arg(long, default_value = "distributed", value_parser = commands::cache_level_parser())]
        cache_level: CacheLevel,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = stevedore_core::init_observability(cli.verbose) {
        eprintln!("warning: logging disabled: {}", e);
    }

    match cli.command {
        Commands::Build(args) => {
            let succeeded = commands::build::build(args).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }

        Commands::Init { output, force } => {
            commands::init::init(&output, force)?;
        }

        Commands::Cache(cache_cmd) => match cache_cmd {
            CacheCommands::Cleanup { cache_level } => {
                commands::cache::cleanup(cache_level)?;
            }

            CacheCommands::Clear { service, cache_level } => {
                commands::cache::clear(&service, cache_level)?;
            }
        },
    }

    Ok(())
}
