//! cellnas - Main Entry Point
//!
//! Inspect and exercise cell-based NAS search spaces from the command line.

use clap::Parser;
use cellnas::cli::{cmd_encode, cmd_forward, cmd_genotype, cmd_info, Cli, Commands, SpaceArgs};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cellnas=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Info { space }) => {
            cmd_info(&space)?;
        }
        Some(Commands::Forward { space, batch, size, mode, eval }) => {
            cmd_forward(&space, batch, size, mode, eval)?;
        }
        Some(Commands::Genotype { space, weights, output }) => {
            cmd_genotype(&space, &weights, output.as_deref())?;
        }
        Some(Commands::Encode { space, genotype, output }) => {
            cmd_encode(&space, &genotype, output.as_deref())?;
        }
        None => {
            // Default: summary of the DARTS space
            let space = SpaceArgs {
                config: None,
                space: None,
                channels: None,
                layers: None,
                nodes: None,
                seed: 0,
            };
            cmd_info(&space)?;
        }
    }

    Ok(())
}
