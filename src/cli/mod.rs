//! Command-line interface.

pub mod serve;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Multi-tenant inference API gateway
#[derive(Debug, Parser)]
#[command(name = "gantry", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the gateway
    Serve(ServeArgs),
    /// Configuration utilities
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "gantry.toml", env = "GANTRY_CONFIG")]
    pub config: PathBuf,

    /// Override the ingress port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the bind host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Write a commented example configuration file
    Init(ConfigInitArgs),
}

#[derive(Debug, Args)]
pub struct ConfigInitArgs {
    /// Where to write the file
    #[arg(short, long, default_value = "gantry.toml")]
    pub output: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

/// Handle `gantry config init`.
pub fn handle_config_init(args: &ConfigInitArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.output.exists() && !args.force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            args.output.display()
        )
        .into());
    }

    std::fs::write(&args.output, include_str!("../../gantry.example.toml"))?;
    println!("Wrote {}", args.output.display());
    Ok(())
}
