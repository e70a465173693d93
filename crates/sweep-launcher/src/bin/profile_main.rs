//! Launch Profiles - Main Entry Point
//!
//! # Usage
//!
//! ```bash
//! launch-profile list
//! launch-profile show "DQN Pauseable"
//! launch-profile export --out .vscode/launch.json
//! launch-profile --profiles profiles.yaml run eval
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sweep_launcher::config::{init_logging, LoggingConfig};
use sweep_launcher::{JobLog, ProfileRegistry};

/// Launch-profile registry
#[derive(Parser, Debug)]
#[command(name = "launch-profile")]
#[command(author = "Atari-CR Team")]
#[command(version = "0.1.0")]
#[command(about = "List, export and run the project's launch profiles")]
struct Cli {
    /// Profile file replacing the built-in profiles (YAML, JSON or launch.json)
    #[arg(long, global = true, value_name = "FILE")]
    profiles: Option<PathBuf>,

    #[command(flatten)]
    logging: LoggingConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List profile names
    List,
    /// Show one profile
    Show { name: String },
    /// Write an editor launch.json document
    Export {
        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run one profile, streaming its output
    Run { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.logging)?;

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let registry = match &cli.profiles {
        Some(path) => ProfileRegistry::from_file(path)?,
        None => ProfileRegistry::builtin(),
    };

    match cli.command {
        Command::List => {
            for profile in registry.iter() {
                println!("{:<24} {}", profile.name, profile.program.display());
            }
        }
        Command::Show { name } => {
            let profile = registry.get(&name)?;
            println!("{}", serde_yaml::to_string(profile)?);
        }
        Command::Export { out } => {
            let json = serde_json::to_string_pretty(&registry.to_launch_json())?;
            match out {
                Some(path) => {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        std::fs::create_dir_all(parent).with_context(|| {
                            format!("Failed to create directory: {}", parent.display())
                        })?;
                    }
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!("Wrote {} profile(s) to {}", registry.len(), path.display());
                }
                None => println!("{}", json),
            }
        }
        Command::Run { name } => {
            let status = registry.run(&name, JobLog::stdout()).await?;
            if !status.success() {
                tracing::warn!("Profile '{}' exited with {}", name, status);
                return Ok(status.code().unwrap_or(1));
            }
        }
    }
    Ok(0)
}
