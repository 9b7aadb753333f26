use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facesort_core::config::clamp_f32;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod plan;
mod run;

use config::Config;

#[derive(Parser)]
#[command(name = "facesort", about = "Match face clusters to known persons per folder")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/facesort/config.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assign each directory's cluster plan to persons and update its registry
    Match {
        /// Target directories, each holding a cluster plan
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
        /// Plan file name inside each directory
        #[arg(long)]
        plan_file: Option<String>,
        /// Global match threshold (0–1)
        #[arg(long)]
        threshold: Option<f32>,
        /// Required gap between best and second-best person (0–1)
        #[arg(long)]
        margin: Option<f32>,
        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List persons in a directory's registry
    List {
        dir: PathBuf,
    },
    /// Set or clear a person's custom match threshold
    SetThreshold {
        dir: PathBuf,
        number: u32,
        /// New threshold (0–1); only ever raises the global one
        #[arg(required_unless_present = "clear", conflicts_with = "clear")]
        value: Option<f32>,
        /// Remove the custom threshold
        #[arg(long)]
        clear: bool,
    },
    /// Upgrade a registry to the current schema
    Migrate {
        dir: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Match {
            dirs,
            plan_file,
            threshold,
            margin,
            output,
        } => {
            let mut config = config.with_overrides(threshold, margin);
            if let Some(name) = plan_file {
                config.plan_file = name;
            }

            let outcomes = run::process_all(&dirs, &config);
            let json = serde_json::to_string_pretty(&outcomes)?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("writing report {}", path.display()))?,
                None => println!("{json}"),
            }

            let failed = outcomes.iter().filter(|o| o.is_failed()).count();
            if failed > 0 {
                bail!("{failed} of {} directories failed", outcomes.len());
            }
        }
        Commands::List { dir } => {
            let registry = config.store(&dir).load();
            if registry.is_empty() {
                println!("No persons in {}", dir.display());
            }
            for p in &registry.persons {
                let threshold = p
                    .custom_threshold
                    .map_or_else(|| "-".to_string(), |t| format!("{t:.2}"));
                println!(
                    "{:>5}  prototypes={}  observations={}  threshold={}",
                    p.number,
                    p.prototypes.len(),
                    p.observation_count,
                    threshold
                );
            }
        }
        Commands::SetThreshold {
            dir,
            number,
            value,
            clear,
        } => {
            let store = config.store(&dir);
            let mut registry = store.load();
            let Some(person) = registry.get_mut(number) else {
                bail!("no person {number} in {}", dir.display());
            };
            person.custom_threshold = if clear {
                None
            } else {
                value.map(|v| clamp_f32(v, 0.0, 1.0, config.matching.match_threshold))
            };
            tracing::info!(person = number, threshold = ?person.custom_threshold, "custom threshold updated");
            store.save(&mut registry)?;
        }
        Commands::Migrate { dir } => {
            let store = config.store(&dir);
            let registry = store.load();
            println!(
                "{}: {} persons, schema v{}",
                store.path().display(),
                registry.len(),
                registry.version
            );
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
