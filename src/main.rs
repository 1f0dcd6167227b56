// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! tether CLI - resolve specifiers and walk module graphs

use anyhow::Context;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tether_loader::{Loader, LoaderOptions, VERSION};

#[derive(Parser)]
#[command(
    name = "tether",
    about = "Module resolution and loading engine for the Tether runtime",
    version = VERSION,
    author = "Pegasus Heavy Industries"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Read loader options from a JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Allow http(s) specifiers to resolve
    #[arg(long, global = true)]
    allow_network: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a specifier to its canonical id and format
    Resolve {
        /// The specifier to resolve
        specifier: String,

        /// File the specifier is imported from
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Load a module graph and print its dependency tree
    Graph {
        /// Entry module
        entry: PathBuf,
    },

    /// Load a module graph and report the first failure
    Check {
        /// Entry module
        entry: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("tether_loader=debug,tether=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("tether_loader=warn,tether=warn")
            .init();
    }

    let loader = Loader::with_options(load_options(&cli)?);

    match cli.command {
        Command::Resolve { specifier, from } => {
            let parent = from.map(|p| p.display().to_string());
            match loader.resolve(&specifier, parent.as_deref()) {
                Ok(resolution) => {
                    println!(
                        "{} {}",
                        resolution.id.cyan(),
                        format!("({})", resolution.format).dimmed()
                    );
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red().bold(), e);
                    std::process::exit(1);
                }
            }
        }
        Command::Graph { entry } => {
            let id = canonical_entry(&entry)?;
            loader.set_main(id.clone());
            if let Err(e) = loader.import(&id, None).await {
                eprintln!("{}: {}", "Error".red().bold(), e);
                std::process::exit(1);
            }
            let mut seen = HashSet::new();
            print_tree(&loader, &id, 0, &mut seen);
            println!(
                "\n{} module(s) loaded",
                loader.registry().len().to_string().green()
            );
        }
        Command::Check { entry } => {
            let id = canonical_entry(&entry)?;
            loader.set_main(id.clone());
            match loader.import(&id, None).await {
                Ok(_) => {
                    println!(
                        "{} {} ({} module(s))",
                        "OK".green().bold(),
                        id,
                        loader.registry().len()
                    );
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red().bold(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn load_options(cli: &Cli) -> anyhow::Result<LoaderOptions> {
    let mut options = match &cli.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => LoaderOptions::default(),
    };
    if cli.allow_network {
        options.allow_network_imports = true;
    }
    Ok(options)
}

fn canonical_entry(entry: &Path) -> anyhow::Result<String> {
    let path = entry
        .canonicalize()
        .with_context(|| format!("entry module {}", entry.display()))?;
    Ok(path.display().to_string())
}

fn print_tree(loader: &Loader, id: &str, depth: usize, seen: &mut HashSet<String>) {
    let indent = "  ".repeat(depth);
    let Some(record) = loader.registry().get(id) else {
        println!("{indent}{} {}", id, "(missing)".red());
        return;
    };

    if !seen.insert(id.to_string()) {
        println!("{indent}{} {}", id.dimmed(), "(already shown)".dimmed());
        return;
    }

    println!(
        "{indent}{} {}",
        id.cyan(),
        format!("({})", record.format()).dimmed()
    );
    for dependency in record.dependencies() {
        print_tree(loader, &dependency, depth + 1, seen);
    }
}
