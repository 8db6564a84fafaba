//! weft - resolve declarative project descriptions into a build graph.

mod cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about = "Declarative project description resolver", long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Resolve a project and emit the resolved graph as JSON
  Resolve {
    /// Project description file, or a directory containing exactly one
    #[arg(default_value = ".")]
    project: PathBuf,

    /// Profile to resolve for
    #[arg(short, long, default_value = "default")]
    profile: String,

    /// Build variant (debug, release, ...)
    #[arg(long, default_value = "debug")]
    variant: String,

    /// Settings directory holding the profiles
    #[arg(long)]
    settings_dir: Option<PathBuf>,

    /// Build root directory
    #[arg(long)]
    build_root: Option<PathBuf>,

    /// Property overrides (module.property=value), highest precedence
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Treat undeclared properties as errors
    #[arg(long)]
    strict: bool,

    /// Write the resolved graph to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },

  /// List the profiles in the settings directory
  Profiles {
    /// Settings directory holding the profiles
    #[arg(long, default_value = ".")]
    settings_dir: PathBuf,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .without_time()
    .init();

  let cli = Cli::parse();
  match cli.command {
    Commands::Resolve {
      project,
      profile,
      variant,
      settings_dir,
      build_root,
      overrides,
      strict,
      output,
    } => cmd::cmd_resolve(cmd::ResolveOptions {
      project,
      profile,
      variant,
      settings_dir,
      build_root,
      overrides,
      strict,
      output,
      verbose: cli.verbose,
    }),
    Commands::Profiles { settings_dir } => cmd::cmd_profiles(&settings_dir),
  }
}
