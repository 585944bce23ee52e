//! vmfixture CLI entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// vmfixture - VM test fixture processing
#[derive(Parser, Debug)]
#[command(name = "vmfixture")]
#[command(about = "Prepare and clean up VM test fixtures")]
#[command(version)]
struct Cli {
    /// Parameter file (flat TOML table).
    #[arg(short, long, global = true, value_name = "FILE")]
    params: Option<PathBuf>,

    /// Override a parameter (KEY=VALUE, repeatable).
    #[arg(short = 's', long = "set", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the effective parameters.
    Params(cli::params::ParamsCmd),

    /// Run image lifecycle actions without VMs.
    #[command(subcommand)]
    Images(cli::images::ImagesCmd),

    /// Show host facts probed before a test.
    HostInfo(cli::host::HostInfoCmd),
}

fn main() {
    let cli = Cli::parse();

    init_logging(cli.log_json);

    tracing::debug!(version = vmfixture::VERSION, "starting vmfixture");

    let result = cli::load_params(cli.params.as_deref(), &cli.overrides).and_then(|params| {
        match cli.command {
            Commands::Params(cmd) => cmd.run(&params),
            Commands::Images(cmd) => cmd.run(&params),
            Commands::HostInfo(cmd) => cmd.run(&params),
        }
    });

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vmfixture=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
