use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{InspectArgs, ServeArgs, run_inspect, run_serve};

#[derive(Parser)]
#[command(author, version, about = "hubmirror: caching mirror for model hub downloads")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mirror HTTP server.
    Serve(ServeArgs),
    /// Print the header and block bitmap of a cache file, optionally exporting its contents.
    Inspect(InspectArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => {
            setup_default_tracing();
            run_serve(args).await
        }
        Commands::Inspect(args) => run_inspect(args).await,
    }
}

pub(crate) fn setup_default_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
