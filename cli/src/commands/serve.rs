use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use hubmirror_server::{AppContext, MirrorConfig, serve};
use tracing::info;

#[derive(Args)]
pub struct ServeArgs {
    /// YAML configuration file. Flags below override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Directory holding cache files and revision refs.
    #[arg(long)]
    pub repos_path: Option<PathBuf>,
    /// Serve only cached and model-bin content; never contact the upstream.
    #[arg(long)]
    pub offline: bool,
}

pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = load_config(&args)?;
    info!(addr = %config.bind_addr(), upstream = %config.upstream_url, "starting mirror");
    let ctx = AppContext::new(config).context("building mirror context")?;
    serve(Arc::new(ctx)).await.context("running mirror server")
}

fn load_config(args: &ServeArgs) -> Result<MirrorConfig> {
    let mut config = match &args.config {
        Some(path) => MirrorConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => MirrorConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(repos_path) = &args.repos_path {
        config.repos_path = repos_path.clone();
    }
    if args.offline {
        config.offline = true;
    }
    config.validate().context("validating config")?;
    Ok(config)
}
