use std::path::PathBuf;

use anyhow::{Context as _, Error};
use burrow_http::Server;
use clap::Parser;
use tracing::{event, Level};

/// Serve static sites and gateway scripts over HTTP/1.1.
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(default_value = "burrow.toml")]
    config: PathBuf,

    /// Log filter, overridden by `RUST_LOG` when set.
    #[arg(long, default_value = "info")]
    log: String,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    devutils::init_logging(&cli.log);

    let config = burrow::load(&cli.config)
        .with_context(|| format!("invalid configuration \"{}\"", cli.config.display()))?;

    if cli.check {
        event!(Level::INFO, servers = config.servers.len(), "configuration is valid");
        return Ok(());
    }

    let mut server = Server::bind(config.servers, config.options)?;
    server.run()?;

    Ok(())
}
