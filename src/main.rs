use clap::Parser;
use mcp_proxy::{commands, logging, Cli};
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.logging())?;

    let config = match cli.load_config().await {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e);
        }
    };

    commands::run(cli.subcommand(), config).await
}
