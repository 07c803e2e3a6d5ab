mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use docrelay::{config::Config, ingestor, notifier, observability};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    observability::init_tracing();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config)?;

    match cli.command {
        Commands::Notifier(args) => notifier::run(config, args.address).await?,
        Commands::Ingestor(args) => {
            if let Some(root) = args.download_root {
                config.ingestor.download_root = root;
            }
            if let Some(workers) = args.workers {
                config.ingestor.workers = workers;
            }
            ingestor::run(config).await?
        }
    }

    Ok(())
}
