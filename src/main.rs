mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use nimbus_fetch::config::Settings;
use nimbus_fetch::providers::ProviderRegistry;
use nimbus_fetch::server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let mut settings = match args.config {
                Some(path) => Settings::load_from_path(path)?,
                None => Settings::load()?,
            };
            if let Some(address) = args.address {
                settings.server.bind_addr = address;
            }

            // Concrete provider integrations are wired here by deployments;
            // the core ships the registry and the trait.
            let providers = ProviderRegistry::new();
            server::run(settings, providers).await?;
        }
    }

    Ok(())
}
