use anyhow::Result;
use clap::Parser;
use tokio::time::Duration;
use tracing::info;

use parley_relay::cli::{run_probe, Cli, Commands, ServeArgs};
use parley_relay::telemetry::Telemetry;
use parley_relay::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Probe {
            url,
            username,
            wait_secs,
        }) => {
            let report = run_probe(&url, &username, Duration::from_secs(wait_secs)).await?;
            println!("id: {}", report.id);
            println!("username: {}", report.username);
            println!("users: {}", report.roster.join(", "));
            Ok(())
        }
        Some(Commands::Serve(args)) => serve(args, telemetry).await,
        None => serve(ServeArgs::default(), telemetry).await,
    }
}

async fn serve(args: ServeArgs, telemetry: Telemetry) -> Result<()> {
    let config = Config::from_env().with_overrides(&args);
    info!(
        listen_addr = %config.listen_addr(),
        id_seed = ?config.id_seed,
        "starting parley relay"
    );
    parley_relay::run(config, Some(telemetry.metrics_handle())).await
}
