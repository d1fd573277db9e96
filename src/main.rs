use cadence::cli::Cli;
use cadence::config::Config;
use cadence::router::route_command;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(cli.verbose || config.general.verbose);
    log::debug!("Using configuration from {}", Config::get_config_path().display());

    if let Err(e) = route_command(cli, config).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// RUST_LOG wins; otherwise info when verbose and warn when quiet.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}
