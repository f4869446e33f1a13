#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::{process::ExitCode, sync::Arc};

use bcon_hub::config::{Cli, Config, EXAMPLE_CONFIG};
use clap::Parser;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(path) = cli.generate_config {
        return match std::fs::write(&path, EXAMPLE_CONFIG) {
            Ok(()) => {
                println!("example configuration written to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("cannot write {}: {e}", path.display());
                ExitCode::from(2)
            }
        };
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = simple_logger::init_with_level(config.log_level.as_level()) {
        eprintln!("logger init failed: {e}");
        return ExitCode::FAILURE;
    }

    match bcon_hub::startup(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
