//! nackfec-sim: loopback sender/receiver run of the NACK/FEC repair engine.

mod config;
mod sim;

use config::Config;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("run with --help for usage");
            return ExitCode::from(2);
        }
    };

    if config.print_config {
        config.print();
    } else {
        println!(
            "seed={} blocks={} loss={:.2}% geometry={}+{}",
            config.seed,
            config.blocks,
            config.loss_rate * 100.0,
            config.session.num_data,
            config.session.num_parity
        );
    }

    let metrics = match sim::run(&config) {
        Ok(metrics) => metrics,
        Err(e) => {
            tracing::error!("simulation failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if config.print_metrics {
        metrics.print_summary();
    }
    metrics.print_result();

    if metrics.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
