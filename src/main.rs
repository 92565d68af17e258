//! drvstream - stream the leaf derivations of a Nix expression forest.

mod accessor;
mod cli;
mod collect;
mod error;
mod eval;
mod job;
mod logging;
mod memory;
mod msg;
mod supervisor;
mod worker;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::Cli;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_config());

    if cli.internal_worker {
        std::process::exit(worker::run_worker_main(&cli.worker_config()));
    }

    if let Err(e) = run(&cli) {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    supervisor::run(cli)?;
    Ok(())
}
