// Entrypoint for the CLI application.
// - Keeps `main` small: set up logging, parse arguments, hand off to `ui`.
// - Any error ends up here and is printed in red with exit code 1.

use clap::Parser;
use concentriq_cli::{cli::Cli, ui};
use crossterm::style::Stylize;
use tracing_subscriber::EnvFilter;

fn init_logging(debug: bool) {
    let env_debug = std::env::var("CONCENTRIQ_DEBUG").ok();
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let debug = debug || ui::debug_requested(env_debug.as_deref());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(ui::log_directive(debug, rust_log.as_deref())))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(err) = ui::run(cli) {
        eprintln!("{}", format!("{err:#}").red());
        std::process::exit(1);
    }
}
