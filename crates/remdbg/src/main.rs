use clap::Parser;
use remdbg_engine::init_logging;

mod cli;
mod client;
mod commands;
mod errors;
mod injector;
mod tty;

fn main() {
    let parsed = cli::Cli::parse();
    init_logging(!parsed.verbose);

    match commands::run_command(parsed.command) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("remdbg: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
