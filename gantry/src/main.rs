mod cli;
mod conf;
mod execution;
mod graph;
mod project;
mod scheduler;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use colored::Colorize;
use human_panic::setup_panic;

#[tokio::main]
async fn main() {
    setup_panic!();

    let cli = cli::Cli::parse();

    match cli.run().await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("{} {:?}", "x".red(), e);
            std::process::exit(1)
        }
    }
}
