use clap::{Parser, Subcommand, ValueEnum};

mod bench;

/// Bounded executor diagnostic and load testing tools.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive a pool with synthetic tasks and report how it behaved
    Bench(bench::Command),
}

fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Commands::Bench(args) => args.exec(),
    }
}
