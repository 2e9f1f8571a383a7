use clap::Parser;

mod blockchain;
mod cli;

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    cli::run(cli::Cli::parse())
}
