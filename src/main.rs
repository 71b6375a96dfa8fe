use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use replikv::config::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => replikv::node::run(cli.config).await,
        Command::Inspect(args) => {
            let path = args.file.unwrap_or_else(|| cli.config.snapshot_path());
            println!("{}", replikv::node::inspect(&path)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
