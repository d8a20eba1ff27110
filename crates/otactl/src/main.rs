//! otactl - control CLI for otakit state directories

use anyhow::Result;
use clap::Parser;
use otactl::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    otactl::init_logging();
    otactl::run(cli).await
}
