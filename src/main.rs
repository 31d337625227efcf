use anyhow::Result;
use clap::Parser;
use keyword_aggregator::cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    cli::run(args).await
}
