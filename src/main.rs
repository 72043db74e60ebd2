use anyhow::Result;
use playground::cli;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run().await
}
