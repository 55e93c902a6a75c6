use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = grapnel::cli::Cli::parse();
    grapnel::cli::run(cli).await
}
