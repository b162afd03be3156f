use anyhow::{Context, Result};
use rustls::crypto::ring;
use zerowork::cli;

#[tokio::main]
async fn main() -> Result<()> {
    ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))
        .context("TLS crypto provider initialization failed")?;

    cli::start()?.execute().await
}
