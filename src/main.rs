use anyhow::Context;
use quickie::{Config, Server};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = Config::default();
    let mut server = Server::bind(config.clone())
        .with_context(|| format!("failed to listen on {}", config.addr))?;

    server.run().context("event loop failed")?;

    Ok(())
}
