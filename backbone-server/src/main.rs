use backbone_core::{IdentityStore, Server, Settings};
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Backbone relay server")]
struct Config {
    /// Path to the settings TOML file. Missing keys fall back to defaults.
    #[arg(long, default_value = "settings.toml")]
    settings: PathBuf,

    /// Directory holding the server's private key and clients' public keys.
    #[arg(long, default_value = ".server-state")]
    state_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();

    let settings = if config.settings.exists() {
        Settings::load(&config.settings)?
    } else {
        info!(
            "no settings file at {}, using defaults",
            config.settings.display()
        );
        Settings::default()
    };

    let identity_store = IdentityStore::init(&config.state_dir).await?;
    let server = Server::start(identity_store, settings).await?;
    info!("backbone-server listening on {}", server.local_addr());

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    server.stop();
    server.join().await;
    info!("backbone-server stopped");
    Ok(())
}
