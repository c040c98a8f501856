use backbone_core::client::Client;
use backbone_core::{crypto, ClientId};
use clap::Parser;
use log::info;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(version, about = "Backbone relay client")]
struct Config {
    /// Server address to dial.
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Server port.
    #[arg(long, default_value_t = 4000)]
    port: u16,

    /// Directory holding this client's own keypair, per the `.client/`
    /// layout in spec.md §6.
    #[arg(long, default_value = ".client-state")]
    state_dir: PathBuf,
}

/// Loads the first `<hex>`/`<hex>.pub` pair found under `<state_dir>/.client/`,
/// or generates and persists a new one. The client-side store is
/// intentionally simpler than [`backbone_core::IdentityStore`] (one keypair,
/// not a directory of peers) — per spec.md's "pluggable identity repository"
/// note, its implementation is this binary's concern, not the core crate's.
async fn load_or_generate_identity(
    state_dir: &Path,
) -> anyhow::Result<(ClientId, RsaPrivateKey, RsaPublicKey)> {
    let client_dir = state_dir.join(".client");
    tokio::fs::create_dir_all(&client_dir).await?;

    let mut entries = tokio::fs::read_dir(&client_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".pub") {
            continue;
        }
        if let Some(id) = ClientId::from_hex(&name) {
            let pem = tokio::fs::read(entry.path()).await?;
            let private_key = crypto::deserialize_private(&pem)?;
            let public_key = RsaPublicKey::from(&private_key);
            return Ok((id, private_key, public_key));
        }
    }

    let id = ClientId::new();
    let private_key = crypto::generate()?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = crypto::serialize_private(&private_key)?;
    let public_pem = crypto::serialize_public(&public_key)?;
    tokio::fs::write(client_dir.join(id.hex()), &private_pem).await?;
    tokio::fs::write(client_dir.join(format!("{}.pub", id.hex())), &public_pem).await?;

    Ok((id, private_key, public_key))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();

    let (id, private_key, public_key) = load_or_generate_identity(&config.state_dir).await?;
    info!("client id: {id}");
    info!(
        "public key (register this with the server's identity store):\n{}",
        String::from_utf8_lossy(&crypto::serialize_public(&public_key)?)
    );

    let (client, handshake_event) = Client::start(id, private_key, &config.address, config.port);
    handshake_event
        .await
        .map_err(|_| anyhow::anyhow!("handshake task ended without reporting an outcome"))??;
    info!("connected to {}:{}", config.address, config.port);

    tokio::signal::ctrl_c().await?;
    info!("received SIGINT");

    client.stop().await;
    info!("backbone-client stopped");
    Ok(())
}
