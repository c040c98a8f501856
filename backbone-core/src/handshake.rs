//! Server-side challenge/response handshake. One round trip of application
//! data authenticates a freshly accepted socket and hands the client its
//! runtime configuration.

use crate::frame::{self, FrameError};
use crate::id::ClientId;
use crate::identity::IdentityStore;
use crate::message::{C2SType, Message};
use crate::settings::Settings;
use rand::RngCore;
use rsa::RsaPublicKey;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("authentication challenge failed: {0}")]
    Failed(String),
    #[error("frame error during handshake: {0}")]
    Frame(#[from] FrameError),
}

pub type Result<T> = std::result::Result<T, ChallengeError>;

/// The authenticated peer record produced by a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: ClientId,
    pub public_key: RsaPublicKey,
}

/// Runs the server side of the handshake over an already-accepted socket.
/// Returns the authenticated peer identity, or `ChallengeError` if the
/// peer is unknown, signs with the wrong key, or any step fails. The
/// caller is responsible for closing the socket on failure.
pub async fn handle_handshake<RW: AsyncRead + AsyncWrite + Unpin>(
    socket: &mut RW,
    identity_store: &IdentityStore,
    settings: &Settings,
) -> Result<Identity> {
    let nonce = random_nonce(settings.challenge_size);

    let server_pub_pem = identity_store.server_public_key_pem();
    let mut challenge = Vec::with_capacity(2 + server_pub_pem.len() + nonce.len());
    challenge.extend_from_slice(&(server_pub_pem.len() as u16).to_be_bytes());
    challenge.extend_from_slice(server_pub_pem);
    challenge.extend_from_slice(&nonce);
    frame::send(socket, &challenge, None).await?;

    let response = frame::read(socket, Some(identity_store.server_private_key()))
        .await?
        .ok_or_else(|| ChallengeError::Failed("empty challenge response".into()))?;

    if response.len() < 16 {
        return Err(ChallengeError::Failed("response too short".into()));
    }
    let client_id_bytes: [u8; 16] = response[0..16]
        .try_into()
        .map_err(|_| ChallengeError::Failed("malformed client id".into()))?;
    let client_id = ClientId::from_bytes(client_id_bytes);
    let signature = &response[16..];

    let client_key = identity_store
        .get(client_id)
        .await
        .map_err(|e| ChallengeError::Failed(format!("identity store error: {e}")))?
        .ok_or_else(|| ChallengeError::Failed(format!("no such client: {client_id}")))?;

    if !crate::crypto::verify(&client_key, &nonce, signature) {
        return Err(ChallengeError::Failed("invalid signature".into()));
    }

    let config_payload =
        serde_json::to_vec(settings).map_err(|e| ChallengeError::Failed(e.to_string()))?;
    let config_msg = Message::c2s(C2SType::Config, Some(config_payload));
    frame::send(socket, &config_msg.to_bytes(), Some(&client_key)).await?;

    Ok(Identity {
        id: client_id,
        public_key: client_key,
    })
}

fn random_nonce(size: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; size];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use tokio::io::duplex;

    #[tokio::test]
    async fn rejects_unknown_client() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::init(dir.path()).await.unwrap();
        let settings = Settings::default();

        let (mut server_side, mut client_side) = duplex(64 * 1024);

        let server_task = tokio::spawn(async move {
            handle_handshake(&mut server_side, &store, &settings).await
        });

        // Client reads the challenge, then signs with a key the store has
        // never seen and claims an unregistered id.
        let challenge = frame::read(&mut client_side, None).await.unwrap().unwrap();
        let key_len = u16::from_be_bytes(challenge[0..2].try_into().unwrap()) as usize;
        let nonce = &challenge[2 + key_len..];
        let server_pub = crypto::deserialize_public(&challenge[2..2 + key_len]).unwrap();

        let client_priv = crypto::generate().unwrap();
        let signature = crypto::sign(&client_priv, nonce);
        let mut response = ClientId::new().as_bytes().to_vec();
        response.extend_from_slice(&signature);
        frame::send(&mut client_side, &response, Some(&server_pub))
            .await
            .unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(ChallengeError::Failed(_))));
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::init(dir.path()).await.unwrap();
        let client_id = ClientId::new();
        let registered_priv = crypto::generate().unwrap();
        let registered_pub = RsaPublicKey::from(&registered_priv);
        store.add(client_id, &registered_pub).await.unwrap();
        let settings = Settings::default();

        let (mut server_side, mut client_side) = duplex(64 * 1024);
        let server_task =
            tokio::spawn(async move { handle_handshake(&mut server_side, &store, &settings).await });

        let challenge = frame::read(&mut client_side, None).await.unwrap().unwrap();
        let key_len = u16::from_be_bytes(challenge[0..2].try_into().unwrap()) as usize;
        let nonce = &challenge[2 + key_len..];
        let server_pub = crypto::deserialize_public(&challenge[2..2 + key_len]).unwrap();

        // Sign with a *different* private key than the one registered for this id.
        let impostor_priv = crypto::generate().unwrap();
        let signature = crypto::sign(&impostor_priv, nonce);
        let mut response = client_id.as_bytes().to_vec();
        response.extend_from_slice(&signature);
        frame::send(&mut client_side, &response, Some(&server_pub))
            .await
            .unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(ChallengeError::Failed(_))));
    }

    #[tokio::test]
    async fn succeeds_for_registered_client() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::init(dir.path()).await.unwrap();
        let client_id = ClientId::new();
        let client_priv = crypto::generate().unwrap();
        let client_pub = RsaPublicKey::from(&client_priv);
        store.add(client_id, &client_pub).await.unwrap();
        let settings = Settings::default();

        let (mut server_side, mut client_side) = duplex(64 * 1024);
        let server_task =
            tokio::spawn(async move { handle_handshake(&mut server_side, &store, &settings).await });

        let challenge = frame::read(&mut client_side, None).await.unwrap().unwrap();
        let key_len = u16::from_be_bytes(challenge[0..2].try_into().unwrap()) as usize;
        let nonce = &challenge[2 + key_len..];
        let server_pub = crypto::deserialize_public(&challenge[2..2 + key_len]).unwrap();

        let signature = crypto::sign(&client_priv, nonce);
        let mut response = client_id.as_bytes().to_vec();
        response.extend_from_slice(&signature);
        frame::send(&mut client_side, &response, Some(&server_pub))
            .await
            .unwrap();

        let config_frame = frame::read(&mut client_side, Some(&client_priv))
            .await
            .unwrap()
            .unwrap();
        let config_msg = Message::from_bytes(&config_frame).unwrap();
        assert!(matches!(
            config_msg,
            Message::C2S {
                ty: C2SType::Config,
                ..
            }
        ));

        let identity = server_task.await.unwrap().unwrap();
        assert_eq!(identity.id, client_id);
        assert_eq!(identity.public_key, client_pub);
    }
}
