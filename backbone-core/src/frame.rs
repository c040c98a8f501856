//! Length-prefixed wire frames: `length:u16_be || bytes`. `length == 0`
//! reads back as "no data". When a key is supplied, the payload is
//! chunk-encrypted/decrypted per [`crate::crypto`].

use crate::crypto::{self, CryptoError};
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are outside the protocol.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame payload of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge(usize),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Writes `msg` as a frame. If `public_key` is given the payload is
/// encrypted to it first; otherwise it is sent in clear text.
pub async fn send<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &[u8],
    public_key: Option<&RsaPublicKey>,
) -> Result<()> {
    let payload = match public_key {
        Some(key) => crypto::encrypt(key, msg)?,
        None => msg.to_vec(),
    };
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u16).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `None` for a zero-length ("no data") frame. If
/// `private_key` is given the payload is decrypted after reading.
pub async fn read<R: AsyncRead + Unpin>(
    reader: &mut R,
    private_key: Option<&RsaPrivateKey>,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    match private_key {
        Some(key) => Ok(Some(crypto::decrypt(key, &buf)?)),
        None => Ok(Some(buf)),
    }
}
