//! Outbound client library: dial the server, complete the handshake, then
//! run sender/receiver workers under a master task. Grounded in the
//! teacher's `MeshClient` (`mesh_client.rs`) — its "master opens the
//! socket, does a key exchange, then spawns worker loops and signals
//! completion via a `oneshot`" shape carries over directly, generalized
//! from the mesh peer-exchange protocol to the RSA challenge in
//! [`crate::handshake`].

use crate::frame::{self, FrameError};
use crate::id::ClientId;
use crate::message::{C2SType, Message, S2SType};
use crate::settings::Settings;
use log::{debug, info, trace, warn};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;

const QUEUE_CAPACITY: usize = 256;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Fired once a queued message has reached the socket.
pub type SentEvent = oneshot::Receiver<()>;

/// Fired once the handshake completes, carrying its outcome.
pub type HandshakeEvent = oneshot::Receiver<Result<(), ClientError>>;

struct Shared {
    server_public_key: Mutex<Option<RsaPublicKey>>,
    settings: Mutex<Option<Settings>>,
    running: AtomicBool,
}

/// A connection to a backbone server. Construct with [`Client::start`].
pub struct Client {
    id: ClientId,
    private_key: RsaPrivateKey,
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    outbound_tx: mpsc::Sender<(Message, oneshot::Sender<()>)>,
    inbound_rx: Mutex<mpsc::Receiver<Message>>,
    master_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Client {
    /// Spawns the master task, which dials `address:port`, runs the
    /// handshake, and on success starts the sender/receiver workers. The
    /// returned [`HandshakeEvent`] fires once that handshake attempt is
    /// resolved, one way or the other.
    pub fn start(id: ClientId, private_key: RsaPrivateKey, address: &str, port: u16) -> (Self, HandshakeEvent) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (handshake_tx, handshake_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            server_public_key: Mutex::new(None),
            settings: Mutex::new(None),
            running: AtomicBool::new(true),
        });

        let master_task = tokio::spawn(master_task(
            id,
            private_key.clone(),
            address.to_owned(),
            port,
            shared.clone(),
            stop_tx.clone(),
            stop_rx,
            outbound_rx,
            inbound_tx,
            handshake_tx,
        ));

        let client = Client {
            id,
            private_key,
            shared,
            stop_tx,
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            master_task: Mutex::new(Some(master_task)),
        };

        (client, handshake_rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Enqueues `msg` for delivery. The returned event fires once the
    /// frame has reached the socket, per spec.
    pub async fn send(&self, msg: Message) -> SentEvent {
        let (tx, rx) = oneshot::channel();
        // If the sender task is gone, `tx` drops with the failed send and
        // `rx` resolves to an error immediately.
        let _ = self.outbound_tx.send((msg, tx)).await;
        rx
    }

    /// Pops one inbound message. `block = false` returns immediately with
    /// `None` if the queue is empty.
    pub async fn read(&self, block: bool) -> Option<Message> {
        let mut rx = self.inbound_rx.lock().await;
        if block {
            rx.recv().await
        } else {
            rx.try_recv().ok()
        }
    }

    /// Best-effort `C2S(STOP)`, then flips the stop flag and joins the
    /// master task (which joins the sender/receiver in turn).
    pub async fn stop(&self) {
        let stop_msg = Message::c2s(C2SType::Stop, None);
        let (tx, _rx) = oneshot::channel();
        let _ = self.outbound_tx.send((stop_msg, tx)).await;

        let _ = self.stop_tx.send(true);
        if let Some(task) = self.master_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn master_task(
    id: ClientId,
    private_key: RsaPrivateKey,
    address: String,
    port: u16,
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    mut stop_rx: watch::Receiver<bool>,
    outbound_rx: mpsc::Receiver<(Message, oneshot::Sender<()>)>,
    inbound_tx: mpsc::Sender<Message>,
    handshake_tx: oneshot::Sender<Result<(), ClientError>>,
) {
    let outcome = dial_and_handshake(&id, &private_key, &address, port, &shared).await;

    let socket = match outcome {
        Ok(socket) => {
            let _ = handshake_tx.send(Ok(()));
            socket
        }
        Err(e) => {
            warn!("[{id}] handshake failed: {e}");
            shared.running.store(false, Ordering::Release);
            let _ = handshake_tx.send(Err(e));
            return;
        }
    };

    let (read_half, write_half) = socket.into_split();
    let write_half = Arc::new(Mutex::new(write_half));

    let sender_task = tokio::spawn(sender_loop(
        id,
        outbound_rx,
        write_half.clone(),
        shared.clone(),
        stop_tx.clone(),
    ));
    let receiver_task = tokio::spawn(receiver_loop(
        id,
        read_half,
        private_key.clone(),
        inbound_tx,
        shared.clone(),
        stop_tx,
    ));

    while !*stop_rx.borrow() {
        if stop_rx.changed().await.is_err() {
            break;
        }
    }

    shared.running.store(false, Ordering::Release);
    let _ = sender_task.await;
    let _ = receiver_task.await;
    trace!("[{id}] master task stopped");
}

async fn dial_and_handshake(
    id: &ClientId,
    private_key: &RsaPrivateKey,
    address: &str,
    port: u16,
    shared: &Shared,
) -> Result<TcpStream, ClientError> {
    let mut socket = TcpStream::connect((address, port)).await?;

    let challenge = frame::read(&mut socket, None)
        .await?
        .ok_or_else(|| ClientError::Handshake("empty challenge frame".into()))?;
    if challenge.len() < 2 {
        return Err(ClientError::Handshake("challenge frame too short".into()));
    }
    let key_len = u16::from_be_bytes(challenge[0..2].try_into().unwrap()) as usize;
    if challenge.len() < 2 + key_len {
        return Err(ClientError::Handshake("challenge frame truncated".into()));
    }
    let server_key_pem = &challenge[2..2 + key_len];
    let nonce = &challenge[2 + key_len..];
    let server_public_key = crate::crypto::deserialize_public(server_key_pem)
        .map_err(|e| ClientError::Handshake(format!("bad server key: {e}")))?;

    let signature = crate::crypto::sign(private_key, nonce);
    let mut response = id.as_bytes().to_vec();
    response.extend_from_slice(&signature);
    frame::send(&mut socket, &response, Some(&server_public_key)).await?;

    let config_frame = frame::read(&mut socket, Some(private_key))
        .await?
        .ok_or_else(|| ClientError::Handshake("empty config frame".into()))?;
    let config_msg = Message::from_bytes(&config_frame)
        .ok_or_else(|| ClientError::Handshake("malformed config frame".into()))?;
    let settings = match config_msg {
        Message::C2S {
            ty: C2SType::Config,
            payload: Some(payload),
            ..
        } => serde_json::from_slice::<Settings>(&payload)
            .map_err(|e| ClientError::Handshake(format!("bad config json: {e}")))?,
        _ => return Err(ClientError::Handshake("expected C2S(CONFIG)".into())),
    };

    *shared.server_public_key.lock().await = Some(server_public_key);
    *shared.settings.lock().await = Some(settings);

    info!("[{id}] handshake complete");
    Ok(socket)
}

async fn sender_loop(
    id: ClientId,
    mut outbound_rx: mpsc::Receiver<(Message, oneshot::Sender<()>)>,
    write_half: Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
) {
    let server_public_key = shared
        .server_public_key
        .lock()
        .await
        .clone()
        .expect("server key set before sender starts");
    let heartbeat_interval = shared
        .settings
        .lock()
        .await
        .as_ref()
        .map(|s| Duration::from_secs(s.heartbeat_interval))
        .unwrap_or(Duration::from_secs(10));

    let mut last_send = Instant::now();

    loop {
        match timeout(POLL_TIMEOUT, outbound_rx.recv()).await {
            Ok(Some((msg, sent_tx))) => {
                let mut writer = write_half.lock().await;
                match frame::send(&mut *writer, &msg.to_bytes(), Some(&server_public_key)).await {
                    Ok(()) => {
                        drop(writer);
                        last_send = Instant::now();
                        let _ = sent_tx.send(());
                    }
                    Err(e) => {
                        warn!("[{id}] send failed: {e}");
                        let stop_msg = Message::c2s(C2SType::Stop, None);
                        let _ = frame::send(&mut *writer, &stop_msg.to_bytes(), Some(&server_public_key)).await;
                        drop(writer);
                        let _ = stop_tx.send(true);
                        break;
                    }
                }
            }
            Ok(None) => break, // client dropped, outbound channel closed
            Err(_elapsed) => {
                if *stop_tx.subscribe().borrow() {
                    break;
                }
                if last_send.elapsed() > heartbeat_interval {
                    let heartbeat = Message::c2s(C2SType::Heartbeat, None);
                    let mut writer = write_half.lock().await;
                    if frame::send(&mut *writer, &heartbeat.to_bytes(), Some(&server_public_key))
                        .await
                        .is_ok()
                    {
                        last_send = Instant::now();
                    }
                }
            }
        }
    }

    trace!("[{id}] sender stopped");
}

async fn receiver_loop(
    id: ClientId,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    private_key: RsaPrivateKey,
    inbound_tx: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
) {
    loop {
        if *stop_tx.subscribe().borrow() {
            break;
        }
        let read_result = timeout(POLL_TIMEOUT, frame::read(&mut read_half, Some(&private_key))).await;
        let frame_bytes = match read_result {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => {
                debug!("[{id}] receiver socket error: {e}");
                let _ = stop_tx.send(true);
                break;
            }
            Err(_elapsed) => continue,
        };

        match Message::from_bytes(&frame_bytes) {
            Some(Message::C2C { recipient, payload }) => {
                let _ = inbound_tx.send(Message::c2c(recipient, payload)).await;
            }
            Some(Message::C2S {
                ty: C2SType::Stop, ..
            }) => {
                debug!("[{id}] server requested stop");
                let _ = stop_tx.send(true);
                break;
            }
            Some(Message::C2S {
                ty: C2SType::Config,
                payload: Some(payload),
                ..
            }) => match serde_json::from_slice::<Settings>(&payload) {
                Ok(new_settings) => *shared.settings.lock().await = Some(new_settings),
                Err(e) => debug!("[{id}] dropping malformed CONFIG update: {e}"),
            },
            Some(Message::S2S { ty: S2SType::Stop, .. }) => {
                let _ = stop_tx.send(true);
                break;
            }
            _ => debug!("[{id}] dropping unparseable or non-deliverable frame"),
        }
    }

    trace!("[{id}] receiver stopped");
}
