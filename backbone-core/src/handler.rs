//! Per-connection client handler: a socket-reader task and an
//! outbound-queue-reader task sharing a `stopFlag` watch channel, a
//! last-activity clock, and a mutex-guarded socket write half.

use crate::frame;
use crate::handshake::Identity;
use crate::message::{C2SType, Message, S2SType};
use crate::registry::Registry;
use log::{debug, info, trace, warn};
use rsa::RsaPrivateKey;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// The single point of coordination: any worker setting this to `true`
/// causes the peer worker to exit at its next poll.
#[derive(Clone)]
struct StopFlag {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl StopFlag {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        StopFlag { tx, rx }
    }

    fn set(&self) {
        let _ = self.tx.send(true);
    }

    fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    async fn changed_to_set(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A running handler's external handle. Dropping this does not stop the
/// handler — call `stop()` explicitly.
pub struct HandlerHandle {
    pub peer_id: crate::id::ClientId,
    stop_flag: StopFlag,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl HandlerHandle {
    pub fn stop(&self) {
        self.stop_flag.set();
    }

    /// Waits for both workers to exit. Per spec.md §5, a real
    /// implementation should treat a join taking more than ~10s as a bug;
    /// callers doing so should wrap this in their own timeout.
    pub async fn join(self) {
        let _ = self.reader_task.await;
        let _ = self.writer_task.await;
    }
}

pub struct HandlerConfig {
    pub heartbeat_timeout: Duration,
    /// The server's own private key, needed to decrypt frames the peer
    /// encrypted to the server's public key (spec.md §4.9's sender step).
    pub server_private_key: RsaPrivateKey,
}

/// Spawns the reader/writer worker pair for one authenticated connection
/// and registers it in `registry`.
pub async fn spawn(
    socket: TcpStream,
    peer: Identity,
    registry: Registry,
    config: HandlerConfig,
) -> HandlerHandle {
    let peer_id = peer.id;
    let inbound = registry.register(peer_id).await;

    let (read_half, write_half) = socket.into_split();
    let write_half = Arc::new(Mutex::new(write_half));
    let stop_flag = StopFlag::new();
    let last_activity = Arc::new(AtomicU64::new(now_epoch()));

    let reader_task = tokio::spawn(socket_reader(
        read_half,
        write_half.clone(),
        peer.clone(),
        registry.clone(),
        stop_flag.clone(),
        last_activity.clone(),
        config.heartbeat_timeout,
        config.server_private_key,
    ));

    let writer_task = tokio::spawn(queue_writer(
        inbound,
        write_half,
        peer,
        registry,
        stop_flag.clone(),
    ));

    HandlerHandle {
        peer_id,
        stop_flag,
        reader_task,
        writer_task,
    }
}

async fn socket_reader(
    mut read_half: OwnedReadHalf,
    write_half: Arc<Mutex<OwnedWriteHalf>>,
    peer: Identity,
    registry: Registry,
    mut stop_flag: StopFlag,
    last_activity: Arc<AtomicU64>,
    heartbeat_timeout: Duration,
    server_private_key: RsaPrivateKey,
) {
    trace!("[{}] socket reader starting", peer.id);
    loop {
        if stop_flag.is_set() {
            break;
        }

        let read_result = timeout(
            POLL_TIMEOUT,
            frame::read(&mut read_half, Some(&server_private_key)),
        )
        .await;

        let frame_bytes = match read_result {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => continue, // empty frame, no-op
            Ok(Err(e)) => {
                warn!("[{}] socket error: {e}", peer.id);
                stop_flag.set();
                break;
            }
            Err(_elapsed) => {
                let idle = now_epoch().saturating_sub(last_activity.load(Ordering::Relaxed));
                if idle > heartbeat_timeout.as_secs() {
                    info!("[{}] heartbeat timeout after {idle}s idle", peer.id);
                    stop_flag.set();
                    break;
                }
                continue;
            }
        };

        last_activity.store(now_epoch(), Ordering::Relaxed);

        let message = match Message::from_bytes(&frame_bytes) {
            Some(m) => m,
            None => {
                debug!("[{}] dropping unparseable frame", peer.id);
                continue;
            }
        };

        match message {
            Message::C2C { recipient, payload } => {
                if let Some(queue) = registry.get(recipient).await {
                    if queue
                        .send(Message::c2c(recipient, payload))
                        .await
                        .is_err()
                    {
                        debug!("[{}] recipient {recipient} queue closed, dropping", peer.id);
                    }
                } else {
                    debug!("[{}] routing miss: {recipient} not registered", peer.id);
                }
            }
            Message::C2S { ty, .. } => match ty {
                C2SType::Heartbeat => {
                    // Already credited via `last_activity` above.
                }
                C2SType::Stop => {
                    info!("[{}] peer requested stop", peer.id);
                    stop_flag.set();
                    break;
                }
                C2SType::Config => {
                    debug!("[{}] dropping unexpected mid-session CONFIG from peer", peer.id);
                }
            },
            Message::S2S { .. } => {
                debug!("[{}] dropping S2S on socket path (illegal direction)", peer.id);
            }
        }
    }

    // Best-effort shutdown notice so the peer can tell graceful shutdown
    // from network failure.
    let stop_msg = Message::c2s(C2SType::Stop, Some(b"handler stopping".to_vec()));
    let mut writer = write_half.lock().await;
    let _ = frame::send(&mut *writer, &stop_msg.to_bytes(), None).await;
    drop(writer);

    trace!("[{}] socket reader stopped", peer.id);
}

async fn queue_writer(
    mut inbound: crate::registry::InboundReceiver,
    write_half: Arc<Mutex<OwnedWriteHalf>>,
    peer: Identity,
    registry: Registry,
    mut stop_flag: StopFlag,
) {
    trace!("[{}] queue reader starting", peer.id);
    loop {
        tokio::select! {
            _ = stop_flag.changed_to_set() => break,
            popped = timeout(POLL_TIMEOUT, inbound.recv()) => {
                match popped {
                    Ok(Some(msg)) => {
                        if !handle_queued_message(msg, &write_half, &peer).await {
                            stop_flag.set();
                            break;
                        }
                    }
                    Ok(None) => {
                        // Sender side dropped (deregistered); nothing more will arrive.
                        continue;
                    }
                    Err(_elapsed) => {
                        if stop_flag.is_set() {
                            break;
                        }
                        continue;
                    }
                }
            }
        }
    }

    registry.deregister(peer.id).await;
    stop_flag.set();

    let done = Message::s2s(S2SType::Done, Some(peer.id.as_bytes().to_vec()));
    if registry.server_queue().send(done).await.is_err() {
        warn!("[{}] server queue closed, could not report DONE", peer.id);
    }

    trace!("[{}] queue reader stopped", peer.id);
}

/// Returns `false` if the loop should terminate (STOP received or a write
/// error occurred).
async fn handle_queued_message(
    msg: Message,
    write_half: &Arc<Mutex<OwnedWriteHalf>>,
    peer: &Identity,
) -> bool {
    match msg {
        Message::C2C { recipient, payload } => {
            if recipient != peer.id {
                warn!(
                    "[{}] routing error: queued message addressed to {recipient}, dropping",
                    peer.id
                );
                return true;
            }
            let out = Message::c2c(recipient, payload);
            let mut writer = write_half.lock().await;
            if let Err(e) = frame::send(&mut *writer, &out.to_bytes(), Some(&peer.public_key)).await
            {
                warn!("[{}] write error: {e}", peer.id);
                return false;
            }
            true
        }
        Message::S2S {
            ty: S2SType::Stop, ..
        } => false,
        _ => {
            debug!("[{}] dropping non-deliverable queued message", peer.id);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::id::ClientId;
    use crate::message::S2SType;
    use rsa::RsaPublicKey;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn queued_c2c_message_is_delivered_to_socket() {
        let (server_socket, mut client_socket) = connected_pair().await;
        let client_priv = crypto::generate().unwrap();
        let client_pub = RsaPublicKey::from(&client_priv);
        let peer = Identity {
            id: ClientId::new(),
            public_key: client_pub,
        };

        let (registry, _server_rx) = Registry::new();
        let handle = spawn(
            server_socket,
            peer.clone(),
            registry.clone(),
            HandlerConfig {
                heartbeat_timeout: Duration::from_secs(30),
                server_private_key: crypto::generate().unwrap(),
            },
        )
        .await;

        let sink = registry.get(peer.id).await.unwrap();
        sink.send(Message::c2c(peer.id, b"hello".to_vec()))
            .await
            .unwrap();

        let frame = frame::read(&mut client_socket, Some(&client_priv))
            .await
            .unwrap()
            .unwrap();
        let msg = Message::from_bytes(&frame).unwrap();
        assert_eq!(msg, Message::c2c(peer.id, b"hello".to_vec()));

        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn stop_deregisters_and_reports_done() {
        let (server_socket, _client_socket) = connected_pair().await;
        let peer = Identity {
            id: ClientId::new(),
            public_key: RsaPublicKey::from(&crypto::generate().unwrap()),
        };

        let (registry, mut server_rx) = Registry::new();
        let handle = spawn(
            server_socket,
            peer.clone(),
            registry.clone(),
            HandlerConfig {
                heartbeat_timeout: Duration::from_secs(30),
                server_private_key: crypto::generate().unwrap(),
            },
        )
        .await;

        assert!(registry.contains(peer.id).await);
        handle.stop();
        handle.join().await;

        assert!(!registry.contains(peer.id).await);
        let done = server_rx.recv().await.unwrap();
        match done {
            Message::S2S {
                ty: S2SType::Done,
                payload: Some(payload),
                ..
            } => assert_eq!(payload, peer.id.as_bytes().to_vec()),
            other => panic!("expected S2S(DONE) with id payload, got {other:?}"),
        }
    }
}
