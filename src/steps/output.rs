//! Output step: discovers all targets by name, opens a send channel to each,
//! and forwards every serialized payload to every target with the sender's
//! connection GUID in frame 0.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::discovery::finder;
use crate::discovery::types::PeerDescriptor;
use crate::errors::{DiscoveryError, TransportError};
use crate::net::framing;

const SENDER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OutputStep {
    name: String,
    target_names: Vec<String>,
    discovery_port: u16,
    connection_guid: Uuid,
    cancel: CancelToken,

    sender_tx: Option<Sender<Vec<u8>>>,
    sender_error: Arc<Mutex<Option<TransportError>>>,
    /// Once the captured error has been surfaced once, every subsequent
    /// `send()` keeps failing.
    sticky_failed: AtomicBool,
    stop_sender: Arc<AtomicBool>,
    sender_handle: Option<thread::JoinHandle<()>>,
}

impl OutputStep {
    pub fn new(name: String, target_names: Vec<String>, discovery_port: u16) -> OutputStep {
        OutputStep {
            name,
            target_names,
            discovery_port,
            // A fresh connection GUID is minted at construction,
            // not per-awaken, so it's stable across retries of the same step.
            connection_guid: Uuid::new_v4(),
            cancel: CancelToken::new(),
            sender_tx: None,
            sender_error: Arc::new(Mutex::new(None)),
            sticky_failed: AtomicBool::new(false),
            stop_sender: Arc::new(AtomicBool::new(false)),
            sender_handle: None,
        }
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    /// Finds every target by name, connects to each, and starts the
    /// background sender.
    pub fn awaken(&mut self) -> Result<(), DiscoveryError> {
        let descriptor = PeerDescriptor {
            name: self.name.clone(),
            guid: self.connection_guid,
        };
        let uris = finder::run(&descriptor, &self.target_names, self.discovery_port, &self.cancel)?;
        if uris.len() != self.target_names.len() {
            return Err(DiscoveryError::CountMismatch {
                found: uris.len(),
                expected: self.target_names.len(),
            });
        }

        let mut connections = Vec::with_capacity(uris.len());
        for uri in &uris {
            let addr = parse_tcp_uri(uri)?;
            let stream = TcpStream::connect(addr)?;
            debug!("Output step '{}' connected to target at {}", self.name, addr);
            connections.push(stream);
        }

        let (tx, rx) = mpsc::channel();
        self.sender_tx = Some(tx);
        self.sender_handle = Some(spawn_sender(
            self.connection_guid,
            connections,
            rx,
            Arc::clone(&self.sender_error),
            Arc::clone(&self.stop_sender),
        ));

        Ok(())
    }

    /// Enqueues `payload` and returns immediately. A missing payload is
    /// silently dropped. Surfaces any error previously captured
    /// by the background sender; subsequent sends keep failing once one has.
    pub fn send(&self, payload: Option<Vec<u8>>) -> Result<(), TransportError> {
        if self.sticky_failed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if let Some(e) = self.sender_error.lock().unwrap().take() {
            self.sticky_failed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        let Some(bytes) = payload else {
            return Ok(());
        };
        let tx = self
            .sender_tx
            .as_ref()
            .expect("send() called before awaken()");
        tx.send(bytes).map_err(|_| TransportError::Closed)
    }

    /// Closes the send queue, signals the sender, and joins it with a
    /// bounded timeout before disposing sockets. Swallows errors; logs them.
    pub fn end(&mut self) {
        self.stop_sender.store(true, Ordering::SeqCst);
        self.sender_tx.take(); // drop the sender half to unblock rx.recv()
        let Some(handle) = self.sender_handle.take() else {
            return;
        };
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        match thread::Builder::new()
            .name("output-sender-join".into())
            .spawn(move || {
                let _ = done_tx.send(handle.join());
            }) {
            Ok(_) => {
                if done_rx.recv_timeout(SENDER_JOIN_TIMEOUT).is_err() {
                    warn!(
                        "Output step '{}' background sender did not stop within {:?}; abandoning it",
                        self.name, SENDER_JOIN_TIMEOUT
                    );
                }
            }
            Err(e) => warn!("Failed to spawn a join watcher for '{}': {}", self.name, e),
        }
    }
}

fn parse_tcp_uri(uri: &str) -> Result<std::net::SocketAddr, DiscoveryError> {
    let rest = uri
        .strip_prefix("tcp://")
        .ok_or_else(|| DiscoveryError::Malformed(format!("not a tcp:// URI: {}", uri)))?;
    rest.parse()
        .map_err(|e| DiscoveryError::Malformed(format!("invalid socket address '{}': {}", rest, e)))
}

fn spawn_sender(
    guid: Uuid,
    mut connections: Vec<TcpStream>,
    rx: Receiver<Vec<u8>>,
    error_slot: Arc<Mutex<Option<TransportError>>>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("output-sender".into())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let payload = match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(p) => p,
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                };
                for conn in connections.iter_mut() {
                    if let Err(e) = framing::write_message(conn, guid, &payload) {
                        *error_slot.lock().unwrap() = Some(TransportError::Io(e));
                    }
                }
            }
            for conn in connections.iter_mut() {
                let _ = conn.flush();
            }
        })
        .expect("failed to spawn the output step's background sender thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn sender_forwards_to_every_connected_target() {
        let listener_a = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let listener_b = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let server_a = thread::spawn(move || {
            let (mut s, _) = listener_a.accept().unwrap();
            framing::read_message(&mut s).unwrap().unwrap()
        });
        let server_b = thread::spawn(move || {
            let (mut s, _) = listener_b.accept().unwrap();
            framing::read_message(&mut s).unwrap().unwrap()
        });

        let guid = Uuid::new_v4();
        let conn_a = TcpStream::connect(addr_a).unwrap();
        let conn_b = TcpStream::connect(addr_b).unwrap();
        let (tx, rx) = mpsc::channel();
        let error_slot = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_sender(guid, vec![conn_a, conn_b], rx, Arc::clone(&error_slot), Arc::clone(&stop));

        tx.send(b"fan-out".to_vec()).unwrap();

        let (g_a, p_a) = server_a.join().unwrap();
        let (g_b, p_b) = server_b.join().unwrap();
        assert_eq!(g_a, guid);
        assert_eq!(g_b, guid);
        assert_eq!(p_a, b"fan-out");
        assert_eq!(p_b, b"fan-out");

        stop.store(true, Ordering::SeqCst);
        drop(tx);
        handle.join().unwrap();
        assert!(error_slot.lock().unwrap().is_none());
    }

    #[test]
    fn rejects_non_tcp_uris() {
        assert!(parse_tcp_uri("udp://127.0.0.1:1").is_err());
        assert!(parse_tcp_uri("tcp://127.0.0.1:9999").is_ok());
    }
}
