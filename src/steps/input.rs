//! Input step: completes discovery of `expected_sources` upstream peers,
//! then continuously harvests their messages into per-source FIFO queues,
//! and on request hands the driver one message from each source.

use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, warn};

use crate::cancel::CancelToken;
use crate::discovery::beacon;
use crate::discovery::interfaces::interface_ipv4;
use crate::errors::{DiscoveryError, TransportError};
use crate::faninbuffer::FanInBuffer;
use crate::net::framing;

const RECEIVER_POLL_INTERVAL: Duration = Duration::from_millis(1);
const RECEIVER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);
const READ_CHUNK_LEN: usize = 4096;

pub struct InputStep {
    name: String,
    expected_sources: usize,
    inbound_interface: String,
    outbound_interfaces: Vec<String>,
    discovery_port: u16,
    cancel: CancelToken,

    buffer: Option<Arc<FanInBuffer>>,
    receiver_error: Arc<Mutex<Option<TransportError>>>,
    stop_receiver: Arc<AtomicBool>,
    receiver_handle: Option<thread::JoinHandle<()>>,
}

impl InputStep {
    pub fn new(
        name: String,
        expected_sources: usize,
        inbound_interface: String,
        outbound_interfaces: Vec<String>,
        discovery_port: u16,
    ) -> InputStep {
        InputStep {
            name,
            expected_sources,
            inbound_interface,
            outbound_interfaces,
            discovery_port,
            cancel: CancelToken::new(),
            buffer: None,
            receiver_error: Arc::new(Mutex::new(None)),
            stop_receiver: Arc::new(AtomicBool::new(false)),
            receiver_handle: None,
        }
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    /// Binds the data listener, completes discovery via a beacon, and spawns
    /// the background receiver.
    pub fn awaken(&mut self) -> Result<(), DiscoveryError> {
        let ip = interface_ipv4(&self.inbound_interface)?;
        let listener = TcpListener::bind((ip, 0))?;
        listener.set_nonblocking(true)?;
        let own_addr = listener.local_addr()?;
        debug!(
            "Input step '{}' bound its data listener at {}",
            self.name, own_addr
        );

        let peers = beacon::run(
            &self.name,
            own_addr,
            &listener,
            &self.outbound_interfaces,
            self.discovery_port,
            self.expected_sources,
            &self.cancel,
        )?;
        debug!(
            "Input step '{}' discovered {} source(s)",
            self.name,
            peers.len()
        );

        let buffer = Arc::new(FanInBuffer::new(
            peers
                .into_iter()
                .map(|p| (p.descriptor.guid, p.descriptor.name))
                .collect(),
        ));
        self.buffer = Some(Arc::clone(&buffer));

        self.receiver_handle = Some(spawn_receiver(
            listener,
            buffer,
            Arc::clone(&self.receiver_error),
            Arc::clone(&self.stop_receiver),
            self.cancel.clone(),
        ));

        Ok(())
    }

    /// Blocks until all sources have a ready message, surfacing any fatal
    /// error captured by the background receiver, or a clean cancellation.
    pub fn receive(&self) -> Result<IndexMap<String, Vec<u8>>, TransportError> {
        let buffer = self
            .buffer
            .as_ref()
            .expect("receive() called before awaken()");
        loop {
            if let Some(e) = self.receiver_error.lock().unwrap().take() {
                return Err(e);
            }
            if buffer.all_ready() {
                return Ok(buffer.drain_one_each());
            }
            if self.cancel.is_fired() {
                return Err(TransportError::Closed);
            }
            thread::sleep(RECEIVER_POLL_INTERVAL);
        }
    }

    pub fn expected_sources(&self) -> usize {
        self.expected_sources
    }

    /// Signals the background receiver to stop and joins it with a bounded
    /// timeout. No exceptions propagate.
    pub fn end(&mut self) {
        self.stop_receiver.store(true, Ordering::SeqCst);
        let Some(handle) = self.receiver_handle.take() else {
            return;
        };
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        match thread::Builder::new()
            .name("input-receiver-join".into())
            .spawn(move || {
                let _ = done_tx.send(handle.join());
            }) {
            Ok(_) => {
                if done_rx.recv_timeout(RECEIVER_JOIN_TIMEOUT).is_err() {
                    warn!(
                        "Input step '{}' background receiver did not stop within {:?}; abandoning it",
                        self.name, RECEIVER_JOIN_TIMEOUT
                    );
                }
            }
            Err(e) => warn!("Failed to spawn a join watcher for '{}': {}", self.name, e),
        }
    }
}

/// Per-connection byte accumulator: non-blocking socket reads may return
/// partial frames, so this buffers bytes across poll iterations until a
/// complete two-frame message is scannable.
struct PendingConnection {
    stream: TcpStream,
    buf: Vec<u8>,
}

enum PollOutcome {
    Progress,
    Idle,
    Closed,
    Fatal(TransportError),
}

impl PendingConnection {
    fn poll(&mut self, buffer: &FanInBuffer) -> PollOutcome {
        let mut chunk = [0u8; READ_CHUNK_LEN];
        let mut read_any = false;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return PollOutcome::Closed,
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    read_any = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return PollOutcome::Fatal(TransportError::Io(e)),
            }
        }

        let mut drained_any = false;
        loop {
            match framing::try_scan_message(&self.buf) {
                Ok(Some((consumed, guid, payload))) => {
                    self.buf.drain(..consumed);
                    buffer.push(guid, payload);
                    drained_any = true;
                }
                Ok(None) => break,
                Err(e) => return PollOutcome::Fatal(e),
            }
        }

        if read_any || drained_any {
            PollOutcome::Progress
        } else {
            PollOutcome::Idle
        }
    }
}

fn spawn_receiver(
    listener: TcpListener,
    buffer: Arc<FanInBuffer>,
    error_slot: Arc<Mutex<Option<TransportError>>>,
    stop: Arc<AtomicBool>,
    cancel: CancelToken,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("input-receiver".into())
        .spawn(move || {
            let mut connections: Vec<PendingConnection> = Vec::new();

            while !stop.load(Ordering::SeqCst) && !cancel.is_fired() {
                let mut did_work = false;

                match listener.accept() {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!("Failed to set a new data connection non-blocking: {}", e);
                        } else {
                            debug!("Input step accepted a new data connection from {}", addr);
                            connections.push(PendingConnection {
                                stream,
                                buf: Vec::new(),
                            });
                            did_work = true;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        *error_slot.lock().unwrap() = Some(TransportError::Io(e));
                        break;
                    }
                }

                connections.retain_mut(|conn| match conn.poll(&buffer) {
                    PollOutcome::Progress => {
                        did_work = true;
                        true
                    }
                    PollOutcome::Idle => true,
                    PollOutcome::Closed => false,
                    PollOutcome::Fatal(e) => {
                        // That source's queue can never become ready again, so
                        // `receive()` would otherwise block forever; capture
                        // the error so it surfaces on the next `receive()`
                        // poll instead (the first captured error wins).
                        warn!("Dropping a data connection after a fatal error: {}", e);
                        let mut slot = error_slot.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        false
                    }
                });

                if !did_work {
                    thread::sleep(RECEIVER_POLL_INTERVAL);
                }
            }
        })
        .expect("failed to spawn the input step's background receiver thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::SocketAddr;
    use uuid::Uuid;

    #[test]
    fn receiver_enqueues_messages_from_an_accepted_connection() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();

        let guid = Uuid::new_v4();
        let buffer = Arc::new(FanInBuffer::new(vec![(guid, "a".to_string())]));
        let error_slot = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let cancel = CancelToken::new();

        let handle = spawn_receiver(listener, Arc::clone(&buffer), Arc::clone(&error_slot), Arc::clone(&stop), cancel.clone());

        let mut client = TcpStream::connect(addr).unwrap();
        framing::write_message(&mut client, guid, b"payload-1").unwrap();
        client.flush().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !buffer.all_ready() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(buffer.all_ready());
        let out = buffer.drain_one_each();
        assert_eq!(out.get("a").unwrap(), b"payload-1");

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(error_slot.lock().unwrap().is_none());
    }

    #[test]
    fn a_framing_error_on_one_connection_surfaces_through_error_slot() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();

        let guid = Uuid::new_v4();
        let buffer = Arc::new(FanInBuffer::new(vec![(guid, "a".to_string())]));
        let error_slot = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let cancel = CancelToken::new();

        let handle = spawn_receiver(listener, Arc::clone(&buffer), Arc::clone(&error_slot), Arc::clone(&stop), cancel.clone());

        let mut client = TcpStream::connect(addr).unwrap();
        // A GUID frame that isn't 16 bytes is a framing error, not a partial read.
        framing::write_frame(&mut client, b"too short").unwrap();
        client.flush().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if error_slot.lock().unwrap().is_some() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "error_slot was never populated");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            error_slot.lock().unwrap().as_ref().unwrap(),
            TransportError::Framing(_)
        ));
        assert!(!buffer.all_ready());

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
