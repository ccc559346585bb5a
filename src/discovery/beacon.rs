//! UDP beacon: advertises this listener and collects identifying
//! handshakes from exactly `required_finders` unique remote finders.

use std::collections::HashSet;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::cancel::CancelToken;
use crate::discovery::interfaces::{viable_interfaces, ViableInterface};
use crate::discovery::types::{BeaconAdvertisement, DiscoveredPeer, PeerDescriptor};
use crate::errors::DiscoveryError;
use crate::net::framing;

const BROADCAST_INTERVAL: Duration = Duration::from_millis(250);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const HANDSHAKE_IO_TIMEOUT: Duration = Duration::from_secs(5);
const ACK_MAX_LEN: usize = 1024;

/// Runs the beacon to completion: returns exactly `required_finders` unique
/// peer descriptors, or a `DiscoveryError`.
///
/// `acceptor` is the input step's own data listener,
/// already bound and set non-blocking before the first UDP send — the
/// beacon doesn't bind a second, separate socket. The same listener that
/// accepts these short-lived handshake connections keeps accepting
/// long-lived data connections afterwards, which is why
/// the listener must be live before discovery starts. `own_addr` is that
/// listener's address, echoed back to each finder as the acknowledgement
/// URI.
pub fn run(
    name: &str,
    own_addr: SocketAddr,
    acceptor: &TcpListener,
    outbound_interface_names: &[String],
    discovery_port: u16,
    required_finders: usize,
    cancel: &CancelToken,
) -> Result<Vec<DiscoveredPeer>, DiscoveryError> {
    let interfaces = viable_interfaces(outbound_interface_names)?;

    let broadcaster_error: Arc<Mutex<Option<DiscoveryError>>> = Arc::new(Mutex::new(None));
    let stop_broadcaster = Arc::new(AtomicBool::new(false));

    let broadcaster_handle = spawn_broadcaster(
        name.to_string(),
        own_addr.port(),
        interfaces,
        discovery_port,
        Arc::clone(&broadcaster_error),
        Arc::clone(&stop_broadcaster),
    )?;

    let result = accept_handshakes(acceptor, own_addr, required_finders, cancel, &broadcaster_error);

    stop_broadcaster.store(true, Ordering::SeqCst);
    let _ = broadcaster_handle.join();

    result
}

fn spawn_broadcaster(
    name: String,
    listener_port: u16,
    interfaces: Vec<ViableInterface>,
    discovery_port: u16,
    error_slot: Arc<Mutex<Option<DiscoveryError>>>,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, DiscoveryError> {
    let advertisement = BeaconAdvertisement {
        name,
        listener_port,
    };
    let payload = serde_json::to_vec(&advertisement)
        .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;

    let mut sockets = Vec::with_capacity(interfaces.len());
    for iface in &interfaces {
        let socket = UdpSocket::bind((iface.address, 0))?;
        socket.set_broadcast(true)?;
        sockets.push((socket, SocketAddr::from((iface.broadcast, discovery_port))));
    }

    Ok(thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            for (socket, broadcast_addr) in &sockets {
                if let Err(e) = socket.send_to(&payload, broadcast_addr) {
                    *error_slot.lock().unwrap() = Some(DiscoveryError::Io(e));
                    return;
                }
            }
            thread::sleep(BROADCAST_INTERVAL);
        }
    }))
}

fn accept_handshakes(
    acceptor: &TcpListener,
    own_addr: SocketAddr,
    required_finders: usize,
    cancel: &CancelToken,
    broadcaster_error: &Arc<Mutex<Option<DiscoveryError>>>,
) -> Result<Vec<DiscoveredPeer>, DiscoveryError> {
    let mut seen_endpoints: HashSet<SocketAddr> = HashSet::new();
    let mut peers = Vec::new();

    loop {
        if peers.len() >= required_finders {
            return Ok(peers);
        }
        if cancel.is_fired() {
            return Err(DiscoveryError::Cancelled);
        }
        if let Some(e) = broadcaster_error.lock().unwrap().take() {
            return Err(e);
        }

        match acceptor.accept() {
            Ok((stream, remote_addr)) => {
                if !seen_endpoints.insert(remote_addr) {
                    return Err(DiscoveryError::DuplicateEndpoint(remote_addr.to_string()));
                }
                match handle_handshake(stream, own_addr) {
                    Ok(peer) => {
                        debug!("Beacon completed a handshake with {}", remote_addr);
                        peers.push(peer);
                    }
                    Err(e) => warn!("Discarding a failed handshake from {}: {}", remote_addr, e),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => return Err(DiscoveryError::Io(e)),
        }
    }
}

/// Beacon side of the TCP handshake: read the finder's descriptor frame, echo
/// back the acknowledgement — the data listener's own URI — close.
fn handle_handshake(
    mut stream: TcpStream,
    own_addr: SocketAddr,
) -> Result<DiscoveredPeer, DiscoveryError> {
    stream.set_read_timeout(Some(HANDSHAKE_IO_TIMEOUT))?;
    stream.set_write_timeout(Some(HANDSHAKE_IO_TIMEOUT))?;

    let frame = framing::read_frame(&mut stream)?
        .ok_or_else(|| DiscoveryError::Malformed("connection closed before a descriptor frame arrived".into()))?;
    let descriptor: PeerDescriptor =
        serde_json::from_slice(&frame).map_err(|e| DiscoveryError::Malformed(e.to_string()))?;

    let ack = format!("tcp://{}:{}", own_addr.ip(), own_addr.port());
    let ack_bytes = ack.as_bytes();
    debug_assert!(ack_bytes.len() <= ACK_MAX_LEN);
    stream.write_all(ack_bytes)?;
    stream.flush()?;

    Ok(DiscoveredPeer { descriptor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream as StdTcpStream;

    #[test]
    fn handshake_echoes_the_data_listeners_own_uri() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let own_addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = StdTcpStream::connect(own_addr).unwrap();
            let descriptor = PeerDescriptor {
                name: "finder-a".into(),
                guid: uuid::Uuid::new_v4(),
            };
            let bytes = serde_json::to_vec(&descriptor).unwrap();
            framing::write_frame(&mut stream, &bytes).unwrap();

            let mut ack = vec![0u8; 1024];
            let n = stream.read(&mut ack).unwrap();
            ack.truncate(n);
            String::from_utf8(ack).unwrap()
        });

        let (stream, _remote_addr) = listener.accept().unwrap();
        let peer = handle_handshake(stream, own_addr).unwrap();
        assert_eq!(peer.descriptor.name, "finder-a");

        let ack = client.join().unwrap();
        assert_eq!(ack, format!("tcp://127.0.0.1:{}", own_addr.port()));
    }

    #[test]
    fn run_fails_fast_on_pre_fired_cancellation() {
        let cancel = CancelToken::new();
        cancel.fire();
        let acceptor = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        acceptor.set_nonblocking(true).unwrap();
        let own_addr = acceptor.local_addr().unwrap();
        let err = run(
            "node-a",
            own_addr,
            &acceptor,
            &["definitely-not-a-real-iface".to_string()],
            5557,
            1,
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, DiscoveryError::NoViableInterface));
    }
}
