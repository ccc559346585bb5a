//! UDP finder: finds each named beacon and completes the TCP
//! handshake with it, obtaining its listener URI.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use log::debug;
use socket2::{Domain, Socket, Type};

use crate::cancel::CancelToken;
use crate::discovery::types::{BeaconAdvertisement, PeerDescriptor};
use crate::errors::DiscoveryError;
use crate::net::framing;

const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HANDSHAKE_IO_TIMEOUT: Duration = Duration::from_secs(5);
const ACK_MAX_LEN: usize = 1024;
const RECV_BUF_LEN: usize = 2048;

/// One target's discovered connection URI, e.g. `tcp://10.0.0.5:51234`.
pub type TargetUri = String;

/// Binds the shared discovery UDP socket with address reuse. No repo in the retrieval
/// pack sets `SO_REUSEADDR` on a plain `UdpSocket`, so this reaches for
/// `socket2` (see DESIGN.md).
fn bind_discovery_socket(discovery_port: u16) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], discovery_port).into();
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Finds each target name in declared order, completing the TCP handshake
/// with each beacon in turn, and returns its acknowledged URI. Sequential by
/// design: a shared UDP socket is simpler to reason about than
/// concurrent readers, and the extra latency is dominated by the beacon's
/// 250ms broadcast cadence anyway.
pub fn run(
    self_descriptor: &PeerDescriptor,
    target_names: &[String],
    discovery_port: u16,
    cancel: &CancelToken,
) -> Result<Vec<TargetUri>, DiscoveryError> {
    let socket = bind_discovery_socket(discovery_port)?;
    let mut uris = Vec::with_capacity(target_names.len());

    for name in target_names {
        if cancel.is_fired() {
            return Err(DiscoveryError::Cancelled);
        }
        let uri = find_one(&socket, name, self_descriptor, cancel)?;
        debug!("Finder resolved '{}' to {}", name, uri);
        uris.push(uri);
    }

    Ok(uris)
}

fn find_one(
    socket: &UdpSocket,
    target_name: &str,
    self_descriptor: &PeerDescriptor,
    cancel: &CancelToken,
) -> Result<TargetUri, DiscoveryError> {
    let mut buf = [0u8; RECV_BUF_LEN];
    loop {
        if cancel.is_fired() {
            return Err(DiscoveryError::Cancelled);
        }
        let (len, source) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(RECV_POLL_INTERVAL);
                continue;
            }
            Err(e) => return Err(DiscoveryError::Io(e)),
        };

        let advertisement: BeaconAdvertisement = match serde_json::from_slice(&buf[..len]) {
            Ok(a) => a,
            Err(_) => continue, // malformed or unrelated broadcast; ignore
        };
        if advertisement.name != target_name {
            continue;
        }

        let beacon_addr = SocketAddr::new(source.ip(), advertisement.listener_port);
        return handshake(beacon_addr, self_descriptor);
    }
}

fn handshake(
    beacon_addr: SocketAddr,
    self_descriptor: &PeerDescriptor,
) -> Result<TargetUri, DiscoveryError> {
    let mut stream = TcpStream::connect(beacon_addr)?;
    stream.set_read_timeout(Some(HANDSHAKE_IO_TIMEOUT))?;
    stream.set_write_timeout(Some(HANDSHAKE_IO_TIMEOUT))?;

    let descriptor_bytes = serde_json::to_vec(self_descriptor)
        .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
    framing::write_frame(&mut stream, &descriptor_bytes)?;

    let mut ack = vec![0u8; ACK_MAX_LEN];
    let n = stream.read(&mut ack)?;
    ack.truncate(n);
    let uri = String::from_utf8(ack)
        .map_err(|e| DiscoveryError::Malformed(format!("non-UTF8 acknowledgement: {}", e)))?;

    let _ = stream.flush();
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn handshake_reads_back_beacon_uri() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let frame = framing::read_frame(&mut stream).unwrap().unwrap();
            let descriptor: PeerDescriptor = serde_json::from_slice(&frame).unwrap();
            assert_eq!(descriptor.name, "sender-a");
            stream.write_all(b"tcp://127.0.0.1:9999").unwrap();
        });

        let descriptor = PeerDescriptor {
            name: "sender-a".into(),
            guid: uuid::Uuid::new_v4(),
        };
        let uri = handshake(addr, &descriptor).unwrap();
        assert_eq!(uri, "tcp://127.0.0.1:9999");
        server.join().unwrap();
    }

    #[test]
    fn cancellation_aborts_before_any_packet() {
        let cancel = CancelToken::new();
        cancel.fire();
        let descriptor = PeerDescriptor {
            name: "x".into(),
            guid: uuid::Uuid::new_v4(),
        };
        let err = run(&descriptor, &["b".to_string()], 15557, &cancel).unwrap_err();
        assert!(matches!(err, DiscoveryError::Cancelled));
    }
}
