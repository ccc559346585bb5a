//! Wire types exchanged during discovery.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Carried over UDP broadcast every 250ms by a beacon.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct BeaconAdvertisement {
    pub name: String,
    pub listener_port: u16,
}

/// Carried from finder to beacon across the TCP handshake.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PeerDescriptor {
    pub name: String,
    pub guid: Uuid,
}

/// A peer discovered by a beacon.
#[derive(Clone, Debug)]
pub struct DiscoveredPeer {
    pub descriptor: PeerDescriptor,
}
