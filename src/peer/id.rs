//! The address by which a remote peer is known: its socket endpoint plus
//! the 20 byte peer id it presented during the handshake (§1, §6).

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::RawPeerId;

/// Identifies a remote peer.
///
/// Equality and hashing are by `peer_id` alone, matching the protocol's own
/// notion of peer identity: the same peer id reconnecting from a different
/// address is still the same peer, while two different peer ids sharing an
/// address (unlikely, but not forbidden) are distinct.
#[derive(Clone, Debug)]
pub struct PeerId {
    ip: String,
    port: u16,
    id: RawPeerId,
}

impl PeerId {
    /// # Panics
    ///
    /// Panics if `port` is 0; the wire protocol has no notion of a
    /// zero-port peer.
    pub fn new(ip: impl Into<String>, port: u16, id: RawPeerId) -> Self {
        assert_ne!(port, 0, "peer port must be nonzero");
        Self {
            ip: ip.into(),
            port,
            id,
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn raw_id(&self) -> &RawPeerId {
        &self.id
    }
}

impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerId {}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
