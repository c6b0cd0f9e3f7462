//! Per-peer connection management: identity ([`id`]), the socket-owning
//! exchange ([`exchange`]), and the choke/interest/request state machine
//! ([`sharing_peer`]) that ties them together (§3-§5).

pub mod exchange;
pub mod id;
pub mod sharing_peer;

pub use exchange::{ExchangeState, PeerExchange};
pub use id::PeerId;
pub use sharing_peer::SharingPeer;
