//! This module defines types used to configure the peer wire protocol core.

use std::time::Duration;

/// The canonical block length: most implementations only ever request and
/// serve blocks of this size (the last block of a piece may be shorter).
pub const DEFAULT_REQUEST_SIZE: u32 = 0x4000;

/// No peer is obligated to respect a request for more than this many bytes;
/// a request declaring a larger length is a protocol violation.
pub const MAX_REQUEST_SIZE: u32 = 0x20000;

/// The maximum number of block requests kept outstanding at once on a single
/// peer connection (the pipeline depth).
pub const MAX_PIPELINED_REQUESTS: usize = 5;

/// The configuration of a single peer session.
///
/// A torrent engine will typically have one shared instance of this applied
/// to all its peer connections.
#[derive(Clone, Copy, Debug)]
pub struct PeerConf {
    /// The number of block requests we keep outstanding on the wire to fully
    /// saturate the link, per peer.
    pub max_pipelined_requests: usize,

    /// The length of a block we request, in bytes. The last block of a piece
    /// may be shorter.
    pub request_size: u32,

    /// The largest request length we are willing to serve before treating
    /// the REQUEST as a protocol violation.
    pub max_request_size: u32,

    /// The window over which [`crate::rate::Rate`] reports a throughput
    /// figure.
    pub rate_window: Duration,

    /// How long the outbound queue may sit idle before the writer injects a
    /// KEEP_ALIVE of its own accord.
    pub keepalive_interval: Duration,

    /// How long we tolerate a read gap before considering the peer dead and
    /// transitioning the exchange to `Errored`.
    pub idle_read_timeout: Duration,

    /// How long we wait for the initial TCP connect to succeed.
    pub connect_timeout: Duration,
}

impl Default for PeerConf {
    /// Returns the configuration with the defaults named throughout the
    /// specification: a pipeline depth of 5, 16 KiB requests, a 128 KiB
    /// request ceiling, a 20 second rate window, a 2 minute keepalive
    /// interval, and a 130 second dead-peer read timeout.
    fn default() -> Self {
        Self {
            max_pipelined_requests: MAX_PIPELINED_REQUESTS,
            request_size: DEFAULT_REQUEST_SIZE,
            max_request_size: MAX_REQUEST_SIZE,
            rate_window: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(2 * 60),
            idle_read_timeout: Duration::from_secs(130),
            // needs tuning once real-world connect latencies are measured
            connect_timeout: Duration::from_secs(30),
        }
    }
}
