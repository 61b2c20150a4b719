//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

/// The maximum accepted `Piece` message block length, per the wire codec
/// (spec.md §4.1/§6). A peer sending a larger block is dropped.
pub const MAX_BLOCK_LEN: u32 = 1_000_000;

/// The global configuration for a [`crate::engine::ResourceEngine`] and all
/// its parts, mirroring the teacher's `Conf`/`EngineConf`/`TorrentConf`
/// split, reshaped around this spec's knobs instead of the teacher's
/// tracker-announce ones.
#[derive(Clone, Copy, Debug)]
pub struct EngineConf {
    /// How often the scheduler wakes to look for free pieces (spec.md §4.5).
    pub scheduler_tick: Duration,

    /// How long a dispatched request is allowed to stay `IN_PROGRESS` before
    /// the scheduler reclaims the piece (spec.md §4.5, "work task").
    pub request_timeout: Duration,

    /// How often the owned bitfield is rebroadcast to all connected peers
    /// (spec.md §4.5, "Periodic bitfield broadcast").
    pub broadcast_interval: Duration,

    /// The width of the rolling window used to compute upload/download
    /// rates (spec.md §4.5, "Network statistics").
    pub stats_window: Duration,

    /// The largest `Piece` block length a peer may send before the
    /// connection is closed (spec.md §4.1/§6).
    pub max_block_len: u32,
}

impl Default for EngineConf {
    /// Returns the engine configuration with the defaults specified in
    /// spec.md §5 ("Timeouts").
    fn default() -> Self {
        Self {
            scheduler_tick: Duration::from_millis(200),
            request_timeout: Duration::from_secs(60),
            broadcast_interval: Duration::from_secs(30),
            stats_window: Duration::from_secs(2),
            max_block_len: MAX_BLOCK_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_timeouts() {
        let conf = EngineConf::default();
        assert_eq!(conf.scheduler_tick, Duration::from_millis(200));
        assert_eq!(conf.request_timeout, Duration::from_secs(60));
        assert_eq!(conf.broadcast_interval, Duration::from_secs(30));
        assert_eq!(conf.stats_window, Duration::from_secs(2));
        assert_eq!(conf.max_block_len, 1_000_000);
    }
}
