//! Stream multiplexer profile.
//!
//! One immutable set of limits applied to every multiplexed connection of a
//! host. Changing any of them requires assembling a new host.

use crate::error::{HostError, HostResult};
use libp2p::{ping, yamux};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest per-stream window Yamux accepts.
pub const MIN_STREAM_WINDOW: u32 = 256 * 1024;

/// Yamux tuning plus the keep-alive cadence used on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxerProfile {
    /// Per-stream flow-control window in bytes.
    pub max_stream_window: u32,
    /// Inbound streams allowed to wait for protocol negotiation before new
    /// ones are refused.
    pub accept_backlog: usize,
    /// Keep-alive ping interval; `None` disables keep-alive pings.
    pub keep_alive_interval: Option<Duration>,
    /// Largest amount of data buffered for a single stream.
    pub max_message_size: usize,
    /// Maximum concurrent streams per connection.
    pub max_streams: usize,
}

impl Default for MuxerProfile {
    fn default() -> Self {
        Self {
            max_stream_window: 4 * 1024 * 1024, // 4 MiB
            accept_backlog: 128,
            keep_alive_interval: Some(Duration::from_secs(15)),
            max_message_size: 16 * 1024 * 1024, // 16 MiB
            max_streams: 512,
        }
    }
}

impl MuxerProfile {
    /// Checks the limits before they reach the multiplexer, which would
    /// otherwise panic on an undersized window.
    pub fn validate(&self) -> HostResult<()> {
        if self.max_stream_window < MIN_STREAM_WINDOW {
            return Err(HostError::HostConstruction(format!(
                "stream window {} is below the minimum of {MIN_STREAM_WINDOW}",
                self.max_stream_window
            )));
        }
        if self.accept_backlog == 0 || self.max_streams == 0 {
            return Err(HostError::HostConstruction(
                "accept backlog and stream limit must be non-zero".to_string(),
            ));
        }
        if self.max_message_size < self.max_stream_window as usize {
            return Err(HostError::HostConstruction(format!(
                "max message size {} is smaller than the stream window {}",
                self.max_message_size, self.max_stream_window
            )));
        }
        if self.keep_alive_interval == Some(Duration::ZERO) {
            return Err(HostError::HostConstruction(
                "keep-alive interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the Yamux configuration for this profile.
    ///
    /// Each of these setters switches `yamux::Config` over to the legacy
    /// yamux 0.12 implementation, the only one exposing window and buffer
    /// limits.
    #[allow(deprecated)]
    pub fn yamux_config(&self) -> yamux::Config {
        let mut config = yamux::Config::default();
        config.set_max_num_streams(self.max_streams);
        config.set_receive_window_size(self.max_stream_window);
        config.set_max_buffer_size(self.max_message_size);
        config
    }

    /// Ping configuration driving keep-alive, if enabled.
    pub fn ping_config(&self) -> Option<ping::Config> {
        self.keep_alive_interval
            .map(|interval| ping::Config::new().with_interval(interval))
    }
}
