//! Pipeline configuration types
//!
//! Configuration is an explicit value handed to each component at
//! construction. The hosting application decides where it is persisted.

use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the ingest path, the state table and the recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Age after which a signal value turns Stale
    #[serde(default = "default_staleness_window")]
    pub staleness_window_ms: u64,

    /// Silence on the bus after which bus-loss is declared
    #[serde(default = "default_bus_loss_window")]
    pub bus_loss_window_ms: u64,

    /// Upper bound of a single blocking receive on the frame source
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,

    /// Delay between attempts to reopen a disconnected backend
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Maximum age of the published bus health snapshot
    #[serde(default = "default_health_publish_interval")]
    pub health_publish_interval_ms: u64,

    /// Recorder sampling interval
    #[serde(default = "default_recording_interval")]
    pub recording_interval_ms: u64,

    /// Records buffered between the recorder sampler and its sink
    #[serde(default = "default_recorder_queue_capacity")]
    pub recorder_queue_capacity: usize,

    /// Optional: only decode frames from these channels
    #[serde(default)]
    pub channel_filter: Option<Vec<u8>>,

    /// Optional: only decode these message IDs
    #[serde(default)]
    pub message_filter: Option<Vec<u32>>,
}

fn default_staleness_window() -> u64 {
    500
}

fn default_bus_loss_window() -> u64 {
    1000
}

fn default_receive_timeout() -> u64 {
    10
}

fn default_reconnect_interval() -> u64 {
    1000
}

fn default_health_publish_interval() -> u64 {
    100
}

fn default_recording_interval() -> u64 {
    100
}

fn default_recorder_queue_capacity() -> usize {
    256
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            staleness_window_ms: default_staleness_window(),
            bus_loss_window_ms: default_bus_loss_window(),
            receive_timeout_ms: default_receive_timeout(),
            reconnect_interval_ms: default_reconnect_interval(),
            health_publish_interval_ms: default_health_publish_interval(),
            recording_interval_ms: default_recording_interval(),
            recorder_queue_capacity: default_recorder_queue_capacity(),
            channel_filter: None,
            message_filter: None,
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the staleness window
    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window_ms = window.as_millis() as u64;
        self
    }

    /// Builder method: set the bus-loss window
    pub fn with_bus_loss_window(mut self, window: Duration) -> Self {
        self.bus_loss_window_ms = window.as_millis() as u64;
        self
    }

    /// Builder method: set the receive timeout
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: set the reconnect interval
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder method: set the recording interval
    pub fn with_recording_interval(mut self, interval: Duration) -> Self {
        self.recording_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder method: set channel filter
    pub fn with_channel_filter(mut self, channels: Vec<u8>) -> Self {
        self.channel_filter = Some(channels);
        self
    }

    /// Builder method: set message filter
    pub fn with_message_filter(mut self, messages: Vec<u32>) -> Self {
        self.message_filter = Some(messages);
        self
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn bus_loss_window(&self) -> Duration {
        Duration::from_millis(self.bus_loss_window_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn health_publish_interval(&self) -> Duration {
        Duration::from_millis(self.health_publish_interval_ms)
    }

    pub fn recording_interval(&self) -> Duration {
        Duration::from_millis(self.recording_interval_ms)
    }

    /// Check if a channel should be processed
    pub fn should_process_channel(&self, channel: u8) -> bool {
        match &self.channel_filter {
            Some(channels) => channels.contains(&channel),
            None => true,
        }
    }

    /// Check if a message ID should be processed
    pub fn should_process_message(&self, can_id: u32) -> bool {
        match &self.message_filter {
            Some(messages) => messages.contains(&can_id),
            None => true,
        }
    }

    /// Check if a frame should be decoded based on filters
    pub fn should_process_frame(&self, channel: u8, can_id: u32) -> bool {
        self.should_process_channel(channel) && self.should_process_message(can_id)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let windows = [
            ("staleness_window_ms", self.staleness_window_ms),
            ("bus_loss_window_ms", self.bus_loss_window_ms),
            ("receive_timeout_ms", self.receive_timeout_ms),
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("health_publish_interval_ms", self.health_publish_interval_ms),
            ("recording_interval_ms", self.recording_interval_ms),
        ];
        for (name, value) in windows {
            if value == 0 {
                return Err(Error::ConfigInvalid(format!("{} must be greater than zero", name)));
            }
        }
        if self.receive_timeout_ms > self.bus_loss_window_ms {
            return Err(Error::ConfigInvalid(format!(
                "receive_timeout_ms ({}) must not exceed bus_loss_window_ms ({})",
                self.receive_timeout_ms, self.bus_loss_window_ms
            )));
        }
        if self.recorder_queue_capacity == 0 {
            return Err(Error::ConfigInvalid(
                "recorder_queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parameters handed to a hardware backend when opening a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusParams {
    /// Backend-specific channel name (e.g. "PCAN_USBBUS1", "vcan0")
    pub channel: String,
    /// Nominal bitrate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Open the channel in CAN-FD mode
    #[serde(default)]
    pub fd_mode: bool,
    /// Data-phase bitrate for CAN-FD
    #[serde(default)]
    pub data_bitrate: Option<u32>,
}

fn default_bitrate() -> u32 {
    500_000
}

impl Default for BusParams {
    fn default() -> Self {
        Self {
            channel: "PCAN_USBBUS1".to_string(),
            bitrate: default_bitrate(),
            fd_mode: false,
            data_bitrate: None,
        }
    }
}

impl BusParams {
    pub fn new(channel: impl Into<String>, bitrate: u32) -> Self {
        Self {
            channel: channel.into(),
            bitrate,
            ..Default::default()
        }
    }

    /// Builder method: enable CAN-FD with a data-phase bitrate
    pub fn with_fd(mut self, data_bitrate: u32) -> Self {
        self.fd_mode = true;
        self.data_bitrate = Some(data_bitrate);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(Error::ConfigInvalid("channel must not be empty".to_string()));
        }
        if self.bitrate == 0 {
            return Err(Error::ConfigInvalid("bitrate must be greater than zero".to_string()));
        }
        if self.data_bitrate.is_some() && !self.fd_mode {
            return Err(Error::ConfigInvalid(
                "data_bitrate is only valid in CAN-FD mode".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_builder() {
        let config = PipelineConfig::new()
            .with_staleness_window(Duration::from_millis(250))
            .with_bus_loss_window(Duration::from_secs(2))
            .with_recording_interval(Duration::from_millis(50))
            .with_channel_filter(vec![0, 1]);

        assert_eq!(config.staleness_window(), Duration::from_millis(250));
        assert_eq!(config.bus_loss_window_ms, 2000);
        assert_eq!(config.recording_interval_ms, 50);
        assert_eq!(config.channel_filter, Some(vec![0, 1]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filter_logic() {
        let config = PipelineConfig::new()
            .with_channel_filter(vec![0, 1])
            .with_message_filter(vec![0x123, 0x456]);

        assert!(config.should_process_frame(0, 0x123));
        assert!(config.should_process_frame(1, 0x456));
        assert!(!config.should_process_frame(2, 0x123)); // Wrong channel
        assert!(!config.should_process_frame(0, 0x789)); // Wrong message
    }

    #[test]
    fn test_no_filters() {
        let config = PipelineConfig::new();
        assert!(config.should_process_frame(0, 0x123));
        assert!(config.should_process_frame(99, 0xFFFFFFFF));
    }

    #[test]
    fn test_invalid_windows_rejected() {
        let zero_staleness = PipelineConfig {
            staleness_window_ms: 0,
            ..Default::default()
        };
        assert!(matches!(zero_staleness.validate(), Err(Error::ConfigInvalid(_))));

        let slow_receive = PipelineConfig::new()
            .with_receive_timeout(Duration::from_secs(5))
            .with_bus_loss_window(Duration::from_secs(1));
        assert!(matches!(slow_receive.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_bus_params_validation() {
        assert!(BusParams::default().validate().is_ok());
        assert!(BusParams::new("vcan0", 500_000).with_fd(2_000_000).validate().is_ok());
        assert!(BusParams::new("", 500_000).validate().is_err());
        let bad = BusParams {
            data_bitrate: Some(2_000_000),
            ..BusParams::default()
        };
        assert!(bad.validate().is_err());
    }
}
