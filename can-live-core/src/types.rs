//! Core types for the live CAN pipeline
//!
//! This module defines the values that flow between the frame sources, the
//! decoder, the signal state table and the recorder, together with the error
//! type shared by the whole library.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Bit 31 marks a 29-bit identifier in schema lookup keys (DBC convention)
pub const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Largest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Maximum payload of a classic CAN frame
pub const MAX_CLASSIC_PAYLOAD: usize = 8;

/// Maximum payload of a CAN-FD frame
pub const MAX_FD_PAYLOAD: usize = 64;

/// Build the key used to look a frame up in the signal schema
pub fn lookup_key(can_id: u32, is_extended: bool) -> u32 {
    if is_extended {
        can_id | EXTENDED_ID_FLAG
    } else {
        can_id
    }
}

/// Format a lookup key the way the live view shows it ("0x1A0", "0x18FEF100 (EXT)")
pub fn format_key(key: u32) -> String {
    if key & EXTENDED_ID_FLAG != 0 {
        format!("0x{:X} (EXT)", key & !EXTENDED_ID_FLAG)
    } else {
        format!("0x{:X}", key)
    }
}

/// Raw CAN frame as delivered by a frame source
///
/// Frames are immutable once produced. The timestamp is taken from the
/// monotonic clock at the moment the source handed the frame over, so the
/// whole pipeline reasons about one time base.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// CAN arbitration ID (11-bit or 29-bit, without flag bits)
    pub can_id: u32,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// Frame data bytes (0-8 bytes for classic CAN, up to 64 for CAN-FD)
    pub data: Vec<u8>,
    /// True if this is a CAN-FD frame
    pub is_fd: bool,
    /// Monotonic receive time
    pub timestamp: Instant,
    /// Hardware timestamp in microseconds, when the backend provides one
    pub hw_timestamp_us: Option<u64>,
    /// Source channel number
    pub channel: u8,
}

impl RawFrame {
    /// Build a classic frame stamped with the current instant
    pub fn new(can_id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self::at(can_id, data, Instant::now())
    }

    /// Build a classic frame with an explicit receive instant
    pub fn at(can_id: u32, data: impl Into<Vec<u8>>, timestamp: Instant) -> Self {
        Self {
            can_id,
            is_extended: can_id > MAX_STANDARD_ID,
            data: data.into(),
            is_fd: false,
            timestamp,
            hw_timestamp_us: None,
            channel: 0,
        }
    }

    /// Builder method: mark the frame as CAN-FD
    pub fn with_fd(mut self, is_fd: bool) -> Self {
        self.is_fd = is_fd;
        self
    }

    /// Builder method: force the identifier format
    pub fn with_extended(mut self, is_extended: bool) -> Self {
        self.is_extended = is_extended;
        self
    }

    /// Builder method: attach the backend's own timestamp
    pub fn with_hw_timestamp(mut self, timestamp_us: u64) -> Self {
        self.hw_timestamp_us = Some(timestamp_us);
        self
    }

    /// Builder method: set the source channel
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Key of this frame in the signal schema
    pub fn key(&self) -> u32 {
        lookup_key(self.can_id, self.is_extended)
    }

    /// Check identifier range and payload size
    pub fn validate(&self) -> Result<()> {
        let max_id = if self.is_extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if self.can_id > max_id {
            return Err(Error::InvalidFrame(format!(
                "identifier 0x{:X} exceeds 0x{:X}",
                self.can_id, max_id
            )));
        }
        let max_len = if self.is_fd {
            MAX_FD_PAYLOAD
        } else {
            MAX_CLASSIC_PAYLOAD
        };
        if self.data.len() > max_len {
            return Err(Error::InvalidFrame(format!(
                "payload of {} bytes exceeds {} bytes",
                self.data.len(),
                max_len
            )));
        }
        Ok(())
    }
}

/// Errors that can occur in the pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Hardware disconnected: {0}")]
    HardwareDisconnected(String),

    #[error("Failed to load signal schema {path}: {reason}")]
    SchemaLoadFailed { path: String, reason: String },

    #[error("Malformed frame 0x{can_id:X}: {reason}")]
    DecodeMalformed { can_id: u32, reason: String },

    #[error("Unknown message ID: 0x{0:X}")]
    UnknownMessageId(u32),

    #[error("Recorder write failed: {0}")]
    RecorderWriteFailed(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Physical value of a decoded signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhysicalValue {
    /// Scaled value: `raw * factor + offset`
    Numeric(f64),
    /// Raw value with a description from the DBC value table
    State { raw: i64, label: String },
}

impl PhysicalValue {
    /// Numeric view of the value, used by plots and the recorder
    pub fn as_f64(&self) -> f64 {
        match self {
            PhysicalValue::Numeric(v) => *v,
            PhysicalValue::State { raw, .. } => *raw as f64,
        }
    }
}

impl fmt::Display for PhysicalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalValue::Numeric(v) => write!(f, "{:.3}", v),
            PhysicalValue::State { label, .. } => write!(f, "{}", label),
        }
    }
}

/// Whether a signal value can be trusted as current
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    /// Updated within the staleness window
    Fresh,
    /// Last update is older than the staleness window
    Stale,
    /// Never received since the schema was loaded
    Unknown,
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validity::Fresh => write!(f, "Fresh"),
            Validity::Stale => write!(f, "Stale"),
            Validity::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Out-of-range flag attached to a decoded value (never fatal)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RangeWarning {
    BelowMin { min: f64 },
    AboveMax { max: f64 },
}

impl fmt::Display for RangeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeWarning::BelowMin { min } => write!(f, "below min {}", min),
            RangeWarning::AboveMax { max } => write!(f, "above max {}", max),
        }
    }
}

/// Latest known value of one signal, as seen by a reader
#[derive(Debug, Clone, PartialEq)]
pub struct SignalValue {
    /// Signal name (unique within the schema)
    pub name: Arc<str>,
    /// Owning message key (see [`lookup_key`])
    pub message_key: u32,
    /// Physical value, `None` while the signal is Unknown
    pub value: Option<PhysicalValue>,
    /// Raw value before scaling
    pub raw_value: Option<i64>,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<Arc<str>>,
    /// Receive time of the frame that carried the value
    pub timestamp: Option<Instant>,
    /// Ingest sequence number of that frame
    pub sequence: u64,
    /// Validity at the time the value was read
    pub validity: Validity,
    /// Range warning raised by the decoder
    pub warning: Option<RangeWarning>,
    /// Time between the last two updates
    pub cycle_time: Option<Duration>,
    /// Number of updates since the schema was loaded
    pub update_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_key_marks_extended_ids() {
        assert_eq!(lookup_key(0x100, false), 0x100);
        assert_eq!(lookup_key(0x18FEF100, true), 0x98FEF100);
        assert_eq!(format_key(0x98FEF100), "0x18FEF100 (EXT)");
        assert_eq!(format_key(0x1A0), "0x1A0");
    }

    #[test]
    fn test_frame_validation() {
        assert!(RawFrame::new(0x100, vec![0; 8]).validate().is_ok());
        assert!(RawFrame::new(0x100, vec![0; 9]).validate().is_err());
        assert!(RawFrame::new(0x100, vec![0; 64]).with_fd(true).validate().is_ok());
        assert!(RawFrame::new(0x800, vec![0; 8])
            .with_extended(false)
            .validate()
            .is_err());
        assert!(RawFrame::new(0x18FEF100, vec![]).is_extended);
    }

    #[test]
    fn test_physical_value_display() {
        assert_eq!(format!("{}", PhysicalValue::Numeric(1.0)), "1.000");
        let state = PhysicalValue::State {
            raw: 2,
            label: "Charging".to_string(),
        };
        assert_eq!(format!("{}", state), "Charging");
        assert_eq!(state.as_f64(), 2.0);
    }
}
