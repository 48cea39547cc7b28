//! candump log replay
//!
//! Replays a SocketCAN `candump -l` log as if it were live traffic. Frames
//! are released at the pace given by their log timestamps and stamped with
//! the monotonic receive time, so staleness and bus-loss behave as on a
//! real bus. The end of the log looks like a silent bus.
//!
//! Line format: `(1436509052.249713) vcan0 18FEF100#2A366C2BBA`, with `##`
//! and a flags nibble for CAN-FD frames.

use super::{Backend, FrameSource, ReceiveOutcome};
use crate::config::BusParams;
use crate::types::{Error, RawFrame, Result, MAX_STANDARD_ID};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One frame of a candump log, before it is replayed
#[derive(Debug, Clone, PartialEq)]
pub struct CandumpEntry {
    /// Log timestamp in seconds
    pub timestamp: f64,
    pub interface: String,
    pub can_id: u32,
    pub is_extended: bool,
    pub is_fd: bool,
    pub data: Vec<u8>,
}

/// Parse one `candump -l` line
pub fn parse_candump_line(line: &str) -> Result<CandumpEntry> {
    let invalid =
        |what: &str| Error::InvalidData(format!("{} in candump line '{}'", what, line));

    let mut line_splits = line.split_whitespace();
    let timestamp = line_splits.next().ok_or_else(|| invalid("missing timestamp"))?;
    let timestamp = timestamp
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| invalid("malformed timestamp"))?
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite() && *t >= 0.0)
        .ok_or_else(|| invalid("malformed timestamp"))?;
    let interface = line_splits.next().ok_or_else(|| invalid("missing interface"))?;
    let id_and_data = line_splits.next().ok_or_else(|| invalid("missing id#data"))?;

    // "##" marks CAN-FD, followed by one flags character
    let (id_str, payload, is_fd) = match id_and_data.split_once("##") {
        Some((id, rest)) => (id, rest.get(1..).unwrap_or(""), true),
        None => {
            let (id, rest) = id_and_data
                .split_once('#')
                .ok_or_else(|| invalid("missing '#'"))?;
            (id, rest, false)
        }
    };

    let can_id = u32::from_str_radix(id_str, 16).map_err(|_| invalid("malformed identifier"))?;
    // Remote frames carry no payload
    let data = if payload.starts_with('R') {
        Vec::new()
    } else {
        hex_to_bytes(payload).ok_or_else(|| invalid("malformed payload"))?
    };

    Ok(CandumpEntry {
        timestamp,
        interface: interface.to_string(),
        can_id,
        is_extended: id_str.len() > 3 || can_id > MAX_STANDARD_ID,
        is_fd,
        data,
    })
}

/// Format a frame as a `candump -l` line
pub fn format_candump_line(timestamp: f64, interface: &str, frame: &RawFrame) -> String {
    let id = if frame.is_extended {
        format!("{:08X}", frame.can_id)
    } else {
        format!("{:03X}", frame.can_id)
    };
    let data: String = frame.data.iter().map(|b| format!("{:02X}", b)).collect();
    let separator = if frame.is_fd { "##0" } else { "#" };
    format!("({:.6}) {} {}{}{}", timestamp, interface, id, separator, data)
}

fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Backend replaying a candump log file
pub struct CandumpBackend {
    path: PathBuf,
}

impl CandumpBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(path: &Path) -> Result<Vec<CandumpEntry>> {
        let content = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_candump_line(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("{:?}:{}: skipping line: {}", path, line_no + 1, e),
            }
        }
        Ok(entries)
    }
}

impl Backend for CandumpBackend {
    fn name(&self) -> &str {
        "candump"
    }

    fn open(&mut self, params: &BusParams) -> Result<Box<dyn FrameSource>> {
        let entries = Self::load(&self.path).map_err(|e| {
            Error::HardwareDisconnected(format!("cannot open replay {:?}: {}", self.path, e))
        })?;
        log::info!(
            "Replaying {} frames from {:?} as {}",
            entries.len(),
            self.path,
            params.channel
        );
        Ok(Box::new(CandumpSource {
            first_timestamp: entries.first().map(|e| e.timestamp).unwrap_or(0.0),
            entries,
            position: 0,
            started: Instant::now(),
        }))
    }
}

struct CandumpSource {
    entries: Vec<CandumpEntry>,
    position: usize,
    first_timestamp: f64,
    started: Instant,
}

impl CandumpSource {
    /// Replay instant of `entry`; `None` if its offset is not representable
    fn due(&self, entry: &CandumpEntry) -> Option<Instant> {
        let offset = (entry.timestamp - self.first_timestamp).max(0.0);
        Duration::try_from_secs_f64(offset)
            .ok()
            .and_then(|offset| self.started.checked_add(offset))
    }
}

impl FrameSource for CandumpSource {
    fn name(&self) -> &str {
        "candump"
    }

    fn receive(&mut self, timeout: Duration) -> ReceiveOutcome {
        let Some(entry) = self.entries.get(self.position) else {
            std::thread::sleep(timeout);
            return ReceiveOutcome::Timeout;
        };

        let now = Instant::now();
        match self.due(entry) {
            Some(due) if due > now => {
                let wait = due - now;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return ReceiveOutcome::Timeout;
                }
                std::thread::sleep(wait);
            }
            Some(_) => {}
            None => log::warn!(
                "Timestamp {} is out of replay range, releasing frame immediately",
                entry.timestamp
            ),
        }

        let frame = RawFrame::at(entry.can_id, entry.data.clone(), Instant::now())
            .with_extended(entry.is_extended)
            .with_fd(entry.is_fd)
            .with_hw_timestamp((entry.timestamp * 1_000_000.0).round() as u64);
        self.position += 1;
        ReceiveOutcome::Frame(frame)
    }
}
