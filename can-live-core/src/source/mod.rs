//! Frame sources
//!
//! A [`Backend`] is the hardware capability boundary: it opens a channel and
//! hands back a [`FrameSource`] that yields frames with a bounded wait.
//! Vendor drivers live outside this crate and plug in by implementing the
//! two traits; the crate ships a null source (the dummy bus), a channel
//! source fed by a [`FrameInjector`] and a candump log replayer.

mod candump;
mod channel;
mod null;

pub use candump::{format_candump_line, parse_candump_line, CandumpBackend};
pub use channel::{ChannelBackend, FrameInjector};
pub use null::{NullBackend, NullSource};

use crate::config::BusParams;
use crate::types::{RawFrame, Result};
use std::time::Duration;

/// Result of one bounded receive
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    Frame(RawFrame),
    /// Nothing arrived within the timeout
    Timeout,
    /// The source's buffer overflowed and `lost` frames were discarded
    Overrun { lost: u64 },
    /// The link is gone; the source must be reopened
    Disconnected(String),
}

/// An open channel producing frames
pub trait FrameSource: Send {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Wait at most `timeout` for the next frame
    ///
    /// Implementations must not block longer than the timeout.
    fn receive(&mut self, timeout: Duration) -> ReceiveOutcome;

    /// Release the channel
    fn close(&mut self) {}
}

/// Something that can open a [`FrameSource`]
pub trait Backend: Send {
    fn name(&self) -> &str;

    /// Open a channel with the given bus parameters
    fn open(&mut self, params: &BusParams) -> Result<Box<dyn FrameSource>>;
}
