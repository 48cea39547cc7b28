//! Dummy bus: never produces frames

use super::{Backend, FrameSource, ReceiveOutcome};
use crate::config::BusParams;
use crate::types::Result;
use std::time::Duration;

/// Backend that always opens a [`NullSource`]
#[derive(Debug, Default)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn open(&mut self, params: &BusParams) -> Result<Box<dyn FrameSource>> {
        log::debug!("Opening dummy bus for channel {}", params.channel);
        Ok(Box::new(NullSource))
    }
}

/// Source that waits out every timeout and yields nothing
#[derive(Debug, Default)]
pub struct NullSource;

impl FrameSource for NullSource {
    fn name(&self) -> &str {
        "null"
    }

    fn receive(&mut self, timeout: Duration) -> ReceiveOutcome {
        std::thread::sleep(timeout);
        ReceiveOutcome::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_null_source_only_times_out() {
        let mut source = NullBackend.open(&BusParams::default()).unwrap();
        let start = Instant::now();
        assert_eq!(source.receive(Duration::from_millis(5)), ReceiveOutcome::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
