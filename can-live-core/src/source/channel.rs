//! In-process frame source
//!
//! Frames are pushed by a [`FrameInjector`] (a driver callback thread, a
//! simulator or a test) into a bounded queue. A full queue is never waited
//! on: the frame is counted as an overrun and the next receive reports it.

use super::{Backend, FrameSource, ReceiveOutcome};
use crate::config::BusParams;
use crate::types::{Error, RawFrame, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct Shared {
    overruns: AtomicU64,
    link_up: AtomicBool,
}

/// Backend whose frames come from a [`FrameInjector`]
pub struct ChannelBackend {
    rx: Receiver<RawFrame>,
    shared: Arc<Shared>,
}

impl ChannelBackend {
    /// Create a backend with a queue of `capacity` frames and its injector
    pub fn new(capacity: usize) -> (Self, FrameInjector) {
        let (tx, rx) = bounded(capacity);
        let shared = Arc::new(Shared {
            overruns: AtomicU64::new(0),
            link_up: AtomicBool::new(true),
        });
        (
            Self {
                rx,
                shared: shared.clone(),
            },
            FrameInjector { tx, shared },
        )
    }
}

impl Backend for ChannelBackend {
    fn name(&self) -> &str {
        "channel"
    }

    fn open(&mut self, params: &BusParams) -> Result<Box<dyn FrameSource>> {
        if !self.shared.link_up.load(Ordering::Acquire) {
            return Err(Error::HardwareDisconnected(format!(
                "channel {} is down",
                params.channel
            )));
        }
        Ok(Box::new(ChannelSource {
            rx: self.rx.clone(),
            shared: self.shared.clone(),
        }))
    }
}

struct ChannelSource {
    rx: Receiver<RawFrame>,
    shared: Arc<Shared>,
}

impl FrameSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    fn receive(&mut self, timeout: Duration) -> ReceiveOutcome {
        if !self.shared.link_up.load(Ordering::Acquire) {
            return ReceiveOutcome::Disconnected("link down".to_string());
        }
        let lost = self.shared.overruns.swap(0, Ordering::AcqRel);
        if lost > 0 {
            return ReceiveOutcome::Overrun { lost };
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => ReceiveOutcome::Frame(frame),
            Err(RecvTimeoutError::Timeout) => ReceiveOutcome::Timeout,
            Err(RecvTimeoutError::Disconnected) => {
                ReceiveOutcome::Disconnected("frame injector dropped".to_string())
            }
        }
    }
}

/// Producer handle of a [`ChannelBackend`]
#[derive(Clone)]
pub struct FrameInjector {
    tx: Sender<RawFrame>,
    shared: Arc<Shared>,
}

impl FrameInjector {
    /// Queue a frame without blocking
    ///
    /// Returns false if the frame was not queued (queue full or no
    /// receiver left); a full queue is counted as an overrun.
    pub fn inject(&self, frame: RawFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.shared.overruns.fetch_add(1, Ordering::AcqRel);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Simulate plugging or unplugging the hardware
    pub fn set_link(&self, up: bool) {
        self.shared.link_up.store(up, Ordering::Release);
    }

    /// Overruns not yet reported to the receiver
    pub fn pending_overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Acquire)
    }
}
