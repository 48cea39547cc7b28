//! Time-sliced recorder
//!
//! Samples a selection of signals from the state table at a fixed interval
//! and appends one [`LogRecord`] per tick to a [`LogSink`].
//!
//! Two threads do the work. The sampler follows a drift-free schedule and
//! only ever reads published table snapshots; it hands records to the
//! writer through a bounded queue and never waits on it. When the queue is
//! full the sample is skipped and counted. The writer owns the sink, so a
//! slow or failing disk only ever affects the recorder.
//!
//! State machine: `Idle -> Armed -> Recording -> Stopped`, with `arm`
//! allowed again from `Stopped`.

mod sink;

pub use sink::{CsvSink, LogRecord, LogSink, MemorySink, RecordEntry};

use crate::state_table::TableReader;
use crate::types::{Error, Result, Validity};
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Armed,
    Recording,
    Stopped,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RecorderState::Idle => "idle",
            RecorderState::Armed => "armed",
            RecorderState::Recording => "recording",
            RecorderState::Stopped => "stopped",
        };
        write!(f, "{}", text)
    }
}

/// Counters and state of the recorder
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderStatus {
    pub state: RecorderState,
    /// Records queued for the sink
    pub samples: u64,
    /// Records the sink accepted
    pub written: u64,
    /// Ticks that produced no record (queue full or sampler late)
    pub skipped: u64,
    /// First write error, reported once
    pub last_error: Option<String>,
}

impl RecorderStatus {
    fn new() -> Self {
        Self {
            state: RecorderState::Idle,
            samples: 0,
            written: 0,
            skipped: 0,
            last_error: None,
        }
    }
}

/// Drift-free tick schedule: tick `k` is due at `start + k * interval`
#[derive(Debug, Clone)]
struct TickSchedule {
    start: Instant,
    interval: Duration,
    tick: u64,
}

impl TickSchedule {
    fn new(start: Instant, interval: Duration) -> Self {
        Self {
            start,
            interval,
            tick: 0,
        }
    }

    fn deadline(&self, tick: u64) -> Instant {
        let nanos = self.interval.as_nanos().saturating_mul(tick as u128);
        self.start + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// When the next tick is due
    fn next_deadline(&self) -> Instant {
        self.deadline(self.tick + 1)
    }

    /// Move to the latest tick due at `now`; returns how many were missed
    fn advance(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.start).as_nanos();
        let due = u64::try_from(elapsed / self.interval.as_nanos().max(1)).unwrap_or(u64::MAX);
        let next = self.tick + 1;
        self.tick = due.max(next);
        due.saturating_sub(next)
    }
}

#[derive(Debug, Clone)]
struct Selection {
    signals: Vec<Arc<str>>,
    interval: Duration,
}

struct Workers {
    stop_tx: Sender<()>,
    sampler: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Recorder bound to one state table
pub struct Recorder {
    reader: TableReader,
    queue_capacity: usize,
    default_interval: Duration,
    status: Arc<Mutex<RecorderStatus>>,
    selection: Option<Selection>,
    workers: Option<Workers>,
}

impl Recorder {
    /// `default_interval` is used by [`Recorder::arm_default`]
    pub fn new(reader: TableReader, queue_capacity: usize, default_interval: Duration) -> Self {
        Self {
            reader,
            queue_capacity: queue_capacity.max(1),
            default_interval,
            status: Arc::new(Mutex::new(RecorderStatus::new())),
            selection: None,
            workers: None,
        }
    }

    /// Select the signals to record and the sampling interval
    ///
    /// Every name must exist in the current schema. Allowed while Idle,
    /// Armed or Stopped; counters restart.
    pub fn arm(&mut self, signals: &[impl AsRef<str>], interval: Duration) -> Result<()> {
        let state = self.status.lock().state;
        if state == RecorderState::Recording {
            return Err(Error::InvalidState("cannot arm while recording".to_string()));
        }
        if interval.is_zero() {
            return Err(Error::ConfigInvalid(
                "recording interval must be greater than zero".to_string(),
            ));
        }
        if signals.is_empty() {
            return Err(Error::ConfigInvalid("no signals selected for recording".to_string()));
        }

        let snapshot = self.reader.snapshot();
        let schema = snapshot.schema();
        let mut selected = Vec::with_capacity(signals.len());
        for name in signals {
            let name = name.as_ref();
            let index = schema
                .index_of(name)
                .ok_or_else(|| Error::ConfigInvalid(format!("unknown signal '{}'", name)))?;
            if let Some(signal) = schema.signal(index) {
                selected.push(signal.name.clone());
            }
        }

        // Threads left behind by a write failure
        self.join_workers();

        self.selection = Some(Selection {
            signals: selected,
            interval,
        });
        let mut status = self.status.lock();
        *status = RecorderStatus::new();
        status.state = RecorderState::Armed;
        log::info!(
            "Recorder armed: {} signals every {} ms",
            signals.len(),
            interval.as_millis()
        );
        Ok(())
    }

    /// Select signals, sampling at the configured recording interval
    pub fn arm_default(&mut self, signals: &[impl AsRef<str>]) -> Result<()> {
        self.arm(signals, self.default_interval)
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Start sampling into `sink`
    pub fn start(&mut self, sink: Box<dyn LogSink>) -> Result<()> {
        let state = self.status.lock().state;
        if state != RecorderState::Armed {
            return Err(Error::InvalidState(format!("cannot start recorder while {}", state)));
        }
        let selection = self
            .selection
            .clone()
            .ok_or_else(|| Error::InvalidState("recorder has no selection".to_string()))?;

        let (record_tx, record_rx) = bounded::<LogRecord>(self.queue_capacity);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let sink_name = sink.name().to_string();

        // Set before the writer exists so a write failure is never overwritten
        self.status.lock().state = RecorderState::Recording;
        let writer = {
            let status = self.status.clone();
            std::thread::Builder::new()
                .name("recorder-writer".to_string())
                .spawn(move || run_writer(sink, record_rx, status))
        };
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                self.status.lock().state = RecorderState::Armed;
                return Err(e.into());
            }
        };
        let sampler = {
            let status = self.status.clone();
            let reader = self.reader.clone();
            std::thread::Builder::new()
                .name("recorder-sampler".to_string())
                .spawn(move || run_sampler(reader, selection, record_tx, stop_rx, status))
        };
        let sampler = match sampler {
            Ok(handle) => handle,
            Err(e) => {
                // record_tx went down with the closure, so the writer exits
                let _ = writer.join();
                self.status.lock().state = RecorderState::Armed;
                return Err(e.into());
            }
        };

        self.workers = Some(Workers {
            stop_tx,
            sampler,
            writer,
        });
        log::info!("Recording started ({})", sink_name);
        Ok(())
    }

    /// Stop recording, drain the queue and close the sink
    ///
    /// Returns once the sink is closed. Calling it when not recording is a
    /// no-op apart from returning the status.
    pub fn stop(&mut self) -> RecorderStatus {
        let was_running = self.workers.is_some();
        self.join_workers();
        let mut status = self.status.lock();
        if status.state == RecorderState::Recording {
            status.state = RecorderState::Stopped;
        }
        if was_running {
            log::info!(
                "Recording stopped: {} written, {} skipped",
                status.written,
                status.skipped
            );
        }
        status.clone()
    }

    pub fn status(&self) -> RecorderStatus {
        self.status.lock().clone()
    }

    pub fn state(&self) -> RecorderState {
        self.status.lock().state
    }

    fn join_workers(&mut self) {
        if let Some(workers) = self.workers.take() {
            drop(workers.stop_tx);
            if workers.sampler.join().is_err() {
                log::error!("Recorder sampler thread panicked");
            }
            if workers.writer.join().is_err() {
                log::error!("Recorder writer thread panicked");
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.join_workers();
    }
}

fn run_sampler(
    reader: TableReader,
    selection: Selection,
    record_tx: Sender<LogRecord>,
    stop_rx: Receiver<()>,
    status: Arc<Mutex<RecorderStatus>>,
) {
    let started = Instant::now();
    let mut schedule = TickSchedule::new(started, selection.interval);
    let mut sequence = 0u64;

    loop {
        match stop_rx.recv_deadline(schedule.next_deadline()) {
            Err(RecvTimeoutError::Timeout) => {}
            // Stop requested or the recorder went away
            _ => break,
        }

        let now = Instant::now();
        let missed = schedule.advance(now);
        let snapshot = reader.snapshot();
        let entries = selection
            .signals
            .iter()
            .map(|name| match snapshot.get(name, now) {
                Some(value) => RecordEntry {
                    name: name.clone(),
                    value: value.value.as_ref().map(|v| v.as_f64()),
                    validity: value.validity,
                },
                // Removed by a schema reload
                None => RecordEntry {
                    name: name.clone(),
                    value: None,
                    validity: Validity::Unknown,
                },
            })
            .collect();

        let record = LogRecord {
            timestamp: Utc::now(),
            elapsed: now.saturating_duration_since(started),
            sequence,
            entries,
        };
        sequence += 1;

        let outcome = record_tx.try_send(record);
        let mut status = status.lock();
        status.skipped += missed;
        match outcome {
            Ok(()) => status.samples += 1,
            Err(TrySendError::Full(_)) => {
                status.skipped += 1;
                log::debug!("Recorder queue full, sample skipped");
            }
            // Writer gave up after a write failure
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
}

fn run_writer(
    mut sink: Box<dyn LogSink>,
    record_rx: Receiver<LogRecord>,
    status: Arc<Mutex<RecorderStatus>>,
) {
    let name = sink.name().to_string();
    let fail = |e: Error| {
        log::error!("Recording to {} failed: {}", name, e);
        let mut status = status.lock();
        status.state = RecorderState::Stopped;
        status.last_error = Some(e.to_string());
    };

    while let Ok(record) = record_rx.recv() {
        if let Err(e) = sink.write(&record) {
            fail(e);
            let _ = sink.close();
            return;
        }
        status.lock().written += 1;
        if record_rx.is_empty() {
            if let Err(e) = sink.flush() {
                fail(e);
                let _ = sink.close();
                return;
            }
        }
    }

    if let Err(e) = sink.close() {
        fail(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_schedule_has_no_drift() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(start, ms(100));
        assert_eq!(schedule.next_deadline(), start + ms(100));

        // Woken a little late: the next deadline stays on the grid
        assert_eq!(schedule.advance(start + ms(107)), 0);
        assert_eq!(schedule.next_deadline(), start + ms(200));
    }

    #[test]
    fn test_schedule_counts_missed_ticks() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(start, ms(100));
        schedule.advance(start + ms(100));
        // Ticks 2, 3 and 4 due, only one sample taken
        assert_eq!(schedule.advance(start + ms(430)), 2);
        assert_eq!(schedule.next_deadline(), start + ms(500));
    }

    #[test]
    fn test_schedule_early_wakeup_is_one_tick() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(start, ms(100));
        assert_eq!(schedule.advance(start + ms(99)), 0);
        assert_eq!(schedule.next_deadline(), start + ms(200));
    }
}
