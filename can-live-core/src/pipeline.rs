//! Ingest pipeline
//!
//! One dedicated thread pulls frames from the active source, decodes them
//! and applies the results to the state table and the health monitor. It
//! never touches the disk or waits on a reader: everything it shares is
//! published through atomic snapshots.
//!
//! When the backend cannot be opened, or disconnects, ingest carries on
//! with the null source (no data, never fake values) and keeps trying to
//! reopen the backend.

use crate::config::{BusParams, PipelineConfig};
use crate::decoder::{decode_frame, DecodeOutcome, Decoder};
use crate::health::{HealthMonitor, HealthReader, LinkState};
use crate::recorder::Recorder;
use crate::signals::DatabaseStats;
use crate::source::{Backend, FrameSource, NullSource, ReceiveOutcome};
use crate::state_table::{SignalStateTable, TableReader};
use crate::types::{format_key, RawFrame, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Counters of one ingest run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Frames received from the source
    pub frames: u64,
    /// Frames decoded completely
    pub decoded: u64,
    pub unknown: u64,
    pub malformed: u64,
    /// Frames skipped by the channel/message filter
    pub filtered: u64,
    /// Frames the source lost to overruns
    pub overruns: u64,
    /// Successful reopens of the backend
    pub reconnects: u64,
    /// Schema swaps picked up by the state table
    pub schema_reloads: u64,
}

/// Entry point for starting live ingest
pub struct Pipeline;

impl Pipeline {
    /// Open the backend and start the ingest thread
    ///
    /// # Arguments
    /// * `config` - Pipeline tunables, validated first
    /// * `decoder` - Decoder holding the schema; reloads through any clone
    ///   are picked up by the running pipeline
    /// * `backend` - Hardware backend to read from
    /// * `params` - Channel parameters for `backend.open`
    ///
    /// # Returns
    /// * `Result<PipelineHandle>` - fails only on invalid configuration or
    ///   when the ingest thread cannot be spawned. A backend that cannot be
    ///   opened is not an error; the pipeline starts on the dummy bus.
    ///
    /// # Example
    /// ```no_run
    /// use can_live_core::{BusParams, Decoder, NullBackend, Pipeline, PipelineConfig};
    /// use std::path::Path;
    ///
    /// let decoder = Decoder::new();
    /// decoder.load_dbc(Path::new("powertrain.dbc")).unwrap();
    /// let mut handle = Pipeline::start(
    ///     PipelineConfig::default(),
    ///     decoder,
    ///     Box::new(NullBackend),
    ///     BusParams::default(),
    /// )
    /// .unwrap();
    /// println!("{:?}", handle.table().get("EngineSpeed"));
    /// let summary = handle.stop();
    /// println!("{} frames", summary.frames);
    /// ```
    pub fn start(
        config: PipelineConfig,
        decoder: Decoder,
        mut backend: Box<dyn Backend>,
        params: BusParams,
    ) -> Result<PipelineHandle> {
        config.validate()?;
        params.validate()?;

        let now = Instant::now();
        let table = SignalStateTable::new(decoder.schema(), config.staleness_window());
        let mut health = HealthMonitor::new(config.bus_loss_window(), now);

        let (source, needs_reconnect): (Box<dyn FrameSource>, bool) = match backend.open(&params) {
            Ok(source) => {
                log::info!(
                    "Opened {} on {} at {} bit/s",
                    backend.name(),
                    params.channel,
                    params.bitrate
                );
                (source, false)
            }
            Err(e) => {
                log::warn!("Cannot open {} backend: {}", backend.name(), e);
                health.set_link(LinkState::NoHardware);
                (Box::new(NullSource), true)
            }
        };
        health.publish();

        let table_reader = table.reader();
        let health_reader = health.reader();
        let stop = Arc::new(AtomicBool::new(false));
        let reset = Arc::new(AtomicBool::new(false));

        let ingest = IngestLoop {
            config: config.clone(),
            decoder: decoder.clone(),
            backend,
            params,
            source,
            needs_reconnect,
            last_attempt: now,
            table,
            health,
            sequence: 0,
            summary: IngestSummary::default(),
            stop: stop.clone(),
            reset: reset.clone(),
        };

        let thread = std::thread::Builder::new()
            .name("can-ingest".to_string())
            .spawn(move || ingest.run())?;

        Ok(PipelineHandle {
            config,
            decoder,
            table: table_reader,
            health: health_reader,
            stop,
            reset,
            thread: Some(thread),
            summary: None,
        })
    }
}

/// Control and query handle of a running pipeline
pub struct PipelineHandle {
    config: PipelineConfig,
    decoder: Decoder,
    table: TableReader,
    health: HealthReader,
    stop: Arc<AtomicBool>,
    reset: Arc<AtomicBool>,
    thread: Option<JoinHandle<IngestSummary>>,
    summary: Option<IngestSummary>,
}

impl PipelineHandle {
    /// Read-only access to the signal state table
    pub fn table(&self) -> TableReader {
        self.table.clone()
    }

    /// Read-only access to bus health
    pub fn health(&self) -> HealthReader {
        self.health.clone()
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Recorder sampling this pipeline's table
    ///
    /// [`Recorder::arm_default`] samples at `recording_interval_ms`.
    pub fn recorder(&self) -> Recorder {
        Recorder::new(
            self.table(),
            self.config.recorder_queue_capacity,
            self.config.recording_interval(),
        )
    }

    /// Load a new DBC while running
    ///
    /// On failure the current schema stays active and ingest is unaffected.
    pub fn reload_schema(&self, path: &Path) -> Result<DatabaseStats> {
        self.decoder.load_dbc(path)
    }

    /// Zero the bus statistics; the table and recorder are untouched
    pub fn reset_stats(&self) {
        self.reset.store(true, Ordering::Release);
    }

    /// False once the ingest thread has ended, including by panic
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    /// Stop ingest and wait for the thread to finish
    ///
    /// Does not require the recorder to be stopped first.
    pub fn stop(&mut self) -> IngestSummary {
        if let Some(thread) = self.thread.take() {
            self.stop.store(true, Ordering::Release);
            let summary = thread.join().unwrap_or_else(|_| {
                log::error!("Ingest thread panicked");
                IngestSummary::default()
            });
            self.summary = Some(summary);
        }
        self.summary.clone().unwrap_or_default()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct IngestLoop {
    config: PipelineConfig,
    decoder: Decoder,
    backend: Box<dyn Backend>,
    params: BusParams,
    source: Box<dyn FrameSource>,
    needs_reconnect: bool,
    last_attempt: Instant,
    table: SignalStateTable,
    health: HealthMonitor,
    sequence: u64,
    summary: IngestSummary,
    stop: Arc<AtomicBool>,
    reset: Arc<AtomicBool>,
}

impl IngestLoop {
    fn run(mut self) -> IngestSummary {
        log::info!("Ingest started on {}", self.source.name());
        let receive_timeout = self.config.receive_timeout();
        let publish_interval = self.config.health_publish_interval();

        while !self.stop.load(Ordering::Acquire) {
            if self.reset.swap(false, Ordering::AcqRel) {
                self.health.reset(Instant::now());
            }
            self.follow_schema();
            self.try_reconnect();

            match self.source.receive(receive_timeout) {
                ReceiveOutcome::Frame(frame) => self.handle_frame(frame),
                ReceiveOutcome::Timeout => {}
                ReceiveOutcome::Overrun { lost } => {
                    log::warn!("{} reported {} lost frames", self.source.name(), lost);
                    self.health.record_overrun(lost);
                    self.summary.overruns += lost;
                }
                ReceiveOutcome::Disconnected(reason) => self.handle_disconnect(reason),
            }

            let now = Instant::now();
            self.health.evaluate(now);
            if self.health.publish_due(now, publish_interval) {
                self.health.publish();
            }
        }

        self.source.close();
        self.health.publish();
        log::info!(
            "Ingest stopped: {} frames, {} decoded, {} unknown, {} malformed",
            self.summary.frames,
            self.summary.decoded,
            self.summary.unknown,
            self.summary.malformed
        );
        self.summary
    }

    /// Rebind the table when the decoder's schema was swapped
    fn follow_schema(&mut self) {
        let schema = self.decoder.schema();
        if !Arc::ptr_eq(&schema, self.table.schema()) {
            self.table.rebind(schema);
            self.summary.schema_reloads += 1;
        }
    }

    fn try_reconnect(&mut self) {
        if !self.needs_reconnect
            || self.last_attempt.elapsed() < self.config.reconnect_interval()
        {
            return;
        }
        self.last_attempt = Instant::now();
        match self.backend.open(&self.params) {
            Ok(source) => {
                self.source.close();
                self.source = source;
                self.needs_reconnect = false;
                self.summary.reconnects += 1;
                self.health.set_link(LinkState::Connected);
            }
            Err(e) => log::debug!("Reconnect to {} failed: {}", self.backend.name(), e),
        }
    }

    fn handle_disconnect(&mut self, reason: String) {
        self.source.close();
        self.source = Box::new(NullSource);
        self.needs_reconnect = true;
        self.last_attempt = Instant::now();
        self.health.set_link(LinkState::Disconnected {
            reason,
            since: Instant::now(),
        });
    }

    fn handle_frame(&mut self, frame: RawFrame) {
        self.sequence += 1;
        self.summary.frames += 1;
        self.health.record_frame(&frame);

        if !self.config.should_process_frame(frame.channel, frame.can_id) {
            self.health.record_filtered();
            self.summary.filtered += 1;
            return;
        }
        if let Err(e) = frame.validate() {
            log::debug!("Dropping frame {}: {}", format_key(frame.key()), e);
            self.health.record_malformed();
            self.summary.malformed += 1;
            return;
        }

        let schema = self.table.schema().clone();
        let outcome = decode_frame(&frame, &schema);
        if let Some(e) = outcome.error() {
            log::trace!("{}", e);
        }
        match outcome {
            DecodeOutcome::Decoded { values, .. } => {
                self.table.update(frame.timestamp, self.sequence, &values);
                self.summary.decoded += 1;
            }
            DecodeOutcome::Unknown(_) => {
                self.health.record_unknown();
                self.summary.unknown += 1;
            }
            DecodeOutcome::Malformed { values, .. } => {
                self.health.record_malformed();
                self.summary.malformed += 1;
                if !values.is_empty() {
                    self.table.update(frame.timestamp, self.sequence, &values);
                }
            }
        }
    }
}
