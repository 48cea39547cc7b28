//! CAN Live Core Library
//!
//! Real-time acquisition, decoding and monitoring of CAN bus traffic with
//! signal definitions from DBC files.
//!
//! # Architecture
//!
//! Frames flow through one ingest thread:
//!
//! - A [`Backend`] opens a [`FrameSource`] (hardware driver, injected
//!   frames, candump replay, or the null source when no hardware is present)
//! - The [`Decoder`] maps each frame to signal values using the active
//!   [`SignalSchema`], reporting unknown and malformed frames
//! - The [`SignalStateTable`] keeps the latest value of every signal and
//!   publishes a consistent snapshot after each frame
//! - The [`HealthMonitor`] counts frames per ID and classifies bus-loss
//!
//! Consumers (live views, plots, the [`Recorder`]) only ever read published
//! snapshots, so a slow consumer cannot stall ingest.
//!
//! The library does NOT:
//! - Talk to vendor drivers directly (they plug in through [`Backend`])
//! - Render anything
//! - Decide where configuration is persisted
//!
//! # Example Usage
//!
//! ```no_run
//! use can_live_core::{
//!     BusParams, CsvSink, Decoder, NullBackend, Pipeline, PipelineConfig,
//! };
//! use std::path::Path;
//! use std::time::Duration;
//!
//! // Load signal definitions
//! let decoder = Decoder::new();
//! decoder.load_dbc(Path::new("powertrain.dbc")).unwrap();
//!
//! // Start ingest
//! let config = PipelineConfig::new().with_staleness_window(Duration::from_millis(300));
//! let mut pipeline = Pipeline::start(
//!     config,
//!     decoder,
//!     Box::new(NullBackend),
//!     BusParams::new("PCAN_USBBUS1", 500_000),
//! )
//! .unwrap();
//!
//! // Record two signals every 100 ms
//! let mut recorder = pipeline.recorder();
//! recorder.arm(&["EngineSpeed", "EngineTemp"], Duration::from_millis(100)).unwrap();
//! recorder
//!     .start(Box::new(CsvSink::create(Path::new("run.csv")).unwrap()))
//!     .unwrap();
//!
//! // Read the live table
//! let snapshot = pipeline.table().snapshot();
//! for value in snapshot.values(std::time::Instant::now()) {
//!     println!("{} = {:?} ({})", value.name, value.value, value.validity);
//! }
//!
//! recorder.stop();
//! pipeline.stop();
//! ```

// Public modules
pub mod config;
pub mod decoder;
pub mod health;
pub mod message_decoder;
pub mod pipeline;
pub mod recorder;
pub mod signals;
pub mod source;
pub mod state_table;
pub mod types;

// Re-export main types for convenience
pub use config::{BusParams, PipelineConfig};
pub use decoder::{decode_frame, DecodeOutcome, Decoder};
pub use health::{BusHealth, HealthMonitor, HealthReader, IdStats, LinkState};
pub use message_decoder::{DecodedSignal, MessageDecoder};
pub use pipeline::{IngestSummary, Pipeline, PipelineHandle};
pub use recorder::{
    CsvSink, LogRecord, LogSink, MemorySink, RecordEntry, Recorder, RecorderState, RecorderStatus,
};
pub use signals::{
    load_schema, schema_from_str, ByteOrder, DatabaseStats, MessageDefinition, SignalDefinition,
    SignalSchema, ValueType,
};
pub use source::{
    Backend, CandumpBackend, ChannelBackend, FrameInjector, FrameSource, NullBackend,
    ReceiveOutcome,
};
pub use state_table::{SignalStateTable, TableReader, TableSnapshot};
pub use types::{
    format_key, lookup_key, Error, PhysicalValue, RangeWarning, RawFrame, Result, SignalValue,
    Validity,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_decoder_reports_unknown() {
        let decoder = Decoder::new();
        assert_eq!(decoder.database_stats().num_messages, 0);
        assert_eq!(
            decoder.decode(&RawFrame::new(0x100, vec![0; 8])),
            DecodeOutcome::Unknown(0x100)
        );
    }
}
