//! Log sinks
//!
//! Append-only writers for [`LogRecord`]s. A sink is owned by the
//! recorder's writer thread, so it may block on I/O without affecting the
//! ingest path.

use crate::types::{Error, Result, Validity};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One sampled signal
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEntry {
    pub name: Arc<str>,
    /// Numeric value, `None` while the signal has never been received
    pub value: Option<f64>,
    pub validity: Validity,
}

/// One row of a recording
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Wall-clock time of the sample
    pub timestamp: DateTime<Utc>,
    /// Time since recording started
    pub elapsed: Duration,
    /// Sample number, starting at 0
    pub sequence: u64,
    /// Selected signals, in selection order
    pub entries: Vec<RecordEntry>,
}

/// Output interface of the recorder
pub trait LogSink: Send {
    /// Sink name (used for logging)
    fn name(&self) -> &str;

    /// Append one record
    ///
    /// # Errors
    /// Returns `RecorderWriteFailed`; the recorder stops on the first error.
    fn write(&mut self, record: &LogRecord) -> Result<()>;

    /// Flush buffer (if any)
    fn flush(&mut self) -> Result<()>;

    /// Flush and release the destination
    fn close(&mut self) -> Result<()>;
}

fn write_failed(context: &str, e: std::io::Error) -> Error {
    Error::RecorderWriteFailed(format!("{}: {}", context, e))
}

/// CSV writer: `timestamp,elapsed_s,<signal names...>`
pub struct CsvSink<W: Write + Send = BufWriter<File>> {
    name: String,
    writer: Option<W>,
    header_written: bool,
}

impl CsvSink<BufWriter<File>> {
    /// Create (or truncate) a CSV file
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| write_failed(&path.display().to_string(), e))?;
        log::info!("Recording to {:?}", path);
        Ok(Self::new(path.display().to_string(), BufWriter::new(file)))
    }
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer: Some(writer),
            header_written: false,
        }
    }

    fn writer(&mut self) -> Result<&mut W> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::RecorderWriteFailed(format!("{} is closed", self.name)))
    }
}

fn csv_field(text: &str) -> String {
    if text.contains(',') || text.contains('"') {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

impl<W: Write + Send> LogSink for CsvSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = String::new();
        if !self.header_written {
            line.push_str("timestamp,elapsed_s");
            for entry in &record.entries {
                line.push(',');
                line.push_str(&csv_field(&entry.name));
            }
            line.push('\n');
        }

        line.push_str(&record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true));
        line.push_str(&format!(",{:.3}", record.elapsed.as_secs_f64()));
        for entry in &record.entries {
            line.push(',');
            if let Some(value) = entry.value {
                line.push_str(&value.to_string());
            }
        }
        line.push('\n');

        let writer = self.writer()?;
        writer
            .write_all(line.as_bytes())
            .map_err(|e| write_failed("write", e))?;
        self.header_written = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer()?.flush().map_err(|e| write_failed("flush", e))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| write_failed("close", e))?;
            log::debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

/// Sink keeping records in memory, shared with the caller
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl LogSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write(&mut self, record: &LogRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(sequence: u64, speed: Option<f64>) -> LogRecord {
        LogRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            elapsed: Duration::from_millis(sequence * 100),
            sequence,
            entries: vec![
                RecordEntry {
                    name: Arc::from("Speed"),
                    value: speed,
                    validity: if speed.is_some() {
                        Validity::Fresh
                    } else {
                        Validity::Unknown
                    },
                },
                RecordEntry {
                    name: Arc::from("Gear"),
                    value: Some(3.0),
                    validity: Validity::Stale,
                },
            ],
        }
    }

    #[test]
    fn test_csv_layout() {
        let mut sink = CsvSink::new("buffer", Vec::new());
        sink.write(&record(0, None)).unwrap();
        sink.write(&record(1, Some(1.5))).unwrap();
        let text = String::from_utf8(sink.writer.take().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,elapsed_s,Speed,Gear");
        assert_eq!(lines[1], "2024-05-01T12:00:00.000Z,0.000,,3");
        assert_eq!(lines[2], "2024-05-01T12:00:00.000Z,0.100,1.5,3");
    }

    #[test]
    fn test_write_after_close_fails() {
        let mut sink = CsvSink::new("buffer", Vec::new());
        sink.close().unwrap();
        assert!(matches!(
            sink.write(&record(0, None)),
            Err(Error::RecorderWriteFailed(_))
        ));
    }

    #[test]
    fn test_csv_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.csv");
        let mut sink = CsvSink::create(&path).unwrap();
        sink.write(&record(0, Some(2.0))).unwrap();
        sink.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("timestamp,elapsed_s,Speed,Gear\n"));
    }

    #[test]
    fn test_memory_sink_shares_records() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write(&record(0, Some(1.0))).unwrap();
        writer.close().unwrap();
        assert_eq!(sink.len(), 1);
        assert!(sink.is_closed());
    }
}
