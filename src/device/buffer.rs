//! Sliding-window buffering and optional CSV persistence, shared by all
//! device kinds.
//!
//! Every device composes one [`DataLog`]: a bounded ring buffer of readings
//! plus an optional tab-delimited sink that is open only while a recording
//! session is active. The ring is behind a mutex so the dashboard side can
//! drain it from outside the scheduler task; the sink is touched only by
//! the scheduler task, inside the same critical section as the buffer push,
//! so every written row corresponds to exactly one buffered reading.

use chrono::{DateTime, Utc};
use log::error;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::RigResult;

/// One timestamped sample from a device.
///
/// `timestamp` is seconds since the shared run clock's epoch; `datetime`
/// is the matching wall-clock stamp. `values` maps field name to value
/// ("humidity", "mass_flow", ...) in a stable order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reading {
    /// Seconds since the run clock epoch
    pub timestamp: f64,
    /// Wall-clock stamp
    pub datetime: DateTime<Utc>,
    /// Named values, iterated in stable (sorted) order
    pub values: BTreeMap<String, f64>,
}

impl Reading {
    /// Builds a reading from name/value pairs.
    pub fn new(
        timestamp: f64,
        datetime: DateTime<Utc>,
        values: impl IntoIterator<Item = (String, f64)>,
    ) -> Self {
        Self {
            timestamp,
            datetime,
            values: values.into_iter().collect(),
        }
    }
}

/// Fixed-capacity FIFO of readings; evicts the oldest on overflow.
#[derive(Debug)]
pub struct ReadingBuffer {
    buf: VecDeque<Reading>,
    capacity: usize,
}

impl ReadingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends a reading, evicting the oldest entry when full.
    pub fn push(&mut self, reading: Reading) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(reading);
    }

    /// Removes and returns all buffered readings in push order.
    pub fn drain(&mut self) -> Vec<Reading> {
        self.buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Cloneable, drain-only view of a device's ring buffer for the consumer
/// side (the dashboard layer).
#[derive(Clone, Debug)]
pub struct BufferHandle {
    inner: Arc<Mutex<ReadingBuffer>>,
}

impl BufferHandle {
    /// Removes and returns everything currently buffered. Readings already
    /// drained are never seen again.
    pub fn drain(&self) -> Vec<Reading> {
        lock_buffer(&self.inner).drain()
    }

    /// Number of readings currently buffered.
    pub fn len(&self) -> usize {
        lock_buffer(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The ring holds plain data; a panic while the lock was held cannot leave
/// it inconsistent, so poison is read through.
fn lock_buffer(inner: &Arc<Mutex<ReadingBuffer>>) -> MutexGuard<'_, ReadingBuffer> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Tab-delimited writer for one recording session.
///
/// The header line is derived from the first reading's field names and
/// written exactly once, before the first data row.
struct CsvSink {
    writer: csv::Writer<File>,
    header_written: bool,
}

impl CsvSink {
    fn create(path: &Path) -> RigResult<Self> {
        let file = File::create(path)?;
        let writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(file);
        Ok(Self {
            writer,
            header_written: false,
        })
    }

    fn append(&mut self, reading: &Reading) -> RigResult<()> {
        if !self.header_written {
            let mut header = vec!["timestamp".to_string(), "datetime".to_string()];
            header.extend(reading.values.keys().cloned());
            self.writer.write_record(&header)?;
            self.header_written = true;
        }

        let mut row = vec![
            reading.timestamp.to_string(),
            reading.datetime.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        ];
        row.extend(reading.values.values().map(|v| v.to_string()));
        self.writer.write_record(&row)?;
        Ok(())
    }

    fn finish(mut self) -> RigResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Per-device data path: bounded ring buffer plus optional recording sink.
pub struct DataLog {
    key: String,
    buffer: Arc<Mutex<ReadingBuffer>>,
    sink: Option<CsvSink>,
}

impl DataLog {
    pub fn new(key: impl Into<String>, capacity: usize) -> Self {
        Self {
            key: key.into(),
            buffer: Arc::new(Mutex::new(ReadingBuffer::new(capacity))),
            sink: None,
        }
    }

    /// Appends a reading to the ring buffer and, while recording, writes
    /// one row to the sink. Both happen under the buffer lock so a row is
    /// never written without its reading being buffered.
    ///
    /// A sink failure is logged and ends the recording; it never fails the
    /// poll that produced the reading.
    pub fn push(&mut self, reading: Reading) {
        let mut buffer = lock_buffer(&self.buffer);

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.append(&reading) {
                error!("[{}] push: dropping recording sink: {}", self.key, e);
                self.sink = None;
            }
        }
        buffer.push(reading);
    }

    /// Removes and returns all buffered readings in push order.
    pub fn drain(&self) -> Vec<Reading> {
        lock_buffer(&self.buffer).drain()
    }

    /// Drain-only handle for the consumer side.
    pub fn handle(&self) -> BufferHandle {
        BufferHandle {
            inner: Arc::clone(&self.buffer),
        }
    }

    /// Opens a recording sink at `path`. Replaces any sink already open.
    pub fn start_recording(&mut self, path: &Path) -> RigResult<()> {
        self.sink = Some(CsvSink::create(path)?);
        Ok(())
    }

    /// Flushes and releases the sink. Safe to call when no recording is
    /// active.
    pub fn stop_recording(&mut self) {
        if let Some(sink) = self.sink.take() {
            if let Err(e) = sink.finish() {
                error!("[{}] stop_recording: flush failed: {}", self.key, e);
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.sink.is_some()
    }
}

impl Drop for DataLog {
    fn drop(&mut self) {
        self.stop_recording();
    }
}

/// Fixed-length most-recent-values window, trimmed from the front.
///
/// Owned by the scheduler, independent of the device ring buffer.
#[derive(Debug)]
pub struct DisplayWindow {
    window: VecDeque<Reading>,
    capacity: usize,
}

impl DisplayWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, reading: Reading) {
        self.window.push_back(reading);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.window.back()
    }

    /// Copy of the window contents, oldest first.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.window.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(t: f64) -> Reading {
        Reading::new(t, Utc::now(), [("y1".to_string(), t * 2.0)])
    }

    #[test]
    fn test_ring_never_exceeds_capacity() {
        let mut buf = ReadingBuffer::new(5);
        for i in 0..100 {
            buf.push(reading(i as f64));
            assert!(buf.len() <= 5);
        }
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_ring_evicts_oldest_first() {
        let mut buf = ReadingBuffer::new(3);
        for i in 0..5 {
            buf.push(reading(i as f64));
        }
        let drained = buf.drain();
        let stamps: Vec<f64> = drained.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_drain_returns_push_order_and_empties() {
        let log = {
            let mut log = DataLog::new("test", 100);
            for i in 0..4 {
                log.push(reading(i as f64));
            }
            log
        };

        let drained = log.drain();
        assert_eq!(drained.len(), 4);
        assert!(drained.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        // A second drain before new pushes yields nothing.
        assert!(log.drain().is_empty());
    }

    #[test]
    fn test_handle_drains_from_outside() {
        let mut log = DataLog::new("test", 100);
        let handle = log.handle();
        log.push(reading(0.0));
        log.push(reading(1.0));

        assert_eq!(handle.len(), 2);
        assert_eq!(handle.drain().len(), 2);
        assert!(handle.is_empty());
    }

    #[test]
    fn test_recording_header_once_and_row_per_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.csv");

        let mut log = DataLog::new("dev", 100);
        log.start_recording(&path).unwrap();
        for i in 0..3 {
            log.push(reading(i as f64));
        }
        log.stop_recording();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "timestamp\tdatetime\ty1");
        assert!(lines[1].starts_with("0\t"));
        assert!(lines[3].ends_with("\t4"));
    }

    #[test]
    fn test_stop_recording_without_session_is_safe() {
        let mut log = DataLog::new("dev", 10);
        log.stop_recording();
        assert!(!log.is_recording());
    }

    #[test]
    fn test_display_window_trims_front() {
        let mut window = DisplayWindow::new(3);
        for i in 0..10 {
            window.push(reading(i as f64));
        }
        assert_eq!(window.len(), 3);
        let snap = window.snapshot();
        assert_eq!(snap[0].timestamp, 7.0);
        assert_eq!(window.latest().unwrap().timestamp, 9.0);
    }
}
