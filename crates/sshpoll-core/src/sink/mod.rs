//! Metrics backends.
//!
//! A [`MetricsSink`] accepts points with second-precision timestamps. Tags
//! (including `host`) are written verbatim as string-keyed tags, numeric
//! fields stay numeric.

mod influx;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

pub use influx::InfluxSink;

use crate::record::DataPoint;

/// Error type for sink writes.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Client could not be built or the request never got an answer.
    Transport(String),
    /// Backend answered with a non-success status.
    Rejected { status: u16, body: String },
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Transport(msg) => write!(f, "sink transport error: {}", msg),
            SinkError::Rejected { status, body } => {
                write!(f, "sink rejected write (HTTP {}): {}", status, body.trim())
            }
        }
    }
}

impl std::error::Error for SinkError {}

/// Destination for data points. Shared by every worker.
pub trait MetricsSink: Send + Sync {
    fn write(&self, points: &[DataPoint]) -> Result<(), SinkError>;
}

/// In-memory sink that records every write.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    writes: Vec<Vec<DataPoint>>,
    fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose writes all fail.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    pub fn set_failing(&self, fail: bool) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail = fail;
    }

    /// Write calls received, each with its points.
    pub fn writes(&self) -> Vec<Vec<DataPoint>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .writes
            .clone()
    }

    /// All points received, flattened.
    pub fn points(&self) -> Vec<DataPoint> {
        self.writes().into_iter().flatten().collect()
    }
}

impl MetricsSink for MemorySink {
    fn write(&self, points: &[DataPoint]) -> Result<(), SinkError> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail {
            return Err(SinkError::Transport("memory sink set to fail".into()));
        }
        state.writes.push(points.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn point() -> DataPoint {
        DataPoint {
            measurement: "uptime".into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: 1,
        }
    }

    #[test]
    fn test_memory_sink_records_writes() {
        let sink = MemorySink::new();
        sink.write(&[point(), point()]).unwrap();
        sink.write(&[point()]).unwrap();

        assert_eq!(sink.writes().len(), 2);
        assert_eq!(sink.points().len(), 3);
    }

    #[test]
    fn test_memory_sink_failing() {
        let sink = MemorySink::failing();
        assert!(sink.write(&[point()]).is_err());
        assert!(sink.writes().is_empty());

        sink.set_failing(false);
        assert!(sink.write(&[point()]).is_ok());
    }
}
