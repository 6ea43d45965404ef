//! Batch emission.
//!
//! Three representations of a [`Batch`]:
//!
//! | Mode       | Destination      | Format                                   |
//! |------------|------------------|------------------------------------------|
//! | `document` | shared writer    | pretty JSON document per batch           |
//! | `line`     | shared writer    | line protocol, one point per line        |
//! | `metrics`  | [`MetricsSink`]  | one write per point, second precision    |
//!
//! Workers share the writer; a batch is rendered fully before the lock is
//! taken so output from different devices interleaves only at batch
//! boundaries.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use crate::line_protocol;
use crate::record::Batch;
use crate::sink::{MetricsSink, SinkError};

/// Writer shared by every worker.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Output representation of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[serde(alias = "json")]
    Document,
    #[serde(alias = "line-protocol")]
    Line,
    #[serde(alias = "influx")]
    Metrics,
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" | "json" => Ok(OutputMode::Document),
            "line" | "line-protocol" => Ok(OutputMode::Line),
            "metrics" | "influx" => Ok(OutputMode::Metrics),
            other => Err(format!("unknown output mode '{}'", other)),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Document => write!(f, "document"),
            OutputMode::Line => write!(f, "line"),
            OutputMode::Metrics => write!(f, "metrics"),
        }
    }
}

/// Error type for emission.
#[derive(Debug)]
pub enum EmitError {
    Io(io::Error),
    Serialize(serde_json::Error),
    /// Sink write failed after `written` points of the batch went through.
    Sink { written: usize, source: SinkError },
    /// Metrics mode requested without a configured sink.
    NoSink,
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::Io(e) => write!(f, "output error: {}", e),
            EmitError::Serialize(e) => write!(f, "cannot serialize batch: {}", e),
            EmitError::Sink { written, source } => {
                write!(f, "{} (after {} points)", source, written)
            }
            EmitError::NoSink => write!(f, "metrics output requested but no sink is configured"),
        }
    }
}

impl std::error::Error for EmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmitError::Io(e) => Some(e),
            EmitError::Serialize(e) => Some(e),
            EmitError::Sink { source, .. } => Some(source),
            EmitError::NoSink => None,
        }
    }
}

impl From<io::Error> for EmitError {
    fn from(e: io::Error) -> Self {
        EmitError::Io(e)
    }
}

/// Destinations available to emitters.
#[derive(Clone)]
pub struct Outputs {
    pub writer: SharedWriter,
    pub sink: Option<Arc<dyn MetricsSink>>,
}

impl Outputs {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            sink: None,
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the emitter for `mode`.
    pub fn emitter(&self, mode: OutputMode) -> Result<Emitter, EmitError> {
        match mode {
            OutputMode::Document => Ok(Emitter::Document(Arc::clone(&self.writer))),
            OutputMode::Line => Ok(Emitter::Line(Arc::clone(&self.writer))),
            OutputMode::Metrics => self
                .sink
                .as_ref()
                .map(|sink| Emitter::Metrics(Arc::clone(sink)))
                .ok_or(EmitError::NoSink),
        }
    }
}

impl fmt::Debug for Outputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outputs")
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

/// Output strategy of one worker, chosen once at construction.
#[derive(Clone)]
pub enum Emitter {
    Document(SharedWriter),
    Line(SharedWriter),
    Metrics(Arc<dyn MetricsSink>),
}

impl Emitter {
    pub fn mode(&self) -> OutputMode {
        match self {
            Emitter::Document(_) => OutputMode::Document,
            Emitter::Line(_) => OutputMode::Line,
            Emitter::Metrics(_) => OutputMode::Metrics,
        }
    }

    /// Emits one batch and returns how many points went out.
    ///
    /// The metrics path writes one point per request and stops at the first
    /// failure; the rest of the batch is dropped.
    pub fn emit(&self, batch: &Batch) -> Result<usize, EmitError> {
        match self {
            Emitter::Document(writer) => {
                let mut doc = serde_json::to_string_pretty(batch).map_err(EmitError::Serialize)?;
                doc.push('\n');
                write_locked(writer, doc.as_bytes())?;
                Ok(batch.len())
            }
            Emitter::Line(writer) => {
                let mut text = String::new();
                let mut lines = 0;
                for point in &batch.points {
                    match line_protocol::render_point(point, false) {
                        Some(line) => {
                            text.push_str(&line);
                            text.push('\n');
                            lines += 1;
                        }
                        None => warn!(
                            host = %batch.host,
                            measurement = %point.measurement,
                            "Dropped point without fields"
                        ),
                    }
                }
                write_locked(writer, text.as_bytes())?;
                Ok(lines)
            }
            Emitter::Metrics(sink) => {
                for (written, point) in batch.points.iter().enumerate() {
                    if let Err(source) = sink.write(std::slice::from_ref(point)) {
                        error!(host = %batch.host, "Sink write failed: {}", source);
                        return Err(EmitError::Sink { written, source });
                    }
                }
                trace!(host = %batch.host, "Wrote {} points to sink", batch.len());
                Ok(batch.len())
            }
        }
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Emitter({})", self.mode())
    }
}

fn write_locked(writer: &SharedWriter, bytes: &[u8]) -> io::Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let mut out = writer.lock().unwrap_or_else(PoisonError::into_inner);
    out.write_all(bytes)?;
    out.flush()
}

/// In-memory writer whose clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use crate::parser::FlatRecord;
    use crate::record::build_point;
    use crate::sink::MemorySink;

    fn batch() -> Batch {
        let spec = CommandSpec::parse("show interface:intf_name").unwrap();
        let mut batch = Batch::new("sw1");
        for (name, rx) in [("eth0", "100"), ("eth1", "down")] {
            let mut row = FlatRecord::new();
            row.insert("intf_name".into(), name.into());
            row.insert("rx".into(), rx.into());
            batch.points.push(build_point(&row, &spec, "sw1", 1_700_000_000));
        }
        batch
    }

    #[test]
    fn test_output_mode_parse() {
        assert_eq!("json".parse::<OutputMode>().unwrap(), OutputMode::Document);
        assert_eq!("LINE".parse::<OutputMode>().unwrap(), OutputMode::Line);
        assert_eq!("influx".parse::<OutputMode>().unwrap(), OutputMode::Metrics);
        assert!("xml".parse::<OutputMode>().is_err());
        assert_eq!(OutputMode::Metrics.to_string(), "metrics");
    }

    #[test]
    fn test_document_emitter() {
        let out = MemoryWriter::new();
        let emitter = Outputs::new(out.clone()).emitter(OutputMode::Document).unwrap();

        assert_eq!(emitter.emit(&batch()).unwrap(), 2);

        let doc: serde_json::Value = serde_json::from_str(&out.contents()).unwrap();
        assert_eq!(doc["host"], "sw1");
        let points = doc["points"].as_array().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0]["measurement"], "show_interface");
        assert_eq!(points[0]["tags"]["intf_name"], "eth0");
        assert_eq!(points[0]["fields"]["rx"], 100.0);
        assert_eq!(points[1]["fields"]["rx"], "down");
        assert_eq!(points[1]["timestamp"], 1_700_000_000);
    }

    #[test]
    fn test_line_emitter() {
        let out = MemoryWriter::new();
        let emitter = Outputs::new(out.clone()).emitter(OutputMode::Line).unwrap();

        assert_eq!(emitter.emit(&batch()).unwrap(), 2);
        assert_eq!(
            out.contents(),
            "show_interface,intf_name=eth0,host=sw1 rx=100\n\
             show_interface,intf_name=eth1,host=sw1 rx=\"down\"\n"
        );
    }

    #[test]
    fn test_line_emitter_skips_points_without_fields() {
        let out = MemoryWriter::new();
        let emitter = Outputs::new(out.clone()).emitter(OutputMode::Line).unwrap();

        let mut batch = batch();
        batch.points[0].fields.clear();

        assert_eq!(emitter.emit(&batch).unwrap(), 1);
        assert_eq!(out.contents(), "show_interface,intf_name=eth1,host=sw1 rx=\"down\"\n");
    }

    #[test]
    fn test_metrics_emitter_writes_one_point_at_a_time() {
        let sink = MemorySink::new();
        let outputs = Outputs::new(io::sink()).with_sink(Arc::new(sink.clone()));
        let emitter = outputs.emitter(OutputMode::Metrics).unwrap();

        assert_eq!(emitter.emit(&batch()).unwrap(), 2);
        let writes = sink.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.len() == 1));
        assert_eq!(writes[0][0].timestamp, 1_700_000_000);
    }

    #[test]
    fn test_metrics_emitter_failure() {
        let outputs = Outputs::new(io::sink()).with_sink(Arc::new(MemorySink::failing()));
        let emitter = outputs.emitter(OutputMode::Metrics).unwrap();

        let err = emitter.emit(&batch()).unwrap_err();
        assert!(matches!(err, EmitError::Sink { written: 0, .. }));
    }

    #[test]
    fn test_metrics_without_sink() {
        let outputs = Outputs::new(io::sink());
        assert!(matches!(
            outputs.emitter(OutputMode::Metrics),
            Err(EmitError::NoSink)
        ));
    }
}
