//! sshpoll-core: scrape CLI-only network devices into time-series points.
//!
//! ```text
//!  WorkerPool ──► PollWorker (one per device)
//!                    │
//!                    ├─ session::Connector ──► DeviceSession.send(command)
//!                    │                               │ raw text
//!                    ├─ parser::ResponseParser ◄─────┘
//!                    │     ├─ template (index + TextFSM-style templates)
//!                    │     └─ delimited (header + rows)
//!                    │                               │ FlatRecord
//!                    ├─ record::build_point ◄────────┘ (coerce, tag, timestamp)
//!                    │                               │ Batch
//!                    └─ emit::Emitter ◄──────────────┘
//!                          ├─ document (JSON)
//!                          ├─ line protocol (stdout)
//!                          └─ sink::MetricsSink (InfluxDB)
//! ```

pub mod clock;
pub mod coerce;
pub mod command;
pub mod config;
pub mod emit;
pub mod line_protocol;
pub mod parser;
pub mod record;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod task;
pub mod worker;

pub use clock::{CancellationToken, Clock, FakeClock, SystemClock};
pub use coerce::FieldValue;
pub use command::{CommandSpec, CommandSpecError};
pub use config::PollerConfig;
pub use emit::{EmitError, Emitter, OutputMode, Outputs};
pub use parser::{FlatRecord, ParseError, ParserMode, TemplateIndex, TemplateMatcher};
pub use record::{Batch, DataPoint};
pub use scheduler::WorkerPool;
pub use session::{Connector, DeviceSession, SessionError, SessionTarget};
pub use sink::{InfluxSink, MemorySink, MetricsSink, SinkError};
pub use task::{DeviceTask, TaskDefaults, TaskError, TaskFile};
pub use worker::{PollContext, PollWorker, WorkerReport, WorkerState};
