//! Per-device poll loop.
//!
//! ```text
//!  Idle ──► Connecting ──► Priming ──► Polling ──► Disconnecting ──► Done
//!              │                        ▲    │            ▲
//!              │                        │    ▼            │
//!              │                       Sleeping ──────────┘ (cancelled / count reached)
//!              ▼
//!            Failed ◄──── fatal session error in any state (session still released)
//! ```
//!
//! Failure is contained per level:
//! - connect errors end this worker only;
//! - a timed-out or unparseable command is dropped from the batch;
//! - a rejected delimited row is dropped from its table;
//! - a failed emission loses that batch only.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::clock::{CancellationToken, Clock, SystemClock};
use crate::emit::{Emitter, Outputs};
use crate::parser::{DelimitedParser, ParserMode, ResponseParser, TemplateMatcher};
use crate::record::{Batch, build_point};
use crate::session::{Connector, DeviceSession, SessionError};
use crate::task::{DeviceTask, TaskError};

/// Lifecycle state of a [`PollWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Connecting,
    Priming,
    Polling,
    Sleeping,
    Disconnecting,
    Done,
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Connecting => "connecting",
            WorkerState::Priming => "priming",
            WorkerState::Polling => "polling",
            WorkerState::Sleeping => "sleeping",
            WorkerState::Disconnecting => "disconnecting",
            WorkerState::Done => "done",
            WorkerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of one worker run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerReport {
    pub hostname: String,
    /// `Idle` if the worker was cancelled before it started.
    pub state: WorkerState,
    pub cycles: u64,
    pub points: usize,
    pub last_error: Option<String>,
}

/// Shared collaborators every worker is built from.
#[derive(Clone)]
pub struct PollContext {
    pub connector: Arc<dyn Connector>,
    pub templates: Option<Arc<dyn TemplateMatcher>>,
    pub outputs: Outputs,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancellationToken,
}

impl PollContext {
    pub fn new(connector: Arc<dyn Connector>, outputs: Outputs) -> Self {
        Self {
            connector,
            templates: None,
            outputs,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateMatcher>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolves the task's parser and emitter.
    ///
    /// Fails if the task asks for templates or a sink that are not configured.
    pub fn worker(&self, task: DeviceTask) -> Result<PollWorker, TaskError> {
        let parser = match task.parser_mode {
            ParserMode::Template => {
                let matcher = self.templates.clone().ok_or_else(|| TaskError::NoTemplates {
                    hostname: task.hostname().to_string(),
                })?;
                ResponseParser::Template {
                    matcher,
                    platform: task.target.device_type.clone(),
                }
            }
            ParserMode::Delimited => ResponseParser::Delimited(DelimitedParser::new(task.delimiter)),
        };

        let emitter = self
            .outputs
            .emitter(task.output_mode)
            .map_err(|source| TaskError::Output {
                hostname: task.hostname().to_string(),
                source,
            })?;

        Ok(PollWorker {
            task,
            parser,
            emitter,
            connector: Arc::clone(&self.connector),
            clock: Arc::clone(&self.clock),
            cancel: self.cancel.clone(),
            state: WorkerState::Idle,
            cycles: 0,
            points: 0,
            last_error: None,
        })
    }
}

impl fmt::Debug for PollContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollContext")
            .field("templates", &self.templates.is_some())
            .field("outputs", &self.outputs)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

/// Drives one device from connect to disconnect.
pub struct PollWorker {
    task: DeviceTask,
    parser: ResponseParser,
    emitter: Emitter,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    state: WorkerState,
    cycles: u64,
    points: usize,
    last_error: Option<String>,
}

impl PollWorker {
    pub fn task(&self) -> &DeviceTask {
        &self.task
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(host = %self.task.hostname(), "{} -> {}", self.state, next);
        self.state = next;
    }

    fn report(&self) -> WorkerReport {
        WorkerReport {
            hostname: self.task.hostname().to_string(),
            state: self.state,
            cycles: self.cycles,
            points: self.points,
            last_error: self.last_error.clone(),
        }
    }

    /// Runs to a terminal state. Never panics on device errors.
    pub fn run(mut self) -> WorkerReport {
        if self.cancel.is_cancelled() {
            debug!(host = %self.task.hostname(), "Cancelled before start");
            return self.report();
        }

        self.transition(WorkerState::Connecting);
        let mut session = match self.connector.connect(&self.task.target) {
            Ok(session) => session,
            Err(e) => {
                error!(host = %self.task.hostname(), "Connection failed: {}", e);
                self.last_error = Some(e.to_string());
                self.transition(WorkerState::Failed);
                return self.report();
            }
        };
        info!(
            host = %self.task.hostname(),
            "Connected, polling {} commands ({})",
            self.task.commands.len(),
            if self.task.is_continuous() {
                format!("every {}s", self.task.interval.as_secs())
            } else {
                "once".to_string()
            }
        );

        let outcome = self.drive(session.as_mut());

        self.transition(WorkerState::Disconnecting);
        session.disconnect();

        match outcome {
            Ok(()) => self.transition(WorkerState::Done),
            Err(e) => {
                error!(host = %self.task.hostname(), "Session lost: {}", e);
                self.last_error = Some(e.to_string());
                self.transition(WorkerState::Failed);
            }
        }

        info!(
            host = %self.task.hostname(),
            "Finished: {} cycles, {} points",
            self.cycles,
            self.points
        );
        self.report()
    }

    /// Priming and the poll loop. Only fatal session errors escape.
    fn drive(&mut self, session: &mut dyn DeviceSession) -> Result<(), SessionError> {
        self.transition(WorkerState::Priming);
        self.prime(session)?;

        loop {
            if self.cancel.is_cancelled() {
                debug!(host = %self.task.hostname(), "Cancelled between cycles");
                return Ok(());
            }

            self.transition(WorkerState::Polling);
            let batch = self.poll_cycle(session)?;
            self.cycles += 1;
            self.emit(&batch);

            let limit_reached = self.task.max_cycles.is_some_and(|max| self.cycles >= max);
            if !self.task.is_continuous() || limit_reached {
                return Ok(());
            }

            self.transition(WorkerState::Sleeping);
            if !self.clock.sleep(self.task.interval, &self.cancel) {
                debug!(host = %self.task.hostname(), "Cancelled while sleeping");
                return Ok(());
            }
        }
    }

    /// Sends precommands and discards their output.
    fn prime(&mut self, session: &mut dyn DeviceSession) -> Result<(), SessionError> {
        for command in &self.task.precommands {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match session.prime(command) {
                Ok(output) => {
                    trace!(host = %self.task.hostname(), command = %command, "Discarded {} bytes", output.len())
                }
                Err(e) if !e.is_fatal() => {
                    warn!(host = %self.task.hostname(), command = %command, "Precommand failed: {}", e);
                    self.last_error = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Runs every command once. Commands that fail to answer or parse are
    /// left out of the batch.
    fn poll_cycle(&mut self, session: &mut dyn DeviceSession) -> Result<Batch, SessionError> {
        let hostname = self.task.hostname();
        let mut batch = Batch::new(hostname);
        let mut last_error = None;

        for spec in &self.task.commands {
            if self.cancel.is_cancelled() {
                debug!(host = %hostname, "Cancelled mid-cycle");
                break;
            }

            let timestamp = self.clock.now();
            let raw = match session.send(spec.command()) {
                Ok(raw) => raw,
                Err(e) if !e.is_fatal() => {
                    warn!(host = %hostname, command = %spec.command(), "Command dropped: {}", e);
                    last_error = Some(e.to_string());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let table = match self.parser.parse(spec.command(), &raw) {
                Ok(table) => table,
                Err(e) => {
                    error!(host = %hostname, command = %spec.command(), "{}", e);
                    last_error = Some(e.to_string());
                    continue;
                }
            };

            for rejected in &table.rejected {
                warn!(host = %hostname, command = %spec.command(), "Row skipped: {}", rejected);
            }
            trace!(
                host = %hostname,
                command = %spec.command(),
                "{} records at {}",
                table.records.len(),
                timestamp
            );

            batch.points.extend(
                table
                    .records
                    .iter()
                    .map(|record| build_point(record, spec, hostname, timestamp)),
            );
        }

        if last_error.is_some() {
            self.last_error = last_error;
        }
        Ok(batch)
    }

    fn emit(&mut self, batch: &Batch) {
        match self.emitter.emit(batch) {
            Ok(count) => {
                debug!(host = %batch.host, "Emitted {} points", count);
                self.points += count;
            }
            Err(e) => {
                error!(host = %batch.host, "Emit failed: {}", e);
                self.last_error = Some(e.to_string());
            }
        }
    }
}

impl fmt::Debug for PollWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollWorker")
            .field("host", &self.task.hostname())
            .field("state", &self.state)
            .field("parser", &self.parser)
            .field("emitter", &self.emitter)
            .field("cycles", &self.cycles)
            .finish_non_exhaustive()
    }
}
