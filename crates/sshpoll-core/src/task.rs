//! Device task descriptors.
//!
//! A [`DeviceTask`] is everything one worker needs. Tasks come either from
//! command-line flags ([`TaskDefaults::task`]) or from a YAML task list
//! ([`TaskFile`]) whose entries inherit any value they leave out:
//!
//! ```yaml
//! devices:
//!   - hostname: sw1
//!     device_type: cisco_ios
//!     commands: ["show interface:intf_name"]
//!   - hostname: lb1
//!     device_type: f5_linux
//!     parser: delimited
//!     precommands: ["tmsh"]
//!     commands: ["tmctl -c pva_stat"]
//!     interval: 60
//! ```
//!
//! All validation happens here, before anything is scheduled.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::command::{CommandSpec, CommandSpecError};
use crate::emit::{EmitError, OutputMode};
use crate::parser::ParserMode;
use crate::parser::delimited::DEFAULT_DELIMITER;
use crate::session::SessionTarget;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_DEVICE_TYPE: &str = "linux";

/// Error type for task construction.
#[derive(Debug)]
pub enum TaskError {
    InvalidCommandSpec {
        hostname: String,
        source: CommandSpecError,
    },
    MissingHostname,
    NoCommands { hostname: String },
    InvalidPort { hostname: String },
    Io { path: PathBuf, source: io::Error },
    Yaml { path: PathBuf, source: serde_yaml::Error },
    NoDevices,
    /// Template parsing requested but no template index is loaded.
    NoTemplates { hostname: String },
    /// The output mode cannot be served.
    Output { hostname: String, source: EmitError },
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::InvalidCommandSpec { hostname, source } => {
                write!(f, "{}: {}", hostname, source)
            }
            TaskError::MissingHostname => write!(f, "task has no hostname"),
            TaskError::NoCommands { hostname } => write!(f, "{}: no commands configured", hostname),
            TaskError::InvalidPort { hostname } => write!(f, "{}: port must be non-zero", hostname),
            TaskError::Io { path, source } => {
                write!(f, "cannot read task file {}: {}", path.display(), source)
            }
            TaskError::Yaml { path, source } => {
                write!(f, "invalid task file {}: {}", path.display(), source)
            }
            TaskError::NoDevices => write!(f, "task file lists no devices"),
            TaskError::NoTemplates { hostname } => {
                write!(f, "{}: template parsing requires a template index", hostname)
            }
            TaskError::Output { hostname, source } => write!(f, "{}: {}", hostname, source),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::InvalidCommandSpec { source, .. } => Some(source),
            TaskError::Io { source, .. } => Some(source),
            TaskError::Yaml { source, .. } => Some(source),
            TaskError::Output { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// One device to poll. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTask {
    pub target: SessionTarget,
    pub parser_mode: ParserMode,
    pub delimiter: char,
    pub commands: Vec<CommandSpec>,
    pub precommands: Vec<String>,
    pub output_mode: OutputMode,
    /// Zero polls once.
    pub interval: Duration,
    /// Stop after this many cycles; `None` runs until cancelled.
    pub max_cycles: Option<u64>,
}

impl DeviceTask {
    pub fn hostname(&self) -> &str {
        &self.target.hostname
    }

    pub fn is_continuous(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Values shared by every task unless overridden.
#[derive(Debug, Clone)]
pub struct TaskDefaults {
    pub port: u16,
    pub username: String,
    pub password: String,
    pub device_type: String,
    pub parser_mode: ParserMode,
    pub delimiter: char,
    pub output_mode: OutputMode,
    pub interval: Duration,
    pub max_cycles: Option<u64>,
    pub precommands: Vec<String>,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            username: String::new(),
            password: String::new(),
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            parser_mode: ParserMode::Template,
            delimiter: DEFAULT_DELIMITER,
            output_mode: OutputMode::Document,
            interval: Duration::ZERO,
            max_cycles: None,
            precommands: Vec::new(),
        }
    }
}

impl TaskDefaults {
    /// Builds a task for `hostname` from `command[:tag]` literals.
    pub fn task<S: AsRef<str>>(&self, hostname: &str, commands: &[S]) -> Result<DeviceTask, TaskError> {
        self.build(DeviceEntry {
            hostname: hostname.to_string(),
            commands: commands.iter().map(|c| c.as_ref().to_string()).collect(),
            ..DeviceEntry::default()
        })
    }

    fn build(&self, entry: DeviceEntry) -> Result<DeviceTask, TaskError> {
        let hostname = entry.hostname.trim().to_string();
        if hostname.is_empty() {
            return Err(TaskError::MissingHostname);
        }
        if entry.commands.is_empty() {
            return Err(TaskError::NoCommands { hostname });
        }

        let port = entry.port.unwrap_or(self.port);
        if port == 0 {
            return Err(TaskError::InvalidPort { hostname });
        }

        let commands = entry
            .commands
            .iter()
            .map(|literal| CommandSpec::parse(literal))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TaskError::InvalidCommandSpec {
                hostname: hostname.clone(),
                source,
            })?;

        Ok(DeviceTask {
            target: SessionTarget {
                hostname,
                port,
                username: entry.username.unwrap_or_else(|| self.username.clone()),
                password: entry.password.unwrap_or_else(|| self.password.clone()),
                device_type: entry.device_type.unwrap_or_else(|| self.device_type.clone()),
            },
            parser_mode: entry.parser.unwrap_or(self.parser_mode),
            delimiter: entry.delimiter.unwrap_or(self.delimiter),
            commands,
            precommands: entry.precommands.unwrap_or_else(|| self.precommands.clone()),
            output_mode: entry.mode.unwrap_or(self.output_mode),
            interval: entry.interval.map(Duration::from_secs).unwrap_or(self.interval),
            max_cycles: entry.count.or(self.max_cycles),
        })
    }
}

/// One `devices:` entry. Unset values inherit [`TaskDefaults`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub hostname: String,
    #[serde(default)]
    pub commands: Vec<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub device_type: Option<String>,
    pub parser: Option<ParserMode>,
    pub delimiter: Option<char>,
    pub mode: Option<OutputMode>,
    pub precommands: Option<Vec<String>>,
    /// Seconds.
    pub interval: Option<u64>,
    pub count: Option<u64>,
}

/// YAML task list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl TaskFile {
    pub fn load(path: &Path) -> Result<Self, TaskError> {
        let content = std::fs::read_to_string(path).map_err(|source| TaskError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| TaskError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Whether some device relies on the shared username or password.
    pub fn needs_credentials(&self) -> (bool, bool) {
        (
            self.devices.iter().any(|d| d.username.is_none()),
            self.devices.iter().any(|d| d.password.is_none()),
        )
    }

    /// Validates every entry; the first invalid one aborts the whole list.
    pub fn into_tasks(self, defaults: &TaskDefaults) -> Result<Vec<DeviceTask>, TaskError> {
        if self.devices.is_empty() {
            return Err(TaskError::NoDevices);
        }
        self.devices
            .into_iter()
            .map(|entry| defaults.build(entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> TaskDefaults {
        TaskDefaults {
            username: "admin".into(),
            password: "secret".into(),
            ..TaskDefaults::default()
        }
    }

    #[test]
    fn test_task_from_flags() {
        let task = defaults()
            .task("sw1", &["show version", "show interface:intf_name"])
            .unwrap();

        assert_eq!(task.hostname(), "sw1");
        assert_eq!(task.target.port, 22);
        assert_eq!(task.target.device_type, "linux");
        assert_eq!(task.commands.len(), 2);
        assert_eq!(task.commands[1].tag_field(), Some("intf_name"));
        assert_eq!(task.output_mode, OutputMode::Document);
        assert!(!task.is_continuous());
    }

    #[test]
    fn test_task_validation() {
        let d = defaults();
        assert!(matches!(
            d.task("sw1", &["a:b:c"]).unwrap_err(),
            TaskError::InvalidCommandSpec { .. }
        ));
        assert!(matches!(
            d.task("", &["show version"]).unwrap_err(),
            TaskError::MissingHostname
        ));
        let none: &[&str] = &[];
        assert!(matches!(
            d.task("sw1", none).unwrap_err(),
            TaskError::NoCommands { .. }
        ));

        let zero_port = TaskDefaults { port: 0, ..defaults() };
        assert!(matches!(
            zero_port.task("sw1", &["uptime"]).unwrap_err(),
            TaskError::InvalidPort { .. }
        ));
    }

    #[test]
    fn test_task_file_inherits_defaults() {
        let yaml = r#"
devices:
  - hostname: sw1
    device_type: cisco_ios
    commands: ["show interface:intf_name"]
  - hostname: lb1
    device_type: f5_linux
    parser: csv
    mode: influx
    username: ops
    precommands: ["tmsh"]
    commands: ["tmctl -c pva_stat"]
    interval: 60
    count: 3
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        std::fs::write(&path, yaml).unwrap();

        let file = TaskFile::load(&path).unwrap();
        assert_eq!(file.needs_credentials(), (true, true));

        let tasks = file.into_tasks(&defaults()).unwrap();
        assert_eq!(tasks.len(), 2);

        let sw1 = &tasks[0];
        assert_eq!(sw1.target.username, "admin");
        assert_eq!(sw1.parser_mode, ParserMode::Template);
        assert_eq!(sw1.interval, Duration::ZERO);

        let lb1 = &tasks[1];
        assert_eq!(lb1.target.username, "ops");
        assert_eq!(lb1.target.password, "secret");
        assert_eq!(lb1.parser_mode, ParserMode::Delimited);
        assert_eq!(lb1.output_mode, OutputMode::Metrics);
        assert_eq!(lb1.precommands, vec!["tmsh"]);
        assert_eq!(lb1.interval, Duration::from_secs(60));
        assert_eq!(lb1.max_cycles, Some(3));
    }

    #[test]
    fn test_task_file_errors() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            TaskFile::load(&missing).unwrap_err(),
            TaskError::Io { .. }
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "devices:\n  - hostname: sw1\n    colour: blue\n").unwrap();
        assert!(matches!(
            TaskFile::load(&bad).unwrap_err(),
            TaskError::Yaml { .. }
        ));

        let empty: TaskFile = serde_yaml::from_str("devices: []").unwrap();
        assert!(matches!(
            empty.into_tasks(&defaults()).unwrap_err(),
            TaskError::NoDevices
        ));

        let invalid: TaskFile =
            serde_yaml::from_str("devices:\n  - hostname: sw1\n    commands: ['a:b:c']\n").unwrap();
        assert!(invalid.into_tasks(&defaults()).is_err());
    }
}
