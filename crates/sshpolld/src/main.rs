//! sshpolld - screen-scraping poller for CLI-only network devices.
//!
//! Logs into each device over SSH, runs the configured commands, parses the
//! output (templates or delimited text) and emits points as a JSON document,
//! line protocol on stdout, or writes to InfluxDB.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod prompt;

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sshpoll_core::config::{
    DEFAULT_INDEX_FILE, DEFAULT_INFLUX_DATABASE, DEFAULT_INFLUX_HOST, DEFAULT_INFLUX_PASSWORD,
    DEFAULT_INFLUX_USER, DEFAULT_TEMPLATE_DIR, InfluxConfig, SessionConfig, TemplateConfig,
};
use sshpoll_core::session::OpenSshConnector;
use sshpoll_core::{
    CancellationToken, DeviceTask, InfluxSink, OutputMode, Outputs, ParserMode, PollContext,
    PollerConfig, TaskDefaults, TaskFile, TemplateIndex, WorkerPool, WorkerReport, WorkerState,
};

/// Screen-scraping poller for InfluxDB.
#[derive(Parser, Debug)]
#[command(name = "sshpolld", about = "Screen-scraping poller for CLI-only devices", version)]
struct Args {
    /// Device to poll.
    #[arg(short = 'H', long, required_unless_present = "tasks", requires = "commands")]
    hostname: Option<String>,

    /// SSH port.
    #[arg(long, default_value = "22", env = "SSHPOLL_PORT")]
    port: u16,

    /// Commands to poll, as `command` or `command:tag_field`.
    #[arg(short, long, num_args = 1.., required_unless_present = "tasks")]
    commands: Vec<String>,

    /// Commands sent once after login; their output is discarded.
    #[arg(long, num_args = 1..)]
    precommands: Vec<String>,

    /// Device type, used to pick templates and the prompt style.
    #[arg(short, long, default_value = "linux", env = "SSHPOLL_DEVICE_TYPE")]
    device_type: String,

    /// Output mode: document (json), line, metrics (influx).
    #[arg(short, long, default_value = "document")]
    mode: OutputMode,

    /// Parser: template (fsm) or delimited (csv).
    #[arg(short = 'P', long = "parse", default_value = "template")]
    parser: ParserMode,

    /// Field delimiter for the delimited parser.
    #[arg(long, default_value = ",")]
    delimiter: char,

    /// Polling interval in seconds; 0 polls once.
    #[arg(short, long, default_value = "0")]
    interval: u64,

    /// Stop each device after this many cycles.
    #[arg(long)]
    count: Option<u64>,

    /// Maximum number of devices polled at once.
    #[arg(short, long, default_value = "1", env = "SSHPOLL_THREADS")]
    threads: usize,

    /// YAML task list (devices inherit the flags above).
    #[arg(short = 'y', long = "tasks", visible_alias = "yaml", conflicts_with = "hostname")]
    tasks: Option<PathBuf>,

    /// SSH username (prompted if missing).
    #[arg(short, long, env = "SSHPOLL_USERNAME")]
    username: Option<String>,

    /// SSH password (prompted if missing).
    #[arg(short, long, env = "SSHPOLL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Per-command response timeout in seconds.
    #[arg(long, default_value = "30", env = "SSHPOLL_TIMEOUT")]
    timeout: u64,

    /// Seconds allowed for the SSH connection to come up.
    #[arg(long, default_value = "10", env = "SSHPOLL_CONNECT_TIMEOUT")]
    connect_timeout: u64,

    /// Milliseconds of output silence before a new prompt is adopted while priming.
    #[arg(long, default_value = "500", env = "SSHPOLL_PROMPT_SETTLE_MS")]
    prompt_settle: u64,

    /// OpenSSH client binary.
    #[arg(long, default_value = "ssh", env = "SSHPOLL_SSH")]
    ssh_binary: String,

    /// sshpass binary, used when a password is given.
    #[arg(long, default_value = "sshpass", env = "SSHPOLL_SSHPASS")]
    sshpass_binary: String,

    /// Template directory.
    #[arg(long, default_value = DEFAULT_TEMPLATE_DIR, env = "SSHPOLL_TEMPLATE_DIR")]
    template_dir: PathBuf,

    /// Template index file, relative to the template directory.
    #[arg(long, default_value = DEFAULT_INDEX_FILE, env = "SSHPOLL_TEMPLATE_INDEX")]
    template_index: PathBuf,

    /// InfluxDB host.
    #[arg(long, default_value = DEFAULT_INFLUX_HOST, env = "SSHPOLL_INFLUX_HOST")]
    influx_host: String,

    /// InfluxDB port.
    #[arg(long, default_value = "8086", env = "SSHPOLL_INFLUX_PORT")]
    influx_port: u16,

    /// InfluxDB database.
    #[arg(long, default_value = DEFAULT_INFLUX_DATABASE, env = "SSHPOLL_INFLUX_DB")]
    influx_db: String,

    /// InfluxDB user.
    #[arg(long, default_value = DEFAULT_INFLUX_USER, env = "SSHPOLL_INFLUX_USER")]
    influx_user: String,

    /// InfluxDB password.
    #[arg(
        long,
        default_value = DEFAULT_INFLUX_PASSWORD,
        env = "SSHPOLL_INFLUX_PASSWORD",
        hide_env_values = true,
        hide_default_value = true
    )]
    influx_password: String,

    /// InfluxDB request timeout in seconds.
    #[arg(long, default_value = "10", env = "SSHPOLL_INFLUX_TIMEOUT")]
    influx_timeout: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn config(&self) -> PollerConfig {
        PollerConfig {
            templates: TemplateConfig {
                template_dir: self.template_dir.clone(),
                index_file: self.template_index.clone(),
            },
            influx: InfluxConfig {
                host: self.influx_host.clone(),
                port: self.influx_port,
                database: self.influx_db.clone(),
                username: self.influx_user.clone(),
                password: self.influx_password.clone(),
                timeout: Duration::from_secs(self.influx_timeout.max(1)),
            },
            session: SessionConfig {
                ssh_binary: self.ssh_binary.clone(),
                sshpass_binary: self.sshpass_binary.clone(),
                command_timeout: Duration::from_secs(self.timeout.max(1)),
                connect_timeout: Duration::from_secs(self.connect_timeout.max(1)),
                prompt_settle: Duration::from_millis(self.prompt_settle),
            },
        }
    }

    fn defaults(&self, username: String, password: String) -> TaskDefaults {
        TaskDefaults {
            port: self.port,
            username,
            password,
            device_type: self.device_type.clone(),
            parser_mode: self.parser,
            delimiter: self.delimiter,
            output_mode: self.mode,
            interval: Duration::from_secs(self.interval),
            max_cycles: self.count,
            precommands: self.precommands.clone(),
        }
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Logs go to stderr; stdout is reserved for emitted data.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("sshpolld={}", level).parse().unwrap())
        .add_directive(format!("sshpoll_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Fills in username/password from flags or interactive prompts.
///
/// Only prompts for what some task actually inherits.
fn credentials(args: &Args, task_file: Option<&TaskFile>) -> Result<(String, String), Box<dyn Error>> {
    let (need_user, need_pass) = task_file.map_or((true, true), TaskFile::needs_credentials);

    let username = match &args.username {
        Some(u) => u.clone(),
        None if need_user => prompt::read_line("Enter username: ")?,
        None => String::new(),
    };
    let password = match &args.password {
        Some(p) => p.clone(),
        None if need_pass => prompt::read_secret("Enter password: ")?,
        None => String::new(),
    };
    Ok((username, password))
}

fn build_tasks(args: &Args) -> Result<Vec<DeviceTask>, Box<dyn Error>> {
    match &args.tasks {
        Some(path) => {
            let file = TaskFile::load(path)?;
            let (username, password) = credentials(args, Some(&file))?;
            let tasks = file.into_tasks(&args.defaults(username, password))?;
            info!("Loaded {} devices from {}", tasks.len(), path.display());
            Ok(tasks)
        }
        None => {
            let hostname = args.hostname.as_deref().unwrap_or_default();
            let (username, password) = credentials(args, None)?;
            Ok(vec![args.defaults(username, password).task(hostname, args.commands.as_slice())?])
        }
    }
}

fn build_context(
    config: &PollerConfig,
    tasks: &[DeviceTask],
    cancel: CancellationToken,
) -> Result<PollContext, Box<dyn Error>> {
    let mut outputs = Outputs::stdout();
    if tasks.iter().any(|t| t.output_mode == OutputMode::Metrics) {
        let sink = InfluxSink::new(&config.influx)?;
        info!("Writing metrics to {}", sink.url());
        outputs = outputs.with_sink(Arc::new(sink));
    }

    let connector = OpenSshConnector::new(config.session.clone());
    let mut context = PollContext::new(Arc::new(connector), outputs).with_cancel(cancel);

    if tasks.iter().any(|t| t.parser_mode == ParserMode::Template) {
        let index = TemplateIndex::load(
            &config.templates.template_dir,
            &config.templates.index_file,
        )?;
        info!(
            "Template index {} ({} entries)",
            config.templates.index_path().display(),
            index.len()
        );
        context = context.with_templates(Arc::new(index));
    }

    Ok(context)
}

/// Logs one line per device and returns the process exit code.
fn summarize(reports: &[WorkerReport]) -> ExitCode {
    for report in reports {
        match &report.last_error {
            Some(e) if report.state == WorkerState::Failed => error!(
                "{}: {} after {} cycles ({})",
                report.hostname, report.state, report.cycles, e
            ),
            Some(e) => warn!(
                "{}: {} after {} cycles, {} points (last error: {})",
                report.hostname, report.state, report.cycles, report.points, e
            ),
            None => info!(
                "{}: {} after {} cycles, {} points",
                report.hostname, report.state, report.cycles, report.points
            ),
        }
    }

    if all_failed(reports) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn all_failed(reports: &[WorkerReport]) -> bool {
    !reports.is_empty() && reports.iter().all(|r| r.state == WorkerState::Failed)
}

fn run(args: Args) -> Result<ExitCode, Box<dyn Error>> {
    let config = args.config();
    debug!("Config: {:?}", config);

    let tasks = build_tasks(&args)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        on_signal.cancel();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let context = build_context(&config, &tasks, cancel)?;
    let pool = WorkerPool::new(context, args.threads);
    let reports = pool.run(tasks)?;

    Ok(summarize(&reports))
}

fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);
    info!("sshpolld {} starting", env!("CARGO_PKG_VERSION"));

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("sshpolld").chain(argv.iter().copied()))
    }

    fn report(state: WorkerState) -> WorkerReport {
        WorkerReport {
            hostname: "sw1".into(),
            state,
            cycles: 0,
            points: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_single_device_flags() {
        let args = parse(&[
            "-H",
            "sw1",
            "-c",
            "show version",
            "show interface:intf_name",
            "-m",
            "influx",
            "-P",
            "csv",
            "-i",
            "60",
            "-u",
            "admin",
            "-p",
            "secret",
        ])
        .unwrap();

        assert_eq!(args.hostname.as_deref(), Some("sw1"));
        assert_eq!(args.commands.len(), 2);
        assert_eq!(args.mode, OutputMode::Metrics);
        assert_eq!(args.parser, ParserMode::Delimited);

        let tasks = build_tasks(&args).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].target.username, "admin");
        assert_eq!(tasks[0].interval, Duration::from_secs(60));
        assert_eq!(tasks[0].commands[1].tag_field(), Some("intf_name"));
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["-H", "sw1", "-c", "uptime"]).unwrap();
        assert_eq!(args.port, 22);
        assert_eq!(args.device_type, "linux");
        assert_eq!(args.mode, OutputMode::Document);
        assert_eq!(args.parser, ParserMode::Template);
        assert_eq!(args.interval, 0);
        assert_eq!(args.threads, 1);

        let config = args.config();
        assert_eq!(config.templates.index_path(), PathBuf::from("templates/index"));
        assert_eq!(config.influx.database, "db_name");
        assert_eq!(config.session.command_timeout, Duration::from_secs(30));
        assert_eq!(config.session.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.session.prompt_settle, Duration::from_millis(500));
        assert_eq!(config.session.sshpass_binary, "sshpass");
        assert_eq!(config.influx.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_transport_flags() {
        let args = parse(&[
            "-H",
            "sw1",
            "-c",
            "uptime",
            "--connect-timeout",
            "3",
            "--prompt-settle",
            "250",
            "--sshpass-binary",
            "/opt/bin/sshpass",
            "--influx-timeout",
            "2",
        ])
        .unwrap();

        let config = args.config();
        assert_eq!(config.session.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.session.prompt_settle, Duration::from_millis(250));
        assert_eq!(config.session.sshpass_binary, "/opt/bin/sshpass");
        assert_eq!(config.influx.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_target_required() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["-H", "sw1"]).is_err());
        assert!(parse(&["-c", "uptime"]).is_err());
        assert!(parse(&["--yaml", "tasks.yaml"]).is_ok());
        assert!(parse(&["--tasks", "tasks.yaml", "-H", "sw1"]).is_err());
    }

    #[test]
    fn test_invalid_command_spec_fails_before_polling() {
        let args = parse(&["-H", "sw1", "-c", "a:b:c", "-u", "x", "-p", "y"]).unwrap();
        let err = build_tasks(&args).unwrap_err();
        assert!(err.to_string().contains("a:b:c"));
    }

    #[test]
    fn test_task_file_with_own_credentials_needs_no_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        std::fs::write(
            &path,
            "devices:\n  - hostname: sw1\n    username: ops\n    password: pw\n    commands: [uptime]\n",
        )
        .unwrap();

        let args = parse(&["--tasks", path.to_str().unwrap()]).unwrap();
        let tasks = build_tasks(&args).unwrap();
        assert_eq!(tasks[0].target.username, "ops");
        assert_eq!(tasks[0].target.password, "pw");
    }

    #[test]
    fn test_exit_code_only_when_everything_failed() {
        assert!(!all_failed(&[]));
        assert!(all_failed(&[report(WorkerState::Failed), report(WorkerState::Failed)]));
        assert!(!all_failed(&[report(WorkerState::Failed), report(WorkerState::Done)]));
        assert!(!all_failed(&[report(WorkerState::Idle)]));
    }
}
