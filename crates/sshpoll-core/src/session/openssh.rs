//! Sessions over the system OpenSSH client.
//!
//! The `ssh` binary is spawned without a pseudo-terminal (`-T`) and driven
//! through its stdin/stdout pipes. A reader thread forwards stdout chunks over
//! a channel so every read can carry a deadline.
//!
//! How the end of a response is detected depends on the device type:
//!
//! - Unix-like shells (`linux`, `f5_linux`, ...): after each command an
//!   `echo <marker>` is written and the response ends at the marker line.
//! - Network CLIs: the response ends when the buffer ends with the prompt
//!   learned at login. While priming, output that goes idle on something that
//!   looks like a different prompt (e.g. after `enable` or `tmsh`) ends the
//!   response and that prompt is adopted.
//!
//! A command that times out leaves its late output in the pipe. Before the
//! next command the session reads up to the abandoned marker or prompt and
//! drops it; if that does not show up within the command timeout the session
//! fails with a transport error.
//!
//! Password authentication goes through `sshpass -e` so the secret travels in
//! the environment rather than the command line.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{Connector, DeviceSession, SessionError, SessionTarget};
use crate::config::SessionConfig;

/// Device types that land in a POSIX shell.
const SHELL_DEVICE_TYPES: &[&str] = &["linux", "generic", "unix", "bash", "f5_linux", "ovs_linux"];

/// Characters a CLI prompt usually ends with.
const PROMPT_TERMINATORS: &[char] = &['>', '#', '$', '%', ']'];

const MAX_PROMPT_LEN: usize = 80;

const READ_CHUNK: usize = 4096;

/// Stderr fragments that mean the credentials were rejected.
const AUTH_FAILURES: &[&str] = &[
    "permission denied",
    "authentication failed",
    "too many authentication failures",
    "no supported authentication methods",
];

/// Opens sessions by spawning `ssh`.
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    config: SessionConfig,
}

impl OpenSshConnector {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, target: &SessionTarget) -> Command {
        let mut cmd = if target.password.is_empty() {
            let mut cmd = Command::new(&self.config.ssh_binary);
            cmd.args(["-o", "BatchMode=yes"]);
            cmd
        } else {
            let mut cmd = Command::new(&self.config.sshpass_binary);
            cmd.arg("-e")
                .arg(&self.config.ssh_binary)
                .env("SSHPASS", &target.password);
            cmd.args(["-o", "PubkeyAuthentication=no"]);
            cmd
        };

        cmd.arg("-T")
            .args(["-p", &target.port.to_string()])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args([
                "-o",
                &format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
            ])
            .args(["-l", &target.username])
            .arg(&target.hostname)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Connector for OpenSshConnector {
    fn connect(&self, target: &SessionTarget) -> Result<Box<dyn DeviceSession>, SessionError> {
        let mut child = self.build_command(target).spawn().map_err(|e| {
            SessionError::Transport(format!("cannot start {}: {}", self.config.ssh_binary, e))
        })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::Transport("ssh pipes unavailable".into()));
            }
        };

        let (tx, rx) = mpsc::channel();
        let reader_name = format!("ssh-out-{}", target.hostname);
        let spawned = thread::Builder::new().name(reader_name).spawn(move || {
            let mut stdout = stdout;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(chunk).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let errors = Arc::new(Mutex::new(String::new()));
        let errors_writer = Arc::clone(&errors);
        let spawned = spawned.and_then(|_| {
            thread::Builder::new()
                .name(format!("ssh-err-{}", target.hostname))
                .spawn(move || {
                    let mut stderr = stderr;
                    let mut buf = [0u8; READ_CHUNK];
                    while let Ok(n) = stderr.read(&mut buf) {
                        if n == 0 {
                            break;
                        }
                        errors_writer
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push_str(&String::from_utf8_lossy(&buf[..n]));
                    }
                })
        });
        if let Err(e) = spawned {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SessionError::Transport(format!("cannot spawn reader thread: {}", e)));
        }

        let completion = if SHELL_DEVICE_TYPES.contains(&target.device_type.as_str()) {
            Completion::Marker
        } else {
            Completion::Prompt(String::new())
        };

        let mut session = OpenSshSession {
            host: target.hostname.clone(),
            child,
            stdin: Some(stdin),
            output: rx,
            errors,
            completion,
            timeout: self.config.command_timeout,
            login_timeout: self.config.connect_timeout + self.config.command_timeout,
            settle: self.config.prompt_settle,
            marker_seq: 0,
            unfinished: None,
            closed: false,
        };

        if let Err(e) = session.establish() {
            session.disconnect();
            return Err(e);
        }

        debug!(
            "Connected to {}:{} as {} ({})",
            target.hostname, target.port, target.username, target.device_type
        );
        Ok(Box::new(session))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Completion {
    /// Response ends at an echoed marker line.
    Marker,
    /// Response ends with the current prompt.
    Prompt(String),
}

struct OpenSshSession {
    host: String,
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<String>,
    errors: Arc<Mutex<String>>,
    completion: Completion,
    timeout: Duration,
    login_timeout: Duration,
    settle: Duration,
    marker_seq: u64,
    unfinished: Option<Unfinished>,
    closed: bool,
}

/// End of a timed out command that has not been read yet.
#[derive(Debug, Clone)]
enum Unfinished {
    Marker(String),
    Prompt(String),
}

impl OpenSshSession {
    /// Waits for the remote side to be ready, turning an early exit into an
    /// auth or transport error.
    fn establish(&mut self) -> Result<(), SessionError> {
        let result = if self.completion == Completion::Marker {
            let marker = self.next_marker();
            self.write_line(&format!("echo {}", marker))
                .and_then(|_| self.read_until_marker(&marker, "login", self.login_timeout))
                .map(|_| ())
        } else {
            self.write_line("").and_then(|_| {
                let banner = self.read_until(
                    "login",
                    self.login_timeout,
                    |buf, idle| idle && last_line(buf).is_some_and(looks_like_prompt),
                )?;
                if let Some(prompt) = last_line(&banner) {
                    trace!("{}: learned prompt {:?}", self.host, prompt);
                    self.completion = Completion::Prompt(prompt.to_string());
                }
                Ok(())
            })
        };

        result.map_err(|e| match e {
            SessionError::Closed => self.classify_exit(),
            other => other,
        })
    }

    fn classify_exit(&mut self) -> SessionError {
        // Let the stderr thread drain what ssh printed before exiting.
        let _ = self.child.wait();
        thread::sleep(Duration::from_millis(50));
        let errors = self
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trim()
            .to_string();
        let lowered = errors.to_lowercase();
        let detail = errors
            .lines()
            .last()
            .unwrap_or("connection closed")
            .to_string();

        if AUTH_FAILURES.iter().any(|f| lowered.contains(f)) {
            SessionError::Auth(detail)
        } else {
            SessionError::Transport(detail)
        }
    }

    fn next_marker(&mut self) -> String {
        self.marker_seq += 1;
        format!("__SSHPOLL_{}_{}__", std::process::id(), self.marker_seq)
    }

    fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        let stdin = self.stdin.as_mut().ok_or(SessionError::Closed)?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.flush())
            .map_err(|_| SessionError::Closed)
    }

    /// Reads until `done(buffer, idle)` holds. `idle` is true when no output
    /// arrived for the settle delay.
    fn read_until<F>(&mut self, command: &str, timeout: Duration, mut done: F) -> Result<String, SessionError>
    where
        F: FnMut(&str, bool) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut buf = String::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout {
                    command: command.to_string(),
                    after: timeout,
                });
            }

            match self.output.recv_timeout(self.settle.min(deadline - now)) {
                Ok(chunk) => {
                    buf.push_str(&chunk.replace('\r', ""));
                    if done(&buf, false) {
                        return Ok(buf);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if done(&buf, true) {
                        return Ok(buf);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(SessionError::Closed),
            }
        }
    }

    fn read_until_marker(&mut self, marker: &str, command: &str, timeout: Duration) -> Result<String, SessionError> {
        let buf = self.read_until(command, timeout, |buf, _| {
            buf.lines().any(|line| line.trim_end() == marker)
        })?;

        let mut out = String::new();
        for line in buf.lines() {
            if line.trim_end() == marker {
                break;
            }
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }

    fn send_with_marker(&mut self, command: &str) -> Result<String, SessionError> {
        let marker = self.next_marker();
        self.write_line(command)?;
        self.write_line(&format!("echo {}", marker))?;

        let result = self.read_until_marker(&marker, command, self.timeout);
        if matches!(result, Err(SessionError::Timeout { .. })) {
            self.unfinished = Some(Unfinished::Marker(marker));
        }
        result
    }

    fn send_with_prompt(&mut self, command: &str, prompt: String, adopt: bool) -> Result<String, SessionError> {
        self.write_line(command)?;

        let mut adopted = None;
        let result = self.read_until(command, self.timeout, |buf, idle| {
            let Some(last) = last_line(buf) else {
                return false;
            };
            if last == prompt {
                return true;
            }
            if adopt && idle && looks_like_prompt(last) {
                adopted = Some(last.to_string());
                return true;
            }
            false
        });
        if matches!(result, Err(SessionError::Timeout { .. })) {
            self.unfinished = Some(Unfinished::Prompt(prompt));
        }
        let buf = result?;

        if let Some(prompt) = adopted {
            debug!("{}: prompt changed to {:?}", self.host, prompt);
            self.completion = Completion::Prompt(prompt);
        }

        Ok(strip_echo_and_prompt(&buf, command))
    }

    /// Drops the late output of a timed out command.
    fn resync(&mut self) -> Result<(), SessionError> {
        let Some(unfinished) = self.unfinished.take() else {
            return Ok(());
        };

        let result = match &unfinished {
            Unfinished::Marker(marker) => self
                .read_until_marker(marker, "resync", self.timeout)
                .map(|_| ()),
            Unfinished::Prompt(prompt) => self
                .read_until("resync", self.timeout, |buf, _| {
                    last_line(buf) == Some(prompt.as_str())
                })
                .map(|_| ()),
        };

        match result {
            Ok(()) => {
                debug!("{}: discarded output of timed out command", self.host);
                Ok(())
            }
            Err(SessionError::Timeout { .. }) => Err(SessionError::Transport(
                "session out of sync after a timed out command".into(),
            )),
            Err(e) => Err(e),
        }
    }

    fn exchange(&mut self, command: &str, adopt_prompt: bool) -> Result<String, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.resync()?;

        trace!("{}: > {}", self.host, command);
        match self.completion.clone() {
            Completion::Marker => self.send_with_marker(command),
            Completion::Prompt(prompt) => self.send_with_prompt(command, prompt, adopt_prompt),
        }
    }
}

impl DeviceSession for OpenSshSession {
    fn send(&mut self, command: &str) -> Result<String, SessionError> {
        self.exchange(command, false)
    }

    fn prime(&mut self, command: &str) -> Result<String, SessionError> {
        self.exchange(command, true)
    }

    fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.write_line("exit");
        self.stdin = None;

        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Ok(None) => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
                Err(e) => {
                    warn!("{}: failed to reap ssh process: {}", self.host, e);
                    break;
                }
            }
        }
        debug!("Disconnected from {}", self.host);
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Last non-empty line of `buf`, trimmed.
fn last_line(buf: &str) -> Option<&str> {
    buf.lines().map(str::trim).rfind(|l| !l.is_empty())
}

fn looks_like_prompt(line: &str) -> bool {
    line.len() <= MAX_PROMPT_LEN && line.ends_with(PROMPT_TERMINATORS)
}

/// Drops the echoed command line and the trailing prompt line.
fn strip_echo_and_prompt(buf: &str, command: &str) -> String {
    let mut lines: Vec<&str> = buf.lines().collect();

    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines.pop();

    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(lines.len());
    let skip_echo = lines
        .get(start)
        .is_some_and(|l| l.trim().ends_with(command.trim()));
    let body = if skip_echo {
        &lines[start + 1..]
    } else {
        &lines[start..]
    };

    let mut out = body.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_prompt() {
        assert!(looks_like_prompt("sw1#"));
        assert!(looks_like_prompt("sw1>"));
        assert!(looks_like_prompt("[admin@lb1:Active:Standalone] ~ #"));
        assert!(looks_like_prompt("user@host:~$"));
        assert!(!looks_like_prompt("GigabitEthernet0/1 is up"));
        assert!(!looks_like_prompt(&"x".repeat(100)));
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("a\nb\n\n  \n"), Some("b"));
        assert_eq!(last_line("  sw1# "), Some("sw1#"));
        assert_eq!(last_line("\n\n"), None);
    }

    #[test]
    fn test_strip_echo_and_prompt() {
        let buf = "show clock\n10:00:00 UTC\nsw1#";
        assert_eq!(strip_echo_and_prompt(buf, "show clock"), "10:00:00 UTC\n");

        // Prompt-prefixed echo.
        let buf = "sw1#show ver\nVersion 15\nuptime 1d\nsw1#\n";
        assert_eq!(strip_echo_and_prompt(buf, "show ver"), "Version 15\nuptime 1d\n");

        // Device that does not echo.
        let buf = "Version 15\nsw1#";
        assert_eq!(strip_echo_and_prompt(buf, "show ver"), "Version 15\n");

        assert_eq!(strip_echo_and_prompt("sw1#", "terminal length 0"), "");
    }

    #[test]
    fn test_missing_binary_is_transport_error() {
        let config = SessionConfig {
            ssh_binary: "/nonexistent/sshpoll-test-ssh".into(),
            ..SessionConfig::default()
        };
        let connector = OpenSshConnector::new(config);
        let target = SessionTarget {
            hostname: "127.0.0.1".into(),
            port: 22,
            username: "nobody".into(),
            password: String::new(),
            device_type: "linux".into(),
        };

        let err = connector.connect(&target).err().unwrap();
        assert!(matches!(err, SessionError::Transport(_)));
    }

    /// Writes `script` as a stand-in `ssh`. `sh` plays the part of sshpass,
    /// so `sh -e <script> <ssh args>` runs it without executing the file.
    fn scripted(dir: &tempfile::TempDir, script: &str, timeout: Duration) -> OpenSshConnector {
        let path = dir.path().join("ssh");
        std::fs::write(&path, script).unwrap();
        OpenSshConnector::new(SessionConfig {
            ssh_binary: path.to_string_lossy().into_owned(),
            sshpass_binary: "sh".into(),
            command_timeout: timeout,
            connect_timeout: Duration::from_secs(2),
            prompt_settle: Duration::from_millis(100),
        })
    }

    fn target(device_type: &str) -> SessionTarget {
        SessionTarget {
            hostname: "sw1".into(),
            port: 22,
            username: "admin".into(),
            password: "secret".into(),
            device_type: device_type.into(),
        }
    }

    const SHELL: &str = "exec sh\n";

    const CLI: &str = r#"P='sw1#'
while IFS= read -r line; do
  case "$line" in
    '') echo ;;
    enable) P='sw1(en)#'; echo ;;
    'show clock') echo '10:00:00 UTC' ;;
    'show load') printf 'cpu 5%%\n'; sleep 1; printf 'mem 7\n' ;;
    exit) exit 0 ;;
  esac
  printf '%s ' "$P"
done
"#;

    #[test]
    fn test_shell_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let connector = scripted(&dir, SHELL, Duration::from_secs(5));

        let mut session = connector.connect(&target("linux")).unwrap();
        assert_eq!(session.send("echo hello").unwrap(), "hello\n");
        assert_eq!(session.send("printf 'a,b\\n1,2\\n'").unwrap(), "a,b\n1,2\n");

        session.disconnect();
        assert_eq!(session.send("echo again").unwrap_err(), SessionError::Closed);
    }

    #[test]
    fn test_late_output_is_not_glued_to_next_response() {
        let dir = tempfile::tempdir().unwrap();
        let connector = scripted(&dir, SHELL, Duration::from_millis(1500));
        let mut session = connector.connect(&target("linux")).unwrap();

        let err = session
            .send("sleep 2; printf 'stale,junk\\n9,9\\n'")
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert!(!err.is_fatal());

        assert_eq!(session.send("printf 'a,b\\n1,2\\n'").unwrap(), "a,b\n1,2\n");
        session.disconnect();
    }

    #[test]
    fn test_session_that_cannot_catch_up_fails() {
        let dir = tempfile::tempdir().unwrap();
        let connector = scripted(&dir, SHELL, Duration::from_millis(500));
        let mut session = connector.connect(&target("linux")).unwrap();

        assert!(matches!(
            session.send("sleep 3").unwrap_err(),
            SessionError::Timeout { .. }
        ));
        let err = session.send("echo hi").unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert!(err.is_fatal());
        session.disconnect();
    }

    #[test]
    fn test_prompt_session_waits_for_learned_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let connector = scripted(&dir, CLI, Duration::from_secs(5));
        let mut session = connector.connect(&target("cisco_ios")).unwrap();

        assert_eq!(session.send("show clock").unwrap(), "10:00:00 UTC\n");
        // A pause after a line ending in '%' does not end the response.
        assert_eq!(session.send("show load").unwrap(), "cpu 5%\nmem 7\n");
        assert_eq!(session.send("show clock").unwrap(), "10:00:00 UTC\n");
        session.disconnect();
    }

    #[test]
    fn test_priming_adopts_new_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let connector = scripted(&dir, CLI, Duration::from_secs(5));
        let mut session = connector.connect(&target("cisco_ios")).unwrap();

        assert_eq!(session.prime("enable").unwrap(), "");
        assert_eq!(session.send("show clock").unwrap(), "10:00:00 UTC\n");
        session.disconnect();
    }
}
