//! Interactive device sessions.
//!
//! The poller only needs three things from a transport: open an authenticated
//! shell, send one command and get back everything it printed, and close.
//! These are captured by [`Connector`] and [`DeviceSession`] so workers can run
//! against the system OpenSSH client in production and against
//! [`mock::MockConnector`] in tests.
//!
//! ```text
//!   PollWorker ──► Connector::connect(target) ──► Box<dyn DeviceSession>
//!                                                   ├─ OpenSshSession (ssh child process)
//!                                                   └─ MockSession    (scripted replies)
//! ```

pub mod mock;
mod openssh;

use std::fmt;
use std::time::Duration;

pub use mock::MockConnector;
pub use openssh::OpenSshConnector;

/// Where and how to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub device_type: String,
}

impl fmt::Debug for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTarget")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("device_type", &self.device_type)
            .finish()
    }
}

/// Error type for session operations.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Credentials were rejected.
    Auth(String),
    /// Host unreachable, protocol negotiation failed, client missing, etc.
    Transport(String),
    /// The device did not finish answering in time.
    Timeout { command: String, after: Duration },
    /// The session ended underneath us.
    Closed,
}

impl SessionError {
    /// Whether the session is unusable after this error.
    ///
    /// A timeout only loses the current command; the session discards its
    /// late output before the next one.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Timeout { .. })
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            SessionError::Transport(msg) => write!(f, "transport error: {}", msg),
            SessionError::Timeout { command, after } => write!(
                f,
                "timed out after {:.1}s waiting for '{}'",
                after.as_secs_f64(),
                command
            ),
            SessionError::Closed => write!(f, "session closed by remote side"),
        }
    }
}

impl std::error::Error for SessionError {}

/// One authenticated interactive connection.
pub trait DeviceSession: Send {
    /// Sends a command and blocks until the full response has been read.
    fn send(&mut self, command: &str) -> Result<String, SessionError>;

    /// Sends a session setup command. Unlike [`send`](Self::send), the
    /// session may pick up a new prompt from the response (`enable`, `tmsh`).
    fn prime(&mut self, command: &str) -> Result<String, SessionError> {
        self.send(command)
    }

    /// Closes the session. Safe to call more than once.
    fn disconnect(&mut self);
}

/// Opens sessions. Shared by all workers.
pub trait Connector: Send + Sync {
    fn connect(&self, target: &SessionTarget) -> Result<Box<dyn DeviceSession>, SessionError>;
}
