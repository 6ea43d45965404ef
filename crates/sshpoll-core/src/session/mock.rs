//! Scripted sessions for tests.
//!
//! ```
//! use sshpoll_core::session::{Connector, MockConnector, SessionTarget};
//!
//! let connector = MockConnector::new().respond("show clock", "10:00:00 UTC\n");
//! let target = SessionTarget {
//!     hostname: "sw1".into(),
//!     port: 22,
//!     username: "admin".into(),
//!     password: "admin".into(),
//!     device_type: "cisco_ios".into(),
//! };
//! let mut session = connector.connect(&target).unwrap();
//! assert_eq!(session.send("show clock").unwrap(), "10:00:00 UTC\n");
//! session.disconnect();
//! assert_eq!(connector.disconnects(), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Connector, DeviceSession, SessionError, SessionTarget};

/// Reply for unscripted commands.
pub const UNKNOWN_COMMAND_REPLY: &str = "% Invalid input detected\n";

/// What a scripted command does.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Output(String),
    /// Fail with [`SessionError::Timeout`].
    Timeout,
    /// Fail with [`SessionError::Closed`] and end the session.
    Drop,
}

#[derive(Debug, Default)]
struct MockState {
    replies: HashMap<String, MockReply>,
    host_replies: HashMap<(String, String), MockReply>,
    rejected_hosts: HashSet<String>,
    reject_all: bool,
    unreachable_hosts: HashSet<String>,
    sent: Vec<(String, String)>,
    connects: usize,
    disconnects: usize,
}

/// Connector whose sessions answer from a script.
///
/// Clones share state, so a test can keep one handle for assertions while the
/// pool uses another.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers `command` with `output` on every host.
    pub fn respond(self, command: &str, output: &str) -> Self {
        self.reply(command, MockReply::Output(output.to_string()))
    }

    pub fn reply(self, command: &str, reply: MockReply) -> Self {
        self.state().replies.insert(command.to_string(), reply);
        self
    }

    /// Answers `command` on one host only; takes precedence over [`respond`](Self::respond).
    pub fn respond_on(self, host: &str, command: &str, output: &str) -> Self {
        self.state().host_replies.insert(
            (host.to_string(), command.to_string()),
            MockReply::Output(output.to_string()),
        );
        self
    }

    /// Rejects credentials on every host.
    pub fn reject_auth(self) -> Self {
        self.state().reject_all = true;
        self
    }

    pub fn reject_auth_on(self, host: &str) -> Self {
        self.state().rejected_hosts.insert(host.to_string());
        self
    }

    pub fn unreachable(self, host: &str) -> Self {
        self.state().unreachable_hosts.insert(host.to_string());
        self
    }

    /// Commands sent so far, in order, across all hosts.
    pub fn sent(&self) -> Vec<String> {
        self.state().sent.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Commands sent to one host.
    pub fn sent_to(&self, host: &str) -> Vec<String> {
        self.state()
            .sent
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }
}

impl Connector for MockConnector {
    fn connect(&self, target: &SessionTarget) -> Result<Box<dyn DeviceSession>, SessionError> {
        let mut state = self.state();
        if state.unreachable_hosts.contains(&target.hostname) {
            return Err(SessionError::Transport(format!(
                "connect to host {} port {}: No route to host",
                target.hostname, target.port
            )));
        }
        if state.reject_all || state.rejected_hosts.contains(&target.hostname) {
            return Err(SessionError::Auth(format!(
                "{}@{}: Permission denied",
                target.username, target.hostname
            )));
        }
        state.connects += 1;

        Ok(Box::new(MockSession {
            host: target.hostname.clone(),
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct MockSession {
    host: String,
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

impl DeviceSession for MockSession {
    fn send(&mut self, command: &str) -> Result<String, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sent.push((self.host.clone(), command.to_string()));

        let reply = state
            .host_replies
            .get(&(self.host.clone(), command.to_string()))
            .or_else(|| state.replies.get(command))
            .cloned()
            .unwrap_or_else(|| MockReply::Output(UNKNOWN_COMMAND_REPLY.to_string()));

        match reply {
            MockReply::Output(output) => Ok(output),
            MockReply::Timeout => Err(SessionError::Timeout {
                command: command.to_string(),
                after: std::time::Duration::from_secs(0),
            }),
            MockReply::Drop => {
                self.closed = true;
                Err(SessionError::Closed)
            }
        }
    }

    fn disconnect(&mut self) {
        // Counted even after a drop: the worker still releases the session.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.disconnects += 1;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> SessionTarget {
        SessionTarget {
            hostname: host.into(),
            port: 22,
            username: "admin".into(),
            password: "secret".into(),
            device_type: "cisco_ios".into(),
        }
    }

    #[test]
    fn test_scripted_and_unknown_commands() {
        let connector = MockConnector::new()
            .respond("show clock", "10:00\n")
            .respond_on("sw2", "show clock", "11:00\n");

        let mut s1 = connector.connect(&target("sw1")).unwrap();
        let mut s2 = connector.connect(&target("sw2")).unwrap();

        assert_eq!(s1.send("show clock").unwrap(), "10:00\n");
        assert_eq!(s2.send("show clock").unwrap(), "11:00\n");
        assert_eq!(s1.send("show nothing").unwrap(), UNKNOWN_COMMAND_REPLY);

        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.sent_to("sw1"), vec!["show clock", "show nothing"]);
        assert_eq!(connector.sent().len(), 3);
    }

    #[test]
    fn test_failures() {
        let connector = MockConnector::new()
            .reject_auth_on("sw1")
            .unreachable("sw9")
            .reply("slow", MockReply::Timeout)
            .reply("reload", MockReply::Drop);

        assert!(matches!(
            connector.connect(&target("sw1")).err().unwrap(),
            SessionError::Auth(_)
        ));
        assert!(matches!(
            connector.connect(&target("sw9")).err().unwrap(),
            SessionError::Transport(_)
        ));

        let mut session = connector.connect(&target("sw2")).unwrap();
        assert!(matches!(
            session.send("slow").unwrap_err(),
            SessionError::Timeout { .. }
        ));
        assert_eq!(session.send("reload").unwrap_err(), SessionError::Closed);
        assert_eq!(session.send("show clock").unwrap_err(), SessionError::Closed);

        session.disconnect();
        assert_eq!(connector.disconnects(), 1);
    }

    #[test]
    fn test_reject_all() {
        let connector = MockConnector::new().reject_auth();
        assert!(connector.connect(&target("any")).is_err());
        assert_eq!(connector.connects(), 0);
    }
}
