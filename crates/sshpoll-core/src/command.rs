//! `command[:tag]` specifications.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Error returned for a malformed `command[:tag]` literal.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpecError {
    pub literal: String,
}

impl fmt::Display for CommandSpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid command spec '{}': expected 'command' or 'command:tag'",
            self.literal
        )
    }
}

impl std::error::Error for CommandSpecError {}

/// A command to send plus the optional field promoted to a tag.
///
/// `"show interface:intf_name"` sends `show interface` and tags every
/// resulting point with the `intf_name` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    command: String,
    tag_field: Option<String>,
}

impl CommandSpec {
    /// Parses a literal, splitting on exactly one `:`. An empty tag
    /// (`"show version:"`) means no tag.
    pub fn parse(literal: &str) -> Result<Self, CommandSpecError> {
        let invalid = || CommandSpecError {
            literal: literal.to_string(),
        };

        let mut parts = literal.split(':');
        let command = parts.next().unwrap_or_default();
        let tag_field = parts.next();
        if parts.next().is_some() || command.trim().is_empty() {
            return Err(invalid());
        }

        let tag_field = tag_field
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string);

        Ok(Self {
            command: command.trim().to_string(),
            tag_field,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn tag_field(&self) -> Option<&str> {
        self.tag_field.as_deref()
    }
}

impl FromStr for CommandSpec {
    type Err = CommandSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag_field {
            Some(tag) => write!(f, "{}:{}", self.command, tag),
            None => write!(f, "{}", self.command),
        }
    }
}
