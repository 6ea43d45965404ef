//! Template-based parsing.
//!
//! A [`TemplateMatcher`] turns the raw output of one command on one platform
//! into flat records. [`TemplateIndex`] is the file-backed implementation: an
//! index maps `(platform, command)` to a template file, and templates are
//! compiled on first use and cached for the lifetime of the process.

mod fsm;
mod index;

use std::fmt;
use std::io;
use std::path::PathBuf;

pub use fsm::{Template, TemplateRunError};
pub use index::TemplateIndex;

use super::{FlatRecord, ParseError};

/// Structures raw command output using a library of templates.
///
/// Implementations are shared by every worker, hence `Send + Sync`.
pub trait TemplateMatcher: Send + Sync {
    /// Applies the template selected for `(platform, command)` to `raw`.
    ///
    /// # Errors
    /// - [`ParseError::NoTemplateMatch`] if nothing is indexed for the pair
    /// - [`ParseError::TemplateParseError`] if the template cannot be loaded
    ///   or rejects the output
    fn match_output(
        &self,
        platform: &str,
        command: &str,
        raw: &str,
    ) -> Result<Vec<FlatRecord>, ParseError>;
}

/// Error type for loading templates and the template index.
#[derive(Debug)]
pub enum TemplateError {
    /// File could not be read.
    Io { path: PathBuf, source: io::Error },
    /// Template or index syntax error.
    Syntax { line: usize, message: String },
    /// A regular expression failed to compile.
    Regex { line: usize, source: regex::Error },
}

impl TemplateError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        TemplateError::Syntax {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn regex(line: usize, source: regex::Error) -> Self {
        TemplateError::Regex { line, source }
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::Io { path, source } => {
                write!(f, "cannot read {}: {}", path.display(), source)
            }
            TemplateError::Syntax { line, message } => write!(f, "line {}: {}", line, message),
            TemplateError::Regex { line, source } => {
                write!(f, "line {}: invalid regex: {}", line, source)
            }
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TemplateError::Io { source, .. } => Some(source),
            TemplateError::Regex { source, .. } => Some(source),
            TemplateError::Syntax { .. } => None,
        }
    }
}
