//! Parsers turning raw command output into flat records.
//!
//! Two strategies share one output shape:
//! - [`template`]: per-platform templates selected from an index (TextFSM style)
//! - [`delimited`]: header row plus delimiter-separated data rows
//!
//! ```text
//!   raw text ──► ResponseParser ──► ParsedTable { records, rejected }
//!                 ├─ Template(matcher, platform)
//!                 └─ Delimited(DelimitedParser)
//! ```

pub mod delimited;
pub mod template;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use delimited::DelimitedParser;
pub use template::{TemplateIndex, TemplateMatcher};

/// One parsed row: lower-cased field name to raw string value.
pub type FlatRecord = BTreeMap<String, String>;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// No template is indexed for this platform/command pair.
    NoTemplateMatch { platform: String, command: String },
    /// The template could not be loaded or the output violated its structure.
    TemplateParseError(String),
    /// A delimited row does not have as many cells as the header.
    MalformedRow {
        line: usize,
        expected: usize,
        found: usize,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NoTemplateMatch { platform, command } => write!(
                f,
                "no template matches platform '{}' and command '{}'",
                platform, command
            ),
            ParseError::TemplateParseError(msg) => write!(f, "template parse error: {}", msg),
            ParseError::MalformedRow {
                line,
                expected,
                found,
            } => write!(
                f,
                "malformed row at line {}: expected {} cells, found {}",
                line, expected, found
            ),
        }
    }
}

impl std::error::Error for ParseError {}

/// Rows parsed from one response.
///
/// Row-level defects land in `rejected` without failing the whole table.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedTable {
    pub records: Vec<FlatRecord>,
    pub rejected: Vec<ParseError>,
}

/// How a task's command output is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserMode {
    #[serde(alias = "fsm")]
    Template,
    #[serde(alias = "csv")]
    Delimited,
}

impl FromStr for ParserMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "template" | "fsm" => Ok(ParserMode::Template),
            "delimited" | "csv" => Ok(ParserMode::Delimited),
            other => Err(format!("unknown parser mode '{}'", other)),
        }
    }
}

impl fmt::Display for ParserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParserMode::Template => write!(f, "template"),
            ParserMode::Delimited => write!(f, "delimited"),
        }
    }
}

/// Parsing strategy, chosen once when a worker is built.
#[derive(Clone)]
pub enum ResponseParser {
    Template {
        matcher: Arc<dyn TemplateMatcher>,
        platform: String,
    },
    Delimited(DelimitedParser),
}

impl ResponseParser {
    /// Parses one command response.
    ///
    /// Template failures are whole-response errors; delimited row defects are
    /// reported in [`ParsedTable::rejected`].
    pub fn parse(&self, command: &str, raw: &str) -> Result<ParsedTable, ParseError> {
        match self {
            ResponseParser::Template { matcher, platform } => {
                let records = matcher.match_output(platform, command, raw)?;
                Ok(ParsedTable {
                    records,
                    rejected: Vec::new(),
                })
            }
            ResponseParser::Delimited(parser) => Ok(parser.parse(raw)),
        }
    }

    pub fn mode(&self) -> ParserMode {
        match self {
            ResponseParser::Template { .. } => ParserMode::Template,
            ResponseParser::Delimited(_) => ParserMode::Delimited,
        }
    }
}

impl fmt::Debug for ResponseParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseParser::Template { platform, .. } => f
                .debug_struct("Template")
                .field("platform", platform)
                .finish_non_exhaustive(),
            ResponseParser::Delimited(parser) => f.debug_tuple("Delimited").field(parser).finish(),
        }
    }
}
