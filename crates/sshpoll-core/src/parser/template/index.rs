//! Template index: selects a template file by platform and command.
//!
//! The index is a comma-separated table. The first non-comment line is the
//! header and must contain a `Template` column:
//!
//! ```text
//! # comments start with '#'
//! Template, Hostname, Platform, Command
//!
//! cisco_ios_show_interface.template, .*, cisco_ios, sh[[ow]] int[[erface]]
//! f5_show_sys_tmm_info.template, .*, f5_ltm, sh[[ow]] sys tmm-info
//! ```
//!
//! Every other column is a regular expression matched at the start of the
//! attribute. In the `Command` column `[[xyz]]` marks an optional completion,
//! so `sh[[ow]]` accepts `sh`, `sho` and `show`. The first matching row wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use regex::Regex;
use tracing::debug;

use super::fsm::Template;
use super::{TemplateError, TemplateMatcher};
use crate::parser::{FlatRecord, ParseError};

const TEMPLATE_COLUMN: &str = "template";
const PLATFORM_COLUMN: &str = "platform";
const COMMAND_COLUMN: &str = "command";

#[derive(Debug)]
struct IndexEntry {
    template: String,
    columns: HashMap<String, Regex>,
}

impl IndexEntry {
    fn matches(&self, column: &str, value: &str) -> bool {
        self.columns.get(column).is_none_or(|re| re.is_match(value))
    }
}

/// File-backed [`TemplateMatcher`].
#[derive(Debug)]
pub struct TemplateIndex {
    template_dir: PathBuf,
    entries: Vec<IndexEntry>,
    cache: Mutex<HashMap<String, Arc<Template>>>,
}

impl TemplateIndex {
    /// Loads `index_file` (relative to `template_dir` unless absolute).
    pub fn load(
        template_dir: impl Into<PathBuf>,
        index_file: impl AsRef<Path>,
    ) -> Result<Self, TemplateError> {
        let template_dir = template_dir.into();
        let index_path = template_dir.join(index_file);
        let content = std::fs::read_to_string(&index_path).map_err(|source| TemplateError::Io {
            path: index_path.clone(),
            source,
        })?;

        let index = Self::from_content(&content, template_dir)?;
        debug!(
            "Loaded template index {} ({} entries)",
            index_path.display(),
            index.len()
        );
        Ok(index)
    }

    /// Parses index content; template names resolve against `template_dir`.
    pub fn from_content(
        content: &str,
        template_dir: impl Into<PathBuf>,
    ) -> Result<Self, TemplateError> {
        let mut rows = content
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let (header_line, header) = rows
            .next()
            .ok_or_else(|| TemplateError::syntax(0, "index is empty"))?;
        let header: Vec<String> = split_row(header).map(|c| c.to_lowercase()).collect();
        let template_col = header
            .iter()
            .position(|c| c == TEMPLATE_COLUMN)
            .ok_or_else(|| TemplateError::syntax(header_line, "index header has no 'Template' column"))?;

        let mut entries = Vec::new();
        for (line_no, line) in rows {
            let cells: Vec<&str> = split_row(line).collect();
            if cells.len() != header.len() {
                return Err(TemplateError::syntax(
                    line_no,
                    format!("expected {} columns, found {}", header.len(), cells.len()),
                ));
            }

            let template = cells[template_col]
                .split(':')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            if template.is_empty() {
                return Err(TemplateError::syntax(line_no, "empty template name"));
            }

            let mut columns = HashMap::new();
            for (name, cell) in header.iter().zip(&cells) {
                if name == TEMPLATE_COLUMN || cell.is_empty() {
                    continue;
                }
                let pattern = if name == COMMAND_COLUMN {
                    expand_completions(cell)
                } else {
                    cell.to_string()
                };
                let regex = Regex::new(&format!("^(?:{})", pattern))
                    .map_err(|e| TemplateError::regex(line_no, e))?;
                columns.insert(name.clone(), regex);
            }

            entries.push(IndexEntry { template, columns });
        }

        Ok(Self {
            template_dir: template_dir.into(),
            entries,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the template file name indexed for this platform and command.
    pub fn lookup(&self, platform: &str, command: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.matches(PLATFORM_COLUMN, platform) && e.matches(COMMAND_COLUMN, command))
            .map(|e| e.template.as_str())
    }

    /// Returns the compiled template, loading it on first use.
    pub fn template(&self, name: &str) -> Result<Arc<Template>, TemplateError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(template) = cache.get(name) {
            return Ok(Arc::clone(template));
        }

        let path = self.template_dir.join(name);
        let source = std::fs::read_to_string(&path).map_err(|source| TemplateError::Io {
            path: path.clone(),
            source,
        })?;
        let template = Arc::new(Template::parse(&source)?);
        debug!("Compiled template {}", path.display());
        cache.insert(name.to_string(), Arc::clone(&template));
        Ok(template)
    }
}

impl TemplateMatcher for TemplateIndex {
    fn match_output(
        &self,
        platform: &str,
        command: &str,
        raw: &str,
    ) -> Result<Vec<FlatRecord>, ParseError> {
        let name = self
            .lookup(platform, command)
            .ok_or_else(|| ParseError::NoTemplateMatch {
                platform: platform.to_string(),
                command: command.to_string(),
            })?;

        let template = self
            .template(name)
            .map_err(|e| ParseError::TemplateParseError(format!("{}: {}", name, e)))?;

        template
            .run(raw)
            .map_err(|e| ParseError::TemplateParseError(format!("{}: {}", name, e)))
    }
}

fn split_row(line: &str) -> impl Iterator<Item = &str> {
    line.split(',').map(str::trim)
}

/// Expands `[[xyz]]` into `(x(y(z)?)?)?`.
fn expand_completions(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;

    while let Some(start) = rest.find("[[") {
        let Some(len) = rest[start + 2..].find("]]") else {
            break;
        };
        out.push_str(&rest[..start]);

        let inner = &rest[start + 2..start + 2 + len];
        let mut expanded = String::new();
        for c in inner.chars().rev() {
            expanded = format!("({}{})?", c, expanded);
        }
        out.push_str(&expanded);

        rest = &rest[start + 2 + len + 2..];
    }

    out.push_str(rest);
    out
}
