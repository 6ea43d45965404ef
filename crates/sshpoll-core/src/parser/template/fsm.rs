//! Template state machine (TextFSM dialect).
//!
//! A template declares the values to extract and a set of states whose rules
//! are regular expressions tried against each line of output:
//!
//! ```text
//! Value Required INTERFACE (\S+)
//! Value RX_PACKETS (\d+)
//!
//! Start
//!   ^${INTERFACE} is up -> Continue
//!   ^\s+${RX_PACKETS} packets input -> Record
//! ```
//!
//! Supported: value options `Filldown`, `Fillup`, `Required`, `List`, `Key`;
//! line actions `Next`, `Continue`, `Error`; record actions `Record`,
//! `NoRecord`, `Clear`, `Clearall`; state transitions including `End`; an
//! optional `EOF` state which suppresses the implicit record at end of input.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use super::TemplateError;
use crate::parser::FlatRecord;

const START_STATE: &str = "Start";
const END_STATE: &str = "End";
const EOF_STATE: &str = "EOF";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ValueOptions {
    filldown: bool,
    fillup: bool,
    required: bool,
    list: bool,
}

#[derive(Debug, Clone)]
struct ValueDef {
    name: String,
    pattern: String,
    options: ValueOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineOp {
    Next,
    Continue,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOp {
    NoRecord,
    Record,
    Clear,
    ClearAll,
}

#[derive(Debug, Clone)]
struct Rule {
    regex: Regex,
    line_op: LineOp,
    record_op: RecordOp,
    new_state: Option<String>,
    message: Option<String>,
    source_line: usize,
}

/// Error raised while running a template against output.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateRunError {
    pub message: String,
}

impl fmt::Display for TemplateRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TemplateRunError {}

/// A compiled template.
#[derive(Debug, Clone)]
pub struct Template {
    values: Vec<ValueDef>,
    states: HashMap<String, Vec<Rule>>,
}

impl Template {
    /// Compiles template source text.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let lines: Vec<&str> = source.lines().collect();
        let mut pos = 0;

        let values = parse_values(&lines, &mut pos)?;
        let states = parse_states(&lines, &mut pos, &values)?;

        if !states.contains_key(START_STATE) {
            return Err(TemplateError::syntax(0, "missing 'Start' state"));
        }
        for rules in states.values() {
            for rule in rules {
                if let Some(ref target) = rule.new_state
                    && target != END_STATE
                    && !states.contains_key(target)
                {
                    return Err(TemplateError::syntax(
                        rule.source_line,
                        format!("transition to undefined state '{}'", target),
                    ));
                }
            }
        }

        Ok(Self { values, states })
    }

    /// Lower-cased column names, in declaration order.
    pub fn header(&self) -> Vec<String> {
        self.values.iter().map(|v| v.name.to_lowercase()).collect()
    }

    /// Runs the template over `text` and returns one record per emitted row.
    pub fn run(&self, text: &str) -> Result<Vec<FlatRecord>, TemplateRunError> {
        let mut run = Run::new(&self.values);
        let mut state = START_STATE;

        'lines: for (idx, line) in text.lines().enumerate() {
            let Some(rules) = self.states.get(state) else {
                break;
            };
            for rule in rules {
                let Some(caps) = rule.regex.captures(line) else {
                    continue;
                };

                for (slot, value) in self.values.iter().enumerate() {
                    if let Some(m) = caps.name(&value.name) {
                        run.assign(slot, m.as_str());
                    }
                }

                if rule.line_op == LineOp::Error {
                    let detail = rule.message.as_deref().unwrap_or("state error");
                    return Err(TemplateRunError {
                        message: format!(
                            "{} (template line {}, input line {}: {:?})",
                            detail,
                            rule.source_line,
                            idx + 1,
                            line
                        ),
                    });
                }

                match rule.record_op {
                    RecordOp::Record => run.append_record(),
                    RecordOp::Clear => run.clear(false),
                    RecordOp::ClearAll => run.clear(true),
                    RecordOp::NoRecord => {}
                }

                if let Some(ref next) = rule.new_state {
                    if next == END_STATE {
                        state = END_STATE;
                        break 'lines;
                    }
                    state = next.as_str();
                }

                if rule.line_op != LineOp::Continue {
                    break;
                }
            }
        }

        if state != END_STATE && !self.states.contains_key(EOF_STATE) {
            run.append_record();
        }

        let header = self.header();
        Ok(run
            .rows
            .into_iter()
            .map(|row| header.iter().cloned().zip(row).collect())
            .collect())
    }
}

#[derive(Debug, Clone)]
enum Cell {
    Scalar(Option<String>),
    List(Vec<String>),
}

impl Cell {
    fn is_empty(&self) -> bool {
        match self {
            Cell::Scalar(v) => v.is_none(),
            Cell::List(items) => items.is_empty(),
        }
    }

    fn render(&self) -> String {
        match self {
            Cell::Scalar(v) => v.clone().unwrap_or_default(),
            Cell::List(items) => items.join(","),
        }
    }
}

/// Mutable state of one template run.
struct Run<'a> {
    values: &'a [ValueDef],
    cells: Vec<Cell>,
    rows: Vec<Vec<String>>,
}

impl<'a> Run<'a> {
    fn new(values: &'a [ValueDef]) -> Self {
        let cells = values.iter().map(empty_cell).collect();
        Self {
            values,
            cells,
            rows: Vec::new(),
        }
    }

    fn assign(&mut self, slot: usize, captured: &str) {
        match &mut self.cells[slot] {
            Cell::Scalar(v) => *v = Some(captured.to_string()),
            Cell::List(items) => items.push(captured.to_string()),
        }

        if self.values[slot].options.fillup {
            for row in self.rows.iter_mut().rev() {
                if !row[slot].is_empty() {
                    break;
                }
                row[slot] = captured.to_string();
            }
        }
    }

    fn append_record(&mut self) {
        if self.cells.iter().all(Cell::is_empty) {
            return;
        }

        let missing_required = self
            .values
            .iter()
            .zip(&self.cells)
            .any(|(value, cell)| value.options.required && cell.is_empty());
        if !missing_required {
            self.rows.push(self.cells.iter().map(Cell::render).collect());
        }

        self.clear(false);
    }

    fn clear(&mut self, all: bool) {
        for (value, cell) in self.values.iter().zip(self.cells.iter_mut()) {
            if all || !value.options.filldown {
                *cell = empty_cell(value);
            }
        }
    }
}

fn empty_cell(value: &ValueDef) -> Cell {
    if value.options.list {
        Cell::List(Vec::new())
    } else {
        Cell::Scalar(None)
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_values(lines: &[&str], pos: &mut usize) -> Result<Vec<ValueDef>, TemplateError> {
    let mut values: Vec<ValueDef> = Vec::new();

    while *pos < lines.len() {
        let line = lines[*pos];
        let line_no = *pos + 1;

        if is_comment(line) {
            *pos += 1;
            continue;
        }
        if line.trim().is_empty() {
            *pos += 1;
            if values.is_empty() {
                continue;
            }
            break;
        }
        let Some(rest) = line.strip_prefix("Value ") else {
            break;
        };

        let value = parse_value_line(rest.trim(), line_no)?;
        if values.iter().any(|v| v.name == value.name) {
            return Err(TemplateError::syntax(
                line_no,
                format!("duplicate value '{}'", value.name),
            ));
        }
        values.push(value);
        *pos += 1;
    }

    if values.is_empty() {
        return Err(TemplateError::syntax(*pos, "template declares no values"));
    }
    Ok(values)
}

fn parse_value_line(rest: &str, line_no: usize) -> Result<ValueDef, TemplateError> {
    let (first, after_first) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| TemplateError::syntax(line_no, "expected 'Value [Options] Name (regex)'"))?;
    let after_first = after_first.trim_start();

    let (options, name, pattern) = if after_first.starts_with('(') {
        (None, first, after_first)
    } else {
        let (name, pattern) = after_first.split_once(char::is_whitespace).ok_or_else(|| {
            TemplateError::syntax(line_no, "expected 'Value [Options] Name (regex)'")
        })?;
        (Some(first), name, pattern.trim_start())
    };

    if !is_identifier(name) {
        return Err(TemplateError::syntax(
            line_no,
            format!("invalid value name '{}'", name),
        ));
    }
    let pattern = pattern.trim_end();
    if !(pattern.starts_with('(') && pattern.ends_with(')')) {
        return Err(TemplateError::syntax(
            line_no,
            format!("value '{}' regex must be enclosed in parentheses", name),
        ));
    }
    Regex::new(pattern).map_err(|e| TemplateError::regex(line_no, e))?;

    let mut parsed = ValueOptions::default();
    for option in options.into_iter().flat_map(|o| o.split(',')) {
        match option {
            "Filldown" => parsed.filldown = true,
            "Fillup" => parsed.fillup = true,
            "Required" => parsed.required = true,
            "List" => parsed.list = true,
            "Key" => {}
            other => {
                return Err(TemplateError::syntax(
                    line_no,
                    format!("unknown value option '{}'", other),
                ));
            }
        }
    }

    Ok(ValueDef {
        name: name.to_string(),
        pattern: pattern.to_string(),
        options: parsed,
    })
}

fn parse_states(
    lines: &[&str],
    pos: &mut usize,
    values: &[ValueDef],
) -> Result<HashMap<String, Vec<Rule>>, TemplateError> {
    let mut states: HashMap<String, Vec<Rule>> = HashMap::new();

    while *pos < lines.len() {
        let line = lines[*pos];
        let line_no = *pos + 1;
        *pos += 1;

        if line.trim().is_empty() || is_comment(line) {
            continue;
        }

        let name = line.trim();
        if line.starts_with(char::is_whitespace) || !is_identifier(name) {
            return Err(TemplateError::syntax(
                line_no,
                format!("expected state name, found '{}'", name),
            ));
        }
        if name == END_STATE {
            return Err(TemplateError::syntax(line_no, "'End' state is reserved"));
        }
        if states.contains_key(name) {
            return Err(TemplateError::syntax(
                line_no,
                format!("duplicate state '{}'", name),
            ));
        }

        let mut rules = Vec::new();
        while *pos < lines.len() {
            let rule_line = lines[*pos];
            if rule_line.trim().is_empty() {
                break;
            }
            *pos += 1;
            if is_comment(rule_line) {
                continue;
            }
            rules.push(parse_rule(rule_line.trim(), *pos, values)?);
        }

        if name == EOF_STATE && !rules.is_empty() {
            return Err(TemplateError::syntax(line_no, "'EOF' state must be empty"));
        }
        states.insert(name.to_string(), rules);
    }

    Ok(states)
}

fn parse_rule(text: &str, line_no: usize, values: &[ValueDef]) -> Result<Rule, TemplateError> {
    if !text.starts_with('^') {
        return Err(TemplateError::syntax(
            line_no,
            format!("rule must start with '^': '{}'", text),
        ));
    }

    let (pattern, action) = split_action(text);
    let expanded = expand_values(pattern, values).map_err(|m| TemplateError::syntax(line_no, m))?;
    let regex =
        Regex::new(&format!("^(?:{})", expanded)).map_err(|e| TemplateError::regex(line_no, e))?;

    let mut rule = Rule {
        regex,
        line_op: LineOp::Next,
        record_op: RecordOp::NoRecord,
        new_state: None,
        message: None,
        source_line: line_no,
    };
    if let Some(action) = action {
        parse_action(action.trim(), &mut rule)
            .map_err(|m| TemplateError::syntax(line_no, m))?;
    }
    Ok(rule)
}

/// Splits `^regex -> Action` on the last whitespace-preceded `->`.
fn split_action(text: &str) -> (&str, Option<&str>) {
    let bytes = text.as_bytes();
    let mut split_at = None;
    for i in 1..bytes.len().saturating_sub(1) {
        if bytes[i] == b'-' && bytes[i + 1] == b'>' && bytes[i - 1].is_ascii_whitespace() {
            split_at = Some(i);
        }
    }
    match split_at {
        Some(i) => (text[..i].trim_end(), Some(&text[i + 2..])),
        None => (text, None),
    }
}

fn parse_action(action: &str, rule: &mut Rule) -> Result<(), String> {
    if action.is_empty() {
        return Ok(());
    }

    let (head, tail) = match action.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, Some(tail.trim())),
        None => (action, None),
    };
    let (first, record) = match head.split_once('.') {
        Some((first, record)) => (first, Some(record)),
        None => (head, None),
    };

    let line_op = match first {
        "Next" => Some(LineOp::Next),
        "Continue" => Some(LineOp::Continue),
        "Error" => Some(LineOp::Error),
        _ => None,
    };

    match line_op {
        Some(op) => {
            rule.line_op = op;
            if let Some(record) = record {
                rule.record_op = parse_record_op(record)?;
            }
        }
        None if record.is_some() => return Err(format!("invalid action '{}'", head)),
        None => match parse_record_op(first) {
            Ok(op) => rule.record_op = op,
            Err(_) if is_identifier(first) => {
                if tail.is_some() {
                    return Err(format!("unexpected text after state '{}'", first));
                }
                rule.new_state = Some(first.to_string());
                return Ok(());
            }
            Err(e) => return Err(e),
        },
    }

    if let Some(tail) = tail.filter(|t| !t.is_empty()) {
        if rule.line_op == LineOp::Error {
            rule.message = Some(tail.trim_matches('"').to_string());
        } else if is_identifier(tail) {
            if rule.line_op == LineOp::Continue {
                return Err("'Continue' cannot change state".to_string());
            }
            rule.new_state = Some(tail.to_string());
        } else {
            return Err(format!("invalid state name '{}'", tail));
        }
    }
    Ok(())
}

fn parse_record_op(op: &str) -> Result<RecordOp, String> {
    match op {
        "Record" => Ok(RecordOp::Record),
        "NoRecord" => Ok(RecordOp::NoRecord),
        "Clear" => Ok(RecordOp::Clear),
        "Clearall" => Ok(RecordOp::ClearAll),
        other => Err(format!("unknown record action '{}'", other)),
    }
}

/// Replaces `${Name}` / `$Name` with the value's regex as a named group.
/// `$$` is a literal `$`.
fn expand_values(pattern: &str, values: &[ValueDef]) -> Result<String, String> {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let name = match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
                continue;
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, ch)) => name.push(ch),
                        None => return Err(format!("unterminated '${{' in '{}'", pattern)),
                    }
                }
                name
            }
            Some((_, ch)) if ch.is_ascii_alphabetic() || *ch == '_' => {
                let mut name = String::new();
                while let Some((_, ch)) = chars.peek() {
                    if !(ch.is_ascii_alphanumeric() || *ch == '_') {
                        break;
                    }
                    name.push(*ch);
                    chars.next();
                }
                name
            }
            _ => {
                out.push('$');
                continue;
            }
        };

        let value = values
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| format!("rule references undeclared value '{}'", name))?;
        out.push_str(&format!("(?P<{}>", value.name));
        out.push_str(&value.pattern[1..]);
    }

    Ok(out)
}
