//! InfluxDB line protocol rendering.
//!
//! ```text
//! show_interface,intf_name=eth0,host=sw1 rx=100,descr="uplink" 1700000000
//! └─ measurement ─┘└────── tags ───────┘ └──────── fields ───────┘└─ ts ─┘
//! ```
//!
//! Promoted tags come first in name order, `host` always last. Tag values are
//! written bare; field values keep their coerced type (quoted text, bare
//! numbers). InfluxDB rejects empty tag values and empty field keys, so those
//! are left out.

use crate::coerce::FieldValue;
use crate::record::{DataPoint, HOST_TAG};

/// Renders one point as a single line without a trailing newline.
///
/// Returns `None` for a point without (non-empty) fields, which line protocol
/// cannot express.
pub fn render_point(point: &DataPoint, with_timestamp: bool) -> Option<String> {
    let fields: Vec<String> = point
        .fields
        .iter()
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| format!("{}={}", escape_key(name), render_field(value)))
        .collect();
    if fields.is_empty() {
        return None;
    }

    let mut line = escape(&point.measurement, &[',', ' ']);

    let tags = point
        .tags
        .iter()
        .filter(|(name, _)| name.as_str() != HOST_TAG)
        .chain(point.tags.get_key_value(HOST_TAG))
        .filter(|(name, value)| !name.is_empty() && !value.is_empty());
    for (name, value) in tags {
        line.push(',');
        line.push_str(&escape_key(name));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');
    line.push_str(&fields.join(","));

    if with_timestamp {
        line.push(' ');
        line.push_str(&point.timestamp.to_string());
    }

    Some(line)
}

/// Renders points one per line, skipping those without fields.
pub fn render_points<'a>(points: impl IntoIterator<Item = &'a DataPoint>, with_timestamp: bool) -> String {
    let mut out = String::new();
    for line in points.into_iter().filter_map(|p| render_point(p, with_timestamp)) {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn render_field(value: &FieldValue) -> String {
    match value {
        FieldValue::Number(_) => value.render_quoted(),
        FieldValue::Text(s) => FieldValue::Text(s.replace('\n', "\\n")).render_quoted(),
    }
}

fn escape_key(raw: &str) -> String {
    escape(raw, &[',', '=', ' '])
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
