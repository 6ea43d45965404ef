//! Value coercion for parsed fields.
//!
//! Device output is scraped as text. Anything that reads losslessly as a number
//! is stored as `f64` so the metrics backend can aggregate it; everything else
//! is kept verbatim.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A field or tag value after coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Coerces raw text into a value.
    ///
    /// The whole string must parse as a finite float (integers included).
    /// `"nan"`, `"inf"`, padded numbers and empty strings stay text.
    pub fn coerce(raw: &str) -> Self {
        match raw.parse::<f64>() {
            Ok(n) if n.is_finite() && !has_padding(raw) => FieldValue::Number(n),
            _ => FieldValue::Text(raw.to_string()),
        }
    }

    /// Re-applies coercion. Numbers are left alone, text is re-examined.
    pub fn recoerce(self) -> Self {
        match self {
            FieldValue::Text(s) => FieldValue::coerce(&s),
            number => number,
        }
    }

    /// Renders the value as a line-protocol field value.
    ///
    /// Text is wrapped in double quotes with `"` and `\` escaped,
    /// numbers are emitted bare.
    pub fn render_quoted(&self) -> String {
        match self {
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                out.push('"');
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
                out
            }
        }
    }
}

fn has_padding(raw: &str) -> bool {
    raw.trim() != raw
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(raw: &str) -> Self {
        FieldValue::coerce(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_integers_and_floats() {
        assert_eq!(FieldValue::coerce("100"), FieldValue::Number(100.0));
        assert_eq!(FieldValue::coerce("100.10"), FieldValue::Number(100.10));
        assert_eq!(FieldValue::coerce("-3"), FieldValue::Number(-3.0));
        assert_eq!(FieldValue::coerce("1e3"), FieldValue::Number(1000.0));
    }

    #[test]
    fn test_coerce_keeps_text() {
        assert_eq!(FieldValue::coerce("abc"), FieldValue::Text("abc".into()));
        assert_eq!(FieldValue::coerce("eth0"), FieldValue::Text("eth0".into()));
        assert_eq!(FieldValue::coerce("10.0.0.1"), FieldValue::Text("10.0.0.1".into()));
        assert_eq!(FieldValue::coerce(""), FieldValue::Text(String::new()));
        assert_eq!(FieldValue::coerce(" 12"), FieldValue::Text(" 12".into()));
    }

    #[test]
    fn test_coerce_rejects_non_finite() {
        assert_eq!(FieldValue::coerce("nan"), FieldValue::Text("nan".into()));
        assert_eq!(FieldValue::coerce("inf"), FieldValue::Text("inf".into()));
        assert_eq!(FieldValue::coerce("-infinity"), FieldValue::Text("-infinity".into()));
    }

    #[test]
    fn test_coerce_is_idempotent() {
        for raw in ["42", "4.2", "up", "1/2", "0x10", "-0"] {
            let once = FieldValue::coerce(raw);
            let twice = once.clone().recoerce();
            assert_eq!(once, twice, "coercion of {raw:?} is not stable");
        }
    }

    #[test]
    fn test_render_quoted() {
        assert_eq!(FieldValue::coerce("hello").render_quoted(), r#""hello""#);
        assert_eq!(FieldValue::Text("12345".into()).render_quoted(), r#""12345""#);
        assert_eq!(FieldValue::coerce("12345").render_quoted(), "12345");
        assert_eq!(FieldValue::coerce("0.5").render_quoted(), "0.5");
        assert_eq!(
            FieldValue::Text(r#"say "hi" \o/"#.into()).render_quoted(),
            r#""say \"hi\" \\o/""#
        );
    }

    #[test]
    fn test_render_is_stable() {
        for raw in ["7", "up", "2.25"] {
            let value = FieldValue::coerce(raw);
            let rendered = value.render_quoted();
            assert_eq!(value.clone().recoerce().render_quoted(), rendered);
        }
    }

    #[test]
    fn test_serialize_untagged() {
        let values = vec![FieldValue::Number(1.5), FieldValue::Text("up".into())];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[1.5,"up"]"#);
    }
}
