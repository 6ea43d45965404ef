//! Normalized data points.
//!
//! Every parsed row, whichever parser produced it, becomes one [`DataPoint`]:
//!
//! ```text
//! FlatRecord {intf_name: "eth0", rx: "100"}      CommandSpec "show interface:intf_name"
//!            │                                              │
//!            └──────────────► build_point ◄─────────────────┘
//!                                  │
//!   DataPoint { measurement: "show_interface",
//!               tags:   {host: "sw1", intf_name: "eth0"},
//!               fields: {rx: 100.0},
//!               timestamp }
//! ```

use std::collections::BTreeMap;

use serde::Serialize;

use crate::coerce::FieldValue;
use crate::command::CommandSpec;
use crate::parser::FlatRecord;

/// Tag always attached to every point.
pub const HOST_TAG: &str = "host";

/// One timestamped measurement ready for emission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub measurement: String,
    /// Tag values are kept verbatim.
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Unix epoch seconds.
    pub timestamp: i64,
}

impl DataPoint {
    pub fn host(&self) -> Option<&str> {
        self.tags.get(HOST_TAG).map(String::as_str)
    }
}

/// Points produced by one poll cycle of one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Batch {
    pub host: String,
    pub points: Vec<DataPoint>,
}

impl Batch {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            points: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Measurement name for a command: whitespace runs become one underscore.
pub fn measurement_name(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Builds a point from one parsed row.
///
/// The row is left untouched. If `spec` names a tag field that the row does
/// not contain, the point is still produced with only the `host` tag.
pub fn build_point(
    record: &FlatRecord,
    spec: &CommandSpec,
    hostname: &str,
    timestamp: i64,
) -> DataPoint {
    let mut tags = BTreeMap::new();
    tags.insert(HOST_TAG.to_string(), hostname.to_string());

    let tag_field = spec.tag_field().filter(|tag| record.contains_key(*tag));
    if let Some(tag) = tag_field {
        tags.insert(tag.to_string(), record[tag].clone());
    }

    let fields = record
        .iter()
        .filter(|(name, _)| Some(name.as_str()) != tag_field)
        .map(|(name, raw)| (name.clone(), FieldValue::coerce(raw)))
        .collect();

    DataPoint {
        measurement: measurement_name(spec.command()),
        tags,
        fields,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> FlatRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_measurement_name() {
        assert_eq!(measurement_name("show interface"), "show_interface");
        assert_eq!(measurement_name("tmctl  -c\tpva_stat"), "tmctl_-c_pva_stat");
        assert_eq!(measurement_name("uptime"), "uptime");
    }

    #[test]
    fn test_build_point_promotes_tag() {
        let row = record(&[("intf_name", "eth0"), ("rx", "100")]);
        let spec = CommandSpec::parse("show interface:intf_name").unwrap();

        let point = build_point(&row, &spec, "sw1", 1_700_000_000);

        assert_eq!(point.measurement, "show_interface");
        assert_eq!(point.tags.len(), 2);
        assert_eq!(point.tags["host"], "sw1");
        assert_eq!(point.tags["intf_name"], "eth0");
        assert_eq!(point.fields.len(), 1);
        assert_eq!(point.fields["rx"], FieldValue::Number(100.0));
        assert_eq!(point.timestamp, 1_700_000_000);

        // Input row is not consumed.
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_build_point_missing_tag_field_is_lenient() {
        let row = record(&[("rx", "5")]);
        let spec = CommandSpec::parse("show interface:intf_name").unwrap();

        let point = build_point(&row, &spec, "sw1", 0);

        assert_eq!(point.tags.len(), 1);
        assert!(point.host().is_some());
        assert_eq!(point.fields["rx"], FieldValue::Number(5.0));
    }

    #[test]
    fn test_build_point_tag_value_is_verbatim() {
        let row = record(&[("vlan", "007"), ("name", "users")]);
        let spec = CommandSpec::parse("show vlan:vlan").unwrap();

        let point = build_point(&row, &spec, "sw1", 0);

        assert_eq!(point.tags["vlan"], "007");
        assert!(!point.fields.contains_key("vlan"));
        assert_eq!(point.fields["name"], FieldValue::Text("users".into()));
    }

    #[test]
    fn test_build_point_without_tag() {
        let row = record(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let spec = CommandSpec::parse("tmctl -c pva_stat").unwrap();

        let point = build_point(&row, &spec, "f5", 42);

        assert_eq!(point.measurement, "tmctl_-c_pva_stat");
        assert_eq!(point.fields["a"], FieldValue::Number(1.0));
        assert_eq!(point.fields["b"], FieldValue::Number(2.0));
        assert_eq!(point.fields["c"], FieldValue::Number(3.0));
    }
}
