//! Delimited text parser.
//!
//! Handles tools that already print tables, e.g. F5 `tmctl -c`:
//!
//! ```text
//! name,packets_in,packets_out
//! pva0,1200,900
//!
//! [user@F5-TEST:Active] ~ #
//! ```
//!
//! The first line is the header. Every following line up to the first blank
//! line is a data row; whatever comes after the blank line (banners, prompts)
//! is discarded.

use super::{FlatRecord, ParseError, ParsedTable};

pub const DEFAULT_DELIMITER: char = ',';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimitedParser {
    delimiter: char,
}

impl Default for DelimitedParser {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

impl DelimitedParser {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Parses a header-plus-rows table.
    ///
    /// Leading blank lines are skipped. Rows whose cell count differs from the
    /// header are rejected as [`ParseError::MalformedRow`]; the other rows are
    /// still returned.
    pub fn parse(&self, raw: &str) -> ParsedTable {
        let mut table = ParsedTable::default();
        let mut lines = raw
            .lines()
            .enumerate()
            .skip_while(|(_, line)| line.trim().is_empty());

        let Some((_, header_line)) = lines.next() else {
            return table;
        };
        let header: Vec<String> = self
            .split(header_line)
            .map(|name| name.to_lowercase())
            .collect();

        for (idx, line) in lines {
            if line.trim().is_empty() {
                break;
            }

            let cells: Vec<&str> = self.split(line).collect();
            if cells.len() != header.len() {
                table.rejected.push(ParseError::MalformedRow {
                    line: idx + 1,
                    expected: header.len(),
                    found: cells.len(),
                });
                continue;
            }

            let record: FlatRecord = header
                .iter()
                .cloned()
                .zip(cells.into_iter().map(str::to_string))
                .collect();
            table.records.push(record);
        }

        table
    }

    fn split<'a>(&self, line: &'a str) -> impl Iterator<Item = &'a str> {
        line.split(self.delimiter).map(str::trim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stops_at_blank_line() {
        let raw = "a,b,c\n1,2,3\n\n[user@F5-TEST:Active] ~ # \n";
        let table = DelimitedParser::default().parse(raw);

        assert_eq!(table.records.len(), 1);
        assert!(table.rejected.is_empty());
        let record = &table.records[0];
        assert_eq!(record["a"], "1");
        assert_eq!(record["b"], "2");
        assert_eq!(record["c"], "3");
    }

    #[test]
    fn test_parse_multiple_rows_crlf() {
        let raw = "Name,Packets_In\r\npva0,10\r\npva1,20\r\n";
        let table = DelimitedParser::default().parse(raw);

        assert_eq!(table.records.len(), 2);
        assert_eq!(table.records[0]["name"], "pva0");
        assert_eq!(table.records[1]["packets_in"], "20");
    }

    #[test]
    fn test_parse_malformed_row_is_rejected_not_fatal() {
        let raw = "a,b,c\n1,2\n4,5,6\n";
        let table = DelimitedParser::default().parse(raw);

        assert_eq!(table.records.len(), 1);
        assert_eq!(table.records[0]["a"], "4");
        assert_eq!(
            table.rejected,
            vec![ParseError::MalformedRow {
                line: 2,
                expected: 3,
                found: 2
            }]
        );
    }

    #[test]
    fn test_parse_header_only() {
        let table = DelimitedParser::default().parse("a,b,c\n");
        assert!(table.records.is_empty());
        assert!(table.rejected.is_empty());
    }

    #[test]
    fn test_parse_empty_input() {
        let table = DelimitedParser::default().parse("");
        assert!(table.records.is_empty());
        let table = DelimitedParser::default().parse("\n\n");
        assert!(table.records.is_empty());
    }

    #[test]
    fn test_parse_custom_delimiter() {
        let parser = DelimitedParser::new(';');
        let table = parser.parse("\nif;rx\neth0;100\n");
        assert_eq!(parser.delimiter(), ';');
        assert_eq!(table.records.len(), 1);
        assert_eq!(table.records[0]["if"], "eth0");
        assert_eq!(table.records[0]["rx"], "100");
    }
}
