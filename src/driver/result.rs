//! Result decoding for the simple query protocol.
//!
//! The simple protocol returns every value in text format, so rows are
//! surfaced as nullable strings.

use bytes::Bytes;
use serde::Serialize;
use tracing::warn;

use super::Event;
use crate::protocol::FieldDescription;

/// Column metadata from RowDescription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub table_oid: u32,
    pub column_attr: i16,
    pub format: i16,
}

impl From<FieldDescription> for Column {
    fn from(field: FieldDescription) -> Self {
        Self {
            name: field.name,
            type_oid: field.type_oid,
            type_size: field.type_size,
            type_modifier: field.type_modifier,
            table_oid: field.table_oid,
            column_attr: field.column_attr,
            format: field.format,
        }
    }
}

/// One DataRow; `None` is SQL NULL, distinct from an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    pub values: Vec<Option<String>>,
}

impl Row {
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.values.get(idx)?.as_deref()
    }

    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.values.get(idx), Some(None))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Pipe-joined text; NULL renders as an empty field.
    pub fn render(&self) -> String {
        self.values
            .iter()
            .map(|v| v.as_deref().unwrap_or(""))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Rows of one command, alive between RowDescription and CommandComplete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// Rows as JSON objects keyed by column name.
    pub fn to_json(&self) -> serde_json::Value {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let object = self
                    .columns
                    .iter()
                    .zip(&row.values)
                    .map(|(col, value)| {
                        let value = value
                            .clone()
                            .map_or(serde_json::Value::Null, serde_json::Value::String);
                        (col.name.clone(), value)
                    })
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(object)
            })
            .collect();
        serde_json::Value::Array(rows)
    }
}

/// Turns post-authentication result frames into events.
#[derive(Debug, Default)]
pub struct ResultDecoder {
    current: Option<ResultSet>,
}

impl ResultDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_row_description(&mut self, fields: Vec<FieldDescription>) -> Event {
        let columns: Vec<Column> = fields.into_iter().map(Column::from).collect();
        self.current = Some(ResultSet {
            columns: columns.clone(),
            rows: Vec::new(),
        });
        Event::RowDescription(columns)
    }

    pub fn on_data_row(&mut self, values: Vec<Option<Bytes>>) -> Event {
        let row = Row {
            values: values
                .into_iter()
                .map(|v| v.map(|b| String::from_utf8_lossy(&b).into_owned()))
                .collect(),
        };
        match self.current.as_mut() {
            Some(set) => {
                if set.columns.len() != row.len() {
                    warn!(
                        expected = set.columns.len(),
                        got = row.len(),
                        "DataRow width differs from RowDescription"
                    );
                }
                set.rows.push(row.clone());
            }
            None => warn!("DataRow without RowDescription"),
        }
        Event::Row(row)
    }

    /// Close the current result set, if any, and hand it over.
    pub fn on_command_complete(&mut self, tag: String) -> Event {
        Event::CommandComplete {
            tag,
            result: self.current.take(),
        }
    }

    /// Drop a partially received result (error or empty query).
    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }
}

/// Affected rows from a CommandComplete tag.
/// Examples: "INSERT 0 1" → 1, "UPDATE 5" → 5, "DELETE 10" → 10
pub fn parse_affected_rows(tag: &str) -> Option<u64> {
    tag.split_whitespace().last().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(name: &str) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: 25,
            type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }

    #[test]
    fn test_two_columns_value_and_null_render() {
        let mut decoder = ResultDecoder::new();
        decoder.on_row_description(vec![field("id"), field("note")]);
        let Event::Row(row) = decoder.on_data_row(vec![Some(Bytes::from_static(b"1")), None])
        else {
            panic!("expected a row");
        };
        assert_eq!(row.render(), "1 | ");
        assert!(row.is_null(1));
        assert_eq!(row.get(0), Some("1"));
    }

    #[test]
    fn test_null_distinct_from_empty() {
        let mut decoder = ResultDecoder::new();
        let Event::Row(row) = decoder.on_data_row(vec![Some(Bytes::new()), None]) else {
            panic!("expected a row");
        };
        assert_eq!(row.values, vec![Some(String::new()), None]);
        assert!(!row.is_null(0));
        assert!(row.is_null(1));
    }

    #[test]
    fn test_result_set_lifecycle() {
        let mut decoder = ResultDecoder::new();
        decoder.on_row_description(vec![field("name")]);
        decoder.on_data_row(vec![Some(Bytes::from_static(b"alice"))]);
        decoder.on_data_row(vec![Some(Bytes::from_static(b"bob"))]);
        assert!(decoder.in_progress());

        let Event::CommandComplete { tag, result } = decoder.on_command_complete("SELECT 2".into())
        else {
            panic!("expected completion");
        };
        assert_eq!(tag, "SELECT 2");
        let result = result.unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[1].render(), "bob");
        assert!(!decoder.in_progress());
    }

    #[test]
    fn test_command_without_rows() {
        let mut decoder = ResultDecoder::new();
        let event = decoder.on_command_complete("INSERT 0 3".into());
        assert_eq!(
            event,
            Event::CommandComplete {
                tag: "INSERT 0 3".into(),
                result: None
            }
        );
        assert_eq!(parse_affected_rows("INSERT 0 3"), Some(3));
        assert_eq!(parse_affected_rows("BEGIN"), None);
    }

    #[test]
    fn test_json_rendering() {
        let set = ResultSet {
            columns: vec![field("id").into(), field("note").into()],
            rows: vec![Row {
                values: vec![Some("1".into()), None],
            }],
        };
        assert_eq!(
            set.to_json(),
            serde_json::json!([{ "id": "1", "note": null }])
        );
    }
}
