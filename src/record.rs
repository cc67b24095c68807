// ABOUTME: Schema-free row representation shared by every source and destination
// ABOUTME: Ordered column-to-JSON-scalar mapping with conflict-key identity helpers

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{Map, Value};

/// One row of a table, keyed by column name in source column order
///
/// Values are JSON scalars (string, number, boolean, null). Timestamps travel
/// as ISO-8601 strings; json/jsonb columns may carry nested values. The column
/// set is whatever the source row held, nothing is fixed per table.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a record from a JSON object, rejecting any other JSON shape
    ///
    /// # Examples
    ///
    /// ```
    /// # use pg_table_migrator::record::Record;
    /// # use serde_json::json;
    /// let record = Record::from_json(json!({"id": 7, "title": "Verbs"})).unwrap();
    /// assert_eq!(record.identity(&["id".to_string()]), "id=7");
    /// assert!(Record::from_json(json!([1, 2])).is_err());
    /// ```
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => bail!(
                "Expected a JSON object for a row, got {}",
                json_kind(&other)
            ),
        }
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(column.into(), value)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render the conflict-key columns for log lines, e.g. `id=7` or `user_id=3,badge_id=9`
    pub fn identity(&self, conflict_key: &[String]) -> String {
        conflict_key
            .iter()
            .map(|column| match self.0.get(column) {
                Some(Value::String(s)) => format!("{}={}", column, s),
                Some(Value::Null) => format!("{}=null", column),
                Some(value) => format!("{}={}", column, value),
                None => format!("{}=<missing>", column),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn into_json(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Ordered union of the column names of a batch, in first-seen order
pub fn column_union(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for column in record.columns() {
            if !columns.iter().any(|c| c == column) {
                columns.push(column.to_string());
            }
        }
    }
    columns
}

/// Serialize a batch as a JSON array, the shape PostgREST and `json_populate_recordset` expect
pub fn records_to_json_array(records: &[Record]) -> Value {
    Value::Array(
        records
            .iter()
            .map(|record| Value::Object(record.0.clone()))
            .collect(),
    )
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
