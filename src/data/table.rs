use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

use crate::errors::{Error, Result};

const FLOAT_COLUMNS: [&str; 2] = ["lon", "lat"];
const TIMESTAMP_COLUMN: &str = "timestamp";
const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// A single cell. Everything read from XML starts out as `Text`; typed
/// variants only appear through coercion or generated columns.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    /// Milliseconds since the Unix epoch, UTC.
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(millis) => DateTime::from_timestamp_millis(*millis),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Text(text) => serializer.serialize_str(text),
            Value::Integer(value) => serializer.serialize_i64(*value),
            Value::Float(value) => serializer.serialize_f64(*value),
            Value::Timestamp(_) => match self.as_datetime() {
                Some(datetime) => serializer.serialize_str(&datetime.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                None => serializer.serialize_unit(),
            },
        }
    }
}

/// Parse an OSM timestamp into milliseconds since the epoch. Offset-less
/// forms are taken as UTC; digits past the millisecond are truncated.
pub fn parse_timestamp(text: &str) -> Result<i64> {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(text) {
        return Ok(datetime.timestamp_millis());
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    Err(Error::coercion(format!("timestamp {:?} is not a recognised date-time", text)))
}

/// A flat, ordered key/value mapping for one primitive. Inserting an existing
/// key replaces its value in place, so key order is first-seen order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Record {
        Record::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// Rows sharing one column schema. Columns are the union of keys over all
/// rows that went into the table, and a row lacking a key holds `Null`.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Serialize, Debug, Clone, PartialEq, Default)]
#[archive(check_bytes)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = TableRow<'_>> {
        self.rows.iter().map(move |values| TableRow { table: self, values })
    }

    pub fn row(&self, index: usize) -> Option<TableRow<'_>> {
        self.rows.get(index).map(|values| TableRow { table: self, values })
    }

    /// All values of one column in row order, or `None` if there is no such column.
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Value>> {
        let index = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| &row[index]))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TableRow<'a> {
    table: &'a Table,
    values: &'a [Value],
}

impl<'a> TableRow<'a> {
    /// The cell under `column`; `None` only when the table has no such column.
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        let values = self.values;
        self.table.column_index(column).map(|index| &values[index])
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn columns(&self) -> &'a [String] {
        &self.table.columns
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a Value)> {
        let table: &'a Table = self.table;
        let values: &'a [Value] = self.values;
        table.columns.iter()
            .map(String::as_str)
            .zip(values.iter())
    }
}

/// Accumulates records of one kind and assembles them into a `Table`.
#[derive(Debug, Default)]
pub struct TableBuilder {
    records: Vec<Record>,
}

impl TableBuilder {
    pub fn new() -> TableBuilder {
        TableBuilder::default()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Assemble the table, then coerce `lon`/`lat` to finite floats and
    /// `timestamp` to a date-time. Text that does not coerce fails the whole
    /// table.
    pub fn build(self) -> Result<Table> {
        let mut columns: Vec<String> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for record in &self.records {
            for key in record.keys() {
                if !positions.contains_key(key) {
                    positions.insert(key.to_string(), columns.len());
                    columns.push(key.to_string());
                }
            }
        }

        let mut rows = Vec::with_capacity(self.records.len());
        for record in self.records {
            let mut row = vec![Value::Null; columns.len()];
            for (key, value) in record {
                row[positions[&key]] = value;
            }
            rows.push(row);
        }

        let mut table = Table { columns, rows };
        for column in FLOAT_COLUMNS {
            table.coerce(column, |text| {
                let value = text.trim().parse::<f64>()
                    .map_err(|err| Error::coercion(err.to_string()))?;
                if !value.is_finite() {
                    return Err(Error::coercion("not a finite number"));
                }
                Ok(Value::Float(value))
            })?;
        }
        table.coerce(TIMESTAMP_COLUMN, |text| parse_timestamp(text).map(Value::Timestamp))?;
        Ok(table)
    }
}

impl Table {
    fn coerce<F>(&mut self, column: &str, convert: F) -> Result<()>
    where
        F: Fn(&str) -> Result<Value>,
    {
        let Some(index) = self.column_index(column) else {
            return Ok(());
        };
        for (row_number, row) in self.rows.iter_mut().enumerate() {
            let converted = match &row[index] {
                Value::Text(text) => convert(text).map_err(|err| Error::coercion(format!(
                    "column {:?}, row {}: cannot convert {:?}: {}",
                    column, row_number, text, err.message,
                )))?,
                _ => continue,
            };
            row[index] = converted;
        }
        Ok(())
    }
}
