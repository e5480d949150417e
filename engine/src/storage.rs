//! The host storage the reader fills and the writer queries, and its in-memory implementation.

use std::{collections::HashMap, fs, path::Path};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{json, Map, Value as Json};
use thiserror::Error;
use tracing::debug;

use crate::{
    conf::SrsNameFormat,
    geometry::{parse_gml, to_gml32, GeometryValue, SwapCoordinates},
    model::FieldType,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("table {0} already exists")]
    DuplicateTable(String),
    #[error("no table named {0}")]
    UnknownTable(String),
    #[error("no column {column} in table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("corrupt data: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A cell value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime, Option<FixedOffset>),
    Binary(Vec<u8>),
    StringList(Vec<String>),
    IntegerList(Vec<i64>),
    RealList(Vec<f64>),
    BooleanList(Vec<bool>),
    Geometry(Box<GeometryValue>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The XML lexical form of the value. Lists are joined by spaces; `None` for null and
    /// geometries.
    pub fn to_lexical(&self, field_type: FieldType) -> Option<String> {
        Some(match self {
            Self::Null | Self::Geometry(_) => return None,
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Real(r) => crate::geometry::format_number(*r),
            Self::Boolean(b) => b.to_string(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Self::DateTime(dt, offset) => format_datetime(dt, *offset),
            Self::Binary(bytes) if field_type == FieldType::HexBinary => {
                bytes.iter().map(|b| format!("{b:02X}")).collect()
            }
            Self::Binary(bytes) => BASE64.encode(bytes),
            Self::StringList(items) => items.join(" "),
            Self::IntegerList(items) => join(items.iter().map(i64::to_string)),
            Self::RealList(items) => join(items.iter().map(|r| crate::geometry::format_number(*r))),
            Self::BooleanList(items) => join(items.iter().map(bool::to_string)),
        })
    }

    /// The items of a list value, each in lexical form.
    pub fn list_items(&self, field_type: FieldType) -> Vec<String> {
        match self {
            Self::StringList(items) => items.clone(),
            Self::IntegerList(items) => items.iter().map(i64::to_string).collect(),
            Self::RealList(items) => items
                .iter()
                .map(|r| crate::geometry::format_number(*r))
                .collect(),
            Self::BooleanList(items) => items.iter().map(bool::to_string).collect(),
            other => other.to_lexical(field_type).into_iter().collect(),
        }
    }

    fn to_json(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::String(s) => json!(s),
            Self::Integer(i) => json!(i),
            Self::Real(r) => json!(r),
            Self::Boolean(b) => json!(b),
            Self::StringList(items) => json!(items),
            Self::IntegerList(items) => json!(items),
            Self::RealList(items) => json!(items),
            Self::BooleanList(items) => json!(items),
            Self::Geometry(geometry) => {
                match to_gml32(geometry, SrsNameFormat::OgcUrn, "g") {
                    Ok(gml) => json!(gml),
                    Err(e) => {
                        debug!("Cannot encode geometry: {e}");
                        Json::Null
                    }
                }
            }
            other => json!(other.to_lexical(FieldType::Base64Binary)),
        }
    }

    fn from_json(json: &Json, column: &ColumnDef) -> Result<Self, StorageError> {
        let invalid = || StorageError::Corrupt(format!("{json} in column {}", column.name));
        if json.is_null() {
            return Ok(Self::Null);
        }
        if column.is_array {
            let items = json.as_array().ok_or_else(invalid)?;
            return Ok(match column.field_type {
                t if t.is_integer() => Self::IntegerList(
                    items
                        .iter()
                        .map(|i| i.as_i64().ok_or_else(invalid))
                        .collect::<Result<_, _>>()?,
                ),
                t if t.is_real() => Self::RealList(
                    items
                        .iter()
                        .map(|i| i.as_f64().ok_or_else(invalid))
                        .collect::<Result<_, _>>()?,
                ),
                FieldType::Boolean => Self::BooleanList(
                    items
                        .iter()
                        .map(|i| i.as_bool().ok_or_else(invalid))
                        .collect::<Result<_, _>>()?,
                ),
                _ => Self::StringList(
                    items
                        .iter()
                        .map(|i| i.as_str().map(str::to_string).ok_or_else(invalid))
                        .collect::<Result<_, _>>()?,
                ),
            });
        }
        match column.field_type {
            t if t.is_integer() => json.as_i64().map(Self::Integer).ok_or_else(invalid),
            t if t.is_real() => json.as_f64().map(Self::Real).ok_or_else(invalid),
            FieldType::Boolean => json.as_bool().map(Self::Boolean).ok_or_else(invalid),
            FieldType::Geometry => {
                let gml = json.as_str().ok_or_else(invalid)?;
                parse_gml(gml, SwapCoordinates::Auto)
                    .map(|g| Self::Geometry(Box::new(g)))
                    .map_err(|e| StorageError::Corrupt(e.to_string()))
            }
            FieldType::Base64Binary | FieldType::HexBinary => {
                let text = json.as_str().ok_or_else(invalid)?;
                parse_lexical(text, FieldType::Base64Binary).ok_or_else(invalid)
            }
            field_type => {
                let text = json.as_str().ok_or_else(invalid)?;
                Ok(parse_lexical(text, field_type).unwrap_or_else(|| Self::String(text.into())))
            }
        }
    }
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(" ")
}

fn format_datetime(value: &NaiveDateTime, offset: Option<FixedOffset>) -> String {
    let base = value.format("%Y-%m-%dT%H:%M:%S%.f").to_string();
    match offset {
        Some(o) if o.local_minus_utc() == 0 => format!("{base}Z"),
        Some(o) => format!("{base}{o}"),
        None => base,
    }
}

/// Converts the text of an element or attribute to a value of `field_type`, `None` when `text` is
/// not a valid lexical form.
pub fn parse_scalar(text: &str, field_type: FieldType) -> Option<Value> {
    let trimmed = text.trim();
    match field_type {
        t if t.is_integer() => trimmed.parse().ok().map(Value::Integer),
        t if t.is_real() => match trimmed {
            "INF" => Some(Value::Real(f64::INFINITY)),
            "-INF" => Some(Value::Real(f64::NEG_INFINITY)),
            "NaN" => Some(Value::Real(f64::NAN)),
            _ => trimmed.parse().ok().map(Value::Real),
        },
        FieldType::Boolean => match trimmed {
            "true" | "1" => Some(Value::Boolean(true)),
            "false" | "0" => Some(Value::Boolean(false)),
            _ => None,
        },
        FieldType::Date
        | FieldType::Time
        | FieldType::DateTime
        | FieldType::Base64Binary
        | FieldType::HexBinary => parse_lexical(trimmed, field_type),
        _ => Some(Value::String(text.to_string())),
    }
}

/// Converts the items of a space separated list, `None` when one of them is invalid.
pub fn parse_list(text: &str, field_type: FieldType) -> Option<Value> {
    let items = text.split_whitespace();
    Some(match field_type {
        t if t.is_integer() => {
            Value::IntegerList(items.map(|i| i.parse().ok()).collect::<Option<_>>()?)
        }
        t if t.is_real() => Value::RealList(
            items
                .map(|i| match parse_scalar(i, t)? {
                    Value::Real(r) => Some(r),
                    _ => None,
                })
                .collect::<Option<_>>()?,
        ),
        FieldType::Boolean => Value::BooleanList(
            items
                .map(|i| match parse_scalar(i, FieldType::Boolean)? {
                    Value::Boolean(b) => Some(b),
                    _ => None,
                })
                .collect::<Option<_>>()?,
        ),
        _ => Value::StringList(items.map(str::to_string).collect()),
    })
}

/// Parses the lexical form of the date, time and binary types, `None` when `text` is not valid.
pub fn parse_lexical(text: &str, field_type: FieldType) -> Option<Value> {
    let text = text.trim();
    match field_type {
        FieldType::Date => {
            // Dates may carry a time zone, which is dropped
            let date = text.get(..10)?;
            NaiveDate::parse_from_str(date, "%Y-%m-%d").ok().map(Value::Date)
        }
        FieldType::Time => {
            let time = text.trim_end_matches('Z');
            NaiveTime::parse_from_str(time, "%H:%M:%S%.f")
                .ok()
                .map(Value::Time)
        }
        FieldType::DateTime => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                return Some(Value::DateTime(dt.naive_local(), Some(*dt.offset())));
            }
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| Value::DateTime(dt, None))
        }
        FieldType::Base64Binary => BASE64
            .decode(text.split_whitespace().collect::<String>())
            .ok()
            .map(Value::Binary),
        FieldType::HexBinary => {
            if text.len() % 2 != 0 {
                return None;
            }
            (0..text.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
                .collect::<Option<Vec<_>>>()
                .map(Value::Binary)
        }
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub field_type: FieldType,
    pub is_array: bool,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            is_array: false,
            nullable: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<String>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// One record, keyed by column name. A column absent from the row is unset, which the writer
/// distinguishes from an explicit null.
#[derive(Clone, Debug, Default)]
pub struct Row {
    values: Vec<(String, Value)>,
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.values.len() == other.values.len()
            && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        match self.values.iter_mut().find(|(name, _)| *name == column) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((column, value)),
        }
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Tables the reader writes to and the writer reads from.
pub trait Storage {
    fn create_table(&mut self, table: TableDef) -> Result<(), StorageError>;

    fn table(&self, name: &str) -> Option<&TableDef>;

    /// Adds a column to an existing table. Existing rows leave it unset.
    fn add_column(&mut self, table: &str, column: ColumnDef) -> Result<(), StorageError>;

    fn insert(&mut self, table: &str, row: Row) -> Result<(), StorageError>;

    /// Every row of `table`, in insertion order.
    fn rows(&self, table: &str) -> Result<Vec<Row>, StorageError>;

    /// The rows of `table` whose `column` equals `value`, in insertion order.
    fn find(&self, table: &str, column: &str, value: &Value) -> Result<Vec<Row>, StorageError> {
        Ok(self
            .rows(table)?
            .into_iter()
            .filter(|r| r.get(column) == Some(value))
            .collect())
    }

    /// Names of every table, in creation order.
    fn table_names(&self) -> Vec<String>;
}

#[derive(Debug)]
struct Table {
    def: TableDef,
    rows: Vec<Row>,
}

/// Keeps every table in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Vec<Table>,
    by_name: HashMap<String, usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table_index(&self, name: &str) -> Result<usize, StorageError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.by_name
            .get(table)
            .map_or(0, |&i| self.tables[i].rows.len())
    }

    /// Serializes every table, definitions included.
    pub fn to_json(&self) -> Json {
        let tables = self
            .tables
            .iter()
            .map(|table| {
                let columns = table
                    .def
                    .columns
                    .iter()
                    .map(|c| {
                        json!({
                            "name": c.name,
                            "type": c.field_type.as_str(),
                            "array": c.is_array,
                            "nullable": c.nullable,
                        })
                    })
                    .collect::<Vec<_>>();
                let rows = table
                    .rows
                    .iter()
                    .map(|row| {
                        Json::Object(
                            row.iter()
                                .map(|(k, v)| (k.to_string(), v.to_json()))
                                .collect::<Map<_, _>>(),
                        )
                    })
                    .collect::<Vec<_>>();
                json!({
                    "name": table.def.name,
                    "primary_key": table.def.primary_key,
                    "columns": columns,
                    "rows": rows,
                })
            })
            .collect::<Vec<_>>();
        json!({ "tables": tables })
    }

    pub fn from_json(json: &Json) -> Result<Self, StorageError> {
        let invalid = |what: &str| StorageError::Corrupt(what.to_string());
        let mut store = Self::new();
        let tables = json
            .get("tables")
            .and_then(Json::as_array)
            .ok_or_else(|| invalid("missing tables"))?;
        for table in tables {
            let name = table
                .get("name")
                .and_then(Json::as_str)
                .ok_or_else(|| invalid("table without name"))?;
            let mut columns = Vec::new();
            for column in table
                .get("columns")
                .and_then(Json::as_array)
                .ok_or_else(|| invalid("table without columns"))?
            {
                let column_name = column
                    .get("name")
                    .and_then(Json::as_str)
                    .ok_or_else(|| invalid("column without name"))?;
                let type_name = column.get("type").and_then(Json::as_str).unwrap_or("string");
                columns.push(ColumnDef {
                    name: column_name.to_string(),
                    field_type: FieldType::from_xsd_name(type_name),
                    is_array: column.get("array").and_then(Json::as_bool).unwrap_or(false),
                    nullable: column.get("nullable").and_then(Json::as_bool).unwrap_or(true),
                });
            }
            let def = TableDef {
                name: name.to_string(),
                columns,
                primary_key: table
                    .get("primary_key")
                    .and_then(Json::as_str)
                    .map(str::to_string),
            };
            let rows = table
                .get("rows")
                .and_then(Json::as_array)
                .cloned()
                .unwrap_or_default();
            store.create_table(def.clone())?;
            for json_row in rows {
                let object = json_row
                    .as_object()
                    .ok_or_else(|| invalid("row is not an object"))?;
                let mut row = Row::new();
                for (key, value) in object {
                    let column = def.column(key).ok_or_else(|| StorageError::UnknownColumn {
                        table: name.to_string(),
                        column: key.clone(),
                    })?;
                    row.set(key.clone(), Value::from_json(value, column)?);
                }
                store.insert(name, row)?;
            }
        }
        Ok(store)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        fs::write(path, serde_json::to_string_pretty(&self.to_json())?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&serde_json::from_str(&text)?)
    }
}

impl Storage for MemoryStore {
    fn create_table(&mut self, table: TableDef) -> Result<(), StorageError> {
        if self.by_name.contains_key(&table.name) {
            return Err(StorageError::DuplicateTable(table.name));
        }
        self.by_name.insert(table.name.clone(), self.tables.len());
        self.tables.push(Table {
            def: table,
            rows: Vec::new(),
        });
        Ok(())
    }

    fn table(&self, name: &str) -> Option<&TableDef> {
        self.by_name.get(name).map(|&i| &self.tables[i].def)
    }

    fn add_column(&mut self, table: &str, column: ColumnDef) -> Result<(), StorageError> {
        let index = self.table_index(table)?;
        let def = &mut self.tables[index].def;
        if def.column(&column.name).is_none() {
            def.columns.push(column);
        }
        Ok(())
    }

    fn insert(&mut self, table: &str, row: Row) -> Result<(), StorageError> {
        let index = self.table_index(table)?;
        let table = &mut self.tables[index];
        if let Some((column, _)) = row.iter().find(|(k, _)| table.def.column(k).is_none()) {
            return Err(StorageError::UnknownColumn {
                table: table.def.name.clone(),
                column: column.to_string(),
            });
        }
        table.rows.push(row);
        Ok(())
    }

    fn rows(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        Ok(self.tables[self.table_index(table)?].rows.clone())
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.def.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::geometry::{Coord, Geometry};

    fn sample_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        let mut values = ColumnDef::new("values", FieldType::Int32);
        values.is_array = true;
        store
            .create_table(TableDef {
                name: "Item".into(),
                columns: vec![
                    ColumnDef::new("id", FieldType::Id),
                    ColumnDef::new("when", FieldType::DateTime),
                    ColumnDef::new("blob", FieldType::HexBinary),
                    ColumnDef::new("where", FieldType::Geometry),
                    values,
                ],
                primary_key: Some("id".into()),
            })
            .unwrap();
        let mut row = Row::new();
        row.set("id", Value::String("i1".into()));
        row.set(
            "when",
            parse_lexical("2024-03-01T10:00:00Z", FieldType::DateTime).unwrap(),
        );
        row.set("blob", parse_lexical("CAFE", FieldType::HexBinary).unwrap());
        row.set(
            "where",
            Value::Geometry(Box::new(GeometryValue {
                geometry: Geometry::Point(Coord::xy(2.0, 49.0)),
                srs_name: Some("urn:ogc:def:crs:EPSG::4326".into()),
            })),
        );
        row.set("values", Value::IntegerList(vec![1, 2]));
        store.insert("Item", row).unwrap();
        store
    }

    #[test]
    fn lexical_forms() {
        let dt = parse_lexical("2024-03-01T10:00:00+02:00", FieldType::DateTime).unwrap();
        assert_eq!(
            dt.to_lexical(FieldType::DateTime).as_deref(),
            Some("2024-03-01T10:00:00+02:00")
        );
        let date = parse_lexical("2024-03-01Z", FieldType::Date).unwrap();
        assert_eq!(date.to_lexical(FieldType::Date).as_deref(), Some("2024-03-01"));
        assert_eq!(parse_lexical("2024-13-01", FieldType::Date), None);
        let binary = parse_lexical("SGVsbG8=", FieldType::Base64Binary).unwrap();
        assert_eq!(binary, Value::Binary(b"Hello".to_vec()));
        assert_eq!(parse_lexical("ABC", FieldType::HexBinary), None);
        assert_eq!(
            Value::IntegerList(vec![1, 2]).to_lexical(FieldType::Int32).as_deref(),
            Some("1 2")
        );
    }

    #[test]
    fn scalar_conversion() {
        assert_eq!(parse_scalar(" 12 ", FieldType::Int64), Some(Value::Integer(12)));
        assert_eq!(parse_scalar("12x", FieldType::Int32), None);
        assert_eq!(
            parse_scalar("-INF", FieldType::Double),
            Some(Value::Real(f64::NEG_INFINITY))
        );
        assert_eq!(parse_scalar("1", FieldType::Boolean), Some(Value::Boolean(true)));
        assert_eq!(parse_scalar(" a ", FieldType::String), Some(Value::String(" a ".into())));
        assert_eq!(
            parse_list("1.5 2", FieldType::Double),
            Some(Value::RealList(vec![1.5, 2.0]))
        );
        assert_eq!(parse_list("1 x", FieldType::Int32), None);
    }

    #[test]
    fn rows_and_queries() {
        let mut store = sample_store();
        assert_eq!(store.row_count("Item"), 1);
        let found = store
            .find("Item", "id", &Value::String("i1".into()))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].get("missing").is_none());

        let mut bad = Row::new();
        bad.set("nope", Value::Null);
        assert!(matches!(
            store.insert("Item", bad),
            Err(StorageError::UnknownColumn { .. })
        ));
        assert!(matches!(
            store.rows("Other"),
            Err(StorageError::UnknownTable(_))
        ));
        store
            .add_column("Item", ColumnDef::new("extra", FieldType::String))
            .unwrap();
        assert!(store.table("Item").unwrap().column("extra").is_some());
    }

    #[test]
    fn json_dump_reloads() {
        let store = sample_store();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        store.save(&path).unwrap();
        let reloaded = MemoryStore::load(&path).unwrap();
        assert_eq!(reloaded.table_names(), ["Item"]);
        assert_eq!(reloaded.rows("Item").unwrap(), store.rows("Item").unwrap());
    }
}
