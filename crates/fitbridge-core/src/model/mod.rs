//! Persisted entities
//!
//! Every entity declares its table, its ordered column list and the mapping
//! from storage column to in-memory field. Rows are hydrated through serde:
//! a row becomes a JSON object keyed by field name, which is then
//! deserialized into the typed struct. Writes go the other way.

mod device;
mod output;
mod session;
mod user;
mod view;

pub use device::Device;
pub use output::{HrDeviceOutput, KeiserM3iOutput, Sample};
pub use session::Session;
pub use user::User;
pub use view::{Label, View};

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::{EntityError, FitError, Result};
use crate::storage::Database;

// ----------------------------------------------------------------------------
// Column Mapping
// ----------------------------------------------------------------------------

/// Storage affinity of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Bool,
    /// Structured value stored as JSON text
    Json,
}

/// One storage column and the field it hydrates
#[derive(Debug, Clone, Copy)]
pub struct Column {
    /// Name in the table
    pub name: &'static str,
    /// Name of the struct field
    pub field: &'static str,
    pub kind: ColumnKind,
}

impl Column {
    /// Column whose storage name equals the field name
    pub const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            field: name,
            kind,
        }
    }

    /// Column stored under a different name than its field
    pub const fn aliased(name: &'static str, field: &'static str, kind: ColumnKind) -> Self {
        Self { name, field, kind }
    }

    /// Fields named `*settings` or `*conf` are always stored as JSON text
    pub fn stores_json(&self) -> bool {
        self.kind == ColumnKind::Json
            || self.field.ends_with("settings")
            || self.field.ends_with("conf")
    }

    /// Quoted identifier, safe for reserved words such as `order`
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.name)
    }

    /// Convert a field value to a bindable SQL value
    pub fn to_sql(&self, value: Option<&Value>) -> Result<SqlValue> {
        let value = match value {
            None | Some(Value::Null) => return Ok(SqlValue::Null),
            Some(v) => v,
        };
        if self.stores_json() {
            return Ok(SqlValue::Text(serde_json::to_string(value)?));
        }
        let converted = match (self.kind, value) {
            (ColumnKind::Bool, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
            (ColumnKind::Bool, Value::Number(n)) => {
                SqlValue::Integer(i64::from(n.as_f64().unwrap_or_default() != 0.0))
            }
            (ColumnKind::Integer, Value::Number(n)) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Integer(n.as_f64().unwrap_or_default().round() as i64),
            },
            (ColumnKind::Integer, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
            (ColumnKind::Real, Value::Number(n)) => SqlValue::Real(n.as_f64().unwrap_or_default()),
            (ColumnKind::Text, Value::String(s)) => SqlValue::Text(s.clone()),
            (ColumnKind::Text, other) => SqlValue::Text(other.to_string()),
            (_, other) => {
                return Err(FitError::invalid_field(
                    self.field,
                    format!("cannot store {other} in {:?} column", self.kind),
                ))
            }
        };
        Ok(converted)
    }

    /// Convert a raw SQL value back to the field's JSON form
    pub fn from_sql(&self, raw: ValueRef<'_>) -> Value {
        match raw {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => match self.kind {
                ColumnKind::Bool => Value::Bool(i != 0),
                ColumnKind::Real => serde_json::Number::from_f64(i as f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                _ => Value::from(i),
            },
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes).into_owned();
                if self.stores_json() {
                    serde_json::from_str(&text).unwrap_or_else(|e| {
                        tracing::warn!("Unparseable JSON in column {}: {}", self.name, e);
                        Value::Null
                    })
                } else {
                    Value::String(text)
                }
            }
            ValueRef::Blob(bytes) => Value::from(bytes.to_vec()),
        }
    }
}

// ----------------------------------------------------------------------------
// Entity Trait
// ----------------------------------------------------------------------------

/// A struct persisted as one row of one table
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Table name, interpolated textually into statements
    const TABLE: &'static str;
    /// Class name used in tagged strings
    const CLASS: &'static str;
    /// Schema of the table
    const DDL: &'static str;
    /// Ordering applied to multi-row loads
    const ORDER_BY: &'static str = "\"id\"";

    /// Ordered columns, excluding `id`
    fn columns() -> &'static [Column];

    /// Columns written by an update; all columns unless narrowed
    fn update_columns() -> Vec<&'static Column> {
        Self::columns().iter().collect()
    }

    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    /// Check field constraints before a write
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Persist attached child collections after this row has an id
    fn save_children(&mut self, _db: &Database) -> Result<()> {
        Ok(())
    }

    /// Load attached child collections after hydration
    fn load_children(&mut self, _db: &Database) -> Result<()> {
        Ok(())
    }

    /// Look up a column by storage or field name
    fn column(name: &str) -> Option<&'static Column> {
        Self::columns()
            .iter()
            .find(|c| c.name == name || c.field == name)
    }

    /// Field values keyed by field name
    fn to_fields(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(FitError::invalid_field(
                Self::CLASS,
                format!("serialized to non-object {other}"),
            )),
        }
    }

    /// Bindable values in `columns` order
    fn column_values(&self, columns: &[&'static Column]) -> Result<Vec<SqlValue>> {
        let fields = self.to_fields()?;
        columns
            .iter()
            .map(|c| c.to_sql(fields.get(c.field)))
            .collect()
    }

    /// Id or an error naming the entity
    fn require_id(&self) -> Result<i64> {
        self.id()
            .ok_or(FitError::Entity(EntityError::MissingId { class: Self::CLASS }))
    }
}

/// Hydrate an entity from a row selected as `id, <columns...>`
pub(crate) fn hydrate<E: Entity>(row: &rusqlite::Row<'_>) -> rusqlite::Result<Map<String, Value>> {
    let mut map = Map::new();
    let id: Option<i64> = row.get(0)?;
    map.insert("id".to_string(), id.map(Value::from).unwrap_or(Value::Null));
    for (idx, column) in E::columns().iter().enumerate() {
        let raw = row.get_ref(idx + 1)?;
        map.insert(column.field.to_string(), column.from_sql(raw));
    }
    Ok(map)
}

/// Validate a device alias
pub fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty() && alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
