//! Embedded SQL store
//!
//! One connection per process. Writes open a transaction lazily and keep it
//! open until a caller commits, which lets derivators coalesce many sample
//! inserts into one commit.

use std::path::Path;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{EntityError, FitError, Result};
use crate::model::{
    self, Device, Entity, HrDeviceOutput, KeiserM3iOutput, Label, Session, User, View,
};

/// Schema of every persisted entity, in dependency order
const SCHEMA: &[&str] = &[
    User::DDL,
    Device::DDL,
    Session::DDL,
    View::DDL,
    Label::DDL,
    HrDeviceOutput::DDL,
    KeiserM3iOutput::DDL,
];

/// Database connection wrapper
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the database file, creating it when missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!("Opened database at {:?}", path.as_ref());
        Ok(Self { conn })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Enable foreign keys and create every table
    pub fn bootstrap(&self) -> Result<()> {
        self.commit()?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        for ddl in SCHEMA {
            self.conn.execute_batch(ddl)?;
        }
        Ok(())
    }

    /// Underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Whether uncommitted writes are pending
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn begin(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// Commit pending writes, if any
    pub fn commit(&self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Discard pending writes, if any
    pub fn rollback(&self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Load one entity and its children
    pub fn load_by_id<E: Entity>(&self, id: i64) -> Result<Option<E>> {
        Ok(self
            .load_where::<E>(&[("id", SqlValue::Integer(id))])?
            .into_iter()
            .next())
    }

    /// Load every row of an entity's table
    pub fn load_all<E: Entity>(&self) -> Result<Vec<E>> {
        self.load_where::<E>(&[])
    }

    /// Load rows matching all equality filters, keyed by column or field name
    pub fn load_where<E: Entity>(&self, filters: &[(&str, SqlValue)]) -> Result<Vec<E>> {
        let mut clauses = Vec::with_capacity(filters.len());
        for (name, _) in filters {
            let column = if *name == "id" {
                "\"id\"".to_string()
            } else {
                E::column(name)
                    .map(|c| c.quoted())
                    .ok_or_else(|| FitError::invalid_field(*name, "unknown filter column"))?
            };
            clauses.push(format!("{column} = ?"));
        }
        let columns: Vec<String> = E::columns().iter().map(|c| c.quoted()).collect();
        let mut sql = format!("SELECT \"id\", {} FROM \"{}\"", columns.join(", "), E::TABLE);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(E::ORDER_BY);

        let rows = {
            let mut stmt = self.conn.prepare(&sql)?;
            let params = params_from_iter(filters.iter().map(|(_, v)| v));
            let mapped = stmt.query_map(params, |row| model::hydrate::<E>(row))?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut out = Vec::with_capacity(rows.len());
        for map in rows {
            let mut entity: E = serde_json::from_value(Value::Object(map))?;
            entity.load_children(self)?;
            out.push(entity);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------------

    /// Insert or update an entity and its children
    ///
    /// Inserts assign the generated id back into the entity. The transaction
    /// stays open unless `commit` is set.
    pub fn save<E: Entity>(&self, entity: &mut E, commit: bool) -> Result<()> {
        entity.validate()?;
        self.begin()?;
        match entity.id() {
            None => {
                let columns: Vec<&'static model::Column> = E::columns().iter().collect();
                let names: Vec<String> = columns.iter().map(|c| c.quoted()).collect();
                let placeholders = vec!["?"; columns.len()].join(", ");
                let sql = format!(
                    "INSERT OR IGNORE INTO \"{}\" ({}) VALUES ({})",
                    E::TABLE,
                    names.join(", "),
                    placeholders
                );
                let values = entity.column_values(&columns)?;
                let changed = self.conn.execute(&sql, params_from_iter(values.iter()))?;
                if changed == 0 {
                    return Err(EntityError::InsertIgnored { table: E::TABLE }.into());
                }
                entity.set_id(self.conn.last_insert_rowid());
            }
            Some(id) => {
                let columns = E::update_columns();
                let sets: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{} = ?", c.quoted()))
                    .collect();
                let sql = format!(
                    "UPDATE \"{}\" SET {} WHERE \"id\" = ?",
                    E::TABLE,
                    sets.join(", ")
                );
                let mut values = entity.column_values(&columns)?;
                values.push(SqlValue::Integer(id));
                let changed = self.conn.execute(&sql, params_from_iter(values.iter()))?;
                if changed == 0 {
                    return Err(FitError::NotFound(format!("{} {}", E::CLASS, id)));
                }
            }
        }
        entity.save_children(self)?;
        if commit {
            self.commit()?;
        }
        Ok(())
    }

    /// Save and commit; a failure rolls back everything pending
    pub fn save_or_rollback<E: Entity>(&self, entity: &mut E) -> Result<()> {
        let saved = self.save(entity, true);
        if saved.is_err() {
            if let Err(e) = self.rollback() {
                warn!("Rollback after failed {} save failed: {}", E::CLASS, e);
            }
        }
        saved
    }

    /// Save, logging instead of returning the error
    pub fn to_db<E: Entity>(&self, entity: &mut E, commit: bool) -> bool {
        match self.save(entity, commit) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to save {}: {}", E::CLASS, e);
                false
            }
        }
    }

    /// Delete an entity by id; returns whether a row was affected
    pub fn remove<E: Entity>(&self, entity: &E, commit: bool) -> Result<bool> {
        let id = entity.require_id()?;
        self.begin()?;
        let sql = format!("DELETE FROM \"{}\" WHERE \"id\" = ?", E::TABLE);
        let changed = self.conn.execute(&sql, [id])?;
        if commit {
            self.commit()?;
        }
        Ok(changed > 0)
    }

    /// Delete, logging instead of returning the error
    pub fn delete<E: Entity>(&self, entity: &E, commit: bool) -> bool {
        self.remove(entity, commit).unwrap_or_else(|e| {
            warn!("Failed to delete {}: {}", E::CLASS, e);
            false
        })
    }

    /// Number of rows in an entity's table
    pub fn count<E: Entity>(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", E::TABLE);
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    // ------------------------------------------------------------------------
    // Ad-hoc SQL
    // ------------------------------------------------------------------------

    /// Run one SQL statement, returning its rows keyed by column name
    pub fn execute_sql(&self, sql: &str) -> Result<Vec<Map<String, Value>>> {
        let mut stmt = self.conn.prepare(sql)?;
        if stmt.column_count() == 0 {
            stmt.execute([])?;
            return Ok(Vec::new());
        }
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = Map::new();
            for (idx, name) in names.iter().enumerate() {
                map.insert(name.clone(), json_of(row.get_ref(idx)?));
            }
            out.push(map);
        }
        Ok(out)
    }

    /// Single scalar query helper
    pub fn query_scalar(&self, sql: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(sql, [], |row| row.get::<_, Option<i64>>(0))
            .optional()?
            .flatten())
    }
}

fn json_of(raw: ValueRef<'_>) -> Value {
    match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::from(b.to_vec()),
    }
}
