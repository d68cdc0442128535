use serde::{Deserialize, Serialize};

use super::{Column, ColumnKind, Entity};
use crate::errors::{FitError, Result};

/// Person a session is recorded for
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: Option<i64>,
    pub name: String,
    pub weight: i64,
    pub height: i64,
    /// Unix seconds
    pub birthday: i64,
    pub male: bool,
}

const COLUMNS: &[Column] = &[
    Column::new("name", ColumnKind::Text),
    Column::new("weight", ColumnKind::Integer),
    Column::new("height", ColumnKind::Integer),
    Column::new("birthday", ColumnKind::Integer),
    Column::new("male", ColumnKind::Bool),
];

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Entity for User {
    const TABLE: &'static str = "user";
    const CLASS: &'static str = "User";
    const DDL: &'static str = "CREATE TABLE IF NOT EXISTS user (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        weight INTEGER NOT NULL DEFAULT 0,
        height INTEGER NOT NULL DEFAULT 0,
        birthday INTEGER NOT NULL DEFAULT 0,
        male INTEGER NOT NULL DEFAULT 1
    )";

    fn columns() -> &'static [Column] {
        COLUMNS
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FitError::invalid_field("name", "must not be empty"));
        }
        Ok(())
    }
}
