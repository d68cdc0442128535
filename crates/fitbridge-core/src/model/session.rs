use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Column, ColumnKind, Entity};

/// Marker stored in `exported` until a session has been exported
pub const NOT_EXPORTED: i64 = 0xFFFF;

/// A contiguous recording of one device for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub id: Option<i64>,
    /// Session chaining co-temporal recordings together
    pub main_id: Option<i64>,
    pub device: i64,
    pub user: i64,
    /// Unix milliseconds
    pub date_start: i64,
    pub settings: Map<String, Value>,
    pub exported: i64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            id: None,
            main_id: None,
            device: 0,
            user: 0,
            date_start: 0,
            settings: Map::new(),
            exported: NOT_EXPORTED,
        }
    }
}

impl Session {
    pub fn new(device: i64, user: i64, date_start: i64) -> Self {
        Self {
            device,
            user,
            date_start,
            ..Self::default()
        }
    }
}

const COLUMNS: &[Column] = &[
    Column::new("main_id", ColumnKind::Integer),
    Column::new("device", ColumnKind::Integer),
    Column::new("user", ColumnKind::Integer),
    Column::new("date_start", ColumnKind::Integer),
    Column::new("settings", ColumnKind::Json),
    Column::new("exported", ColumnKind::Integer),
];

impl Entity for Session {
    const TABLE: &'static str = "session";
    const CLASS: &'static str = "Session";
    const DDL: &'static str = "CREATE TABLE IF NOT EXISTS session (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        main_id INTEGER,
        device INTEGER NOT NULL REFERENCES device(id) ON DELETE CASCADE,
        user INTEGER NOT NULL REFERENCES user(id) ON DELETE CASCADE,
        date_start INTEGER NOT NULL,
        settings TEXT NOT NULL DEFAULT '{}',
        exported INTEGER NOT NULL DEFAULT 65535
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
}
