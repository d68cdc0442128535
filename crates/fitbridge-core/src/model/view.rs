use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Column, ColumnKind, Entity};
use crate::errors::Result;
use crate::storage::{codec, Database};

// ----------------------------------------------------------------------------
// Label
// ----------------------------------------------------------------------------

/// A formatter configuration placed in a view
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Label {
    pub id: Option<i64>,
    pub view: Option<i64>,
    pub device: i64,
    /// Formatter kind tag: `fitobj`, `session`, `state` or `user`
    #[serde(rename = "type")]
    pub kind: String,
    pub settings: Map<String, Value>,
    pub background: String,
    pub order: i64,
    /// Text shown when the projected fields are stale or missing
    pub timeout: String,
    pub timeout_seconds: i64,
    pub class_name: String,
    pub example_conf: Map<String, Value>,
}

const LABEL_COLUMNS: &[Column] = &[
    Column::new("view", ColumnKind::Integer),
    Column::new("device", ColumnKind::Integer),
    Column::new("type", ColumnKind::Text),
    Column::new("settings", ColumnKind::Json),
    Column::new("background", ColumnKind::Text),
    Column::new("order", ColumnKind::Integer),
    Column::new("timeout", ColumnKind::Text),
    Column::new("timeout_seconds", ColumnKind::Integer),
    Column::new("class_name", ColumnKind::Text),
    Column::new("example_conf", ColumnKind::Json),
];

impl Label {
    pub fn new(device: i64, kind: impl Into<String>) -> Self {
        Self {
            device,
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_settings(mut self, settings: Map<String, Value>) -> Self {
        self.settings = settings;
        self
    }
}

impl Entity for Label {
    const TABLE: &'static str = "label";
    const CLASS: &'static str = "Label";
    const ORDER_BY: &'static str = "\"order\", \"id\"";
    const DDL: &'static str = "CREATE TABLE IF NOT EXISTS label (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        view INTEGER NOT NULL REFERENCES view(id) ON DELETE CASCADE,
        device INTEGER NOT NULL REFERENCES device(id) ON DELETE CASCADE,
        type TEXT NOT NULL,
        settings TEXT NOT NULL DEFAULT '{}',
        background TEXT NOT NULL DEFAULT '',
        \"order\" INTEGER NOT NULL DEFAULT 0,
        timeout TEXT NOT NULL DEFAULT '',
        timeout_seconds INTEGER NOT NULL DEFAULT 0,
        class_name TEXT NOT NULL DEFAULT '',
        example_conf TEXT NOT NULL DEFAULT '{}'
    )";

    fn columns() -> &'static [Column] {
        LABEL_COLUMNS
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }
}

// ----------------------------------------------------------------------------
// View
// ----------------------------------------------------------------------------

/// A named, activatable bundle of labels
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct View {
    pub id: Option<i64>,
    pub name: String,
    pub active: bool,
    #[serde(with = "codec::tagged_list")]
    pub items: Vec<Label>,
}

const VIEW_COLUMNS: &[Column] = &[
    Column::new("name", ColumnKind::Text),
    Column::new("active", ColumnKind::Bool),
];

impl View {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Devices referenced by this view's labels, deduplicated in label order
    pub fn connected_devices(&self) -> Vec<i64> {
        let mut out: Vec<i64> = Vec::new();
        for label in &self.items {
            if !out.contains(&label.device) {
                out.push(label.device);
            }
        }
        out
    }

    /// Drop labels pointing at a device; returns whether any were removed
    pub fn prune_device(&mut self, device: i64) -> bool {
        let before = self.items.len();
        self.items.retain(|l| l.device != device);
        before != self.items.len()
    }
}

impl Entity for View {
    const TABLE: &'static str = "view";
    const CLASS: &'static str = "View";
    const DDL: &'static str = "CREATE TABLE IF NOT EXISTS view (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 0
    )";

    fn columns() -> &'static [Column] {
        VIEW_COLUMNS
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn save_children(&mut self, db: &Database) -> Result<()> {
        let view_id = self.require_id()?;
        let mut kept = Vec::with_capacity(self.items.len());
        for label in &mut self.items {
            label.view = Some(view_id);
            db.save(label, false)?;
            if let Some(id) = label.id {
                kept.push(id);
            }
        }
        // Labels removed from the list since the last save
        for stale in db.load_where::<Label>(&[("view", SqlValue::Integer(view_id))])? {
            if stale.id.is_some_and(|id| !kept.contains(&id)) {
                db.remove(&stale, false)?;
            }
        }
        Ok(())
    }

    fn load_children(&mut self, db: &Database) -> Result<()> {
        let view_id = self.require_id()?;
        self.items = db.load_where::<Label>(&[("view", SqlValue::Integer(view_id))])?;
        Ok(())
    }
}
