use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{is_valid_alias, Column, ColumnKind, Entity};
use crate::errors::{EntityError, FitError, Result};

/// A configured BLE exercise device
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub id: Option<i64>,
    pub name: String,
    /// Unique short name, `[A-Za-z0-9_]+`
    pub alias: String,
    /// Kind tag selecting the device manager variant
    #[serde(rename = "type")]
    pub kind: String,
    pub additional_settings: Map<String, Value>,
    /// Fleet ordering, lower first
    pub order: i64,
    /// Bluetooth MAC address
    pub address: String,
    pub enabled: bool,
}

const COLUMNS: &[Column] = &[
    Column::new("name", ColumnKind::Text),
    Column::new("alias", ColumnKind::Text),
    Column::new("type", ColumnKind::Text),
    Column::new("additional_settings", ColumnKind::Json),
    Column::new("order", ColumnKind::Integer),
    Column::new("address", ColumnKind::Text),
    Column::new("enabled", ColumnKind::Bool),
];

impl Device {
    pub fn new(kind: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            address: address.into(),
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    /// Setting from `additional_settings`
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.additional_settings.get(key)
    }
}

impl Entity for Device {
    const TABLE: &'static str = "device";
    const CLASS: &'static str = "Device";
    const ORDER_BY: &'static str = "\"order\", \"id\"";
    const DDL: &'static str = "CREATE TABLE IF NOT EXISTS device (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL DEFAULT '',
        alias TEXT NOT NULL UNIQUE,
        type TEXT NOT NULL,
        additional_settings TEXT NOT NULL DEFAULT '{}',
        \"order\" INTEGER NOT NULL DEFAULT 0,
        address TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1
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
        if !is_valid_alias(&self.alias) {
            return Err(FitError::Entity(EntityError::InvalidAlias {
                alias: self.alias.clone(),
            }));
        }
        if self.kind.is_empty() {
            return Err(FitError::invalid_field("type", "must not be empty"));
        }
        Ok(())
    }
}
