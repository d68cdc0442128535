//! Per-sample records produced by device managers and completed by derivators
//!
//! Raw sampled fields are stored in `o*` columns and derived fields in `c*`
//! columns; the structs use plain field names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Column, ColumnKind, Entity};
use crate::errors::Result;

// ----------------------------------------------------------------------------
// Heart-rate Output
// ----------------------------------------------------------------------------

/// One heart-rate measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HrDeviceOutput {
    pub id: Option<i64>,
    pub session: Option<i64>,
    /// Unix milliseconds of receipt
    pub timestamp: i64,
    /// Beats per minute
    pub pulse: i64,
    /// 1 skin contact, 0 no contact, -1 contact not reported
    pub worn: i64,
    /// Energy expended in kJ, -1 when absent
    pub joule: i64,
    /// RR intervals in milliseconds
    pub rr: Vec<i64>,
    /// Battery percentage, -1 when unknown
    pub battery: i64,
    pub pulse_mean: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joule_mean: Option<f64>,
    pub n_beats: i64,
    pub time_rel_ms: i64,
    pub time_abs_ms: i64,
    pub time_rel_s: i64,
}

impl Default for HrDeviceOutput {
    fn default() -> Self {
        Self {
            id: None,
            session: None,
            timestamp: 0,
            pulse: 0,
            worn: -1,
            joule: -1,
            rr: Vec::new(),
            battery: -1,
            pulse_mean: 0.0,
            joule_mean: None,
            n_beats: 0,
            time_rel_ms: 0,
            time_abs_ms: 0,
            time_rel_s: 0,
        }
    }
}

impl HrDeviceOutput {
    pub fn new(pulse: i64, worn: i64, joule: i64) -> Self {
        Self {
            pulse,
            worn,
            joule,
            ..Self::default()
        }
    }
}

const HR_COLUMNS: &[Column] = &[
    Column::new("session", ColumnKind::Integer),
    Column::new("timestamp", ColumnKind::Integer),
    Column::aliased("opulse", "pulse", ColumnKind::Integer),
    Column::aliased("oworn", "worn", ColumnKind::Integer),
    Column::aliased("ojoule", "joule", ColumnKind::Integer),
    Column::aliased("orr", "rr", ColumnKind::Json),
    Column::aliased("obattery", "battery", ColumnKind::Integer),
    Column::aliased("cpulsemean", "pulse_mean", ColumnKind::Real),
    Column::aliased("cjoulemean", "joule_mean", ColumnKind::Real),
    Column::aliased("cnbeats", "n_beats", ColumnKind::Integer),
    Column::aliased("ctimerel", "time_rel_ms", ColumnKind::Integer),
    Column::aliased("ctimeabs", "time_abs_ms", ColumnKind::Integer),
    Column::aliased("ctimerels", "time_rel_s", ColumnKind::Integer),
];

impl Entity for HrDeviceOutput {
    const TABLE: &'static str = "hrdeviceSV";
    const CLASS: &'static str = "HRDeviceOutput";
    const ORDER_BY: &'static str = "\"timestamp\", \"id\"";
    const DDL: &'static str = "CREATE TABLE IF NOT EXISTS hrdeviceSV (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session INTEGER NOT NULL REFERENCES session(id) ON DELETE CASCADE,
        timestamp INTEGER NOT NULL,
        opulse INTEGER NOT NULL,
        oworn INTEGER NOT NULL,
        ojoule INTEGER NOT NULL,
        orr TEXT NOT NULL DEFAULT '[]',
        obattery INTEGER NOT NULL DEFAULT -1,
        cpulsemean REAL,
        cjoulemean REAL,
        cnbeats INTEGER,
        ctimerel INTEGER,
        ctimeabs INTEGER,
        ctimerels INTEGER
    )";

    fn columns() -> &'static [Column] {
        HR_COLUMNS
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }
}

// ----------------------------------------------------------------------------
// Keiser M3i Output
// ----------------------------------------------------------------------------

/// One Keiser M3i broadcast
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeiserM3iOutput {
    pub id: Option<i64>,
    pub session: Option<i64>,
    pub timestamp: i64,
    pub major: i64,
    pub minor: i64,
    pub equipment_id: i64,
    /// Cadence; tenths as received, whole rpm once derived
    pub rpm: i64,
    /// Heart rate; tenths as received, whole bpm once derived
    pub pulse: i64,
    pub watt: i64,
    pub calorie: i64,
    /// Elapsed seconds, continued across console resets once derived
    pub time: i64,
    /// Odometer as broadcast, unit flag in bit 15
    pub distance_raw: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gear: Option<i64>,
    /// Odometer in km, continued across console resets
    pub distance: f64,
    /// km/h over the ring buffer window
    pub speed: f64,
    pub speed_mean: f64,
    pub rpm_mean: f64,
    pub pulse_mean: f64,
    pub watt_mean: f64,
    pub distance_rel: f64,
}

const KEISER_COLUMNS: &[Column] = &[
    Column::new("session", ColumnKind::Integer),
    Column::new("timestamp", ColumnKind::Integer),
    Column::aliased("omajor", "major", ColumnKind::Integer),
    Column::aliased("ominor", "minor", ColumnKind::Integer),
    Column::aliased("oequipment", "equipment_id", ColumnKind::Integer),
    Column::aliased("orpm", "rpm", ColumnKind::Integer),
    Column::aliased("opulse", "pulse", ColumnKind::Integer),
    Column::aliased("owatt", "watt", ColumnKind::Integer),
    Column::aliased("ocalorie", "calorie", ColumnKind::Integer),
    Column::aliased("otime", "time", ColumnKind::Integer),
    Column::aliased("odistance", "distance_raw", ColumnKind::Integer),
    Column::aliased("ogear", "gear", ColumnKind::Integer),
    Column::aliased("cdistance", "distance", ColumnKind::Real),
    Column::aliased("cspeed", "speed", ColumnKind::Real),
    Column::aliased("cspeedmean", "speed_mean", ColumnKind::Real),
    Column::aliased("crpmmean", "rpm_mean", ColumnKind::Real),
    Column::aliased("cpulsemean", "pulse_mean", ColumnKind::Real),
    Column::aliased("cwattmean", "watt_mean", ColumnKind::Real),
    Column::aliased("cdistancerel", "distance_rel", ColumnKind::Real),
];

impl Entity for KeiserM3iOutput {
    const TABLE: &'static str = "keiserSV";
    const CLASS: &'static str = "KeiserM3iOutput";
    const ORDER_BY: &'static str = "\"timestamp\", \"id\"";
    const DDL: &'static str = "CREATE TABLE IF NOT EXISTS keiserSV (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session INTEGER NOT NULL REFERENCES session(id) ON DELETE CASCADE,
        timestamp INTEGER NOT NULL,
        omajor INTEGER,
        ominor INTEGER,
        oequipment INTEGER,
        orpm INTEGER,
        opulse INTEGER,
        owatt INTEGER,
        ocalorie INTEGER,
        otime INTEGER,
        odistance INTEGER,
        ogear INTEGER,
        cdistance REAL,
        cspeed REAL,
        cspeedmean REAL,
        crpmmean REAL,
        cpulsemean REAL,
        cwattmean REAL,
        cdistancerel REAL
    )";

    fn columns() -> &'static [Column] {
        KEISER_COLUMNS
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }
}

// ----------------------------------------------------------------------------
// Sample
// ----------------------------------------------------------------------------

/// A sample of any supported device kind
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Hr(HrDeviceOutput),
    Keiser(KeiserM3iOutput),
}

impl Sample {
    pub fn timestamp(&self) -> i64 {
        match self {
            Sample::Hr(s) => s.timestamp,
            Sample::Keiser(s) => s.timestamp,
        }
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        match self {
            Sample::Hr(s) => s.timestamp = timestamp,
            Sample::Keiser(s) => s.timestamp = timestamp,
        }
    }

    pub fn session(&self) -> Option<i64> {
        match self {
            Sample::Hr(s) => s.session,
            Sample::Keiser(s) => s.session,
        }
    }

    pub fn set_session(&mut self, session: Option<i64>) {
        match self {
            Sample::Hr(s) => s.session = session,
            Sample::Keiser(s) => s.session = session,
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Sample::Hr(s) => s.id,
            Sample::Keiser(s) => s.id,
        }
    }

    /// Clear the row id so the sample is inserted as a new row
    pub fn clear_id(&mut self) {
        match self {
            Sample::Hr(s) => s.id = None,
            Sample::Keiser(s) => s.id = None,
        }
    }

    /// Field values keyed by field name, for projection by formatters
    pub fn fields(&self) -> Result<Map<String, Value>> {
        match self {
            Sample::Hr(s) => s.to_fields(),
            Sample::Keiser(s) => s.to_fields(),
        }
    }

    /// Single field lookup
    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields().ok().and_then(|mut f| f.remove(name))
    }
}

impl From<HrDeviceOutput> for Sample {
    fn from(value: HrDeviceOutput) -> Self {
        Sample::Hr(value)
    }
}

impl From<KeiserM3iOutput> for Sample {
    fn from(value: KeiserM3iOutput) -> Self {
        Sample::Keiser(value)
    }
}
