//! Label formatters
//!
//! A label projects fields out of a sample, session, user or device state and
//! renders them through a printf-style format. The output is a string plus a
//! sequence of wrapper tags; coloring and layout belong to external renderers.

mod label;
pub mod printf;

pub use label::{DoubleFormatter, LabelFormatter, Preference, SimpleFormatter, StateFormatter};

use serde_json::{Map, Value};

use crate::errors::{FitError, Result};

// ----------------------------------------------------------------------------
// Formatter Kind
// ----------------------------------------------------------------------------

/// What a label projects its fields from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatterKind {
    /// Derived sample of the label's device
    FitObj,
    /// Current session of the label's device
    Session,
    /// Visible state of the label's device
    State,
    /// User the fleet is recording for
    User,
}

impl FormatterKind {
    pub fn tag(self) -> &'static str {
        match self {
            FormatterKind::FitObj => "fitobj",
            FormatterKind::Session => "session",
            FormatterKind::State => "state",
            FormatterKind::User => "user",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "fitobj" => Ok(FormatterKind::FitObj),
            "session" => Ok(FormatterKind::Session),
            "state" => Ok(FormatterKind::State),
            "user" => Ok(FormatterKind::User),
            other => Err(FitError::invalid_field(
                "type",
                format!("unknown label type {other:?}"),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Formatter Trait
// ----------------------------------------------------------------------------

/// Rendered label
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Formatted {
    pub text: String,
    /// Wrapper and color tokens, outermost first
    pub tags: Vec<String>,
    /// Whether this is the timeout rendering
    pub timed_out: bool,
}

pub trait Formatter {
    fn kind(&self) -> FormatterKind;

    /// Render from an object's fields; any missing field yields the timeout rendering
    fn format(&self, fields: &Map<String, Value>, alias: &str) -> Formatted;

    /// Rendering used when data is missing or stale
    fn format_timeout(&self, alias: &str) -> Formatted;

    /// Editable settings, the source every other property is derived from
    fn settings(&self) -> &Map<String, Value>;

    /// Seconds without updates after which the label times out, 0 for never
    fn timeout_seconds(&self) -> i64;

    fn is_expired(&self, last_update_ms: i64, now_ms: i64) -> bool {
        let secs = self.timeout_seconds();
        secs > 0 && now_ms - last_update_ms >= secs * 1000
    }
}
