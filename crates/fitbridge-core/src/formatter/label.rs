use serde_json::{Map, Value};

use super::printf::sprintf;
use super::{Formatted, Formatter, FormatterKind};
use crate::errors::Result;
use crate::model::Label;
use crate::state::DeviceState;

/// Selector prefix expanding a seconds field to hours, minutes and seconds
const TIME_PREFIX: &str = "%t";
/// Placeholder in the pre-string replaced by the device alias
const ALIAS_PLACEHOLDER: &str = "$D";

// ----------------------------------------------------------------------------
// Shared Settings
// ----------------------------------------------------------------------------

/// Properties every formatter reads out of its settings map
#[derive(Debug, Clone, PartialEq)]
struct Common {
    fields: Vec<String>,
    formats: Vec<String>,
    pre: String,
    timeout: String,
    timeout_seconds: i64,
    wrappers: Vec<String>,
    colors: Map<String, Value>,
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn string_of(settings: &Map<String, Value>, key: &str, default: &str) -> String {
    settings
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

impl Common {
    fn parse(settings: &Map<String, Value>, default_format: &str) -> Self {
        let mut formats = string_list(settings.get("format"));
        if formats.is_empty() {
            formats.push(default_format.to_string());
        }
        Self {
            fields: string_list(settings.get("fields")),
            formats,
            pre: string_of(settings, "pre", ""),
            timeout: string_of(settings, "timeout", "--"),
            timeout_seconds: settings
                .get("timeout_seconds")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            wrappers: string_list(settings.get("wrappers")),
            colors: settings
                .get("colors")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }

    fn pre_for(&self, alias: &str) -> String {
        self.pre.replace(ALIAS_PLACEHOLDER, alias)
    }

    /// Project selectors into format arguments; `None` when a field is missing
    fn project(&self, fields: &Map<String, Value>) -> Option<Vec<Value>> {
        let mut args = Vec::with_capacity(self.fields.len() + 2);
        for selector in &self.fields {
            match selector.strip_prefix(TIME_PREFIX) {
                Some(name) => {
                    let secs = fields.get(name).filter(|v| !v.is_null())?.as_f64()? as i64;
                    args.push(Value::from(secs / 3600));
                    args.push(Value::from((secs % 3600) / 60));
                    args.push(Value::from(secs % 60));
                }
                None => args.push(fields.get(selector.as_str()).filter(|v| !v.is_null())?.clone()),
            }
        }
        Some(args)
    }

    fn color(&self, bucket: &str) -> String {
        self.colors
            .get(bucket)
            .and_then(Value::as_str)
            .unwrap_or(bucket)
            .to_string()
    }

    fn timeout_rendering(&self, alias: &str) -> Formatted {
        let mut tags = self.wrappers.clone();
        tags.push(self.color("timeout"));
        Formatted {
            text: format!("{}{}", self.pre_for(alias), self.timeout),
            tags,
            timed_out: true,
        }
    }
}

/// Copy label columns that double as formatter settings
fn label_settings(label: &Label) -> Map<String, Value> {
    let mut settings = label.settings.clone();
    if !label.timeout.is_empty() {
        settings
            .entry("timeout")
            .or_insert_with(|| Value::from(label.timeout.clone()));
    }
    if label.timeout_seconds > 0 {
        settings
            .entry("timeout_seconds")
            .or_insert_with(|| Value::from(label.timeout_seconds));
    }
    settings
}

// ----------------------------------------------------------------------------
// Simple Formatter
// ----------------------------------------------------------------------------

/// Renders projected fields through one format string
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleFormatter {
    kind: FormatterKind,
    settings: Map<String, Value>,
    common: Common,
}

impl SimpleFormatter {
    pub fn new(kind: FormatterKind, settings: Map<String, Value>) -> Self {
        let common = Common::parse(&settings, "%s");
        Self {
            kind,
            settings,
            common,
        }
    }

    /// Change one setting and re-derive the formatter from it
    pub fn with_setting(mut self, key: &str, value: Value) -> Self {
        self.settings.insert(key.to_string(), value);
        self.common = Common::parse(&self.settings, "%s");
        self
    }
}

impl Formatter for SimpleFormatter {
    fn kind(&self) -> FormatterKind {
        self.kind
    }

    fn format(&self, fields: &Map<String, Value>, alias: &str) -> Formatted {
        let Some(args) = self.common.project(fields) else {
            return self.common.timeout_rendering(alias);
        };
        Formatted {
            text: format!("{}{}", self.common.pre_for(alias), sprintf(&self.common.formats[0], &args)),
            tags: self.common.wrappers.clone(),
            timed_out: false,
        }
    }

    fn format_timeout(&self, alias: &str) -> Formatted {
        self.common.timeout_rendering(alias)
    }

    fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    fn timeout_seconds(&self) -> i64 {
        self.common.timeout_seconds
    }
}

// ----------------------------------------------------------------------------
// Double Formatter
// ----------------------------------------------------------------------------

/// Which comparison outcome a label considers desirable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    Norm,
    Max,
    Min,
}

impl Preference {
    fn parse(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("max") => Preference::Max,
            Some("min") => Preference::Min,
            _ => Preference::Norm,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Preference::Norm => "norm",
            Preference::Max => "max",
            Preference::Min => "min",
        }
    }
}

/// Compares two projected values and tags the outcome
#[derive(Debug, Clone, PartialEq)]
pub struct DoubleFormatter {
    kind: FormatterKind,
    settings: Map<String, Value>,
    common: Common,
    prefer: Preference,
}

impl DoubleFormatter {
    pub fn new(kind: FormatterKind, settings: Map<String, Value>) -> Self {
        let common = Common::parse(&settings, "%s");
        let prefer = Preference::parse(settings.get("prefer"));
        Self {
            kind,
            settings,
            common,
            prefer,
        }
    }

    pub fn preference(&self) -> Preference {
        self.prefer
    }

    /// Color bucket for a pair of values
    pub fn bucket(v1: f64, v2: f64) -> &'static str {
        if (v1 - v2).abs() < f64::EPSILON {
            "equal"
        } else if v1 > v2 {
            "greater"
        } else {
            "less"
        }
    }
}

impl Formatter for DoubleFormatter {
    fn kind(&self) -> FormatterKind {
        self.kind
    }

    fn format(&self, fields: &Map<String, Value>, alias: &str) -> Formatted {
        let args = match self.common.project(fields) {
            Some(args) if args.len() >= 2 => args,
            _ => return self.common.timeout_rendering(alias),
        };
        let v1 = args[0].as_f64().unwrap_or_default();
        let v2 = args[1].as_f64().unwrap_or_default();
        let first = &self.common.formats[0];
        let second = self.common.formats.get(1).unwrap_or(first);
        let text = format!(
            "{}{}{}",
            self.common.pre_for(alias),
            sprintf(first, &args[..1]),
            sprintf(second, &args[1..])
        );
        let mut tags = self.common.wrappers.clone();
        tags.push(self.common.color(Self::bucket(v1, v2)));
        tags.push(self.prefer.tag().to_string());
        Formatted {
            text,
            tags,
            timed_out: false,
        }
    }

    fn format_timeout(&self, alias: &str) -> Formatted {
        self.common.timeout_rendering(alias)
    }

    fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    fn timeout_seconds(&self) -> i64 {
        self.common.timeout_seconds
    }
}

// ----------------------------------------------------------------------------
// State Formatter
// ----------------------------------------------------------------------------

/// Maps a device state to a caption and a color bucket
#[derive(Debug, Clone, PartialEq)]
pub struct StateFormatter {
    settings: Map<String, Value>,
    common: Common,
}

impl StateFormatter {
    pub fn new(settings: Map<String, Value>) -> Self {
        let common = Common::parse(&settings, "%s");
        Self { settings, common }
    }

    /// Caption and bucket for a state, honoring `states` overrides
    pub fn describe(&self, state: DeviceState) -> (String, &'static str) {
        let bucket = match state {
            DeviceState::Online => "ok",
            DeviceState::DPause => "pause",
            DeviceState::Connecting | DeviceState::Connected | DeviceState::Idle => "wait",
            DeviceState::Searching | DeviceState::Disconnecting => "busy",
            DeviceState::InvalidStep => "invalid",
            DeviceState::Uninit | DeviceState::Disconnected => "off",
        };
        let caption = self
            .settings
            .get("states")
            .and_then(|m| m.get(state.name()))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| state.name().to_string());
        (caption, bucket)
    }
}

impl Formatter for StateFormatter {
    fn kind(&self) -> FormatterKind {
        FormatterKind::State
    }

    fn format(&self, fields: &Map<String, Value>, alias: &str) -> Formatted {
        let state = fields
            .get("state")
            .and_then(Value::as_i64)
            .and_then(|c| DeviceState::from_code(c as i32));
        let Some(state) = state else {
            return self.common.timeout_rendering(alias);
        };
        let (caption, bucket) = self.describe(state);
        let mut tags = self.common.wrappers.clone();
        tags.push(self.common.color(bucket));
        Formatted {
            text: format!(
                "{}{}",
                self.common.pre_for(alias),
                sprintf(&self.common.formats[0], &[Value::from(caption)])
            ),
            tags,
            timed_out: false,
        }
    }

    fn format_timeout(&self, alias: &str) -> Formatted {
        self.common.timeout_rendering(alias)
    }

    fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    fn timeout_seconds(&self) -> i64 {
        self.common.timeout_seconds
    }
}

// ----------------------------------------------------------------------------
// Label Formatter
// ----------------------------------------------------------------------------

/// Formatter built from a stored label
#[derive(Debug, Clone, PartialEq)]
pub enum LabelFormatter {
    Simple(SimpleFormatter),
    Double(DoubleFormatter),
    State(StateFormatter),
}

impl LabelFormatter {
    /// Pick the formatter variant for a label
    ///
    /// State labels use the state formatter; labels with two format strings
    /// compare two values; everything else renders one format.
    pub fn from_label(label: &Label) -> Result<Self> {
        let kind = FormatterKind::from_tag(&label.kind)?;
        let settings = label_settings(label);
        if kind == FormatterKind::State {
            return Ok(LabelFormatter::State(StateFormatter::new(settings)));
        }
        if string_list(settings.get("format")).len() == 2 {
            Ok(LabelFormatter::Double(DoubleFormatter::new(kind, settings)))
        } else {
            Ok(LabelFormatter::Simple(SimpleFormatter::new(kind, settings)))
        }
    }

    fn inner(&self) -> &dyn Formatter {
        match self {
            LabelFormatter::Simple(f) => f,
            LabelFormatter::Double(f) => f,
            LabelFormatter::State(f) => f,
        }
    }
}

impl Formatter for LabelFormatter {
    fn kind(&self) -> FormatterKind {
        self.inner().kind()
    }

    fn format(&self, fields: &Map<String, Value>, alias: &str) -> Formatted {
        self.inner().format(fields, alias)
    }

    fn format_timeout(&self, alias: &str) -> Formatted {
        self.inner().format_timeout(alias)
    }

    fn settings(&self) -> &Map<String, Value> {
        self.inner().settings()
    }

    fn timeout_seconds(&self) -> i64 {
        self.inner().timeout_seconds()
    }
}
