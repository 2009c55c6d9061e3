use crate::error::{Result, RuleflowError};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Internal keys of the fields the engine itself reads.
pub mod keys {
    pub const TEAM_PROJECT: &str = "System_TeamProject";
    pub const WORK_ITEM_TYPE: &str = "System_WorkItemType";
    pub const STATE: &str = "System_State";
    pub const ASSIGNED_TO: &str = "System_AssignedTo";
    pub const AREA_PATH: &str = "System_AreaPath";
    pub const TITLE: &str = "System_Title";
    pub const EFFORT: &str = "Microsoft_VSTS_Scheduling_Effort";
}

/// Map an external dotted field name (`System.State`) to its internal key
/// (`System_State`).
pub fn internal_key(name: &str) -> String {
    name.replace('.', "_")
}

/// Map an internal key back to the external dotted name. Names without an
/// underscore pass through unchanged.
pub fn external_name(name: &str) -> String {
    if name.contains('_') {
        name.replace('_', ".")
    } else {
        name.to_string()
    }
}

// ---------------------------------------------------------------------------
// FieldValue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "serde_json::Value")]
pub enum FieldValue {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric view: numbers as-is, strings when they parse.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Render a number the way the tracker displays it: integral values carry
/// no fractional part.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::String(s) => f.write_str(s),
            FieldValue::Number(n) => f.write_str(&format_number(*n)),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Null => Ok(()),
        }
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map_or(FieldValue::Null, FieldValue::Number),
            serde_json::Value::String(s) => FieldValue::String(s),
            // Identity and other structured fields are kept as their raw JSON text.
            other => FieldValue::String(other.to_string()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FieldValue::String(s) => serializer.serialize_str(s),
            FieldValue::Number(n) => serializer.serialize_f64(*n),
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::Null => serializer.serialize_unit(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkItemEvent (inbound webhook payload)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub resource: Option<EventResource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResource {
    #[serde(default)]
    pub work_item_id: Option<i64>,
    #[serde(default)]
    pub revision: Option<EventRevision>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventRevision {
    #[serde(default)]
    pub fields: Option<BTreeMap<String, serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// WorkItemContext
// ---------------------------------------------------------------------------

/// The normalized view of one work item for the duration of one execution.
/// Keys are internal (`System_State`), values are closed [`FieldValue`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkItemContext {
    pub id: i64,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl WorkItemContext {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Builder used by tests and the CLI. `name` may be dotted or internal.
    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(internal_key(name), value.into());
        self
    }

    /// Normalize a webhook payload. Missing resource, revision or fields, an
    /// empty field map, or a missing work item id are validation errors.
    pub fn from_event(event: &WorkItemEvent) -> Result<Self> {
        let resource = event
            .resource
            .as_ref()
            .ok_or_else(|| RuleflowError::InvalidPayload("missing resource".into()))?;
        let id = resource
            .work_item_id
            .filter(|id| *id > 0)
            .ok_or_else(|| RuleflowError::InvalidPayload("missing work item id".into()))?;
        let fields = resource
            .revision
            .as_ref()
            .and_then(|r| r.fields.as_ref())
            .ok_or_else(|| RuleflowError::InvalidPayload("missing revision fields".into()))?;
        if fields.is_empty() {
            return Err(RuleflowError::InvalidPayload("revision fields are empty".into()));
        }

        let fields = fields
            .iter()
            .map(|(name, value)| (internal_key(name), FieldValue::from(value.clone())))
            .collect();
        Ok(Self { id, fields })
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(&internal_key(key))
    }

    /// String view of a field; empty for missing or null fields.
    pub fn field_str(&self, key: &str) -> String {
        self.get(key).map(|v| v.to_string()).unwrap_or_default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<FieldValue>) {
        self.fields.insert(internal_key(key), value.into());
    }

    pub fn project(&self) -> String {
        self.field_str(keys::TEAM_PROJECT)
    }

    pub fn work_item_type(&self) -> String {
        self.field_str(keys::WORK_ITEM_TYPE)
    }

    /// Insert `Null` for every referenced key that is not present so that
    /// expressions see an explicit null instead of an unknown member.
    pub fn ensure_fields<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in keys {
            self.fields
                .entry(internal_key(key.as_ref()))
                .or_insert(FieldValue::Null);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
