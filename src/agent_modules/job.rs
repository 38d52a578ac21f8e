//! Check descriptors as received from the control plane, plus the per-attempt
//! result a checker produces for them.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Debounce threshold used when the control plane omits `sens`.
pub const DEFAULT_SENSITIVITY: i32 = 2;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Settled status of a job. Serialized as `0` (down) / `1` (up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Down,
    Up,
}

impl JobState {
    pub fn from_success(success: bool) -> Self {
        if success { JobState::Up } else { JobState::Down }
    }

    pub fn is_up(self) -> bool {
        matches!(self, JobState::Up)
    }
}

impl Serialize for JobState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            JobState::Down => 0,
            JobState::Up => 1,
        })
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(JobState::Down),
            1 => Ok(JobState::Up),
            other => Err(serde::de::Error::custom(format!(
                "invalid check state {other}, expected 0 or 1"
            ))),
        }
    }
}

/// Description of the current (or most recent) down episode.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EventInfo {
    pub code: String,
    pub message: String,
    pub start: i64,
    pub end: i64,
    #[serde(rename = "type")]
    pub event_type: String,
}

/// Transient state a checker may stash between debounce retries of the same
/// job (resolved address, redirect chain). Never serialized; cleared on finalize.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptContext {
    pub resolved_ip: Option<IpAddr>,
    pub redirects: Vec<String>,
}

impl AttemptContext {
    pub fn clear(&mut self) {
        self.resolved_ip = None;
        self.redirects.clear();
    }
}

/// Outcome of one checker attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub start: i64,
    pub end: i64,
    pub runtime: i64,
    pub success: bool,
    #[serde(rename = "statusCode")]
    pub status_code: String,
    pub message: String,
    #[serde(default)]
    pub diag: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fieldtracking: Option<BTreeMap<String, f64>>,
    /// Set for validation errors that can never succeed on retry.
    #[serde(skip)]
    pub override_debounce: bool,
}

impl CheckResult {
    /// Starts a result whose clock runs from `start`.
    pub fn started_at(start: i64) -> Self {
        Self {
            start,
            end: start,
            runtime: 0,
            success: false,
            status_code: String::new(),
            message: String::new(),
            diag: Value::Null,
            fieldtracking: None,
            override_debounce: false,
        }
    }

    fn finish(mut self, success: bool, status_code: impl Into<String>, message: impl Into<String>) -> Self {
        self.end = now_ms().max(self.start);
        self.runtime = self.end - self.start;
        self.success = success;
        self.status_code = status_code.into();
        self.message = message.into();
        self
    }

    pub fn up(self, status_code: impl Into<String>, message: impl Into<String>) -> Self {
        self.finish(true, status_code, message)
    }

    pub fn down(self, status_code: impl Into<String>, message: impl Into<String>) -> Self {
        self.finish(false, status_code, message)
    }

    /// A configuration problem: down, and exempt from debounce retries.
    pub fn invalid(self, message: impl Into<String>) -> Self {
        let mut result = self.finish(false, "error", message);
        result.override_debounce = true;
        result
    }

    pub fn with_diag(mut self, diag: Value) -> Self {
        self.diag = diag;
        self
    }

    pub fn track(mut self, field: &str, value: f64) -> Self {
        self.fieldtracking
            .get_or_insert_with(BTreeMap::new)
            .insert(field.to_string(), value);
        self
    }
}

fn default_sensitivity() -> i32 {
    DEFAULT_SENSITIVITY
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString<T> {
    Number(T),
    Text(String),
}

/// Numeric descriptor field that the control plane may send as a string.
fn number_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: fmt::Display,
{
    match NumberOrString::<T>::deserialize(deserializer)? {
        NumberOrString::Number(value) => Ok(value),
        NumberOrString::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// A configured monitor plus its schedule and debounce state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckJob {
    pub id: String,
    #[serde(rename = "type")]
    pub check_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Minutes between finalized runs.
    #[serde(deserialize_with = "number_or_string")]
    pub interval: u64,
    #[serde(default)]
    pub runat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default)]
    pub retry: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newpass: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newfail: Option<u32>,
    #[serde(default)]
    pub firstdown: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eventinfo: Option<EventInfo>,
    #[serde(default)]
    pub location: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "number_or_string")]
    pub modified: i64,
    #[serde(default = "default_sensitivity", deserialize_with = "number_or_string")]
    pub sens: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<CheckResult>,
    #[serde(skip)]
    pub attempt: AttemptContext,
    /// Control-plane fields the engine does not interpret, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CheckJob {
    /// Minimal descriptor, mostly useful for building checklists in code.
    pub fn new(id: impl Into<String>, check_type: impl Into<String>, interval: u64) -> Self {
        Self {
            id: id.into(),
            check_type: check_type.into(),
            label: String::new(),
            parameters: Map::new(),
            interval,
            runat: 0,
            state: None,
            retry: 0,
            newpass: None,
            newfail: None,
            firstdown: 0,
            eventinfo: None,
            location: BTreeMap::new(),
            modified: 0,
            sens: DEFAULT_SENSITIVITY,
            results: None,
            attempt: AttemptContext::default(),
            extra: Map::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Numeric parameter; the control plane sends numbers as either JSON
    /// numbers or strings.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        match self.parameters.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        match self.parameters.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_u64().map(|v| v != 0),
            _ => None,
        }
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval.max(1) as i64 * 60_000
    }

    /// Carries schedule and debounce state over from an older descriptor with
    /// the same id.
    pub fn inherit_engine_state(&mut self, previous: &CheckJob) {
        self.runat = previous.runat;
        self.state = previous.state;
        self.retry = previous.retry;
        self.newpass = previous.newpass;
        self.newfail = previous.newfail;
        self.firstdown = previous.firstdown;
        self.eventinfo = previous.eventinfo.clone();
        self.location = previous.location.clone();
        self.results = previous.results.clone();
    }
}
