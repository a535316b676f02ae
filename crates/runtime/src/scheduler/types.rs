//! Shared types for the scheduling subsystem.
//!
//! All persisted timestamps are local wall-clock `NaiveDateTime` values at
//! second precision, serialized as `YYYY-MM-DD HH:MM:SS` (space separator, no
//! offset). This format is a compatibility requirement for in-place upgrades
//! of existing databases and must not be reinterpreted as UTC.

use std::fmt;

use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Timestamp format used everywhere a stamp is persisted or served.
pub const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local wall-clock time, truncated to second precision.
pub fn local_now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Render a stamp in the persisted format.
pub fn format_stamp(stamp: &NaiveDateTime) -> String {
    stamp.format(STAMP_FORMAT).to_string()
}

/// Parse a stamp tolerantly: `T` or space separator, optional fractional
/// seconds, and RFC 3339 offsets (converted to local naive time).
pub fn parse_stamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(aware) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(aware.with_timezone(&Local).naive_local());
    }
    let spaced = trimmed.replace('T', " ");
    NaiveDateTime::parse_from_str(&spaced, STAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(&spaced, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// Serde adapters for the persisted stamp format.
pub mod stamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_stamp, parse_stamp};

    pub fn serialize<S: Serializer>(stamp: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_stamp(stamp))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_stamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer};

        use super::{format_stamp, parse_stamp};

        pub fn serialize<S: Serializer>(
            stamp: &Option<NaiveDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match stamp {
                Some(value) => serializer.serialize_some(&format_stamp(value)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveDateTime>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            Ok(raw.as_deref().and_then(parse_stamp))
        }
    }
}

/// How a task is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fired by cron matching against wall-clock time.
    Schedule,
    /// Fired by a polled condition script or a process lifecycle event.
    Event,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Schedule => write!(f, "schedule"),
            TriggerType::Event => write!(f, "event"),
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(TriggerType::Schedule),
            "event" => Ok(TriggerType::Event),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// Kind of event that fires an event-triggered task.
///
/// Schedule tasks carry `Script` as an inert placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[default]
    Script,
    SystemBoot,
    SystemShutdown,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Script => write!(f, "script"),
            EventType::SystemBoot => write!(f, "system_boot"),
            EventType::SystemShutdown => write!(f, "system_shutdown"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(EventType::Script),
            "system_boot" => Ok(EventType::SystemBoot),
            "system_shutdown" => Ok(EventType::SystemShutdown),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// State of a single task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Why a run was started; recorded verbatim on the result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Schedule,
    Condition,
    Manual,
    SystemBoot,
    SystemShutdown,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Schedule => "schedule",
            TriggerReason::Condition => "condition",
            TriggerReason::Manual => "manual",
            TriggerReason::SystemBoot => "system_boot",
            TriggerReason::SystemShutdown => "system_shutdown",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted task. The payload validator is the sole constructor path;
/// exactly the fields relevant to `trigger_type` are non-null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub account: String,
    pub trigger_type: TriggerType,
    pub schedule_expression: Option<String>,
    pub condition_script: Option<String>,
    pub condition_interval: i64,
    pub event_type: EventType,
    pub is_active: bool,
    pub pre_task_ids: Vec<i64>,
    pub script_body: String,
    #[serde(with = "stamp::option")]
    pub last_run_at: Option<NaiveDateTime>,
    #[serde(with = "stamp::option")]
    pub next_run_at: Option<NaiveDateTime>,
    #[serde(with = "stamp::option")]
    pub last_condition_check_at: Option<NaiveDateTime>,
    #[serde(with = "stamp")]
    pub created_at: NaiveDateTime,
    #[serde(with = "stamp")]
    pub updated_at: NaiveDateTime,
}

/// One recorded execution of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: i64,
    pub task_id: i64,
    pub status: RunStatus,
    pub trigger_reason: String,
    #[serde(with = "stamp")]
    pub started_at: NaiveDateTime,
    #[serde(with = "stamp::option")]
    pub finished_at: Option<NaiveDateTime>,
    pub log: Option<String>,
}

/// A reusable script template. Pure catalog data with no engine behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub script_body: String,
    #[serde(with = "stamp")]
    pub created_at: NaiveDateTime,
    #[serde(with = "stamp")]
    pub updated_at: NaiveDateTime,
}
