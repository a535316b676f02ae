//! Payload validation and normalization.
//!
//! Raw task payloads arrive as loosely-typed JSON. `normalize` merges a
//! payload over an existing row (for updates), enforces every invariant, and
//! produces the only kind of record the store will write. Fields belonging to
//! the other trigger mode are always nulled here, regardless of what the
//! merged payload carried.

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::accounts::{AccountDirectory, AccountError};

use super::cron::{CronError, CronExpression};
use super::types::{parse_stamp, EventType, Task, TriggerType};

/// Smallest accepted condition poll interval, in seconds.
pub const MIN_CONDITION_INTERVAL: i64 = 10;

/// Condition poll interval used when the payload does not carry one.
pub const DEFAULT_CONDITION_INTERVAL: i64 = 60;

/// Raw task payload as received from the control plane.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskPayload {
    pub name: Option<String>,
    pub account: Option<String>,
    pub trigger_type: Option<String>,
    pub schedule_expression: Option<String>,
    pub condition_script: Option<String>,
    pub condition_interval: Option<i64>,
    pub event_type: Option<String>,
    pub is_active: Option<bool>,
    /// Accepts either a JSON array or a JSON-encoded string of ids.
    pub pre_task_ids: Option<serde_json::Value>,
    pub script_body: Option<String>,
    pub next_run_at: Option<String>,
    pub last_run_at: Option<String>,
    pub last_condition_check_at: Option<String>,
}

impl TaskPayload {
    /// Payload that only flips the active flag (toggle and batch actions).
    pub fn set_active(is_active: bool) -> Self {
        Self {
            is_active: Some(is_active),
            ..Self::default()
        }
    }
}

/// Validation failures; the message names the offending field.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("trigger_type must be 'schedule' or 'event'")]
    TriggerType,
    #[error("task name is required")]
    NameRequired,
    #[error("account is required")]
    AccountRequired,
    #[error("script body is required")]
    ScriptBodyRequired,
    #[error("schedule expression is required")]
    ScheduleExpressionRequired,
    #[error("event type is not supported")]
    EventType,
    #[error("event tasks require condition script")]
    ConditionScriptRequired,
    #[error("pre_task_ids format error")]
    PreTaskIds,
    #[error("{0}")]
    Cron(#[from] CronError),
    #[error("{0}")]
    Account(#[from] AccountError),
}

/// A validated, invariant-safe record ready to be written by the store.
#[derive(Debug, Clone)]
pub struct TaskDraft {
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
    pub last_run_at: Option<NaiveDateTime>,
    pub next_run_at: Option<NaiveDateTime>,
    pub last_condition_check_at: Option<NaiveDateTime>,
}

/// Merge `payload` over `existing` (when updating) and validate the result.
pub fn normalize(
    payload: &TaskPayload,
    existing: Option<&Task>,
    accounts: &AccountDirectory,
    now: NaiveDateTime,
) -> Result<TaskDraft, ValidationError> {
    let is_update = existing.is_some();

    let trigger_raw = payload
        .trigger_type
        .clone()
        .or_else(|| existing.map(|t| t.trigger_type.to_string()))
        .unwrap_or_else(|| "schedule".to_string());
    let trigger_type: TriggerType = trigger_raw
        .trim()
        .parse()
        .map_err(|_| ValidationError::TriggerType)?;

    let name = merged_string(payload.name.as_deref(), existing.map(|t| t.name.as_str()));
    if name.is_empty() {
        return Err(ValidationError::NameRequired);
    }

    let mut account = merged_string(
        payload.account.as_deref(),
        existing.map(|t| t.account.as_str()),
    );
    if account.is_empty() && !accounts.posix_supported() {
        account = accounts.default_account().to_string();
    }
    if account.is_empty() {
        return Err(ValidationError::AccountRequired);
    }
    let account = accounts.ensure_allowed(&account)?;

    let script_body = merged_string(
        payload.script_body.as_deref(),
        existing.map(|t| t.script_body.as_str()),
    );
    if script_body.is_empty() {
        return Err(ValidationError::ScriptBodyRequired);
    }

    let is_active = payload
        .is_active
        .or_else(|| existing.map(|t| t.is_active))
        .unwrap_or(true);

    let mut schedule_expression = merged_optional(
        payload.schedule_expression.as_deref(),
        existing.and_then(|t| t.schedule_expression.as_deref()),
    );
    let mut condition_script = merged_optional(
        payload.condition_script.as_deref(),
        existing.and_then(|t| t.condition_script.as_deref()),
    );
    let condition_interval = payload
        .condition_interval
        .or_else(|| existing.map(|t| t.condition_interval))
        .unwrap_or(DEFAULT_CONDITION_INTERVAL)
        .max(MIN_CONDITION_INTERVAL);

    let pre_task_ids = normalize_pre_task_ids(
        payload.pre_task_ids.as_ref(),
        existing.map(|t| t.pre_task_ids.clone()),
        existing.map(|t| t.id),
    )?;

    let last_run_at = payload
        .last_run_at
        .as_deref()
        .and_then(parse_stamp)
        .or_else(|| existing.and_then(|t| t.last_run_at));
    let mut next_run_at = payload
        .next_run_at
        .as_deref()
        .and_then(parse_stamp)
        .or_else(|| existing.and_then(|t| t.next_run_at));
    let mut last_condition_check_at = payload
        .last_condition_check_at
        .as_deref()
        .and_then(parse_stamp)
        .or_else(|| existing.and_then(|t| t.last_condition_check_at));

    let event_type: EventType;
    match trigger_type {
        TriggerType::Schedule => {
            let expression = schedule_expression
                .clone()
                .ok_or(ValidationError::ScheduleExpressionRequired)?;
            let cron = CronExpression::parse(&expression)?;
            let expression_changed = existing.is_some_and(|t| {
                t.trigger_type == TriggerType::Schedule
                    && t.schedule_expression.as_deref() != Some(expression.as_str())
            });
            if !is_update || next_run_at.is_none() || expression_changed {
                next_run_at = Some(cron.next_after(now)?);
            }
            condition_script = None;
            event_type = EventType::Script;
        }
        TriggerType::Event => {
            let event_raw = payload
                .event_type
                .clone()
                .or_else(|| existing.map(|t| t.event_type.to_string()))
                .unwrap_or_default();
            let event_raw = event_raw.trim();
            event_type = if event_raw.is_empty() {
                EventType::Script
            } else {
                event_raw.parse().map_err(|_| ValidationError::EventType)?
            };
            if event_type == EventType::Script {
                if condition_script.is_none() {
                    return Err(ValidationError::ConditionScriptRequired);
                }
            } else {
                condition_script = None;
                last_condition_check_at = None;
            }
            schedule_expression = None;
        }
    }

    Ok(TaskDraft {
        name,
        account,
        trigger_type,
        schedule_expression,
        condition_script,
        condition_interval,
        event_type,
        is_active,
        pre_task_ids,
        script_body,
        last_run_at,
        next_run_at,
        last_condition_check_at,
    })
}

fn merged_string(payload_value: Option<&str>, existing_value: Option<&str>) -> String {
    payload_value
        .or(existing_value)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn merged_optional(payload_value: Option<&str>, existing_value: Option<&str>) -> Option<String> {
    payload_value
        .or(existing_value)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Coerce to integers, drop the task's own id, deduplicate preserving order.
fn normalize_pre_task_ids(
    raw: Option<&serde_json::Value>,
    existing: Option<Vec<i64>>,
    own_id: Option<i64>,
) -> Result<Vec<i64>, ValidationError> {
    let ids: Vec<i64> = match raw {
        None => existing.unwrap_or_default(),
        Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => coerce_id_elements(items)?,
        Some(serde_json::Value::String(encoded)) => {
            let parsed: serde_json::Value =
                serde_json::from_str(encoded).map_err(|_| ValidationError::PreTaskIds)?;
            match parsed {
                serde_json::Value::Array(items) => coerce_id_elements(&items)?,
                _ => return Err(ValidationError::PreTaskIds),
            }
        }
        Some(_) => return Err(ValidationError::PreTaskIds),
    };

    let mut cleaned: Vec<i64> = Vec::with_capacity(ids.len());
    for id in ids {
        if own_id == Some(id) {
            continue;
        }
        if !cleaned.contains(&id) {
            cleaned.push(id);
        }
    }
    Ok(cleaned)
}

fn coerce_id_elements(items: &[serde_json::Value]) -> Result<Vec<i64>, ValidationError> {
    items
        .iter()
        .map(|item| match item {
            serde_json::Value::Number(n) => n.as_i64().ok_or(ValidationError::PreTaskIds),
            serde_json::Value::String(s) => {
                s.trim().parse::<i64>().map_err(|_| ValidationError::PreTaskIds)
            }
            _ => Err(ValidationError::PreTaskIds),
        })
        .collect()
}
