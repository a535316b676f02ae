//! Persistent task catalog backed by SQLite.
//!
//! One connection behind a `tokio::sync::Mutex` serializes every read and
//! write, so each operation observes a consistent snapshot at its call
//! instant. The schema version lives in `PRAGMA user_version` (current = 2)
//! so existing databases migrate in place.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};

use crate::accounts::AccountDirectory;

use super::cron::{CronError, CronExpression};
use super::payload::{normalize, TaskPayload, ValidationError};
use super::types::{
    format_stamp, local_now, parse_stamp, EventType, RunStatus, Task, TaskResult, Template,
    TriggerType,
};

/// Current schema version.
const DB_LATEST_VERSION: i64 = 2;

/// Errors produced by the task store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task name already exists")]
    NameConflict,
    #[error("template key already exists")]
    TemplateKeyConflict,
    #[error("template name is required")]
    TemplateNameRequired,
    #[error("template script body is required")]
    TemplateScriptRequired,
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Cron(#[from] CronError),
    #[error("SQLite error: {0}")]
    Sqlite(String),
    #[error("row decode error: {0}")]
    Decode(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err.to_string())
    }
}

/// Counts returned by a template import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Entry in a template export/import mapping.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TemplateEntry {
    pub name: String,
    pub script_body: String,
}

/// Raw template payload from the control plane.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct TemplatePayload {
    pub key: Option<String>,
    pub name: Option<String>,
    pub script_body: Option<String>,
}

/// SQLite-backed catalog of tasks, results, and templates.
pub struct TaskStore {
    conn: tokio::sync::Mutex<Connection>,
    accounts: AccountDirectory,
}

impl TaskStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path, accounts: AccountDirectory) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::setup(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            accounts,
        })
    }

    /// Open an in-memory store (useful for tests).
    pub fn open_in_memory(accounts: AccountDirectory) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::setup(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            accounts,
        })
    }

    pub fn accounts(&self) -> &AccountDirectory {
        &self.accounts
    }

    fn setup(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let mut version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < 1 {
            Self::create_schema(conn)?;
            conn.pragma_update(None, "user_version", DB_LATEST_VERSION)?;
            version = DB_LATEST_VERSION;
        }
        if version < 2 {
            // Idempotent: tolerate re-running against an already-migrated file.
            if let Err(err) = conn.execute(
                "ALTER TABLE tasks ADD COLUMN event_type TEXT NOT NULL DEFAULT 'script'",
                [],
            ) {
                if !err.to_string().to_lowercase().contains("duplicate column") {
                    return Err(err.into());
                }
            }
            conn.pragma_update(None, "user_version", 2)?;
            version = 2;
        }
        if version < DB_LATEST_VERSION {
            conn.pragma_update(None, "user_version", DB_LATEST_VERSION)?;
        }

        // Installations that predate templates lack the table entirely.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                script_body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn create_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                account TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                schedule_expression TEXT,
                condition_script TEXT,
                condition_interval INTEGER NOT NULL DEFAULT 60,
                event_type TEXT NOT NULL DEFAULT 'script',
                is_active INTEGER NOT NULL DEFAULT 1,
                pre_task_ids TEXT NOT NULL DEFAULT '[]',
                script_body TEXT NOT NULL,
                last_run_at TEXT,
                next_run_at TEXT,
                last_condition_check_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                trigger_reason TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                log TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_task_results_task
                ON task_results(task_id, started_at DESC);

            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                script_body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    /// Validate and insert a new task; returns the stored record.
    pub async fn create_task(&self, payload: &TaskPayload) -> Result<Task, StoreError> {
        let now = local_now();
        let draft = normalize(payload, None, &self.accounts, now)?;
        let stamp = format_stamp(&now);
        let task_id = {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO tasks (
                    name, account, trigger_type, schedule_expression, condition_script,
                    condition_interval, event_type, is_active, pre_task_ids, script_body,
                    last_run_at, next_run_at, last_condition_check_at, created_at, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    draft.name,
                    draft.account,
                    draft.trigger_type.to_string(),
                    draft.schedule_expression,
                    draft.condition_script,
                    draft.condition_interval,
                    draft.event_type.to_string(),
                    draft.is_active as i64,
                    encode_ids(&draft.pre_task_ids),
                    draft.script_body,
                    draft.last_run_at.as_ref().map(format_stamp),
                    draft.next_run_at.as_ref().map(format_stamp),
                    draft.last_condition_check_at.as_ref().map(format_stamp),
                    stamp,
                    stamp,
                ],
            )
            .map_err(|e| map_integrity(e, StoreError::NameConflict))?;
            conn.last_insert_rowid()
        };
        self.get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::Decode("inserted task vanished".to_string()))
    }

    /// Merge a payload over an existing task, re-validate, and write.
    /// Returns `None` when the task does not exist.
    pub async fn update_task(
        &self,
        task_id: i64,
        payload: &TaskPayload,
    ) -> Result<Option<Task>, StoreError> {
        let Some(existing) = self.get_task(task_id).await? else {
            return Ok(None);
        };
        let now = local_now();
        let draft = normalize(payload, Some(&existing), &self.accounts, now)?;
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE tasks SET
                    name=?1, account=?2, trigger_type=?3, schedule_expression=?4,
                    condition_script=?5, condition_interval=?6, event_type=?7, is_active=?8,
                    pre_task_ids=?9, script_body=?10, last_run_at=?11, next_run_at=?12,
                    last_condition_check_at=?13, updated_at=?14
                 WHERE id=?15",
                params![
                    draft.name,
                    draft.account,
                    draft.trigger_type.to_string(),
                    draft.schedule_expression,
                    draft.condition_script,
                    draft.condition_interval,
                    draft.event_type.to_string(),
                    draft.is_active as i64,
                    encode_ids(&draft.pre_task_ids),
                    draft.script_body,
                    draft.last_run_at.as_ref().map(format_stamp),
                    draft.next_run_at.as_ref().map(format_stamp),
                    draft.last_condition_check_at.as_ref().map(format_stamp),
                    format_stamp(&now),
                    task_id,
                ],
            )
            .map_err(|e| map_integrity(e, StoreError::NameConflict))?;
        }
        self.get_task(task_id).await
    }

    /// Delete a task; results cascade.
    pub async fn delete_task(&self, task_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute("DELETE FROM tasks WHERE id=?1", params![task_id])?;
        Ok(rows > 0)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("{TASK_SELECT} WHERE id=?1"),
                params![task_id],
                row_to_task,
            )
            .optional()?;
        row.transpose()
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{TASK_SELECT} ORDER BY id ASC"))?;
        let result = collect_tasks(stmt.query_map([], row_to_task)?);
        result
    }

    pub async fn count_tasks(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row("SELECT COUNT(1) FROM tasks", [], |row| row.get(0))?)
    }

    /// Active schedule tasks whose `next_run_at` has arrived, soonest first.
    pub async fn fetch_due_tasks(&self, moment: NaiveDateTime) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{TASK_SELECT}
             WHERE trigger_type='schedule' AND is_active=1
               AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at ASC"
        ))?;
        let result = collect_tasks(stmt.query_map(params![format_stamp(&moment)], row_to_task)?);
        result
    }

    /// Active event tasks, optionally filtered by event type, id order.
    pub async fn fetch_event_tasks(
        &self,
        event_type: Option<EventType>,
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().await;
        match event_type {
            Some(filter) => {
                let mut stmt = conn.prepare(&format!(
                    "{TASK_SELECT}
                     WHERE trigger_type='event' AND is_active=1 AND event_type=?1
                     ORDER BY id ASC"
                ))?;
                let result = collect_tasks(stmt.query_map(params![filter.to_string()], row_to_task)?);
                result
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{TASK_SELECT}
                     WHERE trigger_type='event' AND is_active=1
                     ORDER BY id ASC"
                ))?;
                let result = collect_tasks(stmt.query_map([], row_to_task)?);
                result
            }
        }
    }

    // ── Results ───────────────────────────────────────────────────────

    /// Claim a run: insert a `running` result unless one already exists for
    /// the task. Returns `None` when the claim loses, so two dispatchers can
    /// never double-start a task.
    pub async fn record_result_start(
        &self,
        task_id: i64,
        trigger_reason: &str,
    ) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "INSERT INTO task_results (task_id, status, trigger_reason, started_at)
             SELECT ?1, 'running', ?2, ?3
             WHERE NOT EXISTS (
                 SELECT 1 FROM task_results WHERE task_id=?1 AND status='running'
             )",
            params![task_id, trigger_reason, format_stamp(&local_now())],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Terminal transition for a run record.
    pub async fn finalize_result(
        &self,
        result_id: i64,
        status: RunStatus,
        log_text: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE task_results SET status=?1, finished_at=?2, log=?3 WHERE id=?4",
            params![
                status.to_string(),
                format_stamp(&local_now()),
                log_text,
                result_id
            ],
        )?;
        Ok(())
    }

    /// Result page for a task, newest first.
    pub async fn fetch_results(
        &self,
        task_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskResult>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, status, trigger_reason, started_at, finished_at, log
             FROM task_results WHERE task_id=?1
             ORDER BY started_at DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![task_id, limit, offset], row_to_result)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row??);
        }
        Ok(results)
    }

    pub async fn get_latest_result(&self, task_id: i64) -> Result<Option<TaskResult>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, task_id, status, trigger_reason, started_at, finished_at, log
                 FROM task_results WHERE task_id=?1
                 ORDER BY started_at DESC LIMIT 1",
                params![task_id],
                row_to_result,
            )
            .optional()?;
        row.transpose()
    }

    /// Purge results for a task; one result when `result_id` is given, all
    /// otherwise. Returns the number of deleted rows.
    pub async fn delete_results(
        &self,
        task_id: i64,
        result_id: Option<i64>,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let rows = match result_id {
            Some(result_id) => conn.execute(
                "DELETE FROM task_results WHERE task_id=?1 AND id=?2",
                params![task_id, result_id],
            )?,
            None => conn.execute(
                "DELETE FROM task_results WHERE task_id=?1",
                params![task_id],
            )?,
        };
        Ok(rows)
    }

    pub async fn has_running_instance(&self, task_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM task_results WHERE task_id=?1 AND status='running'",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Dependencies are met when every `pre_task_id` resolves to a task whose
    /// latest result is `success`. A missing task id blocks too.
    pub async fn dependencies_met(&self, task: &Task) -> Result<bool, StoreError> {
        for dep_id in &task.pre_task_ids {
            match self.get_latest_result(*dep_id).await? {
                Some(result) if result.status == RunStatus::Success => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    // ── Run-state stamps ──────────────────────────────────────────────

    pub async fn update_last_run(&self, task_id: i64) -> Result<(), StoreError> {
        let stamp = format_stamp(&local_now());
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET last_run_at=?1, updated_at=?1 WHERE id=?2",
            params![stamp, task_id],
        )?;
        Ok(())
    }

    /// Compute the next cron match after `base` and persist it.
    pub async fn schedule_next_run(
        &self,
        task_id: i64,
        expression: &str,
        base: NaiveDateTime,
    ) -> Result<Option<NaiveDateTime>, StoreError> {
        if expression.is_empty() {
            return Ok(None);
        }
        let cron = CronExpression::parse(expression)?;
        let next = cron.next_after(base)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET next_run_at=?1, updated_at=?2 WHERE id=?3",
            params![format_stamp(&next), format_stamp(&local_now()), task_id],
        )?;
        Ok(Some(next))
    }

    pub async fn update_condition_check(&self, task_id: i64) -> Result<(), StoreError> {
        let stamp = format_stamp(&local_now());
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET last_condition_check_at=?1, updated_at=?1 WHERE id=?2",
            params![stamp, task_id],
        )?;
        Ok(())
    }

    // ── Templates ─────────────────────────────────────────────────────

    pub async fn list_templates(&self) -> Result<Vec<Template>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{TEMPLATE_SELECT} ORDER BY id ASC"))?;
        let rows = stmt.query_map([], row_to_template)?;
        let mut templates = Vec::new();
        for row in rows {
            templates.push(row??);
        }
        Ok(templates)
    }

    pub async fn get_template(&self, template_id: i64) -> Result<Option<Template>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("{TEMPLATE_SELECT} WHERE id=?1"),
                params![template_id],
                row_to_template,
            )
            .optional()?;
        row.transpose()
    }

    /// Insert a template; a missing key is generated from the name.
    pub async fn create_template(&self, payload: &TemplatePayload) -> Result<Template, StoreError> {
        let name = payload.name.as_deref().unwrap_or_default().trim().to_string();
        let script_body = payload
            .script_body
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if name.is_empty() {
            return Err(StoreError::TemplateNameRequired);
        }
        if script_body.is_empty() {
            return Err(StoreError::TemplateScriptRequired);
        }
        let requested_key = payload.key.as_deref().unwrap_or_default().trim().to_string();
        let stamp = format_stamp(&local_now());

        let template_id = {
            let conn = self.conn.lock().await;
            let key = if requested_key.is_empty() {
                generate_template_key(&conn, &name)?
            } else {
                requested_key
            };
            conn.execute(
                "INSERT INTO templates (key, name, script_body, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5)",
                params![key, name, script_body, stamp, stamp],
            )
            .map_err(|e| map_integrity(e, StoreError::TemplateKeyConflict))?;
            conn.last_insert_rowid()
        };
        self.get_template(template_id)
            .await?
            .ok_or_else(|| StoreError::Decode("inserted template vanished".to_string()))
    }

    pub async fn update_template(
        &self,
        template_id: i64,
        payload: &TemplatePayload,
    ) -> Result<Option<Template>, StoreError> {
        let Some(existing) = self.get_template(template_id).await? else {
            return Ok(None);
        };
        let name = payload
            .name
            .clone()
            .unwrap_or(existing.name)
            .trim()
            .to_string();
        let script_body = payload
            .script_body
            .clone()
            .unwrap_or(existing.script_body)
            .trim()
            .to_string();
        let key = payload.key.clone().unwrap_or(existing.key).trim().to_string();
        if name.is_empty() {
            return Err(StoreError::TemplateNameRequired);
        }
        if script_body.is_empty() {
            return Err(StoreError::TemplateScriptRequired);
        }
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE templates SET key=?1, name=?2, script_body=?3, updated_at=?4 WHERE id=?5",
                params![
                    key,
                    name,
                    script_body,
                    format_stamp(&local_now()),
                    template_id
                ],
            )
            .map_err(|e| map_integrity(e, StoreError::TemplateKeyConflict))?;
        }
        self.get_template(template_id).await
    }

    pub async fn delete_template(&self, template_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute("DELETE FROM templates WHERE id=?1", params![template_id])?;
        Ok(rows > 0)
    }

    /// Upsert templates from a key → `{name, script_body}` mapping. Entries
    /// with an empty script body are skipped.
    pub async fn import_templates(
        &self,
        mapping: &BTreeMap<String, TemplateEntry>,
    ) -> Result<ImportSummary, StoreError> {
        let stamp = format_stamp(&local_now());
        let mut summary = ImportSummary {
            inserted: 0,
            updated: 0,
        };
        let conn = self.conn.lock().await;
        for (key, entry) in mapping {
            let name = if entry.name.trim().is_empty() {
                key.clone()
            } else {
                entry.name.trim().to_string()
            };
            let script_body = entry.script_body.trim().to_string();
            if script_body.is_empty() {
                continue;
            }
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM templates WHERE key=?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                conn.execute(
                    "UPDATE templates SET name=?1, script_body=?2, updated_at=?3 WHERE key=?4",
                    params![name, script_body, stamp, key],
                )?;
                summary.updated += 1;
            } else {
                conn.execute(
                    "INSERT INTO templates (key, name, script_body, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5)",
                    params![key, name, script_body, stamp, stamp],
                )?;
                summary.inserted += 1;
            }
        }
        Ok(summary)
    }

    /// Export all templates as a key → `{name, script_body}` mapping.
    pub async fn export_templates(&self) -> Result<BTreeMap<String, TemplateEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT key, name, script_body FROM templates ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut mapping = BTreeMap::new();
        for row in rows {
            let (key, name, script_body) = row?;
            mapping.insert(key, TemplateEntry { name, script_body });
        }
        Ok(mapping)
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

const TASK_SELECT: &str = "SELECT id, name, account, trigger_type, schedule_expression,
    condition_script, condition_interval, event_type, is_active, pre_task_ids,
    script_body, last_run_at, next_run_at, last_condition_check_at, created_at, updated_at
 FROM tasks";

const TEMPLATE_SELECT: &str =
    "SELECT id, key, name, script_body, created_at, updated_at FROM templates";

fn map_integrity(err: rusqlite::Error, conflict: StoreError) -> StoreError {
    let message = err.to_string().to_lowercase();
    if message.contains("unique") {
        return conflict;
    }
    StoreError::Sqlite(err.to_string())
}

fn encode_ids(ids: &[i64]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

fn parse_required_stamp(raw: &str, column: &str) -> Result<NaiveDateTime, StoreError> {
    parse_stamp(raw).ok_or_else(|| StoreError::Decode(format!("bad {column} stamp: {raw}")))
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Task, StoreError>> {
    let id: i64 = row.get(0)?;
    let name: String = row.get(1)?;
    let account: String = row.get(2)?;
    let trigger_raw: String = row.get(3)?;
    let schedule_expression: Option<String> = row.get(4)?;
    let condition_script: Option<String> = row.get(5)?;
    let condition_interval: i64 = row.get(6)?;
    let event_raw: Option<String> = row.get(7)?;
    let is_active: i64 = row.get(8)?;
    let pre_task_raw: String = row.get(9)?;
    let script_body: String = row.get(10)?;
    let last_run_raw: Option<String> = row.get(11)?;
    let next_run_raw: Option<String> = row.get(12)?;
    let last_check_raw: Option<String> = row.get(13)?;
    let created_raw: String = row.get(14)?;
    let updated_raw: String = row.get(15)?;

    Ok((|| -> Result<Task, StoreError> {
        let trigger_type: TriggerType = trigger_raw.parse().map_err(StoreError::Decode)?;
        let event_type: EventType = match event_raw.as_deref() {
            None | Some("") => EventType::Script,
            Some(raw) => raw.parse().map_err(StoreError::Decode)?,
        };
        let pre_task_ids: Vec<i64> = serde_json::from_str(&pre_task_raw).unwrap_or_default();
        Ok(Task {
            id,
            name,
            account,
            trigger_type,
            schedule_expression,
            condition_script,
            condition_interval,
            event_type,
            is_active: is_active != 0,
            pre_task_ids,
            script_body,
            last_run_at: last_run_raw.as_deref().and_then(parse_stamp),
            next_run_at: next_run_raw.as_deref().and_then(parse_stamp),
            last_condition_check_at: last_check_raw.as_deref().and_then(parse_stamp),
            created_at: parse_required_stamp(&created_raw, "created_at")?,
            updated_at: parse_required_stamp(&updated_raw, "updated_at")?,
        })
    })())
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<TaskResult, StoreError>> {
    let id: i64 = row.get(0)?;
    let task_id: i64 = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let trigger_reason: String = row.get(3)?;
    let started_raw: String = row.get(4)?;
    let finished_raw: Option<String> = row.get(5)?;
    let log: Option<String> = row.get(6)?;

    Ok((|| -> Result<TaskResult, StoreError> {
        Ok(TaskResult {
            id,
            task_id,
            status: status_raw.parse().map_err(StoreError::Decode)?,
            trigger_reason,
            started_at: parse_required_stamp(&started_raw, "started_at")?,
            finished_at: finished_raw.as_deref().and_then(parse_stamp),
            log,
        })
    })())
}

fn row_to_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Template, StoreError>> {
    let id: i64 = row.get(0)?;
    let key: String = row.get(1)?;
    let name: String = row.get(2)?;
    let script_body: String = row.get(3)?;
    let created_raw: String = row.get(4)?;
    let updated_raw: String = row.get(5)?;

    Ok((|| -> Result<Template, StoreError> {
        Ok(Template {
            id,
            key,
            name,
            script_body,
            created_at: parse_required_stamp(&created_raw, "created_at")?,
            updated_at: parse_required_stamp(&updated_raw, "updated_at")?,
        })
    })())
}

fn collect_tasks(
    rows: impl Iterator<Item = rusqlite::Result<Result<Task, StoreError>>>,
) -> Result<Vec<Task>, StoreError> {
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row??);
    }
    Ok(tasks)
}

/// Derive a unique key from a template name: lowercased, spaces to
/// underscores, `_N` suffix to disambiguate.
fn generate_template_key(conn: &Connection, name: &str) -> Result<String, StoreError> {
    let base = name.to_lowercase().replace(' ', "_");
    let mut key = base.clone();
    let mut index = 1;
    loop {
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM templates WHERE key=?1",
            params![key],
            |row| row.get(0),
        )?;
        if count == 0 {
            return Ok(key);
        }
        index += 1;
        key = format!("{base}_{index}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::types::local_now;
    use chrono::Duration;

    fn directory() -> AccountDirectory {
        AccountDirectory::fixed(vec!["ops".to_string(), "deploy".to_string()])
    }

    fn store() -> TaskStore {
        TaskStore::open_in_memory(directory()).unwrap()
    }

    fn schedule_payload(name: &str) -> TaskPayload {
        TaskPayload {
            name: Some(name.to_string()),
            account: Some("ops".to_string()),
            trigger_type: Some("schedule".to_string()),
            schedule_expression: Some("0 3 * * *".to_string()),
            script_body: Some("echo hi".to_string()),
            ..TaskPayload::default()
        }
    }

    fn event_payload(name: &str, event_type: &str) -> TaskPayload {
        TaskPayload {
            name: Some(name.to_string()),
            account: Some("ops".to_string()),
            trigger_type: Some("event".to_string()),
            event_type: Some(event_type.to_string()),
            condition_script: Some("exit 0".to_string()),
            script_body: Some("echo event".to_string()),
            ..TaskPayload::default()
        }
    }

    #[tokio::test]
    async fn create_and_get_task() {
        let store = store();
        let task = store.create_task(&schedule_payload("nightly")).await.unwrap();
        assert!(task.id > 0);
        assert_eq!(task.name, "nightly");
        assert_eq!(task.trigger_type, TriggerType::Schedule);
        assert!(task.next_run_at.is_some());
        assert!(task.updated_at >= task.created_at);

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, task.name);
        assert!(store.get_task(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let store = store();
        store.create_task(&schedule_payload("dup")).await.unwrap();
        assert!(matches!(
            store.create_task(&schedule_payload("dup")).await,
            Err(StoreError::NameConflict)
        ));
    }

    #[tokio::test]
    async fn list_tasks_ordered_by_id() {
        let store = store();
        store.create_task(&schedule_payload("a")).await.unwrap();
        store.create_task(&schedule_payload("b")).await.unwrap();
        let tasks = store.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].id < tasks[1].id);
        assert_eq!(store.count_tasks().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_task_merges_and_revalidates() {
        let store = store();
        let task = store.create_task(&schedule_payload("merge")).await.unwrap();

        let updated = store
            .update_task(task.id, &TaskPayload::set_active(false))
            .await
            .unwrap()
            .unwrap();
        assert!(!updated.is_active);
        assert_eq!(updated.schedule_expression, task.schedule_expression);
        assert_eq!(updated.next_run_at, task.next_run_at);

        assert!(store
            .update_task(9999, &TaskPayload::set_active(true))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_rename_conflict() {
        let store = store();
        store.create_task(&schedule_payload("one")).await.unwrap();
        let second = store.create_task(&schedule_payload("two")).await.unwrap();
        let payload = TaskPayload {
            name: Some("one".to_string()),
            ..TaskPayload::default()
        };
        assert!(matches!(
            store.update_task(second.id, &payload).await,
            Err(StoreError::NameConflict)
        ));
    }

    #[tokio::test]
    async fn delete_task_cascades_to_results() {
        let store = store();
        let task = store.create_task(&schedule_payload("gone")).await.unwrap();
        store
            .record_result_start(task.id, "manual")
            .await
            .unwrap()
            .unwrap();
        assert!(store.delete_task(task.id).await.unwrap());
        assert!(!store.delete_task(task.id).await.unwrap());
        assert!(store.fetch_results(task.id, 50, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_tasks_filtering_and_order() {
        let store = store();
        let due_early = store.create_task(&schedule_payload("early")).await.unwrap();
        let due_late = store.create_task(&schedule_payload("late")).await.unwrap();
        let future = store.create_task(&schedule_payload("future")).await.unwrap();
        let inactive = store.create_task(&schedule_payload("off")).await.unwrap();
        store.create_task(&event_payload("evt", "script")).await.unwrap();

        let now = local_now();
        store
            .schedule_next_run(due_early.id, "* * * * *", now - Duration::hours(3))
            .await
            .unwrap();
        store
            .schedule_next_run(due_late.id, "* * * * *", now - Duration::hours(1))
            .await
            .unwrap();
        store
            .update_task(inactive.id, &TaskPayload::set_active(false))
            .await
            .unwrap();
        store
            .schedule_next_run(inactive.id, "* * * * *", now - Duration::hours(1))
            .await
            .unwrap();

        let due = store.fetch_due_tasks(now).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![due_early.id, due_late.id]);
        assert!(!ids.contains(&future.id));
    }

    #[tokio::test]
    async fn event_tasks_filtering() {
        let store = store();
        store.create_task(&event_payload("cond", "script")).await.unwrap();
        store
            .create_task(&event_payload("boot", "system_boot"))
            .await
            .unwrap();
        store.create_task(&schedule_payload("sched")).await.unwrap();

        let all = store.fetch_event_tasks(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let boot = store
            .fetch_event_tasks(Some(EventType::SystemBoot))
            .await
            .unwrap();
        assert_eq!(boot.len(), 1);
        assert_eq!(boot[0].name, "boot");
    }

    #[tokio::test]
    async fn run_claim_is_exclusive_per_task() {
        let store = store();
        let task = store.create_task(&schedule_payload("claim")).await.unwrap();

        let first = store.record_result_start(task.id, "schedule").await.unwrap();
        assert!(first.is_some());
        assert!(store.has_running_instance(task.id).await.unwrap());

        // A second claim loses while the first is still running.
        let second = store.record_result_start(task.id, "manual").await.unwrap();
        assert!(second.is_none());

        store
            .finalize_result(first.unwrap(), RunStatus::Success, "done")
            .await
            .unwrap();
        assert!(!store.has_running_instance(task.id).await.unwrap());

        // After finalization a new claim succeeds.
        assert!(store
            .record_result_start(task.id, "manual")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn finalize_sets_terminal_fields() {
        let store = store();
        let task = store.create_task(&schedule_payload("final")).await.unwrap();
        let result_id = store
            .record_result_start(task.id, "manual")
            .await
            .unwrap()
            .unwrap();
        store
            .finalize_result(result_id, RunStatus::Failed, "boom")
            .await
            .unwrap();

        let latest = store.get_latest_result(task.id).await.unwrap().unwrap();
        assert_eq!(latest.id, result_id);
        assert_eq!(latest.status, RunStatus::Failed);
        assert_eq!(latest.log.as_deref(), Some("boom"));
        assert!(latest.finished_at.is_some());
    }

    #[tokio::test]
    async fn results_paging_newest_first() {
        let store = store();
        let task = store.create_task(&schedule_payload("paging")).await.unwrap();
        for index in 0..3 {
            let id = store
                .record_result_start(task.id, "manual")
                .await
                .unwrap()
                .unwrap();
            store
                .finalize_result(id, RunStatus::Success, &format!("run {index}"))
                .await
                .unwrap();
        }
        let page = store.fetch_results(task.id, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].id > page[1].id);
        let rest = store.fetch_results(task.id, 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn delete_results_single_and_all() {
        let store = store();
        let task = store.create_task(&schedule_payload("purge")).await.unwrap();
        let first = store
            .record_result_start(task.id, "manual")
            .await
            .unwrap()
            .unwrap();
        store
            .finalize_result(first, RunStatus::Success, "")
            .await
            .unwrap();
        let second = store
            .record_result_start(task.id, "manual")
            .await
            .unwrap()
            .unwrap();
        store
            .finalize_result(second, RunStatus::Success, "")
            .await
            .unwrap();

        assert_eq!(store.delete_results(task.id, Some(first)).await.unwrap(), 1);
        assert_eq!(store.delete_results(task.id, None).await.unwrap(), 1);
        assert!(store.fetch_results(task.id, 50, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dependency_gate() {
        let store = store();
        let dep = store.create_task(&schedule_payload("dep")).await.unwrap();
        let mut payload = schedule_payload("dependent");
        payload.pre_task_ids = Some(serde_json::json!([dep.id]));
        let task = store.create_task(&payload).await.unwrap();

        // No prior run blocks.
        assert!(!store.dependencies_met(&task).await.unwrap());

        // A failed latest result blocks.
        let run = store
            .record_result_start(dep.id, "manual")
            .await
            .unwrap()
            .unwrap();
        store
            .finalize_result(run, RunStatus::Failed, "")
            .await
            .unwrap();
        assert!(!store.dependencies_met(&task).await.unwrap());

        // A successful latest result unblocks.
        let run = store
            .record_result_start(dep.id, "manual")
            .await
            .unwrap()
            .unwrap();
        store
            .finalize_result(run, RunStatus::Success, "")
            .await
            .unwrap();
        assert!(store.dependencies_met(&task).await.unwrap());

        // A missing dependency id blocks.
        let mut payload = schedule_payload("ghost-dep");
        payload.pre_task_ids = Some(serde_json::json!([9999]));
        let ghost = store.create_task(&payload).await.unwrap();
        assert!(!store.dependencies_met(&ghost).await.unwrap());
    }

    #[tokio::test]
    async fn run_state_stamps() {
        let store = store();
        let task = store.create_task(&schedule_payload("stamps")).await.unwrap();

        store.update_last_run(task.id).await.unwrap();
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert!(loaded.last_run_at.is_some());

        store.update_condition_check(task.id).await.unwrap();
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert!(loaded.last_condition_check_at.is_some());

        let next = store
            .schedule_next_run(task.id, "0 3 * * *", local_now())
            .await
            .unwrap()
            .unwrap();
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.next_run_at, Some(next));
        assert!(next > local_now());
    }

    #[tokio::test]
    async fn migrates_v1_database_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    account TEXT NOT NULL,
                    trigger_type TEXT NOT NULL,
                    schedule_expression TEXT,
                    condition_script TEXT,
                    condition_interval INTEGER NOT NULL DEFAULT 60,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    pre_task_ids TEXT NOT NULL DEFAULT '[]',
                    script_body TEXT NOT NULL,
                    last_run_at TEXT,
                    next_run_at TEXT,
                    last_condition_check_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE task_results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    status TEXT NOT NULL,
                    trigger_reason TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    log TEXT
                );",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO tasks (name, account, trigger_type, schedule_expression,
                    script_body, created_at, updated_at)
                 VALUES ('legacy', 'ops', 'schedule', '0 3 * * *', 'echo hi',
                    '2024-01-01 00:00:00', '2024-01-01 00:00:00')",
                [],
            )
            .unwrap();
            conn.pragma_update(None, "user_version", 1).unwrap();
        }

        let store = TaskStore::open(&path, directory()).unwrap();
        let legacy = store.list_tasks().await.unwrap();
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[0].event_type, EventType::Script);

        // Templates table exists even though v1 never had it.
        let template = store
            .create_template(&TemplatePayload {
                name: Some("Daily Backup".to_string()),
                script_body: Some("tar czf /backup.tgz /data".to_string()),
                ..TemplatePayload::default()
            })
            .await
            .unwrap();
        assert_eq!(template.key, "daily_backup");
        drop(store);

        // Re-opening an already-migrated database is a no-op.
        let store = TaskStore::open(&path, directory()).unwrap();
        assert_eq!(store.count_tasks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn template_crud_and_key_generation() {
        let store = store();
        let first = store
            .create_template(&TemplatePayload {
                name: Some("Daily Backup".to_string()),
                script_body: Some("echo backup".to_string()),
                ..TemplatePayload::default()
            })
            .await
            .unwrap();
        assert_eq!(first.key, "daily_backup");

        let second = store
            .create_template(&TemplatePayload {
                name: Some("Daily Backup".to_string()),
                script_body: Some("echo other".to_string()),
                ..TemplatePayload::default()
            })
            .await
            .unwrap();
        assert_eq!(second.key, "daily_backup_2");

        assert!(matches!(
            store
                .create_template(&TemplatePayload {
                    key: Some("daily_backup".to_string()),
                    name: Some("Clash".to_string()),
                    script_body: Some("echo clash".to_string()),
                })
                .await,
            Err(StoreError::TemplateKeyConflict)
        ));

        assert!(matches!(
            store
                .create_template(&TemplatePayload {
                    name: Some("No Script".to_string()),
                    ..TemplatePayload::default()
                })
                .await,
            Err(StoreError::TemplateScriptRequired)
        ));

        let renamed = store
            .update_template(
                first.id,
                &TemplatePayload {
                    name: Some("Nightly Backup".to_string()),
                    ..TemplatePayload::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.name, "Nightly Backup");
        assert_eq!(renamed.key, "daily_backup");

        assert!(store.delete_template(second.id).await.unwrap());
        assert!(store.get_template(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn template_import_and_export() {
        let store = store();
        store
            .create_template(&TemplatePayload {
                key: Some("existing".to_string()),
                name: Some("Existing".to_string()),
                script_body: Some("echo old".to_string()),
            })
            .await
            .unwrap();

        let mut mapping = BTreeMap::new();
        mapping.insert(
            "existing".to_string(),
            TemplateEntry {
                name: "Existing".to_string(),
                script_body: "echo new".to_string(),
            },
        );
        mapping.insert(
            "fresh".to_string(),
            TemplateEntry {
                name: String::new(),
                script_body: "echo fresh".to_string(),
            },
        );
        mapping.insert(
            "skipped".to_string(),
            TemplateEntry {
                name: "Skipped".to_string(),
                script_body: "   ".to_string(),
            },
        );

        let summary = store.import_templates(&mapping).await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.updated, 1);

        let exported = store.export_templates().await.unwrap();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported["existing"].script_body, "echo new");
        // Import falls back to the key when no name is given.
        assert_eq!(exported["fresh"].name, "fresh");
    }
}
