//! Execution runner: one detached worker per task run.
//!
//! A worker claims a `running` result row, executes the task's script under
//! the task's account, and always finalizes the result before stamping
//! `last_run_at`. Failures of any kind (privilege, spawn, timeout, non-zero
//! exit) never propagate out of the worker; they become `failed` results.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::accounts;

use super::task_store::TaskStore;
use super::types::{RunStatus, Task, TriggerReason};

/// Privilege-drop parameters applied in the forked child before exec.
#[cfg(unix)]
#[derive(Debug, Clone)]
struct PrivilegeSwitch {
    uid: u32,
    gid: u32,
    groups: Vec<libc::gid_t>,
}

/// Resolved execution context for a task's account.
#[derive(Debug, Clone, Default)]
struct AccountContext {
    home: Option<String>,
    #[cfg(unix)]
    switch: Option<PrivilegeSwitch>,
}

/// Worker-side failures that abort a run before the script starts.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("account {0} does not exist, cannot execute task")]
    UnknownAccount(String),
    #[error("scheduler service must run as root to switch task execution account")]
    PermissionDenied,
}

/// Spawns and supervises a single task execution.
pub struct TaskRunner;

impl TaskRunner {
    /// Start a detached worker for one task run.
    pub fn spawn(
        store: Arc<TaskStore>,
        task: Task,
        reason: TriggerReason,
        timeout: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            Self::run(store, task, reason, timeout).await;
        })
    }

    async fn run(store: Arc<TaskStore>, task: Task, reason: TriggerReason, timeout: Duration) {
        tracing::info!("executing task {} ({})", task.id, reason);
        let result_id = match store.record_result_start(task.id, reason.as_str()).await {
            Ok(Some(result_id)) => result_id,
            Ok(None) => {
                tracing::info!("task {} already has a running instance, skip", task.id);
                return;
            }
            Err(err) => {
                tracing::error!("failed to record run start for task {}: {err}", task.id);
                return;
            }
        };

        let (log_text, status) = Self::execute_script(&task, reason, timeout).await;

        if let Err(err) = store.finalize_result(result_id, status, &log_text).await {
            tracing::error!("failed to finalize result {result_id}: {err}");
        }
        if let Err(err) = store.update_last_run(task.id).await {
            tracing::error!("failed to stamp last run for task {}: {err}", task.id);
        }
    }

    /// Execute the task's script body; never fails, always yields a log and
    /// a terminal status.
    async fn execute_script(
        task: &Task,
        reason: TriggerReason,
        timeout: Duration,
    ) -> (String, RunStatus) {
        let context = match Self::prepare_account_context(&task.account) {
            Ok(context) => context,
            Err(err) => return (err.to_string(), RunStatus::Failed),
        };

        let mut command = Self::build_command(&task.script_body);
        if let Some(home) = &context.home {
            command.env("HOME", home);
        }
        command
            .env("SCHEDULER_TASK_ID", task.id.to_string())
            .env("SCHEDULER_TASK_NAME", &task.name)
            .env("SCHEDULER_TASK_ACCOUNT", &task.account)
            .env("SCHEDULER_TRIGGER", reason.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        if let Some(switch) = context.switch {
            unsafe {
                command.pre_exec(move || {
                    // gid and supplementary groups must be set before the
                    // uid drop.
                    if libc::setgid(switch.gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if !switch.groups.is_empty()
                        && libc::setgroups(switch.groups.len(), switch.groups.as_ptr()) != 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setuid(switch.uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return (err.to_string(), RunStatus::Failed),
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut log_text = String::from_utf8_lossy(&output.stdout).into_owned();
                log_text.push_str(&String::from_utf8_lossy(&output.stderr));
                let status = if output.status.success() {
                    RunStatus::Success
                } else {
                    RunStatus::Failed
                };
                (log_text.trim().to_string(), status)
            }
            Ok(Err(err)) => (err.to_string(), RunStatus::Failed),
            Err(_) => (
                format!("task execution timeout (> {}s)", timeout.as_secs()),
                RunStatus::Failed,
            ),
        }
    }

    /// Evaluate a condition script: satisfied iff it exits 0 within the
    /// timeout. Runs without account switching or environment injection.
    pub async fn run_condition(task_id: i64, script: &str, timeout: Duration) -> bool {
        let mut command = Self::build_command(script);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!("condition script for task {task_id} failed to spawn: {err}");
                return false;
            }
        };
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(err)) => {
                tracing::warn!("condition script for task {task_id} failed: {err}");
                false
            }
            Err(_) => {
                tracing::warn!("condition script timeout for task {task_id}");
                false
            }
        }
    }

    #[cfg(unix)]
    fn build_command(script: &str) -> Command {
        let mut command = Command::new("/bin/bash");
        command.arg("-c").arg(script);
        command
    }

    #[cfg(windows)]
    fn build_command(script: &str) -> Command {
        let mut command = Command::new("powershell");
        command.args([
            "-NoLogo",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            script,
        ]);
        command
    }

    #[cfg(unix)]
    fn prepare_account_context(account: &str) -> Result<AccountContext, RunnerError> {
        if account.is_empty() {
            return Ok(AccountContext::default());
        }
        let record = accounts::lookup_account(account)
            .ok_or_else(|| RunnerError::UnknownAccount(account.to_string()))?;

        let current_uid = unsafe { libc::geteuid() };
        if current_uid == record.uid {
            return Ok(AccountContext {
                home: Some(record.home),
                switch: None,
            });
        }
        if current_uid != 0 {
            return Err(RunnerError::PermissionDenied);
        }

        let groups: Vec<libc::gid_t> = accounts::account_group_ids(&record.name, record.gid)
            .into_iter()
            .map(|gid| gid as libc::gid_t)
            .collect();
        Ok(AccountContext {
            home: Some(record.home),
            switch: Some(PrivilegeSwitch {
                uid: record.uid,
                gid: record.gid,
                groups,
            }),
        })
    }

    /// Without a POSIX account database there is no way to switch identity;
    /// only the current process account can be honored. Anything else fails
    /// fast instead of silently running as the parent's identity.
    #[cfg(not(unix))]
    fn prepare_account_context(account: &str) -> Result<AccountContext, RunnerError> {
        if account.is_empty() {
            return Ok(AccountContext::default());
        }
        if account == accounts::detect_default_account() {
            return Ok(AccountContext::default());
        }
        Err(RunnerError::PermissionDenied)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::accounts::AccountDirectory;
    use crate::scheduler::payload::TaskPayload;

    fn current_account() -> String {
        accounts::current_account_name().expect("current account must resolve")
    }

    async fn store_with_task(script: &str, account: &str) -> (Arc<TaskStore>, Task) {
        let directory = AccountDirectory::fixed(vec![account.to_string()]);
        let store = Arc::new(TaskStore::open_in_memory(directory).unwrap());
        let payload = TaskPayload {
            name: Some("runner-test".to_string()),
            account: Some(account.to_string()),
            trigger_type: Some("schedule".to_string()),
            schedule_expression: Some("0 3 * * *".to_string()),
            script_body: Some(script.to_string()),
            ..TaskPayload::default()
        };
        let task = store.create_task(&payload).await.unwrap();
        (store, task)
    }

    #[tokio::test]
    async fn successful_run_records_output() {
        let (store, task) = store_with_task("echo hello", &current_account()).await;
        TaskRunner::spawn(
            store.clone(),
            task.clone(),
            TriggerReason::Manual,
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let result = store.get_latest_result(task.id).await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.trigger_reason, "manual");
        assert!(result.log.unwrap().contains("hello"));
        assert!(result.finished_at.is_some());

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert!(task.last_run_at.is_some());
    }

    #[tokio::test]
    async fn environment_injection() {
        let (store, task) =
            store_with_task("echo $SCHEDULER_TASK_NAME:$SCHEDULER_TRIGGER", &current_account())
                .await;
        TaskRunner::spawn(
            store.clone(),
            task.clone(),
            TriggerReason::Schedule,
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let result = store.get_latest_result(task.id).await.unwrap().unwrap();
        assert!(result.log.unwrap().contains("runner-test:schedule"));
    }

    #[tokio::test]
    async fn nonzero_exit_fails() {
        let (store, task) = store_with_task("echo oops 1>&2; exit 3", &current_account()).await;
        TaskRunner::spawn(
            store.clone(),
            task.clone(),
            TriggerReason::Manual,
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let result = store.get_latest_result(task.id).await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.log.unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn timeout_fails_with_marker() {
        let (store, task) = store_with_task("sleep 30", &current_account()).await;
        TaskRunner::spawn(
            store.clone(),
            task.clone(),
            TriggerReason::Manual,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let result = store.get_latest_result(task.id).await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.log.unwrap().contains("task execution timeout (> 1s)"));
    }

    #[tokio::test]
    async fn unknown_account_fails_run() {
        let (store, task) = store_with_task("echo hi", "no-such-account-zz").await;
        TaskRunner::spawn(
            store.clone(),
            task.clone(),
            TriggerReason::Manual,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let result = store.get_latest_result(task.id).await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.log.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn second_spawn_loses_claim() {
        let (store, task) = store_with_task("echo once", &current_account()).await;
        store
            .record_result_start(task.id, "manual")
            .await
            .unwrap()
            .unwrap();

        TaskRunner::spawn(
            store.clone(),
            task.clone(),
            TriggerReason::Schedule,
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        // Only the pre-claimed running row exists; the worker backed off.
        let results = store.fetch_results(task.id, 50, 0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, RunStatus::Running);
    }

    #[tokio::test]
    async fn condition_script_evaluation() {
        assert!(TaskRunner::run_condition(1, "exit 0", Duration::from_secs(10)).await);
        assert!(!TaskRunner::run_condition(1, "exit 1", Duration::from_secs(10)).await);
        assert!(!TaskRunner::run_condition(1, "sleep 30", Duration::from_secs(1)).await);
    }
}
