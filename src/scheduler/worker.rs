//! Worker tasks: pop queued items and execute them.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Instant as Deadline;
use tokio_util::sync::CancellationToken;

use super::{ActiveExecution, Core, QueueItem};
use crate::checker::{CheckMeta, CheckOutcome, Checker};
use crate::db::{CheckExecution, CheckResult, CheckerOptions, CheckerSchedule};
use crate::ident::Identifier;

pub(super) async fn run_worker(core: Arc<Core>, id: usize) {
    tracing::debug!(worker = id, "Worker started");

    loop {
        if core.workers_stop.is_cancelled() {
            break;
        }

        if let Some(item) = core.queue.pop() {
            core.execute_check(item).await;
            continue;
        }

        tokio::select! {
            _ = core.workers_stop.cancelled() => break,
            _ = core.wait_for_work() => {}
        }
    }

    tracing::debug!(worker = id, "Worker stopped");
}

/// Removes an execution from the active map when dropped.
struct ActiveGuard<'a> {
    core: &'a Core,
    execution_id: Identifier,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.core.state.write().active.remove(&self.execution_id);
    }
}

impl Core {
    async fn wait_for_work(&self) {
        let mut rx = self.work_rx.lock().await;
        rx.recv().await;
    }

    /// Run one item. The schedule, if any, advances however the run ends.
    /// The execution timeout is measured from here.
    pub(super) async fn execute_check(&self, item: QueueItem) {
        let deadline = Deadline::now() + self.config.execution_timeout;
        let schedule_id = item.execution.schedule_id;

        self.run_item(item, deadline).await;

        if let Some(schedule_id) = schedule_id {
            if let Err(e) = self.schedules.update_schedule_after_run(&schedule_id) {
                tracing::error!(schedule = %schedule_id, "Failed to advance schedule: {}", e);
            }
            self.state.write().in_flight.remove(&schedule_id);
        }
    }

    async fn run_item(&self, item: QueueItem, deadline: Deadline) {
        let QueueItem { schedule, execution, .. } = item;

        if let Err(e) = self.results.start_execution(&execution.id) {
            tracing::error!(execution = %execution.id, "Failed to start execution: {}", e);
            self.fail(&execution.id, &format!("failed to start execution: {}", e));
            return;
        }

        let cancel = self.workers_stop.child_token();
        self.state.write().active.insert(
            execution.id,
            ActiveExecution {
                cancel: cancel.clone(),
                started_at: Utc::now(),
            },
        );
        let _active = ActiveGuard {
            core: self,
            execution_id: execution.id,
        };

        let Some(checker) = self.registry.get(&execution.checker_name) else {
            self.fail(&execution.id, &format!("checker {} not found", execution.checker_name));
            return;
        };

        let options = match self.merger.merge(checker.as_ref(), &execution) {
            Ok(options) => options,
            Err(e) => {
                tracing::warn!(
                    execution = %execution.id,
                    "Failed to merge options, using stored options: {}",
                    e
                );
                schedule.options.clone()
            }
        };

        let executed_at = Utc::now();
        let started = Instant::now();
        let outcome = self
            .run_isolated(checker, options.clone(), meta_for(&execution), cancel, deadline)
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(message) => {
                self.fail(&execution.id, &message);
                return;
            }
        };

        let mut result = build_result(&schedule, &execution, options, outcome, executed_at, started);
        if let Err(e) = self.results.create_check_result(&mut result) {
            self.fail(&execution.id, &format!("failed to store result: {}", e));
            return;
        }

        match self.results.complete_check_execution(&execution.id, &result.id) {
            Ok(_) => tracing::debug!(
                execution = %execution.id,
                checker = %execution.checker_name,
                status = %result.status,
                "Check completed in {:?}",
                result.duration
            ),
            Err(e) => tracing::error!(execution = %execution.id, "Failed to complete execution: {}", e),
        }
    }

    /// Run the check in its own task so a panic or a hang cannot take the
    /// worker down. Cancellation and the deadline both abort the task.
    async fn run_isolated(
        &self,
        checker: Arc<dyn Checker>,
        options: CheckerOptions,
        meta: CheckMeta,
        cancel: CancellationToken,
        deadline: Deadline,
    ) -> Result<CheckOutcome, String> {
        let timeout = self.config.execution_timeout;
        let mut handle = tokio::spawn(async move { checker.run_check(options, meta).await });
        let abort = handle.abort_handle();
        let timed_out = || format!("test execution timeout after {:?}", timeout);

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) if e.is_panic() => Err(format!("check panicked: {}", panic_message(e.into_panic()))),
                Err(e) => Err(format!("check task failed: {}", e)),
            },
            _ = tokio::time::sleep_until(deadline) => {
                abort.abort();
                Err(timed_out())
            }
            _ = cancel.cancelled() => {
                abort.abort();
                Err(timed_out())
            }
        }
    }

    fn fail(&self, execution_id: &Identifier, message: &str) {
        if let Err(e) = self.results.fail_check_execution(execution_id, message) {
            tracing::error!(execution = %execution_id, "Failed to record execution failure: {}", e);
        }
    }
}

fn meta_for(execution: &CheckExecution) -> CheckMeta {
    CheckMeta::from([
        ("target_type".to_string(), execution.target_type.to_string()),
        ("target_id".to_string(), execution.target_id.to_string()),
        ("owner_id".to_string(), execution.owner_id.to_string()),
    ])
}

fn build_result(
    schedule: &CheckerSchedule,
    execution: &CheckExecution,
    options: CheckerOptions,
    outcome: CheckOutcome,
    executed_at: DateTime<Utc>,
    started: Instant,
) -> CheckResult {
    CheckResult {
        id: Identifier::default(),
        checker_name: schedule.checker_name.clone(),
        check_type: execution.target_type,
        target_id: execution.target_id,
        owner_id: execution.owner_id,
        options,
        executed_at,
        scheduled_check: execution.schedule_id.is_some(),
        status: outcome.status,
        status_line: outcome.status_line,
        report: outcome.report,
        error: String::new(),
        duration: started.elapsed(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{harness, harness_with_registry, quick_config, wait_for_terminal, Harness};
    use super::super::{CheckScheduler, SchedulerConfig};
    use super::Deadline;
    use crate::checker::testing::{Behavior, StubChecker};
    use crate::checker::{CheckMeta, Checker, CheckerRegistry};
    use crate::db::{CheckStatus, CheckerOptions, ExecutionStatus, TargetType};
    use crate::ident::Identifier;
    use crate::storage::{CheckResultStorage, CheckerScheduleStorage};
    use crate::usecase::NewSchedule;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    async fn run_on_demand(behavior: Behavior, config: SchedulerConfig) -> (Harness, Identifier) {
        let h = harness(config, vec![StubChecker::new("stub", behavior)]);
        h.scheduler.start().await.unwrap();
        let id = h
            .scheduler
            .trigger_on_demand_check("stub", TargetType::Domain, h.domain.id, h.owner, CheckerOptions::new())
            .await
            .unwrap();
        (h, id)
    }

    #[tokio::test]
    async fn test_check_error_fails_execution() {
        let (h, id) = run_on_demand(Behavior::Fail("unreachable".to_string()), quick_config()).await;
        let execution = wait_for_terminal(&h.results, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);

        let result = h
            .results
            .get_check_result("stub", TargetType::Domain, &h.domain.id, &execution.result_id.unwrap())
            .unwrap();
        assert_eq!(result.status, CheckStatus::Critical);
        assert_eq!(result.error, "check failed: unreachable");
        h.scheduler.close().await;
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (h, id) = run_on_demand(Behavior::Panic, quick_config()).await;
        let execution = wait_for_terminal(&h.results, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);

        let result = h
            .results
            .get_check_result("stub", TargetType::Domain, &h.domain.id, &execution.result_id.unwrap())
            .unwrap();
        assert!(result.error.contains("stub checker exploded"));

        // Workers keep serving after a panic.
        let next = h
            .scheduler
            .trigger_on_demand_check("stub", TargetType::Domain, h.domain.id, h.owner, CheckerOptions::new())
            .await
            .unwrap();
        assert!(wait_for_terminal(&h.results, &next).await.status.is_terminal());
        h.scheduler.close().await;
    }

    #[tokio::test]
    async fn test_hanging_check_times_out() {
        let (h, id) = run_on_demand(Behavior::Hang, quick_config()).await;
        let execution = wait_for_terminal(&h.results, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);

        let result = h
            .results
            .get_check_result("stub", TargetType::Domain, &h.domain.id, &execution.result_id.unwrap())
            .unwrap();
        assert_eq!(result.error, "test execution timeout after 300ms");
        h.scheduler.close().await;
    }

    #[tokio::test]
    async fn test_close_cancels_running_check() {
        let config = SchedulerConfig {
            execution_timeout: Duration::from_secs(600),
            ..quick_config()
        };
        let (h, id) = run_on_demand(Behavior::Hang, config).await;

        for _ in 0..100 {
            if h.scheduler.status().unwrap().active_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.scheduler.status().unwrap().active_count, 1);

        tokio::time::timeout(Duration::from_secs(2), h.scheduler.close())
            .await
            .expect("close returned in time");

        let execution = h.results.get_execution(&id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let result = h
            .results
            .get_check_result("stub", TargetType::Domain, &h.domain.id, &execution.result_id.unwrap())
            .unwrap();
        assert!(result.error.starts_with("test execution timeout after"));
    }

    #[tokio::test]
    async fn test_failed_scheduled_check_still_advances() {
        let h = harness(quick_config(), vec![StubChecker::new("stub", Behavior::Fail("down".to_string()))]);
        let mut request = NewSchedule::new("stub", h.owner, TargetType::Domain, h.domain.id);
        request.next_run = Some(Utc::now() - ChronoDuration::minutes(1));
        let schedule = h.schedules.create_schedule(request).unwrap();

        h.scheduler.start().await.unwrap();
        for _ in 0..100 {
            if h.store.get_checker_schedule(&schedule.id).unwrap().last_run.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        h.scheduler.close().await;

        let stored = h.store.get_checker_schedule(&schedule.id).unwrap();
        assert!(stored.last_run.is_some());
        assert!(stored.next_run > Utc::now());

        let results = h
            .store
            .list_check_results("stub", TargetType::Domain, &h.domain.id, 0)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CheckStatus::Critical);
        assert!(results[0].scheduled_check);
    }

    #[tokio::test]
    async fn test_check_receives_meta_and_merged_options() {
        let checker = Arc::new(StubChecker::new("recorder", Behavior::Succeed));
        let mut registry = CheckerRegistry::new();
        registry.register(checker.clone());
        let h = harness_with_registry(quick_config(), registry);
        h.scheduler.start().await.unwrap();

        let options = CheckerOptions::from([("level".to_string(), serde_json::json!("high"))]);
        let id = h
            .scheduler
            .trigger_on_demand_check("recorder", TargetType::Domain, h.domain.id, h.owner, options)
            .await
            .unwrap();
        let execution = wait_for_terminal(&h.results, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        h.scheduler.close().await;

        let calls = checker.calls.lock();
        let (options, meta) = &calls[0];
        assert_eq!(options["level"], serde_json::json!("high"));
        assert_eq!(meta["target_type"], "domain");
        assert_eq!(meta["target_id"], h.domain.id.to_string());
        assert_eq!(meta["owner_id"], h.owner.to_string());
    }

    #[tokio::test]
    async fn test_merge_failure_runs_with_stored_options() {
        let checker = Arc::new(StubChecker::new("recorder", Behavior::Succeed));
        let mut registry = CheckerRegistry::new();
        registry.register(checker.clone());
        let h = harness_with_registry(quick_config(), registry);
        h.scheduler.start().await.unwrap();

        // No such domain, so resolving the target for merging fails.
        let missing = Identifier::generate();
        let options = CheckerOptions::from([("level".to_string(), serde_json::json!("run"))]);
        let id = h
            .scheduler
            .trigger_on_demand_check("recorder", TargetType::Domain, missing, h.owner, options)
            .await
            .unwrap();
        let execution = wait_for_terminal(&h.results, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        h.scheduler.close().await;

        let calls = checker.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0["level"], serde_json::json!("run"));
    }

    #[tokio::test]
    async fn test_expired_deadline_times_out_immediately() {
        let config = SchedulerConfig {
            execution_timeout: Duration::from_secs(600),
            ..quick_config()
        };
        let h = harness(config, vec![]);
        let checker: Arc<dyn Checker> = Arc::new(StubChecker::new("stub", Behavior::Hang));

        // Time spent before the check starts counts against the deadline.
        let deadline = Deadline::now() - Duration::from_millis(1);
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            h.scheduler.core().run_isolated(
                checker,
                CheckerOptions::new(),
                CheckMeta::new(),
                tokio_util::sync::CancellationToken::new(),
                deadline,
            ),
        )
        .await
        .expect("deadline enforced");
        let message = outcome.unwrap_err();
        assert!(message.starts_with("test execution timeout"));
    }
}
