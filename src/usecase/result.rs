//! Execution state transitions and result bookkeeping.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

use super::elapsed_between;
use crate::db::{CheckExecution, CheckResult, CheckStatus, CheckerSchedule, ExecutionStatus, TargetType};
use crate::error::{Error, Result};
use crate::ident::Identifier;
use crate::storage::CheckerStorage;

pub const DEFAULT_MAX_RESULTS_PER_CHECK: usize = 100;
pub const DEFAULT_RESULT_RETENTION_DAYS: i64 = 90;

/// Finished executions are kept this many days.
pub const EXECUTION_RETENTION_DAYS: i64 = 7;

/// What a cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub executions: usize,
    pub results: usize,
}

pub struct ResultUsecase {
    storage: Arc<dyn CheckerStorage>,
    max_results_per_check: usize,
    retention: ChronoDuration,
}

impl ResultUsecase {
    /// Non-positive limits fall back to the defaults.
    pub fn new(storage: Arc<dyn CheckerStorage>, max_results_per_check: i64, result_retention_days: i64) -> Self {
        let max_results_per_check = if max_results_per_check > 0 {
            max_results_per_check as usize
        } else {
            DEFAULT_MAX_RESULTS_PER_CHECK
        };
        let retention_days = if result_retention_days > 0 {
            result_retention_days
        } else {
            DEFAULT_RESULT_RETENTION_DAYS
        };

        Self {
            storage,
            max_results_per_check,
            retention: ChronoDuration::days(retention_days),
        }
    }

    pub fn max_results_per_check(&self) -> usize {
        self.max_results_per_check
    }

    /// Store a result and prune its tuple down to the retention limit.
    pub fn create_check_result(&self, result: &mut CheckResult) -> Result<()> {
        self.storage.create_check_result(result)?;

        if let Err(e) = self.storage.delete_old_check_results(
            &result.checker_name,
            result.check_type,
            &result.target_id,
            self.max_results_per_check,
        ) {
            tracing::error!(
                checker = %result.checker_name,
                target = %result.target_id,
                "Failed to prune old results: {}",
                e
            );
        }
        Ok(())
    }

    /// Record a new Pending execution of `schedule`.
    ///
    /// `schedule_id` is None for on-demand runs.
    pub fn create_execution(&self, schedule: &CheckerSchedule, schedule_id: Option<Identifier>) -> Result<CheckExecution> {
        let mut execution = CheckExecution {
            id: Identifier::default(),
            schedule_id,
            checker_name: schedule.checker_name.clone(),
            owner_id: schedule.owner_id,
            target_type: schedule.target_type,
            target_id: schedule.target_id,
            options: schedule.options.clone(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            result_id: None,
        };
        self.storage.create_check_execution(&mut execution)?;
        Ok(execution)
    }

    pub fn get_execution(&self, id: &Identifier) -> Result<CheckExecution> {
        Ok(self.storage.get_check_execution(id)?)
    }

    /// Move a Pending execution to Running.
    pub fn start_execution(&self, id: &Identifier) -> Result<CheckExecution> {
        let mut execution = self.storage.get_check_execution(id)?;
        transition(&mut execution, ExecutionStatus::Running)?;
        self.storage.update_check_execution(&execution)?;
        Ok(execution)
    }

    pub fn complete_check_execution(&self, id: &Identifier, result_id: &Identifier) -> Result<CheckExecution> {
        let mut execution = self.storage.get_check_execution(id)?;
        transition(&mut execution, ExecutionStatus::Completed)?;
        execution.completed_at = Some(Utc::now());
        execution.result_id = Some(*result_id);
        self.storage.update_check_execution(&execution)?;
        Ok(execution)
    }

    /// Fail an execution, storing a Critical result that carries `message`.
    pub fn fail_check_execution(&self, id: &Identifier, message: &str) -> Result<CheckExecution> {
        let mut execution = self.storage.get_check_execution(id)?;
        if !execution.status.can_transition_to(ExecutionStatus::Failed) {
            return Err(Error::InvalidTransition {
                from: execution.status,
                to: ExecutionStatus::Failed,
            });
        }

        let now = Utc::now();
        let mut result = CheckResult {
            id: Identifier::default(),
            checker_name: execution.checker_name.clone(),
            check_type: execution.target_type,
            target_id: execution.target_id,
            owner_id: execution.owner_id,
            options: execution.options.clone(),
            executed_at: now,
            scheduled_check: execution.schedule_id.is_some(),
            status: CheckStatus::Critical,
            status_line: "Execution failed".to_string(),
            report: serde_json::Value::Null,
            error: message.to_string(),
            duration: elapsed_between(execution.started_at, now),
        };
        self.create_check_result(&mut result)?;

        transition(&mut execution, ExecutionStatus::Failed)?;
        execution.completed_at = Some(now);
        execution.result_id = Some(result.id);
        self.storage.update_check_execution(&execution)?;

        tracing::warn!(
            execution = %execution.id,
            checker = %execution.checker_name,
            "Execution failed: {}",
            message
        );
        Ok(execution)
    }

    /// Fail every execution a previous process left Pending or Running.
    pub fn recover_interrupted_executions(&self) -> Result<usize> {
        let mut recovered = 0;
        for execution in self.storage.list_active_check_executions()? {
            match self.fail_check_execution(&execution.id, "execution interrupted by scheduler restart") {
                Ok(_) => recovered += 1,
                Err(e) => tracing::error!(execution = %execution.id, "Failed to recover execution: {}", e),
            }
        }
        Ok(recovered)
    }

    /// Drop finished executions past their retention and results past the
    /// global retention window.
    pub fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let executions = self
            .storage
            .delete_finished_check_executions_before(now - ChronoDuration::days(EXECUTION_RETENTION_DAYS))?;
        let results = self.storage.delete_check_results_before(now - self.retention)?;
        Ok(CleanupReport { executions, results })
    }

    // --- Reads ---

    pub fn list_check_results(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        limit: usize,
    ) -> Result<Vec<CheckResult>> {
        Ok(self
            .storage
            .list_check_results(checker_name, target_type, target_id, limit)?)
    }

    pub fn get_check_result(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        result_id: &Identifier,
    ) -> Result<CheckResult> {
        Ok(self
            .storage
            .get_check_result(checker_name, target_type, target_id, result_id)?)
    }

    pub fn delete_check_result(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        result_id: &Identifier,
    ) -> Result<()> {
        Ok(self
            .storage
            .delete_check_result(checker_name, target_type, target_id, result_id)?)
    }

    pub fn list_results_by_user(&self, user_id: &Identifier, limit: usize) -> Result<Vec<CheckResult>> {
        Ok(self.storage.list_check_results_by_user(user_id, limit)?)
    }

    pub fn list_results_by_checker(&self, checker_name: &str, limit: usize) -> Result<Vec<CheckResult>> {
        Ok(self.storage.list_check_results_by_checker(checker_name, limit)?)
    }

    pub fn delete_all_results_for_target(&self, target_type: TargetType, target_id: &Identifier) -> Result<usize> {
        Ok(self.storage.delete_check_results_for_target(target_type, target_id)?)
    }
}

fn transition(execution: &mut CheckExecution, to: ExecutionStatus) -> Result<()> {
    if !execution.status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: execution.status,
            to,
        });
    }
    execution.status = to;
    Ok(())
}
