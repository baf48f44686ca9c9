//! Storage contracts consumed by the usecases and the scheduler.
//!
//! Every call is synchronous and independently safe to invoke from any
//! task. Implementations never enforce the execution state machine; that
//! is the result usecase's job.

use chrono::{DateTime, Utc};

use crate::db::{
    CheckExecution, CheckResult, CheckerOptionsLayer, CheckerSchedule, DbError, Target, TargetType,
};
use crate::ident::Identifier;

pub type StorageResult<T> = Result<T, DbError>;

pub trait CheckResultStorage {
    /// Newest first. A `limit` of zero returns every result.
    fn list_check_results(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        limit: usize,
    ) -> StorageResult<Vec<CheckResult>>;

    fn list_check_results_by_user(&self, user_id: &Identifier, limit: usize) -> StorageResult<Vec<CheckResult>>;

    fn list_check_results_by_checker(&self, checker_name: &str, limit: usize) -> StorageResult<Vec<CheckResult>>;

    fn get_check_result(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        result_id: &Identifier,
    ) -> StorageResult<CheckResult>;

    /// Assigns a fresh id to the result before storing it.
    fn create_check_result(&self, result: &mut CheckResult) -> StorageResult<()>;

    fn delete_check_result(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        result_id: &Identifier,
    ) -> StorageResult<()>;

    /// Keeps only the `keep_count` most recent results of the tuple.
    fn delete_old_check_results(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        keep_count: usize,
    ) -> StorageResult<usize>;

    fn delete_check_results_for_target(&self, target_type: TargetType, target_id: &Identifier) -> StorageResult<usize>;

    fn delete_check_results_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;
}

pub trait CheckerScheduleStorage {
    fn list_checker_schedules(&self) -> StorageResult<Vec<CheckerSchedule>>;

    fn list_enabled_checker_schedules(&self) -> StorageResult<Vec<CheckerSchedule>>;

    fn list_checker_schedules_by_user(&self, user_id: &Identifier) -> StorageResult<Vec<CheckerSchedule>>;

    fn list_checker_schedules_by_target(
        &self,
        target_type: TargetType,
        target_id: &Identifier,
    ) -> StorageResult<Vec<CheckerSchedule>>;

    fn get_checker_schedule(&self, id: &Identifier) -> StorageResult<CheckerSchedule>;

    /// Assigns an id when the schedule does not carry one yet.
    fn create_checker_schedule(&self, schedule: &mut CheckerSchedule) -> StorageResult<()>;

    fn update_checker_schedule(&self, schedule: &CheckerSchedule) -> StorageResult<()>;

    fn delete_checker_schedule(&self, id: &Identifier) -> StorageResult<()>;
}

pub trait CheckExecutionStorage {
    fn create_check_execution(&self, execution: &mut CheckExecution) -> StorageResult<()>;

    fn get_check_execution(&self, id: &Identifier) -> StorageResult<CheckExecution>;

    fn update_check_execution(&self, execution: &CheckExecution) -> StorageResult<()>;

    fn delete_check_execution(&self, id: &Identifier) -> StorageResult<()>;

    /// Executions in Pending or Running.
    fn list_active_check_executions(&self) -> StorageResult<Vec<CheckExecution>>;

    /// Removes Completed and Failed executions that finished before `cutoff`.
    fn delete_finished_check_executions_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;
}

pub trait SchedulerRunStorage {
    fn check_scheduler_run(&self, at: DateTime<Utc>) -> StorageResult<()>;

    fn last_check_scheduler_run(&self) -> StorageResult<Option<DateTime<Utc>>>;
}

pub trait CheckerOptionsStorage {
    fn list_checker_options_layers(&self, checker_name: &str) -> StorageResult<Vec<CheckerOptionsLayer>>;

    /// Replaces the layer stored for the same checker and scope.
    fn set_checker_options_layer(&self, layer: &CheckerOptionsLayer) -> StorageResult<()>;
}

/// Enumerates the users, domains and services checks can run against.
pub trait TargetCatalog {
    fn list_targets(&self) -> StorageResult<Vec<Target>>;

    fn get_target(&self, target_type: TargetType, id: &Identifier) -> StorageResult<Target>;
}

/// Everything the core needs from persistence, as one object.
pub trait CheckerStorage:
    CheckResultStorage
    + CheckerScheduleStorage
    + CheckExecutionStorage
    + SchedulerRunStorage
    + CheckerOptionsStorage
    + TargetCatalog
    + Send
    + Sync
{
}

impl<T> CheckerStorage for T where
    T: CheckResultStorage
        + CheckerScheduleStorage
        + CheckExecutionStorage
        + SchedulerRunStorage
        + CheckerOptionsStorage
        + TargetCatalog
        + Send
        + Sync
{
}
