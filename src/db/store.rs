//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Params, Result as SqlResult, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use crate::ident::Identifier;
use crate::storage::{
    CheckExecutionStorage, CheckResultStorage, CheckerOptionsStorage, CheckerScheduleStorage,
    SchedulerRunStorage, StorageResult, TargetCatalog,
};

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Database lock poisoned")]
    Poisoned,
    #[error("{0} out of range")]
    OutOfRange(&'static str),
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const SCHEDULE_COLUMNS: &str =
    "id, checker_name, owner_id, target_type, target_id, interval_secs, enabled, next_run, last_run, options";
const EXECUTION_COLUMNS: &str = "id, schedule_id, checker_name, owner_id, target_type, target_id, options, status, started_at, completed_at, result_id";
const RESULT_COLUMNS: &str = "id, checker_name, check_type, target_id, owner_id, options, executed_at, scheduled_check, status, status_line, report, error, duration_ms";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn query_all<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        map: fn(&Row<'_>) -> SqlResult<T>,
    ) -> Result<Vec<T>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, map)?.collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    fn query_one<T, P: Params>(
        &self,
        kind: &'static str,
        sql: &str,
        params: P,
        map: fn(&Row<'_>) -> SqlResult<T>,
    ) -> Result<T, DbError> {
        let conn = self.conn()?;
        conn.query_row(sql, params, map)
            .optional()?
            .ok_or(DbError::NotFound(kind))
    }

    // --- Target catalog ---

    /// Add a target, assigning an id when it has none.
    pub fn add_target(&self, target: &mut Target) -> Result<Identifier, DbError> {
        if target.id.is_empty() {
            target.id = Identifier::generate();
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (id, target_type, owner_id, parent_id, name) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                target.id,
                target.target_type.as_str(),
                target.owner_id,
                target.parent_id,
                target.name,
            ],
        )?;
        Ok(target.id)
    }

    /// Delete a target together with its schedules and results.
    pub fn delete_target(&self, target_type: TargetType, id: &Identifier) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM check_results WHERE check_type = ?1 AND target_id = ?2",
            params![target_type.as_str(), id],
        )?;
        tx.execute(
            "DELETE FROM checker_schedules WHERE target_type = ?1 AND target_id = ?2",
            params![target_type.as_str(), id],
        )?;
        tx.execute(
            "DELETE FROM targets WHERE target_type = ?1 AND id = ?2",
            params![target_type.as_str(), id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl TargetCatalog for Store {
    fn list_targets(&self) -> StorageResult<Vec<Target>> {
        self.query_all(
            "SELECT id, target_type, owner_id, parent_id, name FROM targets ORDER BY target_type, name",
            [],
            target_from_row,
        )
    }

    fn get_target(&self, target_type: TargetType, id: &Identifier) -> StorageResult<Target> {
        self.query_one(
            "target",
            "SELECT id, target_type, owner_id, parent_id, name FROM targets WHERE target_type = ?1 AND id = ?2",
            params![target_type.as_str(), id],
            target_from_row,
        )
    }
}

// --- Schedules ---

impl CheckerScheduleStorage for Store {
    fn list_checker_schedules(&self) -> StorageResult<Vec<CheckerSchedule>> {
        self.query_all(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM checker_schedules ORDER BY next_run ASC"),
            [],
            schedule_from_row,
        )
    }

    fn list_enabled_checker_schedules(&self) -> StorageResult<Vec<CheckerSchedule>> {
        self.query_all(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM checker_schedules WHERE enabled = 1 ORDER BY next_run ASC"),
            [],
            schedule_from_row,
        )
    }

    fn list_checker_schedules_by_user(&self, user_id: &Identifier) -> StorageResult<Vec<CheckerSchedule>> {
        self.query_all(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM checker_schedules WHERE owner_id = ?1 ORDER BY next_run ASC"),
            params![user_id],
            schedule_from_row,
        )
    }

    fn list_checker_schedules_by_target(
        &self,
        target_type: TargetType,
        target_id: &Identifier,
    ) -> StorageResult<Vec<CheckerSchedule>> {
        self.query_all(
            &format!(
                "SELECT {SCHEDULE_COLUMNS} FROM checker_schedules WHERE target_type = ?1 AND target_id = ?2 ORDER BY checker_name"
            ),
            params![target_type.as_str(), target_id],
            schedule_from_row,
        )
    }

    fn get_checker_schedule(&self, id: &Identifier) -> StorageResult<CheckerSchedule> {
        self.query_one(
            "schedule",
            &format!("SELECT {SCHEDULE_COLUMNS} FROM checker_schedules WHERE id = ?1"),
            params![id],
            schedule_from_row,
        )
    }

    fn create_checker_schedule(&self, schedule: &mut CheckerSchedule) -> StorageResult<()> {
        if schedule.id.is_empty() {
            schedule.id = Identifier::generate();
        }
        let options = serde_json::to_string(&schedule.options)?;
        let interval_secs = interval_column(schedule.interval)?;

        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO checker_schedules ({SCHEDULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                schedule.id,
                schedule.checker_name,
                schedule.owner_id,
                schedule.target_type.as_str(),
                schedule.target_id,
                interval_secs,
                schedule.enabled,
                format_db_time(&schedule.next_run),
                schedule.last_run.as_ref().map(format_db_time),
                options,
            ],
        )?;
        Ok(())
    }

    fn update_checker_schedule(&self, schedule: &CheckerSchedule) -> StorageResult<()> {
        let options = serde_json::to_string(&schedule.options)?;
        let interval_secs = interval_column(schedule.interval)?;

        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE checker_schedules SET checker_name=?1, owner_id=?2, target_type=?3, target_id=?4, interval_secs=?5, enabled=?6, next_run=?7, last_run=?8, options=?9 WHERE id=?10",
            params![
                schedule.checker_name,
                schedule.owner_id,
                schedule.target_type.as_str(),
                schedule.target_id,
                interval_secs,
                schedule.enabled,
                format_db_time(&schedule.next_run),
                schedule.last_run.as_ref().map(format_db_time),
                options,
                schedule.id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound("schedule"));
        }
        Ok(())
    }

    fn delete_checker_schedule(&self, id: &Identifier) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM checker_schedules WHERE id = ?1", params![id])?;
        Ok(())
    }
}

// --- Executions ---

impl CheckExecutionStorage for Store {
    fn create_check_execution(&self, execution: &mut CheckExecution) -> StorageResult<()> {
        if execution.id.is_empty() {
            execution.id = Identifier::generate();
        }
        let options = serde_json::to_string(&execution.options)?;

        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO check_executions ({EXECUTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            params![
                execution.id,
                execution.schedule_id,
                execution.checker_name,
                execution.owner_id,
                execution.target_type.as_str(),
                execution.target_id,
                options,
                execution.status.as_str(),
                format_db_time(&execution.started_at),
                execution.completed_at.as_ref().map(format_db_time),
                execution.result_id,
            ],
        )?;
        Ok(())
    }

    fn get_check_execution(&self, id: &Identifier) -> StorageResult<CheckExecution> {
        self.query_one(
            "execution",
            &format!("SELECT {EXECUTION_COLUMNS} FROM check_executions WHERE id = ?1"),
            params![id],
            execution_from_row,
        )
    }

    fn update_check_execution(&self, execution: &CheckExecution) -> StorageResult<()> {
        let options = serde_json::to_string(&execution.options)?;

        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE check_executions SET schedule_id=?1, checker_name=?2, owner_id=?3, target_type=?4, target_id=?5, options=?6, status=?7, started_at=?8, completed_at=?9, result_id=?10 WHERE id=?11",
            params![
                execution.schedule_id,
                execution.checker_name,
                execution.owner_id,
                execution.target_type.as_str(),
                execution.target_id,
                options,
                execution.status.as_str(),
                format_db_time(&execution.started_at),
                execution.completed_at.as_ref().map(format_db_time),
                execution.result_id,
                execution.id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound("execution"));
        }
        Ok(())
    }

    fn delete_check_execution(&self, id: &Identifier) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM check_executions WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn list_active_check_executions(&self) -> StorageResult<Vec<CheckExecution>> {
        self.query_all(
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM check_executions WHERE status IN ('pending', 'running') ORDER BY started_at ASC"
            ),
            [],
            execution_from_row,
        )
    }

    fn delete_finished_check_executions_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM check_executions WHERE status IN ('completed', 'failed') AND completed_at < ?1",
            params![format_db_time(&cutoff)],
        )?;
        Ok(deleted)
    }
}

// --- Results ---

impl CheckResultStorage for Store {
    fn list_check_results(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        limit: usize,
    ) -> StorageResult<Vec<CheckResult>> {
        self.query_all(
            &format!(
                "SELECT {RESULT_COLUMNS} FROM check_results
                 WHERE checker_name = ?1 AND check_type = ?2 AND target_id = ?3
                 ORDER BY executed_at DESC, rowid DESC LIMIT ?4"
            ),
            params![checker_name, target_type.as_str(), target_id, limit_param(limit)],
            result_from_row,
        )
    }

    fn list_check_results_by_user(&self, user_id: &Identifier, limit: usize) -> StorageResult<Vec<CheckResult>> {
        self.query_all(
            &format!(
                "SELECT {RESULT_COLUMNS} FROM check_results WHERE owner_id = ?1
                 ORDER BY executed_at DESC, rowid DESC LIMIT ?2"
            ),
            params![user_id, limit_param(limit)],
            result_from_row,
        )
    }

    fn list_check_results_by_checker(&self, checker_name: &str, limit: usize) -> StorageResult<Vec<CheckResult>> {
        self.query_all(
            &format!(
                "SELECT {RESULT_COLUMNS} FROM check_results WHERE checker_name = ?1
                 ORDER BY executed_at DESC, rowid DESC LIMIT ?2"
            ),
            params![checker_name, limit_param(limit)],
            result_from_row,
        )
    }

    fn get_check_result(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        result_id: &Identifier,
    ) -> StorageResult<CheckResult> {
        self.query_one(
            "result",
            &format!(
                "SELECT {RESULT_COLUMNS} FROM check_results
                 WHERE checker_name = ?1 AND check_type = ?2 AND target_id = ?3 AND id = ?4"
            ),
            params![checker_name, target_type.as_str(), target_id, result_id],
            result_from_row,
        )
    }

    fn create_check_result(&self, result: &mut CheckResult) -> StorageResult<()> {
        result.id = Identifier::generate();
        let options = serde_json::to_string(&result.options)?;
        let report = serde_json::to_string(&result.report)?;

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO check_results ({RESULT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                result.id,
                result.checker_name,
                result.check_type.as_str(),
                result.target_id,
                result.owner_id,
                options,
                format_db_time(&result.executed_at),
                result.scheduled_check,
                result.status.as_str(),
                result.status_line,
                report,
                result.error,
                result.duration.as_millis() as i64,
            ],
        )?;
        Ok(())
    }

    fn delete_check_result(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        result_id: &Identifier,
    ) -> StorageResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM check_results WHERE checker_name = ?1 AND check_type = ?2 AND target_id = ?3 AND id = ?4",
            params![checker_name, target_type.as_str(), target_id, result_id],
        )?;
        if deleted == 0 {
            return Err(DbError::NotFound("result"));
        }
        Ok(())
    }

    fn delete_old_check_results(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: &Identifier,
        keep_count: usize,
    ) -> StorageResult<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM check_results
             WHERE checker_name = ?1 AND check_type = ?2 AND target_id = ?3
             AND id NOT IN (
                 SELECT id FROM check_results
                 WHERE checker_name = ?1 AND check_type = ?2 AND target_id = ?3
                 ORDER BY executed_at DESC, rowid DESC LIMIT ?4
             )",
            params![checker_name, target_type.as_str(), target_id, keep_count as i64],
        )?;
        Ok(deleted)
    }

    fn delete_check_results_for_target(&self, target_type: TargetType, target_id: &Identifier) -> StorageResult<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM check_results WHERE check_type = ?1 AND target_id = ?2",
            params![target_type.as_str(), target_id],
        )?;
        Ok(deleted)
    }

    fn delete_check_results_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM check_results WHERE executed_at < ?1",
            params![format_db_time(&cutoff)],
        )?;
        Ok(deleted)
    }
}

// --- Scheduler bookkeeping ---

impl SchedulerRunStorage for Store {
    fn check_scheduler_run(&self, at: DateTime<Utc>) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scheduler_runs (id, last_run) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET last_run = excluded.last_run",
            params![format_db_time(&at)],
        )?;
        Ok(())
    }

    fn last_check_scheduler_run(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let result: Option<String> = conn
            .query_row("SELECT last_run FROM scheduler_runs WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        Ok(result.and_then(|s| parse_db_time(&s)))
    }
}

impl CheckerOptionsStorage for Store {
    fn list_checker_options_layers(&self, checker_name: &str) -> StorageResult<Vec<CheckerOptionsLayer>> {
        self.query_all(
            "SELECT checker_name, user_id, domain_id, service_id, options FROM checker_options WHERE checker_name = ?1",
            params![checker_name],
            |row| {
                Ok(CheckerOptionsLayer {
                    checker_name: row.get(0)?,
                    user_id: row.get(1)?,
                    domain_id: row.get(2)?,
                    service_id: row.get(3)?,
                    options: json_column(row, 4)?,
                })
            },
        )
    }

    fn set_checker_options_layer(&self, layer: &CheckerOptionsLayer) -> StorageResult<()> {
        let options = serde_json::to_string(&layer.options)?;

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM checker_options
             WHERE checker_name = ?1 AND user_id IS ?2 AND domain_id IS ?3 AND service_id IS ?4",
            params![layer.checker_name, layer.user_id, layer.domain_id, layer.service_id],
        )?;
        tx.execute(
            "INSERT INTO checker_options (checker_name, user_id, domain_id, service_id, options) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![layer.checker_name, layer.user_id, layer.domain_id, layer.service_id, options],
        )?;
        tx.commit()?;
        Ok(())
    }
}

// --- Row mapping ---

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    Ok(Target {
        id: row.get(0)?,
        target_type: parsed_column(row, 1)?,
        owner_id: row.get(2)?,
        parent_id: row.get(3)?,
        name: row.get(4)?,
    })
}

fn interval_column(interval: Duration) -> Result<i64, DbError> {
    i64::try_from(interval.as_secs()).map_err(|_| DbError::OutOfRange("interval"))
}

fn schedule_from_row(row: &Row<'_>) -> SqlResult<CheckerSchedule> {
    let interval_secs: i64 = row.get(5)?;
    let interval_secs = u64::try_from(interval_secs).map_err(|e| conversion_error(5, Box::new(e)))?;
    Ok(CheckerSchedule {
        id: row.get(0)?,
        checker_name: row.get(1)?,
        owner_id: row.get(2)?,
        target_type: parsed_column(row, 3)?,
        target_id: row.get(4)?,
        interval: Duration::from_secs(interval_secs),
        enabled: row.get(6)?,
        next_run: time_column(row, 7)?,
        last_run: optional_time_column(row, 8)?,
        options: json_column(row, 9)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> SqlResult<CheckExecution> {
    Ok(CheckExecution {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        checker_name: row.get(2)?,
        owner_id: row.get(3)?,
        target_type: parsed_column(row, 4)?,
        target_id: row.get(5)?,
        options: json_column(row, 6)?,
        status: parsed_column(row, 7)?,
        started_at: time_column(row, 8)?,
        completed_at: optional_time_column(row, 9)?,
        result_id: row.get(10)?,
    })
}

fn result_from_row(row: &Row<'_>) -> SqlResult<CheckResult> {
    let duration_ms: i64 = row.get(12)?;
    Ok(CheckResult {
        id: row.get(0)?,
        checker_name: row.get(1)?,
        check_type: parsed_column(row, 2)?,
        target_id: row.get(3)?,
        owner_id: row.get(4)?,
        options: json_column(row, 5)?,
        executed_at: time_column(row, 6)?,
        scheduled_check: row.get(7)?,
        status: parsed_column(row, 8)?,
        status_line: row.get(9)?,
        report: json_column(row, 10)?,
        error: row.get(11)?,
        duration: Duration::from_millis(duration_ms.max(0) as u64),
    })
}

fn conversion_error(idx: usize, err: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err)
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> SqlResult<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: T::Err| conversion_error(idx, Box::new(e)))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Box::new(e)))
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| conversion_error(idx, format!("invalid timestamp: {}", raw).into()))
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) => parse_db_time(&s)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("invalid timestamp: {}", s).into())),
        None => Ok(None),
    }
}

/// SQLite treats a negative LIMIT as "no limit".
fn limit_param(limit: usize) -> i64 {
    if limit == 0 {
        -1
    } else {
        limit as i64
    }
}

/// Format a timestamp so that text ordering matches time ordering.
fn format_db_time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
