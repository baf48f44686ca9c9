//! Periodic housekeeping run by the coordinator loop.

use chrono::{DateTime, Utc};

use crate::usecase::{ResultUsecase, ScheduleUsecase};

/// Drop aged executions and results. Failures are logged and retried on the
/// next cleanup tick.
pub(super) fn run_cleanup(results: &ResultUsecase, now: DateTime<Utc>) {
    match results.cleanup(now) {
        Ok(report) if report.executions + report.results > 0 => {
            tracing::info!(
                "Cleanup: Removed {} executions and {} results",
                report.executions,
                report.results
            );
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Cleanup: Failed to remove aged records: {}", e),
    }
}

/// Make sure every target has its default schedules.
pub(super) fn run_discovery(schedules: &ScheduleUsecase) {
    if let Err(e) = schedules.discover_and_ensure_schedules() {
        tracing::error!("Discovery: Failed to ensure schedules: {}", e);
    }
}
