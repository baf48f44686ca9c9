//! Stand-in scheduler used when scheduling is turned off in configuration.

use async_trait::async_trait;

use super::{CheckScheduler, SchedulerStatus};
use crate::db::{CheckerOptions, TargetType};
use crate::error::{Error, Result};
use crate::ident::Identifier;

/// Accepts no work. Status reads as stopped.
#[derive(Debug, Default)]
pub struct DisabledScheduler;

#[async_trait]
impl CheckScheduler for DisabledScheduler {
    async fn trigger_on_demand_check(
        &self,
        _checker_name: &str,
        _target_type: TargetType,
        _target_id: Identifier,
        _owner_id: Identifier,
        _options: CheckerOptions,
    ) -> Result<Identifier> {
        Err(Error::SchedulerDisabled)
    }

    fn status(&self) -> Result<SchedulerStatus> {
        Ok(SchedulerStatus {
            config_enabled: false,
            runtime_enabled: false,
            running: false,
            worker_count: 0,
            queue_size: 0,
            active_count: 0,
            next_schedules: Vec::new(),
            last_run: None,
        })
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            return Err(Error::SchedulerDisabled);
        }
        Ok(())
    }

    fn reschedule_upcoming_checks(&self) -> Result<usize> {
        Err(Error::SchedulerDisabled)
    }

    async fn close(&self) {}
}
