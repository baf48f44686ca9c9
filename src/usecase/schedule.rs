//! Schedule lifecycle: creation, firing bookkeeping, overdue flattening and
//! target discovery.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use super::add_duration;
use crate::checker::CheckerRegistry;
use crate::db::{CheckerOptions, CheckerSchedule, TargetType};
use crate::error::{Error, Result};
use crate::ident::Identifier;
use crate::storage::CheckerStorage;

/// Shortest interval a stored schedule may use.
pub const MINIMUM_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Overdue schedules are only spread out once at least this many piled up.
pub const OVERDUE_RESCHEDULE_THRESHOLD: usize = 10;

/// Input for creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub checker_name: String,
    pub owner_id: Identifier,
    pub target_type: TargetType,
    pub target_id: Identifier,
    /// Zero selects the default interval of the target type.
    pub interval: Duration,
    pub enabled: bool,
    /// When unset the first firing is placed randomly within one interval.
    pub next_run: Option<DateTime<Utc>>,
    pub options: CheckerOptions,
}

impl NewSchedule {
    pub fn new(checker_name: &str, owner_id: Identifier, target_type: TargetType, target_id: Identifier) -> Self {
        Self {
            checker_name: checker_name.to_string(),
            owner_id,
            target_type,
            target_id,
            interval: Duration::ZERO,
            enabled: true,
            next_run: None,
            options: CheckerOptions::new(),
        }
    }
}

pub struct ScheduleUsecase {
    storage: Arc<dyn CheckerStorage>,
    registry: Arc<CheckerRegistry>,
}

impl ScheduleUsecase {
    pub fn new(storage: Arc<dyn CheckerStorage>, registry: Arc<CheckerRegistry>) -> Self {
        Self { storage, registry }
    }

    /// Restrict schedule operations to the schedules owned by `user_id`.
    pub fn for_user(&self, user_id: Identifier) -> UserSchedules<'_> {
        UserSchedules { usecase: self, user_id }
    }

    pub fn create_schedule(&self, request: NewSchedule) -> Result<CheckerSchedule> {
        if self.registry.get(&request.checker_name).is_none() {
            return Err(Error::Validation(format!("unknown checker: {}", request.checker_name)));
        }

        let interval = normalize_interval(request.interval, request.target_type)?;
        let now = Utc::now();
        let next_run = request.next_run.unwrap_or_else(|| {
            let spread = rand::thread_rng().gen_range(0..interval.as_secs().max(1));
            add_duration(now, Duration::from_secs(spread))
        });

        let mut schedule = CheckerSchedule {
            id: Identifier::default(),
            checker_name: request.checker_name,
            owner_id: request.owner_id,
            target_type: request.target_type,
            target_id: request.target_id,
            interval,
            enabled: request.enabled,
            next_run,
            last_run: None,
            options: request.options,
        };
        self.storage.create_checker_schedule(&mut schedule)?;

        tracing::info!(
            schedule = %schedule.id,
            checker = %schedule.checker_name,
            "Created schedule every {:?}, first run at {}",
            schedule.interval,
            schedule.next_run
        );
        Ok(schedule)
    }

    pub fn get_schedule(&self, id: &Identifier) -> Result<CheckerSchedule> {
        Ok(self.storage.get_checker_schedule(id)?)
    }

    pub fn list_user_schedules(&self, user_id: &Identifier) -> Result<Vec<CheckerSchedule>> {
        Ok(self.storage.list_checker_schedules_by_user(user_id)?)
    }

    pub fn list_schedules_by_target(&self, target_type: TargetType, target_id: &Identifier) -> Result<Vec<CheckerSchedule>> {
        Ok(self.storage.list_checker_schedules_by_target(target_type, target_id)?)
    }

    /// Apply `incoming` to the stored schedule with the same id.
    ///
    /// Identity fields stay as stored. A missing `last_run` keeps the stored
    /// one, and an interval change moves `next_run` one interval past the
    /// last run (or now).
    pub fn update_schedule(&self, incoming: CheckerSchedule) -> Result<CheckerSchedule> {
        let stored = self.storage.get_checker_schedule(&incoming.id)?;
        let interval = normalize_interval(incoming.interval, stored.target_type)?;
        let last_run = incoming.last_run.or(stored.last_run);

        let next_run = if interval != stored.interval {
            add_duration(last_run.unwrap_or_else(Utc::now), interval)
        } else {
            incoming.next_run
        };

        let updated = CheckerSchedule {
            interval,
            enabled: incoming.enabled,
            next_run,
            last_run,
            options: incoming.options,
            ..stored
        };
        self.storage.update_checker_schedule(&updated)?;
        Ok(updated)
    }

    pub fn enable_schedule(&self, id: &Identifier) -> Result<CheckerSchedule> {
        let mut schedule = self.storage.get_checker_schedule(id)?;
        let now = Utc::now();
        schedule.enabled = true;
        if schedule.next_run < now {
            schedule.next_run = add_duration(now, schedule.interval);
        }
        self.storage.update_checker_schedule(&schedule)?;
        Ok(schedule)
    }

    pub fn disable_schedule(&self, id: &Identifier) -> Result<CheckerSchedule> {
        let mut schedule = self.storage.get_checker_schedule(id)?;
        schedule.enabled = false;
        self.storage.update_checker_schedule(&schedule)?;
        Ok(schedule)
    }

    pub fn delete_schedule(&self, id: &Identifier) -> Result<()> {
        // Missing schedules report NotFound.
        self.storage.get_checker_schedule(id)?;
        self.storage.delete_checker_schedule(id)?;
        Ok(())
    }

    /// Record a run of the schedule, successful or not.
    pub fn update_schedule_after_run(&self, id: &Identifier) -> Result<CheckerSchedule> {
        let mut schedule = self.storage.get_checker_schedule(id)?;
        let now = Utc::now();
        schedule.last_run = Some(now);
        schedule.next_run = add_duration(now, schedule.interval);
        self.storage.update_checker_schedule(&schedule)?;
        Ok(schedule)
    }

    /// Enabled schedules whose next run has passed.
    pub fn list_due_schedules(&self) -> Result<Vec<CheckerSchedule>> {
        let now = Utc::now();
        Ok(self
            .storage
            .list_enabled_checker_schedules()?
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect())
    }

    /// The `limit` enabled schedules that fire soonest.
    pub fn list_next_schedules(&self, limit: usize) -> Result<Vec<CheckerSchedule>> {
        let mut schedules = self.storage.list_enabled_checker_schedules()?;
        schedules.sort_by_key(|s| s.next_run);
        schedules.truncate(limit);
        Ok(schedules)
    }

    /// Spread a backlog of overdue schedules over the next minimum interval.
    ///
    /// Returns how many schedules were moved; a backlog below the threshold
    /// is left alone.
    pub fn reschedule_overdue_checks(&self) -> Result<usize> {
        let now = Utc::now();
        let overdue: Vec<CheckerSchedule> = self
            .storage
            .list_enabled_checker_schedules()?
            .into_iter()
            .filter(|s| s.next_run < now)
            .collect();

        if overdue.len() < OVERDUE_RESCHEDULE_THRESHOLD {
            return Ok(0);
        }

        let count = overdue.len() as u32;
        let step = MINIMUM_CHECK_INTERVAL / count;
        let mut rescheduled = 0;

        for (i, mut schedule) in overdue.into_iter().enumerate() {
            // (i + 1) * step lands in (0, MINIMUM_CHECK_INTERVAL]
            schedule.next_run = add_duration(now, step * (i as u32 + 1));
            match self.storage.update_checker_schedule(&schedule) {
                Ok(()) => rescheduled += 1,
                Err(e) => {
                    tracing::error!(schedule = %schedule.id, "Failed to reschedule overdue check: {}", e);
                }
            }
        }

        tracing::info!("Rescheduled {} overdue checks over {:?}", rescheduled, MINIMUM_CHECK_INTERVAL);
        Ok(rescheduled)
    }

    /// Create a default schedule for every target and applicable checker
    /// pair that has none yet. Returns the number of schedules created.
    pub fn discover_and_ensure_schedules(&self) -> Result<usize> {
        let targets = self.storage.list_targets()?;
        let mut created = 0;

        for target in targets {
            let existing = match self
                .storage
                .list_checker_schedules_by_target(target.target_type, &target.id)
            {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(target = %target.id, "Discovery: failed to list schedules: {}", e);
                    continue;
                }
            };

            for checker in self.registry.list() {
                if !checker.availability().applies_to(target.target_type) {
                    continue;
                }
                let covered = existing
                    .iter()
                    .any(|s| s.checker_name == checker.name() && s.owner_id == target.owner_id);
                if covered {
                    continue;
                }

                let request = NewSchedule::new(checker.name(), target.owner_id, target.target_type, target.id);
                match self.create_schedule(request) {
                    Ok(_) => created += 1,
                    Err(e) => {
                        tracing::error!(
                            target = %target.id,
                            checker = checker.name(),
                            "Discovery: failed to create schedule: {}",
                            e
                        );
                    }
                }
            }
        }

        if created > 0 {
            tracing::info!("Discovery: created {} schedules", created);
        }
        Ok(created)
    }

    /// Fails unless the schedule belongs to `user_id`.
    pub fn validate_schedule_ownership(&self, id: &Identifier, user_id: &Identifier) -> Result<CheckerSchedule> {
        let schedule = self.storage.get_checker_schedule(id)?;
        if schedule.owner_id != *user_id {
            return Err(Error::Validation("schedule does not belong to this user".to_string()));
        }
        Ok(schedule)
    }
}

/// Schedule operations scoped to one user, each guarded by an ownership check.
pub struct UserSchedules<'a> {
    usecase: &'a ScheduleUsecase,
    user_id: Identifier,
}

impl UserSchedules<'_> {
    pub fn list(&self) -> Result<Vec<CheckerSchedule>> {
        self.usecase.list_user_schedules(&self.user_id)
    }

    pub fn list_by_target(&self, target_type: TargetType, target_id: &Identifier) -> Result<Vec<CheckerSchedule>> {
        Ok(self
            .usecase
            .list_schedules_by_target(target_type, target_id)?
            .into_iter()
            .filter(|s| s.owner_id == self.user_id)
            .collect())
    }

    pub fn create(&self, mut request: NewSchedule) -> Result<CheckerSchedule> {
        request.owner_id = self.user_id;
        self.usecase.create_schedule(request)
    }

    pub fn get(&self, id: &Identifier) -> Result<CheckerSchedule> {
        self.usecase.validate_schedule_ownership(id, &self.user_id)
    }

    pub fn update(&self, schedule: CheckerSchedule) -> Result<CheckerSchedule> {
        self.usecase.validate_schedule_ownership(&schedule.id, &self.user_id)?;
        self.usecase.update_schedule(schedule)
    }

    pub fn enable(&self, id: &Identifier) -> Result<CheckerSchedule> {
        self.usecase.validate_schedule_ownership(id, &self.user_id)?;
        self.usecase.enable_schedule(id)
    }

    pub fn disable(&self, id: &Identifier) -> Result<CheckerSchedule> {
        self.usecase.validate_schedule_ownership(id, &self.user_id)?;
        self.usecase.disable_schedule(id)
    }

    pub fn delete(&self, id: &Identifier) -> Result<()> {
        self.usecase.validate_schedule_ownership(id, &self.user_id)?;
        self.usecase.delete_schedule(id)
    }
}

fn normalize_interval(interval: Duration, target_type: TargetType) -> Result<Duration> {
    let interval = if interval.is_zero() {
        target_type.default_interval()
    } else {
        interval
    };
    if interval < MINIMUM_CHECK_INTERVAL {
        return Err(Error::Validation(format!(
            "interval {:?} is below the minimum of {:?}",
            interval, MINIMUM_CHECK_INTERVAL
        )));
    }
    let representable = chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .is_some();
    if !representable {
        return Err(Error::Validation(format!("interval {:?} is too large", interval)));
    }
    Ok(interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::testing::{Behavior, StubChecker};
    use crate::db::{test_store, Store, Target};
    use crate::storage::CheckerScheduleStorage;
    use chrono::Duration as ChronoDuration;

    fn usecase(store: &Store) -> ScheduleUsecase {
        let mut registry = CheckerRegistry::new();
        registry.register(Arc::new(StubChecker::new("domain_check", Behavior::Succeed).with_availability(true, false)));
        registry.register(Arc::new(StubChecker::new("service_check", Behavior::Succeed).with_availability(false, true)));
        ScheduleUsecase::new(Arc::new(store.clone()), Arc::new(registry))
    }

    fn request(interval: Duration) -> NewSchedule {
        NewSchedule {
            interval,
            ..NewSchedule::new("domain_check", Identifier::generate(), TargetType::Domain, Identifier::generate())
        }
    }

    /// Store a schedule with an explicit next run, bypassing validation.
    fn seed(store: &Store, enabled: bool, next_run: DateTime<Utc>) -> CheckerSchedule {
        let mut schedule = CheckerSchedule {
            id: Identifier::default(),
            checker_name: "domain_check".to_string(),
            owner_id: Identifier::generate(),
            target_type: TargetType::Domain,
            target_id: Identifier::generate(),
            interval: Duration::from_secs(3600),
            enabled,
            next_run,
            last_run: None,
            options: CheckerOptions::new(),
        };
        store.create_checker_schedule(&mut schedule).unwrap();
        schedule
    }

    #[test]
    fn test_interval_below_minimum_rejected() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);

        let err = uc.create_schedule(request(Duration::from_secs(4 * 60))).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.list_checker_schedules().unwrap().is_empty());
    }

    #[test]
    fn test_interval_too_large_rejected() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);

        let err = uc.create_schedule(request(Duration::from_secs(u64::MAX))).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.list_checker_schedules().unwrap().is_empty());

        let created = uc.create_schedule(request(Duration::from_secs(3600))).unwrap();
        let mut changed = created.clone();
        changed.interval = Duration::from_secs(i64::MAX as u64);
        assert!(matches!(uc.update_schedule(changed), Err(Error::Validation(_))));
        assert_eq!(
            store.get_checker_schedule(&created.id).unwrap().interval,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_unknown_checker_rejected() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let mut req = request(Duration::ZERO);
        req.checker_name = "nope".to_string();
        assert!(matches!(uc.create_schedule(req), Err(Error::Validation(_))));
    }

    #[test]
    fn test_default_interval_and_spread_first_run() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);

        let before = Utc::now();
        let schedule = uc.create_schedule(request(Duration::ZERO)).unwrap();
        assert_eq!(schedule.interval, Duration::from_secs(24 * 3600));
        assert!(schedule.next_run >= before);
        assert!(schedule.next_run <= add_duration(Utc::now(), schedule.interval));

        let mut service = request(Duration::ZERO);
        service.checker_name = "service_check".to_string();
        service.target_type = TargetType::Service;
        assert_eq!(uc.create_schedule(service).unwrap().interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_enable_with_past_next_run() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let schedule = seed(&store, false, Utc::now() - ChronoDuration::hours(1));

        let before = Utc::now();
        let enabled = uc.enable_schedule(&schedule.id).unwrap();
        let stored = store.get_checker_schedule(&schedule.id).unwrap();
        assert!(enabled.enabled && stored.enabled);
        assert!(stored.next_run >= before);
        assert!(stored.next_run <= add_duration(Utc::now(), stored.interval));
    }

    #[test]
    fn test_disable_preserves_next_run() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let next = Utc::now() + ChronoDuration::minutes(30);
        let schedule = seed(&store, true, next);

        let disabled = uc.disable_schedule(&schedule.id).unwrap();
        assert!(!disabled.enabled);
        assert_eq!(store.get_checker_schedule(&schedule.id).unwrap().next_run, next);
    }

    #[test]
    fn test_update_preserves_last_run_and_recomputes_next_run() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let last_run = Utc::now() - ChronoDuration::minutes(10);
        let mut schedule = seed(&store, true, Utc::now() + ChronoDuration::minutes(50));
        schedule.last_run = Some(last_run);
        store.update_checker_schedule(&schedule).unwrap();

        let mut incoming = schedule.clone();
        incoming.last_run = None;
        incoming.interval = Duration::from_secs(2 * 3600);
        incoming.owner_id = Identifier::generate();

        let updated = uc.update_schedule(incoming).unwrap();
        assert_eq!(updated.last_run, Some(last_run));
        assert_eq!(updated.next_run, last_run + ChronoDuration::hours(2));
        assert_eq!(updated.owner_id, schedule.owner_id);

        let mut too_short = updated.clone();
        too_short.interval = Duration::from_secs(60);
        assert!(matches!(uc.update_schedule(too_short), Err(Error::Validation(_))));
    }

    #[test]
    fn test_update_after_run_advances_by_interval() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let schedule = seed(&store, true, Utc::now() - ChronoDuration::minutes(5));

        uc.update_schedule_after_run(&schedule.id).unwrap();
        let stored = store.get_checker_schedule(&schedule.id).unwrap();
        let last_run = stored.last_run.unwrap();
        assert_eq!(stored.next_run - last_run, ChronoDuration::hours(1));
    }

    #[test]
    fn test_due_filter() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let now = Utc::now();
        let due = seed(&store, true, now - ChronoDuration::minutes(1));
        seed(&store, false, now - ChronoDuration::minutes(1));
        seed(&store, true, now + ChronoDuration::minutes(10));

        let listed = uc.list_due_schedules().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.id);
    }

    #[test]
    fn test_reschedule_overdue_spreads_backlog() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let now = Utc::now();
        let overdue: Vec<_> = (0..12)
            .map(|i| seed(&store, true, now - ChronoDuration::minutes(30 + i)))
            .collect();
        let future_run = now + ChronoDuration::hours(3);
        let future = seed(&store, true, future_run);

        let before = Utc::now();
        let moved = uc.reschedule_overdue_checks().unwrap();
        let after = Utc::now();
        assert_eq!(moved, 12);

        for s in &overdue {
            let stored = store.get_checker_schedule(&s.id).unwrap();
            assert!(stored.next_run > before);
            assert!(stored.next_run <= add_duration(after, MINIMUM_CHECK_INTERVAL));
        }
        assert_eq!(store.get_checker_schedule(&future.id).unwrap().next_run, future_run);
    }

    #[test]
    fn test_reschedule_overdue_below_threshold_is_noop() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let past = Utc::now() - ChronoDuration::hours(2);
        let seeded: Vec<_> = (0..9).map(|_| seed(&store, true, past)).collect();

        assert_eq!(uc.reschedule_overdue_checks().unwrap(), 0);
        for s in &seeded {
            assert_eq!(store.get_checker_schedule(&s.id).unwrap().next_run, past);
        }
    }

    #[test]
    fn test_ownership() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let schedule = seed(&store, true, Utc::now());

        assert!(uc.validate_schedule_ownership(&schedule.id, &schedule.owner_id).is_ok());
        assert!(matches!(
            uc.validate_schedule_ownership(&schedule.id, &Identifier::generate()),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            uc.validate_schedule_ownership(&Identifier::generate(), &schedule.owner_id),
            Err(Error::NotFound("schedule"))
        ));
    }

    #[test]
    fn test_user_scope_guards_mutations() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let schedule = seed(&store, true, Utc::now());
        let stranger = uc.for_user(Identifier::generate());

        assert!(stranger.disable(&schedule.id).is_err());
        assert!(stranger.delete(&schedule.id).is_err());
        assert!(store.get_checker_schedule(&schedule.id).unwrap().enabled);

        let owner = uc.for_user(schedule.owner_id);
        assert_eq!(owner.list().unwrap().len(), 1);
        owner.delete(&schedule.id).unwrap();
        assert!(store.get_checker_schedule(&schedule.id).is_err());
    }

    #[test]
    fn test_discovery_covers_applicable_checkers_only() {
        let (_tmp, store) = test_store();
        let uc = usecase(&store);
        let owner = Identifier::generate();
        for name in ["a.example", "b.example", "c.example"] {
            let mut domain = Target {
                id: Identifier::default(),
                target_type: TargetType::Domain,
                owner_id: owner,
                parent_id: None,
                name: name.to_string(),
            };
            store.add_target(&mut domain).unwrap();
        }

        assert_eq!(uc.discover_and_ensure_schedules().unwrap(), 3);
        let first: Vec<_> = store.list_checker_schedules().unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|s| s.checker_name == "domain_check" && s.enabled));

        // Second pass is a no-op
        assert_eq!(uc.discover_and_ensure_schedules().unwrap(), 0);
        let mut second = store.list_checker_schedules().unwrap();
        let mut first = first;
        first.sort_by_key(|s| s.id);
        second.sort_by_key(|s| s.id);
        assert_eq!(first, second);
    }
}
