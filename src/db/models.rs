//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::ident::Identifier;

/// Option values handed to a check, keyed by option id.
pub type CheckerOptions = HashMap<String, serde_json::Value>;

/// The kind of object a check observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    User,
    Domain,
    Service,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::User => "user",
            TargetType::Domain => "domain",
            TargetType::Service => "service",
        }
    }

    /// Interval applied when a schedule is created without one.
    pub fn default_interval(&self) -> Duration {
        match self {
            TargetType::User => Duration::from_secs(4 * 3600),
            TargetType::Domain => Duration::from_secs(24 * 3600),
            TargetType::Service => Duration::from_secs(3600),
        }
    }
}

/// Execution lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Pending may fail directly when the worker could not mark it running.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }
}

/// Outcome severity reported by a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warning")]
    Warning,
    #[serde(rename = "critical")]
    Critical,
    #[serde(rename = "unknown")]
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
            CheckStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

macro_rules! impl_str_enum {
    ($ty:ty, $kind:literal, [$($variant:expr),+]) => {
        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| ParseEnumError { kind: $kind, value: s.to_string() })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_str_enum!(TargetType, "target type", [TargetType::User, TargetType::Domain, TargetType::Service]);
impl_str_enum!(
    ExecutionStatus,
    "execution status",
    [ExecutionStatus::Pending, ExecutionStatus::Running, ExecutionStatus::Completed, ExecutionStatus::Failed]
);
impl_str_enum!(
    CheckStatus,
    "check status",
    [CheckStatus::Ok, CheckStatus::Warning, CheckStatus::Critical, CheckStatus::Unknown]
);

/// A recurring check bound to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerSchedule {
    pub id: Identifier,
    pub checker_name: String,
    pub owner_id: Identifier,
    pub target_type: TargetType,
    pub target_id: Identifier,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub enabled: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub options: CheckerOptions,
}

impl CheckerSchedule {
    /// A schedule fires once `next_run` has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run < now
    }
}

/// A single attempt at running a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckExecution {
    pub id: Identifier,
    pub schedule_id: Option<Identifier>,
    pub checker_name: String,
    pub owner_id: Identifier,
    pub target_type: TargetType,
    pub target_id: Identifier,
    pub options: CheckerOptions,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_id: Option<Identifier>,
}

/// A stored check outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: Identifier,
    pub checker_name: String,
    pub check_type: TargetType,
    pub target_id: Identifier,
    pub owner_id: Identifier,
    pub options: CheckerOptions,
    pub executed_at: DateTime<Utc>,
    pub scheduled_check: bool,
    pub status: CheckStatus,
    pub status_line: String,
    pub report: serde_json::Value,
    pub error: String,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

/// An entry of the target catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: Identifier,
    pub target_type: TargetType,
    pub owner_id: Identifier,
    /// Domain a service belongs to.
    pub parent_id: Option<Identifier>,
    pub name: String,
}

/// One stored layer of checker options.
///
/// A layer without any scope id holds the global defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerOptionsLayer {
    pub checker_name: String,
    pub user_id: Option<Identifier>,
    pub domain_id: Option<Identifier>,
    pub service_id: Option<Identifier>,
    pub options: CheckerOptions,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
