//! Check implementations and the registry that resolves them by name.
//!
//! Ships an HTTP availability check and a DNS resolution check.

mod dns;
mod http;

pub use dns::*;
pub use http::*;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{CheckStatus, CheckerOptions, TargetType};

/// Metadata handed to every check alongside its options.
///
/// Always carries `target_type`, `target_id` and `owner_id`.
pub type CheckMeta = HashMap<String, String>;

/// Check error types.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("check timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("check failed: {0}")]
    Failed(String),
}

/// Which target kinds a check can observe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckerAvailability {
    pub apply_to_domain: bool,
    pub apply_to_service: bool,
}

impl CheckerAvailability {
    pub fn applies_to(&self, target_type: TargetType) -> bool {
        match target_type {
            TargetType::Domain => self.apply_to_domain,
            TargetType::Service => self.apply_to_service,
            TargetType::User => false,
        }
    }
}

/// Where an automatically filled option takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoFill {
    TargetId,
    TargetName,
    /// The domain itself, or the parent domain of a service.
    DomainName,
    OwnerId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckerOptionDocumentation {
    pub id: String,
    pub label: String,
    pub description: String,
    pub default: Option<serde_json::Value>,
    pub required: bool,
    pub auto_fill: Option<AutoFill>,
}

impl CheckerOptionDocumentation {
    pub fn new(id: &str, label: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            default: None,
            required: false,
            auto_fill: None,
        }
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn auto_filled(mut self, source: AutoFill) -> Self {
        self.auto_fill = Some(source);
        self
    }
}

/// Declarative option schema of a check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckerOptionsDocumentation {
    pub options: Vec<CheckerOptionDocumentation>,
}

impl CheckerOptionsDocumentation {
    /// Documented default values, keyed by option id.
    pub fn defaults(&self) -> CheckerOptions {
        self.options
            .iter()
            .filter_map(|o| o.default.clone().map(|v| (o.id.clone(), v)))
            .collect()
    }

    pub fn auto_fill_fields(&self) -> impl Iterator<Item = (&str, AutoFill)> {
        self.options
            .iter()
            .filter_map(|o| o.auto_fill.map(|source| (o.id.as_str(), source)))
    }
}

/// What a check reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub status_line: String,
    pub report: serde_json::Value,
}

impl CheckOutcome {
    pub fn new(status: CheckStatus, status_line: impl Into<String>, report: serde_json::Value) -> Self {
        Self {
            status,
            status_line: status_line.into(),
            report,
        }
    }
}

/// A named unit of work that observes a target.
#[async_trait]
pub trait Checker: Send + Sync {
    fn name(&self) -> &str;

    fn availability(&self) -> CheckerAvailability;

    fn options(&self) -> CheckerOptionsDocumentation;

    /// Run the check. Dropping the returned future cancels it.
    async fn run_check(&self, options: CheckerOptions, meta: CheckMeta) -> Result<CheckOutcome, CheckError>;
}

/// Checks known to the process, filled at startup and read-only after.
#[derive(Default, Clone)]
pub struct CheckerRegistry {
    checkers: BTreeMap<String, Arc<dyn Checker>>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every check shipped with the crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpChecker));
        registry.register(Arc::new(DnsChecker));
        registry
    }

    pub fn register(&mut self, checker: Arc<dyn Checker>) {
        let name = checker.name().to_string();
        if self.checkers.insert(name.clone(), checker).is_some() {
            tracing::warn!("Checker {} registered twice, keeping the latest", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Checker>> {
        self.checkers.get(name).cloned()
    }

    /// Registered checks, sorted by name.
    pub fn list(&self) -> impl Iterator<Item = &Arc<dyn Checker>> {
        self.checkers.values()
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }
}

/// Read a numeric option, falling back when absent or malformed.
pub(crate) fn option_u64(options: &CheckerOptions, key: &str, fallback: u64) -> u64 {
    options.get(key).and_then(|v| v.as_u64()).unwrap_or(fallback)
}

/// Read a non-empty string option.
pub(crate) fn option_str<'a>(options: &'a CheckerOptions, key: &str) -> Option<&'a str> {
    options
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
