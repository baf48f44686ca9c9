//! Effective option computation for a check run.
//!
//! Layers are applied in increasing precedence: documented defaults and the
//! global layer, then user, domain, service, the run's own options, and
//! finally auto-filled values. Later layers overwrite earlier ones key by key.

use std::sync::Arc;

use crate::checker::{AutoFill, Checker};
use crate::db::{CheckExecution, CheckerOptions, CheckerOptionsLayer, Target, TargetType};
use crate::error::Result;
use crate::ident::Identifier;
use crate::storage::CheckerStorage;

/// The scope identifiers an execution resolves options against.
#[derive(Debug, Clone, Default, PartialEq)]
struct OptionScope {
    user_id: Option<Identifier>,
    domain_id: Option<Identifier>,
    service_id: Option<Identifier>,
}

impl OptionScope {
    fn matches(&self, layer: &CheckerOptionsLayer) -> bool {
        fn fits(wanted: Option<Identifier>, have: Option<Identifier>) -> bool {
            wanted.is_none() || wanted == have
        }
        fits(layer.user_id, self.user_id)
            && fits(layer.domain_id, self.domain_id)
            && fits(layer.service_id, self.service_id)
    }
}

fn specificity(layer: &CheckerOptionsLayer) -> u8 {
    if layer.service_id.is_some() {
        3
    } else if layer.domain_id.is_some() {
        2
    } else if layer.user_id.is_some() {
        1
    } else {
        0
    }
}

pub struct OptionsMerger {
    storage: Arc<dyn CheckerStorage>,
}

impl OptionsMerger {
    pub fn new(storage: Arc<dyn CheckerStorage>) -> Self {
        Self { storage }
    }

    /// Compute the options `checker` runs with for `execution`.
    pub fn merge(&self, checker: &dyn Checker, execution: &CheckExecution) -> Result<CheckerOptions> {
        let documentation = checker.options();

        let target = match execution.target_type {
            TargetType::User => None,
            _ => Some(
                self.storage
                    .get_target(execution.target_type, &execution.target_id)?,
            ),
        };

        let scope = OptionScope {
            user_id: Some(execution.owner_id),
            domain_id: match execution.target_type {
                TargetType::Domain => Some(execution.target_id),
                TargetType::Service => target.as_ref().and_then(|t| t.parent_id),
                TargetType::User => None,
            },
            service_id: match execution.target_type {
                TargetType::Service => Some(execution.target_id),
                _ => None,
            },
        };

        let mut layers: Vec<CheckerOptionsLayer> = self
            .storage
            .list_checker_options_layers(checker.name())?
            .into_iter()
            .filter(|layer| scope.matches(layer))
            .collect();
        layers.sort_by_key(specificity);

        let mut effective = documentation.defaults();
        for layer in layers {
            effective.extend(layer.options);
        }
        effective.extend(execution.options.clone());

        for (key, source) in documentation.auto_fill_fields() {
            let value = self.auto_fill_value(source, execution, target.as_ref(), scope.domain_id)?;
            if let Some(value) = value {
                effective.insert(key.to_string(), serde_json::Value::String(value));
            }
        }

        Ok(effective)
    }

    fn auto_fill_value(
        &self,
        source: AutoFill,
        execution: &CheckExecution,
        target: Option<&Target>,
        domain_id: Option<Identifier>,
    ) -> Result<Option<String>> {
        Ok(match source {
            AutoFill::TargetId => Some(execution.target_id.to_string()),
            AutoFill::OwnerId => Some(execution.owner_id.to_string()),
            AutoFill::TargetName => target.map(|t| t.name.clone()),
            AutoFill::DomainName => match (execution.target_type, target, domain_id) {
                (TargetType::Domain, Some(t), _) => Some(t.name.clone()),
                (TargetType::Service, _, Some(domain_id)) => {
                    Some(self.storage.get_target(TargetType::Domain, &domain_id)?.name)
                }
                _ => None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::testing::{Behavior, StubChecker};
    use crate::checker::{CheckerOptionDocumentation, CheckerOptionsDocumentation};
    use crate::db::{test_store, ExecutionStatus, Store};
    use crate::error::Error;
    use crate::storage::CheckerOptionsStorage;
    use chrono::Utc;
    use serde_json::json;

    fn layer(
        user_id: Option<Identifier>,
        domain_id: Option<Identifier>,
        service_id: Option<Identifier>,
        key: &str,
        value: serde_json::Value,
    ) -> CheckerOptionsLayer {
        CheckerOptionsLayer {
            checker_name: "stub".to_string(),
            user_id,
            domain_id,
            service_id,
            options: CheckerOptions::from([(key.to_string(), value)]),
        }
    }

    fn execution(target_type: TargetType, target_id: Identifier, owner_id: Identifier) -> CheckExecution {
        CheckExecution {
            id: Identifier::generate(),
            schedule_id: None,
            checker_name: "stub".to_string(),
            owner_id,
            target_type,
            target_id,
            options: CheckerOptions::new(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            result_id: None,
        }
    }

    fn catalog(store: &Store, owner: Identifier) -> (Target, Target) {
        let mut domain = Target {
            id: Identifier::default(),
            target_type: TargetType::Domain,
            owner_id: owner,
            parent_id: None,
            name: "example.com".to_string(),
        };
        store.add_target(&mut domain).unwrap();
        let mut service = Target {
            id: Identifier::default(),
            target_type: TargetType::Service,
            owner_id: owner,
            parent_id: Some(domain.id),
            name: "www".to_string(),
        };
        store.add_target(&mut service).unwrap();
        (domain, service)
    }

    fn documented_checker() -> StubChecker {
        StubChecker::new("stub", Behavior::Succeed).with_documentation(CheckerOptionsDocumentation {
            options: vec![
                CheckerOptionDocumentation::new("level", "Level", "").with_default(json!("default")),
                CheckerOptionDocumentation::new("domain_name", "Domain", "").auto_filled(AutoFill::DomainName),
                CheckerOptionDocumentation::new("target", "Target", "").auto_filled(AutoFill::TargetName),
            ],
        })
    }

    #[test]
    fn test_layer_precedence() {
        let (_tmp, store) = test_store();
        let owner = Identifier::generate();
        let (domain, service) = catalog(&store, owner);

        store.set_checker_options_layer(&layer(None, None, None, "level", json!("global"))).unwrap();
        store.set_checker_options_layer(&layer(Some(owner), None, None, "level", json!("user"))).unwrap();
        store
            .set_checker_options_layer(&layer(Some(owner), Some(domain.id), None, "level", json!("domain")))
            .unwrap();
        store
            .set_checker_options_layer(&layer(None, None, None, "global_only", json!(1)))
            .unwrap();
        // A layer for somebody else never applies.
        store
            .set_checker_options_layer(&layer(Some(Identifier::generate()), None, None, "level", json!("other")))
            .unwrap();

        let merger = OptionsMerger::new(Arc::new(store.clone()));
        let checker = documented_checker();

        let merged = merger.merge(&checker, &execution(TargetType::Domain, domain.id, owner)).unwrap();
        assert_eq!(merged["level"], json!("domain"));
        assert_eq!(merged["global_only"], json!(1));

        store
            .set_checker_options_layer(&layer(Some(owner), Some(domain.id), Some(service.id), "level", json!("service")))
            .unwrap();
        let merged = merger.merge(&checker, &execution(TargetType::Service, service.id, owner)).unwrap();
        assert_eq!(merged["level"], json!("service"));

        let mut run = execution(TargetType::Service, service.id, owner);
        run.options.insert("level".to_string(), json!("run"));
        let merged = merger.merge(&checker, &run).unwrap();
        assert_eq!(merged["level"], json!("run"));
    }

    #[test]
    fn test_documented_default_applies_without_layers() {
        let (_tmp, store) = test_store();
        let owner = Identifier::generate();
        let (domain, _) = catalog(&store, owner);

        let merger = OptionsMerger::new(Arc::new(store));
        let merged = merger
            .merge(&documented_checker(), &execution(TargetType::Domain, domain.id, owner))
            .unwrap();
        assert_eq!(merged["level"], json!("default"));
    }

    #[test]
    fn test_auto_fill_wins_over_run_options() {
        let (_tmp, store) = test_store();
        let owner = Identifier::generate();
        let (_, service) = catalog(&store, owner);

        let merger = OptionsMerger::new(Arc::new(store));
        let mut run = execution(TargetType::Service, service.id, owner);
        run.options.insert("domain_name".to_string(), json!("spoofed.test"));

        let merged = merger.merge(&documented_checker(), &run).unwrap();
        assert_eq!(merged["domain_name"], json!("example.com"));
        assert_eq!(merged["target"], json!("www"));
    }

    #[test]
    fn test_unknown_target_fails_merge() {
        let (_tmp, store) = test_store();
        let merger = OptionsMerger::new(Arc::new(store));
        let err = merger
            .merge(
                &documented_checker(),
                &execution(TargetType::Service, Identifier::generate(), Identifier::generate()),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound("target")));
    }
}
