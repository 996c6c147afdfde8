//! # Blueprint Validation
//!
//! Well-formedness checks run at build time plus a plug-in point for
//! capability-specific validators. A declaration that passes validation
//! is safe to hydrate and attach.

use crate::blueprint::declaration::{BlueprintDeclaration, ChildConfig};
use crate::descriptor::PropertyKind;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("name '{0}' declared more than once")]
    NameCollision(String),

    #[error("action '{action}' requires predicate '{predicate}' which is not a predicate property")]
    BadPredicateReference { action: String, predicate: String },

    #[error("predicate property '{0}' must be boolean-typed")]
    NonBooleanPredicate(String),

    #[error("guard '{guard}' observes '{property}' which does not exist")]
    GuardTargetMissing { guard: String, property: String },

    #[error("guard '{guard}' requires a boolean predicate, got property '{property}' of kind {kind}")]
    GuardTargetNotPredicate {
        guard: String,
        property: String,
        kind: String,
    },

    #[error("remote child '{child}' references undeclared peer '{peer}'")]
    UnknownPeer { child: String, peer: String },

    #[error("operational event '{event}' is declared by '{declared_by}' but missing from the machine")]
    UnknownOperationalEvent { event: String, declared_by: String },

    #[error("schema version of '{id}' regressed from {from} to {to}")]
    SchemaVersionRegression { id: String, from: u32, to: u32 },

    #[error("{capability}: {message}")]
    Feature { capability: String, message: String },
}

/// Capability-specific validator plugged by capability name.
pub trait FeatureValidator: Send + Sync {
    /// Capability this validator applies to.
    fn capability(&self) -> &str;

    /// Check the declaration; push findings.
    fn validate(&self, declaration: &BlueprintDeclaration, issues: &mut Vec<ValidationIssue>);
}

/// Registry of feature validators.
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn FeatureValidator>>,
}

impl ValidatorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a validator.
    pub fn register(&mut self, validator: Arc<dyn FeatureValidator>) {
        self.validators.insert(validator.capability().to_string(), validator);
    }

    /// Run core checks plus every validator whose capability the
    /// declaration advertises.
    pub fn validate(&self, declaration: &BlueprintDeclaration) -> Vec<ValidationIssue> {
        let mut issues = validate_declaration(declaration);
        for (capability, validator) in &self.validators {
            if declaration.has_capability(capability) {
                validator.validate(declaration, &mut issues);
            }
        }
        issues
    }
}

/// Schema versions must never decrease across successive registrations
/// of one blueprint id. Checked against the previously accepted
/// declaration, which a lone declaration cannot see; registries call
/// this before replacing an entry.
pub fn validate_schema_progression(
    previous: &BlueprintDeclaration,
    next: &BlueprintDeclaration,
) -> Result<(), ValidationIssue> {
    if next.schema_version < previous.schema_version {
        return Err(ValidationIssue::SchemaVersionRegression {
            id: next.id.to_string(),
            from: previous.schema_version,
            to: next.schema_version,
        });
    }
    Ok(())
}

/// Core well-formedness checks.
pub fn validate_declaration(declaration: &BlueprintDeclaration) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    // all member names must be pairwise distinct across every bucket
    let mut seen = BTreeSet::new();
    let buckets = declaration
        .properties
        .keys()
        .chain(declaration.hidden_properties.keys())
        .chain(declaration.actions.keys())
        .chain(declaration.hidden_actions.keys())
        .chain(declaration.streams.keys())
        .chain(declaration.children.keys())
        .chain(declaration.peers.keys());
    for name in buckets {
        if !seen.insert(name.clone()) {
            issues.push(ValidationIssue::NameCollision(name.clone()));
        }
    }

    // predicates must be boolean-typed
    for property in declaration.all_properties() {
        if property.kind == PropertyKind::Predicate && property.value_type != "bool" {
            issues.push(ValidationIssue::NonBooleanPredicate(property.name.to_string()));
        }
    }

    // action preconditions must reference predicate properties
    for action in declaration.all_actions() {
        for predicate in &action.required_predicates {
            match declaration.property(predicate) {
                Some(descriptor) if descriptor.kind == PropertyKind::Predicate => {}
                _ => issues.push(ValidationIssue::BadPredicateReference {
                    action: action.name.to_string(),
                    predicate: predicate.to_string(),
                }),
            }
        }
    }

    // guards must observe existing properties of the right kind
    for guard in declaration.guards() {
        let observed = guard.observed();
        match declaration.property(observed) {
            None => issues.push(ValidationIssue::GuardTargetMissing {
                guard: guard.name().to_string(),
                property: observed.to_string(),
            }),
            Some(descriptor) => {
                let needs_predicate =
                    matches!(guard, crate::fsm::GuardSpec::TimedPredicate { .. });
                if needs_predicate && descriptor.kind != PropertyKind::Predicate {
                    issues.push(ValidationIssue::GuardTargetNotPredicate {
                        guard: guard.name().to_string(),
                        property: observed.to_string(),
                        kind: descriptor.kind.to_string(),
                    });
                }
            }
        }
    }

    // remote children must reference declared peers
    for (child, config) in &declaration.children {
        if let ChildConfig::Remote { peer, .. } = config {
            if !declaration.peers.contains_key(peer) {
                issues.push(ValidationIssue::UnknownPeer {
                    child: child.clone(),
                    peer: peer.clone(),
                });
            }
        }
    }

    // events referenced by actions and guards must exist in the machine
    if let Some(fsm) = &declaration.operational_fsm {
        let known: BTreeSet<&String> = fsm.events.iter().collect();
        for action in declaration.all_actions() {
            for event in action.declared_events() {
                if !known.contains(event) {
                    issues.push(ValidationIssue::UnknownOperationalEvent {
                        event: event.clone(),
                        declared_by: action.name.to_string(),
                    });
                }
            }
        }
        for guard in declaration.guards() {
            if !known.contains(&guard.post_event().to_string()) {
                issues.push(ValidationIssue::UnknownOperationalEvent {
                    event: guard.post_event().to_string(),
                    declared_by: guard.name().to_string(),
                });
            }
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::declaration::{BlueprintDeclaration, PeerConnectionConfig, QoS};
    use crate::descriptor::{ActionDescriptor, PropertyDescriptor};
    use crate::meta::Meta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn empty_declaration() -> BlueprintDeclaration {
        BlueprintDeclaration {
            id: "test.device".into(),
            version: "1.0.0".into(),
            tags: vec![],
            device_contract: "test.Device".into(),
            schema_version: 1,
            features: BTreeMap::new(),
            properties: BTreeMap::new(),
            hidden_properties: BTreeMap::new(),
            actions: BTreeMap::new(),
            hidden_actions: BTreeMap::new(),
            streams: BTreeMap::new(),
            children: BTreeMap::new(),
            peers: BTreeMap::new(),
            default_meta: Meta::new(),
            operational_fsm: None,
        }
    }

    #[test]
    fn test_collision_across_buckets() {
        let mut declaration = empty_declaration();
        declaration.properties.insert(
            "position".into(),
            PropertyDescriptor::new("position", PropertyKind::Logical, "double"),
        );
        declaration
            .actions
            .insert("position".into(), ActionDescriptor::new("position"));
        let issues = validate_declaration(&declaration);
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::NameCollision(name) if name == "position")));
    }

    #[test]
    fn test_non_boolean_predicate_rejected() {
        let mut declaration = empty_declaration();
        declaration.properties.insert(
            "isReady".into(),
            PropertyDescriptor::new("isReady", PropertyKind::Predicate, "double"),
        );
        let issues = validate_declaration(&declaration);
        assert!(issues.iter().any(|i| matches!(i, ValidationIssue::NonBooleanPredicate(_))));
    }

    #[test]
    fn test_action_predicate_reference_checked() {
        let mut declaration = empty_declaration();
        declaration.properties.insert(
            "position".into(),
            PropertyDescriptor::new("position", PropertyKind::Logical, "double"),
        );
        declaration.actions.insert(
            "move".into(),
            ActionDescriptor::new("move").requires_predicate("position"),
        );
        let issues = validate_declaration(&declaration);
        assert!(issues.iter().any(|i| matches!(i, ValidationIssue::BadPredicateReference { .. })));
    }

    #[test]
    fn test_remote_child_peer_checked() {
        let mut declaration = empty_declaration();
        declaration.children.insert(
            "sensor".into(),
            ChildConfig::Remote {
                peer: "lab".into(),
                device: "thermo".into(),
                blueprint: "example.thermo".into(),
                version: None,
                meta: Meta::new(),
            },
        );
        let issues = validate_declaration(&declaration);
        assert!(issues.iter().any(|i| matches!(i, ValidationIssue::UnknownPeer { .. })));

        declaration.peers.insert(
            "lab".into(),
            PeerConnectionConfig {
                service_id: "labhub".into(),
                qos: QoS::AtLeastOnce,
                timeout: Duration::from_secs(5),
                failover: None,
            },
        );
        let issues = validate_declaration(&declaration);
        assert!(!issues.iter().any(|i| matches!(i, ValidationIssue::UnknownPeer { .. })));
    }

    #[test]
    fn test_schema_progression() {
        let mut v1 = empty_declaration();
        v1.schema_version = 1;
        let mut v2 = empty_declaration();
        v2.schema_version = 2;

        assert!(validate_schema_progression(&v1, &v2).is_ok());
        assert!(validate_schema_progression(&v1, &v1).is_ok());
        assert!(matches!(
            validate_schema_progression(&v2, &v1),
            Err(ValidationIssue::SchemaVersionRegression { from: 2, to: 1, .. })
        ));
    }

    #[test]
    fn test_clean_declaration_passes() {
        let mut declaration = empty_declaration();
        declaration.properties.insert(
            "isReady".into(),
            PropertyDescriptor::new("isReady", PropertyKind::Predicate, "bool"),
        );
        declaration.actions.insert(
            "calibrate".into(),
            ActionDescriptor::new("calibrate").requires_predicate("isReady"),
        );
        assert!(validate_declaration(&declaration).is_empty());
    }
}
