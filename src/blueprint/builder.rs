//! Blueprint builder
//!
//! Collects members and produces an immutable, validated
//! [`BlueprintDeclaration`]. Build-time work: cross-bucket name collision
//! checks, the implicit lifecycle feature, and computing the operational
//! FSM feature from the machine, the action hooks and the guard
//! post-events.

use super::declaration::{
    BlueprintDeclaration, BlueprintId, ChildConfig, PeerConnectionConfig, Version,
};
use super::features::Feature;
use crate::descriptor::{ActionDescriptor, PropertyDescriptor, StreamDescriptor};
use crate::fsm::{FsmDescriptor, GuardSpec};
use crate::meta::Meta;
use crate::validation::{validate_declaration, ValidationIssue};
use std::collections::BTreeMap;
use thiserror::Error;

/// Build failures.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("blueprint '{id}' failed validation: {issues:?}")]
    Invalid {
        id: BlueprintId,
        issues: Vec<ValidationIssue>,
    },

    #[error("blueprint '{0}' declares guards or action hooks but no operational machine")]
    GuardsWithoutFsm(BlueprintId),
}

/// Mutable collector for a blueprint declaration.
pub struct BlueprintBuilder {
    id: BlueprintId,
    version: Version,
    tags: Vec<String>,
    device_contract: String,
    schema_version: u32,
    features: BTreeMap<String, Feature>,
    properties: BTreeMap<String, PropertyDescriptor>,
    hidden_properties: BTreeMap<String, PropertyDescriptor>,
    actions: BTreeMap<String, ActionDescriptor>,
    hidden_actions: BTreeMap<String, ActionDescriptor>,
    streams: BTreeMap<String, StreamDescriptor>,
    children: BTreeMap<String, ChildConfig>,
    peers: BTreeMap<String, PeerConnectionConfig>,
    default_meta: Meta,
    operational_fsm: Option<FsmDescriptor>,
    guards: Vec<GuardSpec>,
}

impl BlueprintBuilder {
    /// Start a blueprint.
    pub fn new(id: impl Into<BlueprintId>, version: impl Into<Version>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            tags: Vec::new(),
            device_contract: String::new(),
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
            guards: Vec::new(),
        }
    }

    /// Set the device contract fq-name.
    pub fn contract(mut self, fq_name: impl Into<String>) -> Self {
        self.device_contract = fq_name.into();
        self
    }

    /// Set the persistence schema version.
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Add a semantic tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add a public property.
    pub fn property(mut self, descriptor: PropertyDescriptor) -> Self {
        self.properties.insert(descriptor.name.to_string(), descriptor);
        self
    }

    /// Add a hidden property.
    pub fn hidden_property(mut self, descriptor: PropertyDescriptor) -> Self {
        self.hidden_properties.insert(descriptor.name.to_string(), descriptor);
        self
    }

    /// Add a public action.
    pub fn action(mut self, descriptor: ActionDescriptor) -> Self {
        self.actions.insert(descriptor.name.to_string(), descriptor);
        self
    }

    /// Add a hidden action.
    pub fn hidden_action(mut self, descriptor: ActionDescriptor) -> Self {
        self.hidden_actions.insert(descriptor.name.to_string(), descriptor);
        self
    }

    /// Add a binary stream.
    pub fn stream(mut self, descriptor: StreamDescriptor) -> Self {
        self.streams.insert(descriptor.name.to_string(), descriptor);
        self
    }

    /// Add a child component.
    pub fn child(mut self, name: impl Into<String>, config: ChildConfig) -> Self {
        self.children.insert(name.into(), config);
        self
    }

    /// Declare a peer connection.
    pub fn peer(mut self, name: impl Into<String>, config: PeerConnectionConfig) -> Self {
        self.peers.insert(name.into(), config);
        self
    }

    /// Add a capability feature.
    pub fn feature(mut self, feature: Feature) -> Self {
        self.features.insert(feature.capability().to_string(), feature);
        self
    }

    /// Set the default configuration.
    pub fn default_meta(mut self, meta: Meta) -> Self {
        self.default_meta = meta;
        self
    }

    /// Declare the operational machine.
    pub fn operational_fsm(mut self, descriptor: FsmDescriptor) -> Self {
        self.operational_fsm = Some(descriptor);
        self
    }

    /// Declare a guard.
    pub fn guard(mut self, guard: GuardSpec) -> Self {
        self.guards.push(guard);
        self
    }

    /// Validate and freeze into a declaration.
    pub fn build(mut self) -> Result<BlueprintDeclaration, BuildError> {
        // every device carries the lifecycle capability
        self.features
            .entry(Feature::Lifecycle.capability().to_string())
            .or_insert(Feature::Lifecycle);

        let has_action_hooks = self
            .actions
            .values()
            .chain(self.hidden_actions.values())
            .any(|action| action.declared_events().next().is_some());
        if self.operational_fsm.is_none() && (!self.guards.is_empty() || has_action_hooks) {
            return Err(BuildError::GuardsWithoutFsm(self.id));
        }

        // fold action hooks and guard post-events into the declared machine
        if let Some(fsm) = &mut self.operational_fsm {
            let declared: Vec<String> = self
                .actions
                .values()
                .chain(self.hidden_actions.values())
                .flat_map(|action| action.declared_events().cloned())
                .chain(self.guards.iter().map(|g| g.post_event().to_string()))
                .collect();
            for event in declared {
                if !fsm.events.contains(&event) {
                    fsm.events.push(event);
                }
            }
            self.features.insert(
                Feature::OperationalFsm { states: vec![], events: vec![] }
                    .capability()
                    .to_string(),
                Feature::OperationalFsm {
                    states: fsm.states.clone(),
                    events: fsm.events.clone(),
                },
            );
        }

        if !self.guards.is_empty() {
            self.features.insert(
                Feature::OperationalGuards { guards: vec![] }.capability().to_string(),
                Feature::OperationalGuards { guards: self.guards.clone() },
            );
        }

        let mut default_meta = self.default_meta;
        default_meta.seal();

        let declaration = BlueprintDeclaration {
            id: self.id,
            version: self.version,
            tags: self.tags,
            device_contract: self.device_contract,
            schema_version: self.schema_version,
            features: self.features,
            properties: self.properties,
            hidden_properties: self.hidden_properties,
            actions: self.actions,
            hidden_actions: self.hidden_actions,
            streams: self.streams,
            children: self.children,
            peers: self.peers,
            default_meta,
            operational_fsm: self.operational_fsm,
        };

        let issues = validate_declaration(&declaration);
        if !issues.is_empty() {
            return Err(BuildError::Invalid {
                id: declaration.id,
                issues,
            });
        }
        Ok(declaration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PropertyKind;
    use std::time::Duration;

    #[test]
    fn test_build_adds_lifecycle_feature() {
        let declaration = BlueprintBuilder::new("example.motor", "1.0.0")
            .contract("example.Motor")
            .property(
                PropertyDescriptor::new("position", PropertyKind::Logical, "double").mutable(),
            )
            .build()
            .unwrap();
        assert!(declaration.has_capability("lifecycle"));
    }

    #[test]
    fn test_build_rejects_collisions() {
        let result = BlueprintBuilder::new("example.motor", "1.0.0")
            .property(PropertyDescriptor::new("x", PropertyKind::Logical, "double"))
            .action(ActionDescriptor::new("x"))
            .build();
        assert!(matches!(result, Err(BuildError::Invalid { .. })));
    }

    #[test]
    fn test_operational_feature_collects_events() {
        let declaration = BlueprintBuilder::new("example.oven", "1.0.0")
            .property(PropertyDescriptor::new("isHot", PropertyKind::Predicate, "bool"))
            .action(ActionDescriptor::new("bake").triggers("BakeStarted").triggers_on_success("BakeDone"))
            .operational_fsm(
                FsmDescriptor::new("Idle")
                    .transition("Idle", "BakeStarted", "Baking")
                    .transition("Baking", "BakeDone", "Idle")
                    .transition("Baking", "Overheat", "Fault"),
            )
            .guard(GuardSpec::TimedPredicate {
                name: "overheat".into(),
                predicate: "isHot".into(),
                duration: Duration::from_secs(5),
                post_event: "Overheat".into(),
                from_states: Some(vec!["Baking".into()]),
            })
            .build()
            .unwrap();

        match declaration.features.get("operationalFsm").unwrap() {
            Feature::OperationalFsm { events, .. } => {
                for expected in ["BakeStarted", "BakeDone", "Overheat"] {
                    assert!(events.iter().any(|e| e == expected), "missing {expected}");
                }
            }
            other => panic!("wrong feature: {other:?}"),
        }
        assert_eq!(declaration.guards().len(), 1);
    }

    #[test]
    fn test_guards_require_fsm() {
        let result = BlueprintBuilder::new("example.oven", "1.0.0")
            .property(PropertyDescriptor::new("isHot", PropertyKind::Predicate, "bool"))
            .guard(GuardSpec::TimedPredicate {
                name: "overheat".into(),
                predicate: "isHot".into(),
                duration: Duration::from_secs(5),
                post_event: "Overheat".into(),
                from_states: None,
            })
            .build();
        assert!(matches!(result, Err(BuildError::GuardsWithoutFsm(_))));
    }

    #[test]
    fn test_default_meta_is_sealed() {
        let mut meta = Meta::new();
        meta.set_value(&"rate".into(), 10i64).unwrap();
        let declaration = BlueprintBuilder::new("example.motor", "1.0.0")
            .default_meta(meta)
            .build()
            .unwrap();
        assert!(declaration.default_meta.is_sealed());
    }
}
