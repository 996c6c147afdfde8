//! Blueprint declarations
//!
//! The serializable half of a device contract: identity, descriptors,
//! features, children and peers. Declarations are pure data and platform
//! agnostic; behavior is fused in later by the hydrator.

use super::features::Feature;
use crate::descriptor::{ActionDescriptor, PropertyDescriptor, StreamDescriptor};
use crate::fsm::{FsmDescriptor, LifecycleState};
use crate::meta::{Meta, Name};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Opaque blueprint identity; reverse-DNS recommended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlueprintId(pub String);

impl BlueprintId {
    /// Create an id from its serial form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for BlueprintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlueprintId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// SemVer version text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(pub String);

impl Version {
    /// Create a version from its text form.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How a child component binds a property to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildPropertyBinding {
    /// Write a constant into the child once at attach.
    Const { target: Name, value: Meta },
    /// Forward a parent property into the child.
    Direct { target: Name, source: Name },
    /// Forward a parent property through a transformer.
    Transformed {
        target: Name,
        source: Name,
        transformer: TransformerDescriptor,
    },
}

impl ChildPropertyBinding {
    /// The child property being driven.
    pub fn target(&self) -> &Name {
        match self {
            ChildPropertyBinding::Const { target, .. }
            | ChildPropertyBinding::Direct { target, .. }
            | ChildPropertyBinding::Transformed { target, .. } => target,
        }
    }
}

/// Serializable value transformer used by transformed bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransformerDescriptor {
    /// `y = scale * x + offset` over numeric payloads.
    Linear { scale: f64, offset: f64 },
    /// Table lookup over string payloads; missing keys pass through.
    Map { entries: BTreeMap<String, String> },
    /// Resolved against a behavior facet by key.
    Custom { key: String },
}

/// Lifecycle knobs a parent may override on a local child.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChildLifecycleOverrides {
    /// Target state the child should reach when the parent starts.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub desired_state: Option<LifecycleState>,
    /// Timeout applied to the child's lifecycle phases.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub phase_timeout: Option<Duration>,
}

/// Configuration of one child component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildConfig {
    /// Child instantiated on the same hub.
    Local {
        blueprint: BlueprintId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        version: Option<Version>,
        #[serde(default)]
        lifecycle: ChildLifecycleOverrides,
        #[serde(default)]
        meta: Meta,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        bindings: Vec<ChildPropertyBinding>,
    },
    /// Child mirrored from a remote hub over a declared peer.
    Remote {
        peer: String,
        device: Name,
        blueprint: BlueprintId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        version: Option<Version>,
        #[serde(default)]
        meta: Meta,
    },
}

/// Quality of service of a peer channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Declared connection to a peer hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConnectionConfig {
    /// Service id resolved through discovery.
    pub service_id: String,
    /// Delivery guarantee.
    pub qos: QoS,
    /// Per-message timeout.
    pub timeout: Duration,
    /// Optional failover peer name.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failover: Option<String>,
}

/// The serializable contract of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintDeclaration {
    /// Blueprint identity.
    pub id: BlueprintId,
    /// Blueprint version.
    pub version: Version,
    /// Semantic tags.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    /// Fully qualified name of the device contract.
    pub device_contract: String,
    /// Persistence schema version; monotonically non-decreasing across
    /// blueprint versions.
    pub schema_version: u32,
    /// Capability map keyed by capability name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub features: BTreeMap<String, Feature>,
    /// Public properties.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub properties: BTreeMap<String, PropertyDescriptor>,
    /// Internal properties, hidden from discovery.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub hidden_properties: BTreeMap<String, PropertyDescriptor>,
    /// Public actions.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub actions: BTreeMap<String, ActionDescriptor>,
    /// Internal actions, hidden from discovery.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub hidden_actions: BTreeMap<String, ActionDescriptor>,
    /// Binary streams.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub streams: BTreeMap<String, StreamDescriptor>,
    /// Child components keyed by child name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub children: BTreeMap<String, ChildConfig>,
    /// Peer connections keyed by peer name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub peers: BTreeMap<String, PeerConnectionConfig>,
    /// Default configuration layered under attach-time meta.
    #[serde(default)]
    pub default_meta: Meta,
    /// Operational machine, if the device declares one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operational_fsm: Option<FsmDescriptor>,
}

impl BlueprintDeclaration {
    /// Look up a property across the public and hidden buckets.
    pub fn property(&self, name: &Name) -> Option<&PropertyDescriptor> {
        let key = name.to_string();
        self.properties
            .get(&key)
            .or_else(|| self.hidden_properties.get(&key))
    }

    /// Look up an action across the public and hidden buckets.
    pub fn action(&self, name: &Name) -> Option<&ActionDescriptor> {
        let key = name.to_string();
        self.actions.get(&key).or_else(|| self.hidden_actions.get(&key))
    }

    /// Every property descriptor, public and hidden.
    pub fn all_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.values().chain(self.hidden_properties.values())
    }

    /// Every action descriptor, public and hidden.
    pub fn all_actions(&self) -> impl Iterator<Item = &ActionDescriptor> {
        self.actions.values().chain(self.hidden_actions.values())
    }

    /// Whether the blueprint advertises a capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.features.contains_key(capability)
    }

    /// Declared guards, if any.
    pub fn guards(&self) -> &[crate::fsm::GuardSpec] {
        match self.features.get("operationalGuards") {
            Some(Feature::OperationalGuards { guards }) => guards,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PropertyKind;

    #[test]
    fn test_declaration_serde_round_trip() {
        let mut declaration = BlueprintDeclaration {
            id: "example.motor".into(),
            version: "1.0.0".into(),
            tags: vec!["motion".into()],
            device_contract: "example.contracts.Motor".into(),
            schema_version: 1,
            features: BTreeMap::new(),
            properties: BTreeMap::new(),
            hidden_properties: BTreeMap::new(),
            actions: BTreeMap::new(),
            hidden_actions: BTreeMap::new(),
            streams: BTreeMap::new(),
            children: BTreeMap::new(),
            peers: BTreeMap::new(),
            default_meta: Meta::of(1i64),
            operational_fsm: None,
        };
        declaration.properties.insert(
            "position".into(),
            PropertyDescriptor::new("position", PropertyKind::Logical, "double").mutable(),
        );
        declaration.features.insert("lifecycle".into(), Feature::Lifecycle);

        let json = serde_json::to_string(&declaration).unwrap();
        let back: BlueprintDeclaration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, declaration);
    }

    #[test]
    fn test_property_lookup_spans_buckets() {
        let mut declaration = BlueprintDeclaration {
            id: "x".into(),
            version: "1".into(),
            tags: vec![],
            device_contract: "x".into(),
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
        };
        declaration.hidden_properties.insert(
            "rawCounter".into(),
            PropertyDescriptor::new("rawCounter", PropertyKind::Physical, "long"),
        );
        assert!(declaration.property(&"rawCounter".into()).is_some());
        assert!(declaration.property(&"missing".into()).is_none());
    }
}
