//! # Descriptors
//!
//! Descriptors are the pure-data half of a device contract: what a
//! property, action or stream looks like, never how it behaves. They are
//! produced at blueprint build time and consumed by the runtime, the
//! validators and UIs. Everything here is serializable.

use crate::meta::{Meta, Name, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What role a property plays in the device model.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
pub enum PropertyKind {
    /// Backed by hardware; reads may touch the wire.
    Physical,
    /// Software-defined state owned by the device.
    Logical,
    /// Computed from other properties.
    Derived,
    /// Boolean-typed condition used by actions and guards.
    Predicate,
}

/// How a resource lock may be held.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
pub enum LockMode {
    /// Composes with other shared holders.
    SharedRead,
    /// Excludes every other holder.
    ExclusiveWrite,
}

/// A lock a property or action requires before executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLockSpec {
    /// Resource name, scoped to the owning device.
    pub resource: Name,
    /// Required mode.
    pub mode: LockMode,
}

impl ResourceLockSpec {
    /// Shared-read lock on a resource.
    pub fn shared(resource: impl Into<Name>) -> Self {
        Self { resource: resource.into(), mode: LockMode::SharedRead }
    }

    /// Exclusive-write lock on a resource.
    pub fn exclusive(resource: impl Into<Name>) -> Self {
        Self { resource: resource.into(), mode: LockMode::ExclusiveWrite }
    }
}

/// Serializable validation rule applied to written values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ValidationRule {
    /// Numeric closed range.
    Range { min: f64, max: f64 },
    /// Regular-expression match over string payloads.
    Regex { pattern: String },
    /// Minimum string length.
    MinLength { min: usize },
}

impl ValidationRule {
    /// Check a scalar against this rule.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            ValidationRule::Range { min, max } => match value.as_f64() {
                Some(v) if v >= *min && v <= *max => Ok(()),
                Some(v) => Err(format!("value {v} outside range [{min}, {max}]")),
                None => Err("range rule requires a numeric value".to_string()),
            },
            ValidationRule::Regex { pattern } => {
                let text = value
                    .as_str()
                    .ok_or_else(|| "regex rule requires a string value".to_string())?;
                let re = regex::Regex::new(pattern)
                    .map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
                if re.is_match(text) {
                    Ok(())
                } else {
                    Err(format!("'{text}' does not match /{pattern}/"))
                }
            }
            ValidationRule::MinLength { min } => {
                let text = value
                    .as_str()
                    .ok_or_else(|| "minLength rule requires a string value".to_string())?;
                if text.len() >= *min {
                    Ok(())
                } else {
                    Err(format!("length {} below minimum {min}", text.len()))
                }
            }
        }
    }
}

/// Permission name checked against the authorization service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission(pub String);

impl Permission {
    /// Create a permission from its serial name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read/write permissions of a property.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertyPermissions {
    /// Permission required to read; `None` means unrestricted.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub read: Option<Permission>,
    /// Permission required to write; `None` means unrestricted.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub write: Option<Permission>,
}

/// Inclusive numeric range for property values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: f64,
    pub max: f64,
}

/// Metric export hints attached to a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsHint {
    /// Exported metric name.
    pub metric: String,
    /// Static labels attached to every sample.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub labels: BTreeMap<String, String>,
}

/// Contract of a single property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    /// Property name, unique within the blueprint.
    pub name: Name,
    /// Role of the property.
    pub kind: PropertyKind,
    /// Serial name of the value type (converter `type_name`).
    pub value_type: String,
    /// Whether reads are allowed.
    pub readable: bool,
    /// Whether writes are allowed.
    pub mutable: bool,
    /// Engineering unit, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit: Option<String>,
    /// Inclusive numeric range, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub range: Option<NumericRange>,
    /// Closed set of allowed scalar values, if any.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub allowed_values: Vec<Value>,
    /// Access permissions.
    #[serde(default)]
    pub permissions: PropertyPermissions,
    /// Semantic tags.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    /// Externally contributed binding payloads keyed by adapter id
    /// (e.g. a Modbus adapter attaches `{unitId, register, kind}` under
    /// `"modbus"`). The key set is open.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub bindings: BTreeMap<String, Meta>,
    /// Metric export hints.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metrics: Option<MetricsHint>,
    /// Display labels keyed by locale or surface.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub labels: BTreeMap<String, String>,
    /// Whether the value participates in snapshots.
    #[serde(default)]
    pub persistent: bool,
    /// Serializable validation rules applied to writes.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub validation: Vec<ValidationRule>,
    /// Locks that must be held around access.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required_locks: Vec<ResourceLockSpec>,
}

impl PropertyDescriptor {
    /// Readable, non-mutable property of the given kind and type.
    pub fn new(name: impl Into<Name>, kind: PropertyKind, value_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            value_type: value_type.into(),
            readable: true,
            mutable: false,
            unit: None,
            range: None,
            allowed_values: Vec::new(),
            permissions: PropertyPermissions::default(),
            tags: Vec::new(),
            bindings: BTreeMap::new(),
            metrics: None,
            labels: BTreeMap::new(),
            persistent: false,
            validation: Vec::new(),
            required_locks: Vec::new(),
        }
    }

    /// Make the property writable.
    pub fn mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    /// Constrain values to an inclusive numeric range; also installs the
    /// matching validation rule.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(NumericRange { min, max });
        self.validation.push(ValidationRule::Range { min, max });
        self
    }

    /// Set the engineering unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Mark the value as persistent.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Add a validation rule.
    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validation.push(rule);
        self
    }

    /// Require a lock around access.
    pub fn with_lock(mut self, lock: ResourceLockSpec) -> Self {
        self.required_locks.push(lock);
        self
    }

    /// Attach an externally contributed binding payload.
    pub fn with_binding(mut self, key: impl Into<String>, payload: Meta) -> Self {
        self.bindings.insert(key.into(), payload);
        self
    }

    /// Add a semantic tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Run every serializable rule against a scalar write.
    pub fn validate_value(&self, value: &Value) -> Result<(), String> {
        if !self.allowed_values.is_empty() && !self.allowed_values.contains(value) {
            return Err(format!("value {value:?} not in the allowed set"));
        }
        for rule in &self.validation {
            rule.check(value)?;
        }
        Ok(())
    }
}

/// Scope of a cached action result.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
pub enum CacheScope {
    PerDevice,
    PerHub,
    PerCluster,
}

/// Caching contract of an action result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// How long a result stays valid.
    pub ttl: Duration,
    /// Sharing scope of the cache entry.
    pub scope: CacheScope,
    /// Event serial names that invalidate the entry early.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub invalidation_events: Vec<String>,
}

/// Reference to logic executed elsewhere instead of an inline body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskReference {
    /// Routed through the task-executor capability.
    Task { task_id: String },
    /// Serialized transaction plan routed through the plan executor.
    Plan { plan: Meta },
}

/// Contract of a single action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// Action name, unique within the blueprint.
    pub name: Name,
    /// Expected input shape, if constrained.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub inputs: Option<Meta>,
    /// Produced output shape, if constrained.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outputs: Option<Meta>,
    /// Soft timeout applied when the caller gives none.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default_timeout: Option<Duration>,
    /// Hard deadline; execution never survives past it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub execution_deadline: Option<Duration>,
    /// Permission required to execute.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub permission: Option<Permission>,
    /// Locks that must be held around execution.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required_locks: Vec<ResourceLockSpec>,
    /// Predicate properties that must read `true` at dispatch.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required_predicates: Vec<Name>,
    /// Result caching contract.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cache: Option<CachePolicy>,
    /// Whether the action may run on a remote executor.
    #[serde(default)]
    pub distributable: bool,
    /// Operational event posted before the body runs.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub triggers: Option<String>,
    /// Operational event posted on success.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub triggers_on_success: Option<String>,
    /// Operational event posted on failure.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub triggers_on_failure: Option<String>,
    /// Fault type serial names the action may produce.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub fault_types: Vec<String>,
    /// Task or plan reference; such an action cannot be invoked inline.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task_ref: Option<TaskReference>,
}

impl ActionDescriptor {
    /// Plain action with no constraints.
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            inputs: None,
            outputs: None,
            default_timeout: None,
            execution_deadline: None,
            permission: None,
            required_locks: Vec::new(),
            required_predicates: Vec::new(),
            cache: None,
            distributable: false,
            triggers: None,
            triggers_on_success: None,
            triggers_on_failure: None,
            fault_types: Vec::new(),
            task_ref: None,
        }
    }

    /// Set the soft timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Set the hard deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.execution_deadline = Some(deadline);
        self
    }

    /// Require a predicate to hold at dispatch.
    pub fn requires_predicate(mut self, predicate: impl Into<Name>) -> Self {
        self.required_predicates.push(predicate.into());
        self
    }

    /// Require a lock around execution.
    pub fn with_lock(mut self, lock: ResourceLockSpec) -> Self {
        self.required_locks.push(lock);
        self
    }

    /// Post an operational event before the body runs.
    pub fn triggers(mut self, event: impl Into<String>) -> Self {
        self.triggers = Some(event.into());
        self
    }

    /// Post an operational event on success.
    pub fn triggers_on_success(mut self, event: impl Into<String>) -> Self {
        self.triggers_on_success = Some(event.into());
        self
    }

    /// Post an operational event on failure.
    pub fn triggers_on_failure(mut self, event: impl Into<String>) -> Self {
        self.triggers_on_failure = Some(event.into());
        self
    }

    /// Require an execute permission.
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = Some(permission);
        self
    }

    /// Every operational event this action can post.
    pub fn declared_events(&self) -> impl Iterator<Item = &String> {
        self.triggers
            .iter()
            .chain(self.triggers_on_success.iter())
            .chain(self.triggers_on_failure.iter())
    }
}

/// Direction of a binary stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
pub enum StreamDirection {
    In,
    Out,
    Bidirectional,
}

/// Delivery preference of a binary stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
pub enum DeliveryHint {
    /// Newest frame wins; stale frames may drop.
    LatestWins,
    /// Every frame matters; the producer blocks on a full buffer.
    Lossless,
}

/// Contract of a single binary stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Stream name, unique within the blueprint.
    pub name: Name,
    /// Data direction relative to the device.
    pub direction: StreamDirection,
    /// Suggested frame rate in hertz.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub suggested_rate_hz: Option<f64>,
    /// Frames buffered per subscriber.
    pub buffer_size: usize,
    /// Delivery preference.
    pub delivery: DeliveryHint,
}

impl StreamDescriptor {
    /// Stream with the default buffer of 16 frames, latest-wins.
    pub fn new(name: impl Into<Name>, direction: StreamDirection) -> Self {
        Self {
            name: name.into(),
            direction,
            suggested_rate_hz: None,
            buffer_size: 16,
            delivery: DeliveryHint::LatestWins,
        }
    }
}
