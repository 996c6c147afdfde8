//! Capability features
//!
//! A blueprint advertises what its devices can do through a map of
//! [`Feature`]s keyed by capability name. Capabilities compose by
//! tagging, not by subclassing: a device is a plan executor because its
//! blueprint carries [`Feature::PlanExecutor`], and consumers dispatch on
//! the map.

use crate::fsm::GuardSpec;
use serde::{Deserialize, Serialize};

/// Discriminated capability advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Feature {
    /// The device participates in the lifecycle machine. Always present.
    Lifecycle,
    /// The device accepts `reconfigure` with a meta delta.
    Reconfigurable,
    /// The device has persistent properties.
    Stateful,
    /// The device produces typed data records.
    DataSource { type_name: String },
    /// The device executes workspace tasks by id.
    TaskExecutor { task_ids: Vec<String> },
    /// The device executes transaction plans.
    PlanExecutor,
    /// The device runs an operational machine over these states/events.
    OperationalFsm { states: Vec<String>, events: Vec<String> },
    /// The device serves binary artifacts of these MIME types.
    BinaryData { mime_types: Vec<String> },
    /// The device answers introspection queries.
    Introspection { provides_fsm_diagrams: bool },
    /// The device mirrors entries of a remote peer.
    RemoteMirror { entries: Vec<String> },
    /// Guards observing the state graph and feeding the operational
    /// machine.
    OperationalGuards { guards: Vec<GuardSpec> },
}

impl Feature {
    /// Capability name used as the feature-map key.
    pub fn capability(&self) -> &'static str {
        match self {
            Feature::Lifecycle => "lifecycle",
            Feature::Reconfigurable => "reconfigurable",
            Feature::Stateful => "stateful",
            Feature::DataSource { .. } => "dataSource",
            Feature::TaskExecutor { .. } => "taskExecutor",
            Feature::PlanExecutor => "planExecutor",
            Feature::OperationalFsm { .. } => "operationalFsm",
            Feature::BinaryData { .. } => "binaryData",
            Feature::Introspection { .. } => "introspection",
            Feature::RemoteMirror { .. } => "remoteMirror",
            Feature::OperationalGuards { .. } => "operationalGuards",
        }
    }
}
