//! Desired-state reconciliation
//!
//! The reconciler compares a desired description of a hub's device set
//! with the actual one, produces a list of typed diffs, and compiles the
//! diffs into a transaction plan that converges the hub. Replacement is
//! conservative: a blueprint or configuration mismatch rebuilds the
//! device rather than patching it in place.

use super::{ActionSpec, TransactionPlan};
use crate::blueprint::{BlueprintId, ChildPropertyBinding, Version};
use crate::fsm::LifecycleState;
use crate::hub::DeviceHub;
use crate::meta::{Meta, Name};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What one device should look like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredDeviceSpec {
    /// Blueprint to run.
    pub blueprint: BlueprintId,
    /// Pinned version; `None` accepts any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<Version>,
    /// Attach-time configuration.
    #[serde(default)]
    pub config: Meta,
    /// Target lifecycle state (`Running` or `Stopped`).
    pub lifecycle: LifecycleState,
    /// Expected child bindings, if pinned.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub bindings: Vec<ChildPropertyBinding>,
}

/// Desired shape of a whole hub.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesiredHubState {
    /// Devices keyed by hub-local name.
    pub devices: BTreeMap<Name, DesiredDeviceSpec>,
}

/// What one device actually looks like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualDeviceState {
    /// Blueprint currently running.
    pub blueprint: BlueprintId,
    /// Version currently running.
    pub version: Version,
    /// Effective configuration.
    pub config: Meta,
    /// Current lifecycle state.
    pub lifecycle: LifecycleState,
    /// Bindings currently wired.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub bindings: Vec<ChildPropertyBinding>,
}

/// Actual shape of a whole hub.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActualHubState {
    /// Devices keyed by hub-local name.
    pub devices: BTreeMap<Name, ActualDeviceState>,
}

impl ActualHubState {
    /// Gather the actual state from a live hub.
    pub async fn capture(hub: &DeviceHub) -> ActualHubState {
        let mut devices = BTreeMap::new();
        for name in hub.device_names().await {
            let Ok(device) = hub
                .find_device(&crate::meta::Address::new(hub.id().clone(), name.clone()))
                .await
            else {
                continue;
            };
            devices.insert(
                name,
                ActualDeviceState {
                    blueprint: device.declaration().id.clone(),
                    version: device.declaration().version.clone(),
                    config: device.effective_meta().clone(),
                    lifecycle: device.lifecycle().current(),
                    bindings: Vec::new(),
                },
            );
        }
        ActualHubState { devices }
    }
}

/// One difference between desired and actual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateDiff {
    /// Desired but not attached.
    DeviceMissing { name: Name, spec: DesiredDeviceSpec },
    /// Attached but not desired.
    DeviceExtra { name: Name },
    /// Attached with the wrong blueprint or version.
    BlueprintMismatch {
        name: Name,
        expected: BlueprintId,
        actual: BlueprintId,
    },
    /// Attached with a different configuration.
    MetaMismatch { name: Name },
    /// Child bindings differ.
    ChildBindingsChanged { name: Name },
    /// Lifecycle state differs.
    LifecycleStateMismatch {
        name: Name,
        expected: LifecycleState,
        actual: LifecycleState,
    },
}

/// Diff and plan compilation.
pub struct Reconciler;

impl Reconciler {
    /// Compare desired against actual.
    pub fn diff(desired: &DesiredHubState, actual: &ActualHubState) -> Vec<StateDiff> {
        let mut diffs = Vec::new();

        for (name, spec) in &desired.devices {
            let Some(present) = actual.devices.get(name) else {
                diffs.push(StateDiff::DeviceMissing {
                    name: name.clone(),
                    spec: spec.clone(),
                });
                continue;
            };
            let version_ok = spec
                .version
                .as_ref()
                .map(|version| version == &present.version)
                .unwrap_or(true);
            if spec.blueprint != present.blueprint || !version_ok {
                diffs.push(StateDiff::BlueprintMismatch {
                    name: name.clone(),
                    expected: spec.blueprint.clone(),
                    actual: present.blueprint.clone(),
                });
                continue;
            }
            if !spec.config.is_empty() && spec.config != present.config {
                diffs.push(StateDiff::MetaMismatch { name: name.clone() });
                continue;
            }
            if !spec.bindings.is_empty() && spec.bindings != present.bindings {
                diffs.push(StateDiff::ChildBindingsChanged { name: name.clone() });
                continue;
            }
            if spec.lifecycle != present.lifecycle {
                diffs.push(StateDiff::LifecycleStateMismatch {
                    name: name.clone(),
                    expected: spec.lifecycle,
                    actual: present.lifecycle,
                });
            }
        }

        for name in actual.devices.keys() {
            if !desired.devices.contains_key(name) {
                diffs.push(StateDiff::DeviceExtra { name: name.clone() });
            }
        }

        diffs
    }

    /// Compile diffs into a converging plan.
    pub fn reconcile(desired: &DesiredHubState, diffs: &[StateDiff]) -> TransactionPlan {
        let mut steps = Vec::new();
        for diff in diffs {
            match diff {
                StateDiff::DeviceMissing { name, spec } => {
                    let mut sequence = vec![ActionSpec::Attach {
                        device: name.clone(),
                        blueprint: spec.blueprint.clone(),
                        config: spec.config.clone(),
                    }];
                    if spec.lifecycle == LifecycleState::Running {
                        sequence.push(ActionSpec::Start { device: name.clone() });
                    }
                    steps.push(ActionSpec::Sequence { steps: sequence });
                }
                StateDiff::DeviceExtra { name } => {
                    steps.push(ActionSpec::Detach { device: name.clone() });
                }
                StateDiff::BlueprintMismatch { name, .. }
                | StateDiff::MetaMismatch { name }
                | StateDiff::ChildBindingsChanged { name } => {
                    // conservative replace; persistent state survives only
                    // through an explicit hot swap outside the reconciler
                    let Some(spec) = desired.devices.get(name) else { continue };
                    let mut sequence = vec![
                        ActionSpec::Detach { device: name.clone() },
                        ActionSpec::Attach {
                            device: name.clone(),
                            blueprint: spec.blueprint.clone(),
                            config: spec.config.clone(),
                        },
                    ];
                    if spec.lifecycle == LifecycleState::Running {
                        sequence.push(ActionSpec::Start { device: name.clone() });
                    }
                    steps.push(ActionSpec::Sequence { steps: sequence });
                }
                StateDiff::LifecycleStateMismatch { name, expected, .. } => {
                    let step = match expected {
                        LifecycleState::Running => ActionSpec::Start { device: name.clone() },
                        _ => ActionSpec::Stop { device: name.clone() },
                    };
                    steps.push(step);
                }
            }
        }
        TransactionPlan::new(
            "reconcile",
            ActionSpec::Sequence { steps },
        )
    }
}
