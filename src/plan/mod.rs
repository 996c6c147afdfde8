//! # Transaction Plans
//!
//! A [`TransactionPlan`] is a serializable tree of typed steps executed
//! against a hub by the [`executor::PlanExecutor`]. Plans are produced by
//! hand, by task actions, or by the [`reconciler::Reconciler`] from a
//! desired-state diff. String values inside step metas may carry
//! `${...}` references hydrated lazily at execution time ([`refs`]).

pub mod executor;
pub mod reconciler;
pub mod refs;

pub use executor::{PlanExecutor, PlanExecutionContext};
pub use reconciler::{
    ActualDeviceState, ActualHubState, DesiredDeviceSpec, DesiredHubState, Reconciler, StateDiff,
};
pub use refs::ReferenceResolver;

use crate::blueprint::BlueprintId;
use crate::meta::{Address, Meta, Name};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One typed step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActionSpec {
    /// Attach a device on the executing hub.
    Attach {
        device: Name,
        blueprint: BlueprintId,
        #[serde(default)]
        config: Meta,
    },
    /// Detach a device.
    Detach { device: Name },
    /// Start a device.
    Start { device: Name },
    /// Stop a device.
    Stop { device: Name },
    /// Write a property value.
    WriteProperty {
        address: Address,
        property: Name,
        value: Meta,
    },
    /// Invoke an action; the result lands in the context under
    /// `result_key` when given.
    Invoke {
        address: Address,
        action: Name,
        #[serde(default)]
        input: Meta,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result_key: Option<String>,
    },
    /// Run steps strictly in order; the first failure stops the rest.
    Sequence { steps: Vec<ActionSpec> },
    /// Run steps concurrently; wait for all, collect every failure.
    Parallel { steps: Vec<ActionSpec> },
    /// Sleep.
    Delay { duration: Duration },
    /// Wait until a boolean predicate property reads true, or time out.
    AwaitPredicate {
        address: Address,
        predicate: Name,
        timeout: Duration,
    },
    /// Wait for an interactive signal.
    AwaitSignal { id: String, prompt: String },
    /// Branch on a predicate property.
    Conditional {
        address: Address,
        predicate: Name,
        then: Box<ActionSpec>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        otherwise: Option<Box<ActionSpec>>,
    },
    /// Iterate a collection reference, binding each element to `var`.
    Loop {
        collection: String,
        var: String,
        body: Box<ActionSpec>,
    },
    /// Run a workspace task; the result lands in the context under
    /// `result_key` when given.
    RunWorkspaceTask {
        task_id: String,
        #[serde(default)]
        input: Meta,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result_key: Option<String>,
    },
}

/// A whole plan: a named root step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPlan {
    /// Plan label used in logs and audit records.
    pub name: String,
    /// Root step.
    pub root: ActionSpec,
}

impl TransactionPlan {
    /// Wrap a root step.
    pub fn new(name: impl Into<String>, root: ActionSpec) -> Self {
        Self {
            name: name.into(),
            root,
        }
    }
}
