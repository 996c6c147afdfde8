//! # Composite Device Control Plane
//!
//! A runtime for building, orchestrating and operating hierarchies of
//! managed control devices. Each device is produced from a declarative
//! blueprint fused with executable behavior, owns a reactive state graph
//! and a dual state machine (fixed lifecycle + optional operational), and
//! lives inside a hub that provides addressing, lease-based locking,
//! batch I/O, telemetry, persistence and desired-state reconciliation.
//!
//! ```text
//! client ──▶ DeviceHub ──▶ Device runtime ──▶ property / action logic
//!               │               │
//!               │               └─▶ DeviceMessage stream ─▶ broker / audit / telemetry
//!               └─▶ Reconciler + PlanExecutor (meta-controllers)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blueprint;
pub mod descriptor;
pub mod error;
pub mod fsm;
pub mod hub;
pub mod message;
pub mod meta;
pub mod persistence;
pub mod plan;
pub mod ports;
pub mod runtime;
pub mod state;
pub mod validation;

pub use blueprint::{
    BlueprintBuilder, BlueprintDeclaration, BlueprintHydrator, BlueprintId, DeviceApi,
    DeviceDriver, DeviceLogic, ExecutableDeviceBlueprint, Feature,
    InMemoryBehaviorRegistry, InMemoryBlueprintRegistry, Version,
};
pub use error::{DeviceError, FailureKind, HubResult, SerializableDeviceFailure};
pub use fsm::{FsmDescriptor, GuardSpec, LifecycleEvent, LifecycleState};
pub use hub::{
    DeviceFilter, DeviceHub, DeviceInfo, ExecutionContext, OperationResult, TelemetryFilter,
    TelemetryPacket,
};
pub use message::{DeviceHubEvent, DeviceMessage, TopicBroker};
pub use meta::{Address, Meta, Name, NameToken, Value};
pub use persistence::{Snapshot, StateMigrator, StateMigratorRegistry};
pub use plan::{ActionSpec, PlanExecutor, Reconciler, TransactionPlan};
pub use runtime::{Device, DeviceScope};
pub use state::{DeviceState, MutableDeviceState, Quality, StateValue};
