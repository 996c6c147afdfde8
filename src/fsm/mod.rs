//! # Dual-FSM Engine
//!
//! Every device runs the fixed [`lifecycle`] machine; devices that
//! declare business states additionally run a user-defined
//! [`operational`] machine. Both are table-driven interpreters fed from
//! FIFO mailboxes, so no two transitions of one machine ever overlap.
//! [`guards`] bridge the state graph into the operational machine.

pub mod guards;
pub mod lifecycle;
pub mod operational;

pub use guards::{spawn_timed_predicate_guard, spawn_value_change_guard, GuardSpec, WindowPredicate};
pub use lifecycle::{
    LifecycleEvent, LifecycleFsm, LifecycleHook, LifecycleHooks, LifecycleState, TransitionObserver,
};
pub use operational::{
    FsmDescriptor, OperationalCallbacks, OperationalFsm, StateCallback, StateTimer, TransitionRule,
};
