//! # State Graph
//!
//! Reactive network of device state cells. Each `Physical` or `Logical`
//! property becomes a node; `Derived` properties are combine nodes over
//! their inputs. See [`graph`] for cell construction and [`value`] for
//! the reading type.

pub mod graph;
pub mod value;

pub use graph::{
    combine2, combine3, combine4, combine5, reduce, stateful, virtual_state, DeviceState,
    LateBoundState, MutableDeviceState, PersistenceElements, StatefulElement,
};
pub use value::{combine_meta, Quality, StateValue};
