//! # Blueprint Model
//!
//! A blueprint is the declarative contract of a device family: its
//! descriptors, features, children and peers ([`declaration`]), plus the
//! executable half (driver and behavior facets) fused in by the
//! [`registry::BlueprintHydrator`]. Declarations are built through the
//! [`builder::BlueprintBuilder`], which validates on `build()`.

pub mod behavior;
pub mod builder;
pub mod declaration;
pub mod features;
pub mod registry;

pub use behavior::{
    ActionHandler, BehaviorFacet, DeviceApi, DeviceDriver, DeviceLogic, DriverContext,
    ExecutableDeviceBlueprint, FusedBehavior, MetaTransformer, PropertyReadHandler,
    PropertyWriteHandler, ReactiveLogic, SignalHandler,
};
pub use builder::{BlueprintBuilder, BuildError};
pub use declaration::{
    BlueprintDeclaration, BlueprintId, ChildConfig, ChildLifecycleOverrides,
    ChildPropertyBinding, PeerConnectionConfig, QoS, TransformerDescriptor, Version,
};
pub use features::Feature;
pub use registry::{
    BlueprintBehaviorRegistry, BlueprintHydrator, BlueprintProvider, BlueprintRegistry,
    InMemoryBehaviorRegistry, InMemoryBlueprintRegistry,
};
