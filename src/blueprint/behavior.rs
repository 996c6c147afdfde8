//! Behavior facets and executable blueprints
//!
//! The non-serializable half of a device contract. A [`DeviceDriver`]
//! creates the device logic at attach time; [`BehaviorFacet`]s contribute
//! handlers, FSM callbacks, guard predicates and reactive logic keyed by
//! the blueprint id. The hydrator fuses declaration, driver and facets
//! into an [`ExecutableDeviceBlueprint`].

use super::declaration::BlueprintDeclaration;
use crate::error::DeviceError;
use crate::fsm::{LifecycleHooks, LifecycleState, OperationalCallbacks, StateCallback, WindowPredicate};
use crate::meta::{Address, Meta, Name};
use crate::runtime::scope::DeviceScope;
use crate::state::{DeviceState, PersistenceElements};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// What a handler may do with its device.
///
/// Handlers receive the runtime device through this trait, which keeps
/// behavior code decoupled from the runtime types.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Address of the device on its hub.
    fn address(&self) -> Address;

    /// Effective, layered configuration.
    fn meta(&self) -> Meta;

    /// Current lifecycle state.
    fn lifecycle_state(&self) -> LifecycleState;

    /// Read a property through its full read path.
    async fn read_property(&self, name: &Name) -> Result<Meta, DeviceError>;

    /// Write a property through its full write path (validation included).
    async fn write_property(&self, name: &Name, value: Meta) -> Result<(), DeviceError>;

    /// Directly publish a value into a property node, bypassing handlers.
    /// Used by physical drivers pushing hardware readings.
    fn update_property(&self, name: &Name, value: Meta) -> Result<(), DeviceError>;

    /// Reactive cell of a property, if the node exists.
    fn property_state(&self, name: &Name) -> Option<DeviceState<Meta>>;

    /// Post an event to the operational machine, if one runs.
    fn post_operational(&self, event: &str);
}

/// Async read handler of one property.
pub type PropertyReadHandler =
    Arc<dyn Fn(Arc<dyn DeviceApi>) -> BoxFuture<'static, Result<Meta, DeviceError>> + Send + Sync>;

/// Async write handler of one property.
pub type PropertyWriteHandler = Arc<
    dyn Fn(Arc<dyn DeviceApi>, Meta) -> BoxFuture<'static, Result<(), DeviceError>> + Send + Sync,
>;

/// Async action handler: input meta in, output meta out.
pub type ActionHandler = Arc<
    dyn Fn(Arc<dyn DeviceApi>, Meta) -> BoxFuture<'static, Result<Meta, DeviceError>> + Send + Sync,
>;

/// Async frame handler of one binary stream.
pub type SignalHandler = Arc<
    dyn Fn(Arc<dyn DeviceApi>, bytes::Bytes) -> BoxFuture<'static, Result<Option<bytes::Bytes>, DeviceError>>
        + Send
        + Sync,
>;

/// Long-running reactive closure executed in the device scope after
/// wiring.
pub type ReactiveLogic =
    Arc<dyn Fn(Arc<dyn DeviceApi>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Pure meta transformer backing custom child-property bindings.
pub type MetaTransformer = Arc<dyn Fn(&Meta) -> Meta + Send + Sync>;

/// Context handed to [`DeviceDriver::create`].
pub struct DriverContext {
    /// The device's structured scope.
    pub scope: DeviceScope,
    /// Registry the driver's stateful cells register into.
    pub persistence: Arc<PersistenceElements>,
    /// Effective, layered configuration.
    pub meta: Meta,
}

/// Everything a driver contributes to one device instance.
#[derive(Clone, Default)]
pub struct DeviceLogic {
    /// Lifecycle hooks.
    pub hooks: LifecycleHooks,
    /// Property read handlers keyed by property name text.
    pub property_reads: HashMap<String, PropertyReadHandler>,
    /// Property write handlers keyed by property name text.
    pub property_writes: HashMap<String, PropertyWriteHandler>,
    /// Action handlers keyed by action name text.
    pub actions: HashMap<String, ActionHandler>,
    /// Initial property values seeded into the state graph.
    pub initial_values: HashMap<String, Meta>,
}

impl DeviceLogic {
    /// Empty logic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the lifecycle hooks.
    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Install an action handler.
    pub fn with_action(mut self, name: impl Into<String>, handler: ActionHandler) -> Self {
        self.actions.insert(name.into(), handler);
        self
    }

    /// Install a property read handler.
    pub fn with_property_read(mut self, name: impl Into<String>, handler: PropertyReadHandler) -> Self {
        self.property_reads.insert(name.into(), handler);
        self
    }

    /// Install a property write handler.
    pub fn with_property_write(
        mut self,
        name: impl Into<String>,
        handler: PropertyWriteHandler,
    ) -> Self {
        self.property_writes.insert(name.into(), handler);
        self
    }

    /// Seed an initial property value.
    pub fn with_initial(mut self, name: impl Into<String>, value: Meta) -> Self {
        self.initial_values.insert(name.into(), value);
        self
    }
}

/// Factory for device logic; the executable blueprint's entry point.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Create the logic of one device instance.
    async fn create(&self, context: DriverContext) -> Result<DeviceLogic, DeviceError>;
}

/// One contribution registered against a blueprint id.
#[derive(Clone)]
pub enum BehaviorFacet {
    /// The mandatory driver.
    Driver(Arc<dyn DeviceDriver>),
    /// Extra property read handler.
    PropertyRead { name: Name, handler: PropertyReadHandler },
    /// Extra property write handler.
    PropertyWrite { name: Name, handler: PropertyWriteHandler },
    /// Extra action handler.
    Action { name: Name, handler: ActionHandler },
    /// Binary stream handler.
    Signal { name: Name, handler: SignalHandler },
    /// Operational on-entry callback.
    OperationalEntry { state: String, callback: StateCallback },
    /// Operational on-exit callback.
    OperationalExit { state: String, callback: StateCallback },
    /// Code half of a value-change guard.
    GuardPredicate { guard: String, predicate: WindowPredicate },
    /// Custom binding transformer.
    Transformer { key: String, transformer: MetaTransformer },
    /// Reactive logic closure.
    ReactiveLogic(ReactiveLogic),
}

/// Facets fused into their runtime shape.
#[derive(Clone, Default)]
pub struct FusedBehavior {
    /// Facet-contributed property read handlers.
    pub property_reads: HashMap<String, PropertyReadHandler>,
    /// Facet-contributed property write handlers.
    pub property_writes: HashMap<String, PropertyWriteHandler>,
    /// Facet-contributed action handlers.
    pub actions: HashMap<String, ActionHandler>,
    /// Stream handlers.
    pub signals: HashMap<String, SignalHandler>,
    /// Operational entry/exit callbacks.
    pub operational_callbacks: OperationalCallbacks,
    /// Window predicates keyed by guard name.
    pub guard_predicates: HashMap<String, WindowPredicate>,
    /// Custom binding transformers keyed by transformer key.
    pub transformers: HashMap<String, MetaTransformer>,
    /// Reactive logic, if contributed.
    pub reactive_logic: Option<ReactiveLogic>,
}

/// Declaration + driver + fused behavior. Not serializable.
#[derive(Clone)]
pub struct ExecutableDeviceBlueprint {
    /// The serializable contract.
    pub declaration: Arc<BlueprintDeclaration>,
    /// The device factory.
    pub driver: Arc<dyn DeviceDriver>,
    /// Fused facet contributions.
    pub behavior: FusedBehavior,
}

impl std::fmt::Debug for ExecutableDeviceBlueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableDeviceBlueprint")
            .field("declaration", &self.declaration)
            .finish_non_exhaustive()
    }
}

impl ExecutableDeviceBlueprint {
    /// Fuse a declaration with its facets. Exactly one driver facet is
    /// required.
    pub fn fuse(
        declaration: Arc<BlueprintDeclaration>,
        facets: Vec<BehaviorFacet>,
    ) -> Result<Self, DeviceError> {
        let mut driver: Option<Arc<dyn DeviceDriver>> = None;
        let mut behavior = FusedBehavior::default();
        for facet in facets {
            match facet {
                BehaviorFacet::Driver(d) => {
                    if driver.replace(d).is_some() {
                        return Err(DeviceError::Validation(format!(
                            "blueprint '{}' has more than one driver facet",
                            declaration.id
                        )));
                    }
                }
                BehaviorFacet::PropertyRead { name, handler } => {
                    behavior.property_reads.insert(name.to_string(), handler);
                }
                BehaviorFacet::PropertyWrite { name, handler } => {
                    behavior.property_writes.insert(name.to_string(), handler);
                }
                BehaviorFacet::Action { name, handler } => {
                    behavior.actions.insert(name.to_string(), handler);
                }
                BehaviorFacet::Signal { name, handler } => {
                    behavior.signals.insert(name.to_string(), handler);
                }
                BehaviorFacet::OperationalEntry { state, callback } => {
                    behavior.operational_callbacks.on_entry(state, callback);
                }
                BehaviorFacet::OperationalExit { state, callback } => {
                    behavior.operational_callbacks.on_exit(state, callback);
                }
                BehaviorFacet::GuardPredicate { guard, predicate } => {
                    behavior.guard_predicates.insert(guard, predicate);
                }
                BehaviorFacet::Transformer { key, transformer } => {
                    behavior.transformers.insert(key, transformer);
                }
                BehaviorFacet::ReactiveLogic(logic) => {
                    behavior.reactive_logic = Some(logic);
                }
            }
        }
        let driver = driver.ok_or_else(|| {
            DeviceError::not_found("driver facet for blueprint", &declaration.id)
        })?;
        Ok(Self {
            declaration,
            driver,
            behavior,
        })
    }
}
