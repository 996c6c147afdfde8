//! # Device Runtime
//!
//! A [`Device`] is one running instance produced from an executable
//! blueprint: the owner of a state-graph slice, a lifecycle machine, an
//! optional operational machine, a message stream and a structured scope.
//! The hub creates devices on attach and cancels their scope during
//! detach; everything the device spawned dies with it.

pub mod bindings;
pub mod scope;

pub use scope::DeviceScope;

use crate::blueprint::{
    BlueprintDeclaration, DeviceApi, DeviceLogic, DriverContext, ExecutableDeviceBlueprint,
};
use crate::descriptor::{PropertyDescriptor, PropertyKind};
use crate::error::DeviceError;
use crate::fsm::{
    spawn_timed_predicate_guard, spawn_value_change_guard, GuardSpec, LifecycleEvent, LifecycleFsm,
    LifecycleState, OperationalFsm,
};
use crate::message::DeviceMessage;
use crate::meta::{Address, Meta, MetaConverter, Name, Value};
use crate::state::{DeviceState, MutableDeviceState, PersistenceElements, Quality, StateValue};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// One node of the device's property graph.
struct PropertyNode {
    descriptor: PropertyDescriptor,
    cell: MutableDeviceState<Meta>,
}

struct DeviceInner {
    address: Address,
    blueprint: Arc<ExecutableDeviceBlueprint>,
    meta: Meta,
    scope: DeviceScope,
    lifecycle: LifecycleFsm,
    operational: Option<OperationalFsm>,
    nodes: RwLock<HashMap<String, Arc<PropertyNode>>>,
    persistence: Arc<PersistenceElements>,
    logic: DeviceLogic,
    messages: broadcast::Sender<DeviceMessage>,
}

/// A running device instance. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create a device: run the driver, wire the state graph, spawn both
    /// machines, install guards and launch the reactive logic.
    ///
    /// The lifecycle machine starts in `Detached`; the hub posts `Attach`
    /// once the instance is registered.
    pub async fn create(
        address: Address,
        blueprint: Arc<ExecutableDeviceBlueprint>,
        config: Meta,
        parent_scope: &DeviceScope,
    ) -> Result<Device, DeviceError> {
        let scope = parent_scope.child();
        let meta = config.layered_on(&blueprint.declaration.default_meta);
        let persistence = Arc::new(PersistenceElements::new());

        let logic = blueprint
            .driver
            .create(DriverContext {
                scope: scope.clone(),
                persistence: persistence.clone(),
                meta: meta.clone(),
            })
            .await?;

        let (messages, _) = broadcast::channel(256);

        // state-graph slice: one meta-valued cell per property
        let mut nodes = HashMap::new();
        for descriptor in blueprint.declaration.all_properties() {
            let key = descriptor.name.to_string();
            let initial = logic
                .initial_values
                .get(&key)
                .cloned()
                .or_else(|| meta.get(&descriptor.name).cloned().filter(|m| !m.is_empty()));
            let cell = MutableDeviceState::new(initial);
            let node = Arc::new(PropertyNode {
                descriptor: descriptor.clone(),
                cell,
            });

            // persistent properties without a driver-registered delegate
            // snapshot through their node cell
            if descriptor.persistent && !persistence.find(&descriptor.name) {
                register_node_element(&persistence, &descriptor.name, &node);
            }

            // predicate flips are narrated on the message stream
            if descriptor.kind == PropertyKind::Predicate {
                watch_predicate(&scope, &address, &node, messages.clone());
            }

            nodes.insert(key, node);
        }

        let lifecycle = {
            let source = address.clone();
            let tx = messages.clone();
            LifecycleFsm::spawn(
                &scope,
                address.device.clone(),
                logic.hooks.clone(),
                Some(Arc::new(move |from, to| {
                    let _ = tx.send(DeviceMessage::LifecycleStateChanged {
                        source: source.clone(),
                        from,
                        to,
                        timestamp: Utc::now(),
                    });
                })),
            )
        };

        let operational = blueprint.declaration.operational_fsm.as_ref().map(|descriptor| {
            OperationalFsm::spawn(
                &scope,
                address.device.clone(),
                descriptor.clone(),
                blueprint.behavior.operational_callbacks.clone(),
            )
        });

        let device = Device {
            inner: Arc::new(DeviceInner {
                address,
                blueprint,
                meta,
                scope,
                lifecycle,
                operational,
                nodes: RwLock::new(nodes),
                persistence,
                logic,
                messages,
            }),
        };

        device.install_guards();

        if let Some(reactive) = &device.inner.blueprint.behavior.reactive_logic {
            let api: Arc<dyn DeviceApi> = Arc::new(device.clone());
            let fut = reactive(api);
            device.inner.scope.spawn(fut);
        }

        Ok(device)
    }

    fn install_guards(&self) {
        for guard in self.inner.blueprint.declaration.guards() {
            let Some(fsm) = self.inner.operational.clone() else {
                tracing::warn!(guard = guard.name(), "guard declared without operational machine");
                return;
            };
            match guard {
                GuardSpec::TimedPredicate {
                    predicate,
                    duration,
                    post_event,
                    from_states,
                    ..
                } => {
                    let Some(cell) = self.property_cell(predicate) else {
                        tracing::warn!(property = %predicate, "guard target missing; guard skipped");
                        continue;
                    };
                    let as_bool = DeviceState::map(&self.inner.scope, &cell.state(), |m: &Meta| {
                        m.value().and_then(Value::as_bool).unwrap_or(false)
                    });
                    spawn_timed_predicate_guard(
                        &self.inner.scope,
                        as_bool,
                        *duration,
                        post_event.clone(),
                        from_states.clone(),
                        fsm,
                    );
                }
                GuardSpec::ValueChange {
                    name,
                    property,
                    window,
                    post_event,
                } => {
                    let Some(cell) = self.property_cell(property) else {
                        tracing::warn!(property = %property, "guard target missing; guard skipped");
                        continue;
                    };
                    let Some(predicate) =
                        self.inner.blueprint.behavior.guard_predicates.get(name).cloned()
                    else {
                        tracing::warn!(guard = %name, "window predicate not registered; guard skipped");
                        continue;
                    };
                    spawn_value_change_guard(
                        &self.inner.scope,
                        cell.state(),
                        *window,
                        predicate,
                        post_event.clone(),
                        fsm,
                    );
                }
            }
        }
    }

    /// Reactive cell of a property, if the node exists.
    pub fn property_state_of(&self, name: &Name) -> Option<DeviceState<Meta>> {
        self.property_cell(name).map(|cell| cell.state())
    }

    fn property_cell(&self, name: &Name) -> Option<MutableDeviceState<Meta>> {
        self.inner
            .nodes
            .read()
            .expect("node lock poisoned")
            .get(&name.to_string())
            .map(|node| node.cell.clone())
    }

    fn node(&self, name: &Name) -> Result<Arc<PropertyNode>, DeviceError> {
        self.inner
            .nodes
            .read()
            .expect("node lock poisoned")
            .get(&name.to_string())
            .cloned()
            .ok_or_else(|| DeviceError::not_found("property", name))
    }

    fn emit(&self, message: DeviceMessage) {
        let _ = self.inner.messages.send(message);
    }

    /// The hub-facing address of this device.
    pub fn device_address(&self) -> &Address {
        &self.inner.address
    }

    /// The blueprint this device was built from.
    pub fn blueprint(&self) -> &Arc<ExecutableDeviceBlueprint> {
        &self.inner.blueprint
    }

    /// Declaration shortcut.
    pub fn declaration(&self) -> &BlueprintDeclaration {
        &self.inner.blueprint.declaration
    }

    /// Effective, layered configuration.
    pub fn effective_meta(&self) -> &Meta {
        &self.inner.meta
    }

    /// The device's scope.
    pub fn scope(&self) -> &DeviceScope {
        &self.inner.scope
    }

    /// The lifecycle machine handle.
    pub fn lifecycle(&self) -> &LifecycleFsm {
        &self.inner.lifecycle
    }

    /// The operational machine handle, if declared.
    pub fn operational(&self) -> Option<&OperationalFsm> {
        self.inner.operational.as_ref()
    }

    /// Persistence elements of this device.
    pub fn persistence(&self) -> &Arc<PersistenceElements> {
        &self.inner.persistence
    }

    /// Subscribe to this device's messages.
    pub fn messages(&self) -> broadcast::Receiver<DeviceMessage> {
        self.inner.messages.subscribe()
    }

    /// Current reading of a property, with quality and timestamp.
    pub async fn read_state(&self, name: &Name) -> Result<StateValue<Meta>, DeviceError> {
        let node = self.node(name)?;
        if !node.descriptor.readable {
            return Err(DeviceError::Validation(format!(
                "property '{name}' is not readable"
            )));
        }
        self.require_lifecycle(
            "readProperty",
            &[LifecycleState::Stopped, LifecycleState::Running],
        )?;

        let handler = self
            .inner
            .logic
            .property_reads
            .get(&name.to_string())
            .or_else(|| self.inner.blueprint.behavior.property_reads.get(&name.to_string()))
            .cloned();
        if let Some(handler) = handler {
            let api: Arc<dyn DeviceApi> = Arc::new(self.clone());
            let fresh = handler(api).await?;
            node.cell.update(fresh.clone());
            return Ok(node.cell.current());
        }
        Ok(node.cell.current())
    }

    /// Write a property through validation, handler and message emission.
    pub async fn write(&self, name: &Name, value: Meta) -> Result<(), DeviceError> {
        let node = self.node(name)?;
        if !node.descriptor.mutable {
            return Err(DeviceError::Validation(format!(
                "property '{name}' is not mutable"
            )));
        }
        self.require_lifecycle("writeProperty", &[LifecycleState::Running])?;

        if let Some(scalar) = value.value() {
            node.descriptor
                .validate_value(scalar)
                .map_err(DeviceError::Validation)?;
        }

        let handler = self
            .inner
            .logic
            .property_writes
            .get(&name.to_string())
            .or_else(|| self.inner.blueprint.behavior.property_writes.get(&name.to_string()))
            .cloned();
        match handler {
            Some(handler) => {
                let api: Arc<dyn DeviceApi> = Arc::new(self.clone());
                handler(api, value.clone()).await?;
                node.cell.update(value.clone());
            }
            None => node.cell.update(value.clone()),
        }

        let reading = node.cell.current();
        self.emit(DeviceMessage::PropertyChanged {
            source: self.inner.address.clone(),
            property: name.clone(),
            value,
            quality: reading.quality,
            timestamp: reading.timestamp,
        });
        Ok(())
    }

    /// Execute an action: predicates, operational hooks, timeout and
    /// deadline. Authorization and locks are enforced by the hub before
    /// this is reached.
    pub async fn execute(&self, name: &Name, input: Meta) -> Result<Meta, DeviceError> {
        let descriptor = self
            .declaration()
            .action(name)
            .cloned()
            .ok_or_else(|| DeviceError::not_found("action", name))?;
        self.require_lifecycle("execute", &[LifecycleState::Running])?;

        if descriptor.task_ref.is_some() {
            return Err(DeviceError::Validation(format!(
                "action '{name}' is task-backed; route it through its executor capability"
            )));
        }

        for predicate in &descriptor.required_predicates {
            let reading = self.node(predicate)?.cell.current();
            let holds = reading
                .value
                .as_ref()
                .and_then(|m| m.value())
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !holds {
                return Err(DeviceError::Validation(format!(
                    "action '{name}' requires predicate '{predicate}' to hold"
                )));
            }
        }

        let handler = self
            .inner
            .logic
            .actions
            .get(&name.to_string())
            .or_else(|| self.inner.blueprint.behavior.actions.get(&name.to_string()))
            .cloned()
            .ok_or_else(|| DeviceError::not_found("action handler", name))?;

        if let (Some(fsm), Some(event)) = (self.operational(), &descriptor.triggers) {
            fsm.post(event.clone());
        }

        let api: Arc<dyn DeviceApi> = Arc::new(self.clone());
        let body = handler(api, input);
        let limit = effective_limit(descriptor.default_timeout, descriptor.execution_deadline);
        let outcome = match limit {
            Some((after, hard)) => match tokio::time::timeout(after, body).await {
                Ok(result) => result,
                Err(_) => Err(DeviceError::Timeout { after, hard }),
            },
            None => body.await,
        };

        match outcome {
            Ok(result) => {
                if let (Some(fsm), Some(event)) = (self.operational(), &descriptor.triggers_on_success)
                {
                    fsm.post(event.clone());
                }
                Ok(result)
            }
            Err(err) => {
                if let (Some(fsm), Some(event)) = (self.operational(), &descriptor.triggers_on_failure)
                {
                    fsm.post(event.clone());
                }
                let failure =
                    crate::error::SerializableDeviceFailure::new(err.kind(), err.to_string());
                self.emit(DeviceMessage::DeviceError {
                    source: self.inner.address.clone(),
                    failure,
                    timestamp: Utc::now(),
                });
                Err(err)
            }
        }
    }

    /// Feed one frame into a binary stream. The stream's signal handler
    /// may produce a response frame; outbound streams additionally
    /// narrate readiness on the message stream.
    pub async fn handle_frame(
        &self,
        stream: &Name,
        frame: bytes::Bytes,
    ) -> Result<Option<bytes::Bytes>, DeviceError> {
        let descriptor = self
            .declaration()
            .streams
            .get(&stream.to_string())
            .cloned()
            .ok_or_else(|| DeviceError::not_found("stream", stream))?;
        let handler = self
            .inner
            .blueprint
            .behavior
            .signals
            .get(&stream.to_string())
            .cloned()
            .ok_or_else(|| DeviceError::not_found("stream handler", stream))?;
        let api: Arc<dyn DeviceApi> = Arc::new(self.clone());
        let response = handler(api, frame).await?;
        if let (crate::descriptor::StreamDirection::Out | crate::descriptor::StreamDirection::Bidirectional, Some(out)) =
            (descriptor.direction, &response)
        {
            self.emit(DeviceMessage::BinaryReadyNotification {
                source: self.inner.address.clone(),
                stream: stream.clone(),
                size_bytes: out.len() as u64,
                timestamp: Utc::now(),
            });
        }
        Ok(response)
    }

    /// Post `Fail` into the lifecycle machine and narrate the failure.
    pub fn fail(&self, failure: crate::error::SerializableDeviceFailure) {
        self.emit(DeviceMessage::DeviceError {
            source: self.inner.address.clone(),
            failure: failure.clone(),
            timestamp: Utc::now(),
        });
        self.inner.lifecycle.post(LifecycleEvent::Fail(failure));
    }

    /// Cancel the device's scope. Called by the hub once detach completed.
    pub fn shutdown(&self) {
        self.inner.scope.cancel();
    }

    /// Typed read through a converter.
    pub async fn read_as<T>(
        &self,
        name: &Name,
        converter: &dyn MetaConverter<T>,
    ) -> Result<T, DeviceError> {
        let reading = self.read_state(name).await?;
        let meta = reading
            .value
            .ok_or_else(|| DeviceError::not_found("property value", name))?;
        Ok(converter.from_meta(&meta)?)
    }

    fn require_lifecycle(
        &self,
        operation: &str,
        allowed: &[LifecycleState],
    ) -> Result<(), DeviceError> {
        let current = self.inner.lifecycle.current();
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(DeviceError::lifecycle(operation, current))
        }
    }
}

#[async_trait]
impl DeviceApi for Device {
    fn address(&self) -> Address {
        self.inner.address.clone()
    }

    fn meta(&self) -> Meta {
        self.inner.meta.clone()
    }

    fn lifecycle_state(&self) -> LifecycleState {
        self.inner.lifecycle.current()
    }

    async fn read_property(&self, name: &Name) -> Result<Meta, DeviceError> {
        let reading = self.read_state(name).await?;
        Ok(reading.value.unwrap_or_default())
    }

    async fn write_property(&self, name: &Name, value: Meta) -> Result<(), DeviceError> {
        self.write(name, value).await
    }

    fn update_property(&self, name: &Name, value: Meta) -> Result<(), DeviceError> {
        let node = self.node(name)?;
        node.cell.update(value.clone());
        self.emit(DeviceMessage::PropertyChanged {
            source: self.inner.address.clone(),
            property: name.clone(),
            value,
            quality: Quality::Ok,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn property_state(&self, name: &Name) -> Option<DeviceState<Meta>> {
        self.property_cell(name).map(|cell| cell.state())
    }

    fn post_operational(&self, event: &str) {
        if let Some(fsm) = &self.inner.operational {
            fsm.post(event);
        }
    }
}

fn effective_limit(
    soft: Option<Duration>,
    hard: Option<Duration>,
) -> Option<(Duration, bool)> {
    match (soft, hard) {
        (Some(s), Some(h)) if h <= s => Some((h, true)),
        (Some(s), _) => Some((s, false)),
        (None, Some(h)) => Some((h, true)),
        (None, None) => None,
    }
}

fn register_node_element(
    persistence: &Arc<PersistenceElements>,
    name: &Name,
    node: &Arc<PropertyNode>,
) {
    let read_node = node.clone();
    let write_node = node.clone();
    persistence.register_raw(
        name.clone(),
        Arc::new(move || read_node.cell.current().value.unwrap_or_default()),
        Arc::new(move |meta: &Meta| {
            write_node.cell.update(meta.clone());
            Ok(())
        }),
    );
}

fn watch_predicate(
    scope: &DeviceScope,
    address: &Address,
    node: &Arc<PropertyNode>,
    messages: broadcast::Sender<DeviceMessage>,
) {
    let mut readings = node.cell.state().subscribe();
    let source = address.clone();
    let predicate = node.descriptor.name.clone();
    scope.spawn(async move {
        let mut last: Option<bool> = None;
        while readings.changed().await.is_ok() {
            let reading = readings.borrow().clone();
            let Some(value) = reading.value.as_ref().and_then(|m| m.value()).and_then(Value::as_bool)
            else {
                continue;
            };
            if last != Some(value) {
                last = Some(value);
                let _ = messages.send(DeviceMessage::PredicateChanged {
                    source: source.clone(),
                    predicate: predicate.clone(),
                    value,
                    timestamp: reading.timestamp,
                });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{
        ActionHandler, BehaviorFacet, BlueprintBuilder, DeviceDriver, ExecutableDeviceBlueprint,
        SignalHandler,
    };
    use crate::descriptor::{ActionDescriptor, PropertyDescriptor, StreamDescriptor, StreamDirection};
    use crate::fsm::LifecycleEvent;

    struct TestDriver;

    #[async_trait]
    impl DeviceDriver for TestDriver {
        async fn create(&self, _context: DriverContext) -> Result<DeviceLogic, DeviceError> {
            let slow: ActionHandler = Arc::new(|_api, _input| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(Meta::of("late"))
                })
            });
            Ok(DeviceLogic::new()
                .with_initial("position", Meta::of(0.0))
                .with_initial("armed", Meta::of(false))
                .with_action(
                    "fire",
                    Arc::new(|_api, _input| Box::pin(async { Ok(Meta::of("fired")) })),
                )
                .with_action("slowScan", slow))
        }
    }

    fn blueprint() -> Arc<ExecutableDeviceBlueprint> {
        let declaration = BlueprintBuilder::new("test.device", "1.0.0")
            .contract("test.Device")
            .property(
                PropertyDescriptor::new("position", PropertyKind::Logical, "double")
                    .mutable()
                    .with_range(-1.0, 1.0),
            )
            .property(PropertyDescriptor::new("armed", PropertyKind::Predicate, "bool").mutable())
            .action(ActionDescriptor::new("fire").requires_predicate("armed"))
            .action(
                ActionDescriptor::new("slowScan").with_timeout(Duration::from_millis(50)),
            )
            .stream(StreamDescriptor::new("frames", StreamDirection::Out))
            .build()
            .unwrap();
        let echo: SignalHandler = Arc::new(|_api, frame| Box::pin(async move { Ok(Some(frame)) }));
        Arc::new(
            ExecutableDeviceBlueprint::fuse(
                Arc::new(declaration),
                vec![
                    BehaviorFacet::Driver(Arc::new(TestDriver)),
                    BehaviorFacet::Signal {
                        name: "frames".into(),
                        handler: echo,
                    },
                ],
            )
            .unwrap(),
        )
    }

    async fn running_device(scope: &DeviceScope) -> Device {
        let device = Device::create(
            "hub::dev".parse().unwrap(),
            blueprint(),
            Meta::new(),
            scope,
        )
        .await
        .unwrap();
        device.lifecycle().post(LifecycleEvent::Attach);
        device
            .lifecycle()
            .await_state(&[LifecycleState::Stopped], Duration::from_secs(1))
            .await
            .unwrap();
        device.lifecycle().post(LifecycleEvent::Start);
        device
            .lifecycle()
            .await_state(&[LifecycleState::Running], Duration::from_secs(1))
            .await
            .unwrap();
        device
    }

    #[tokio::test]
    async fn test_write_validates_and_emits() {
        let scope = DeviceScope::new();
        let device = running_device(&scope).await;
        let mut messages = device.messages();

        device.write(&"position".into(), Meta::of(0.5)).await.unwrap();
        let err = device.write(&"position".into(), Meta::of(2.0)).await.unwrap_err();
        assert!(matches!(err, DeviceError::Validation(_)));

        let message = messages.recv().await.unwrap();
        assert!(matches!(message, DeviceMessage::LifecycleStateChanged { .. })
            || matches!(message, DeviceMessage::PropertyChanged { .. }));
        scope.cancel();
    }

    #[tokio::test]
    async fn test_write_rejected_before_start() {
        let scope = DeviceScope::new();
        let device = Device::create(
            "hub::dev".parse().unwrap(),
            blueprint(),
            Meta::new(),
            &scope,
        )
        .await
        .unwrap();
        let err = device.write(&"position".into(), Meta::of(0.1)).await.unwrap_err();
        assert!(matches!(err, DeviceError::Lifecycle { .. }));
        scope.cancel();
    }

    #[tokio::test]
    async fn test_action_predicate_gate() {
        let scope = DeviceScope::new();
        let device = running_device(&scope).await;

        let err = device.execute(&"fire".into(), Meta::new()).await.unwrap_err();
        assert!(matches!(err, DeviceError::Validation(_)));

        device.update_property(&"armed".into(), Meta::of(true)).unwrap();
        let result = device.execute(&"fire".into(), Meta::new()).await.unwrap();
        assert_eq!(result, Meta::of("fired"));
        scope.cancel();
    }

    #[tokio::test]
    async fn test_action_soft_timeout() {
        let scope = DeviceScope::new();
        let device = running_device(&scope).await;
        let err = device.execute(&"slowScan".into(), Meta::new()).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { hard: false, .. }));
        scope.cancel();
    }

    #[tokio::test]
    async fn test_predicate_change_is_narrated() {
        let scope = DeviceScope::new();
        let device = running_device(&scope).await;
        let mut messages = device.messages();
        device.update_property(&"armed".into(), Meta::of(true)).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let message = tokio::time::timeout_at(deadline, messages.recv())
                .await
                .expect("predicate message not seen")
                .unwrap();
            if let DeviceMessage::PredicateChanged { predicate, value, .. } = message {
                assert_eq!(predicate, "armed".into());
                assert!(value);
                break;
            }
        }
        scope.cancel();
    }

    #[tokio::test]
    async fn test_stream_frame_round_trip() {
        let scope = DeviceScope::new();
        let device = running_device(&scope).await;
        let frame = bytes::Bytes::from_static(b"scanline");
        let response = device.handle_frame(&"frames".into(), frame.clone()).await.unwrap();
        assert_eq!(response, Some(frame));

        let err = device
            .handle_frame(&"missing".into(), bytes::Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotFound { .. }));
        scope.cancel();
    }
}
