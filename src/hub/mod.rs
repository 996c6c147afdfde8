//! # Hub Control Plane
//!
//! A [`DeviceHub`] owns a collection of devices and fronts every
//! control-plane operation: transactional attach/detach/start/stop,
//! hot-swap with schema migration, lease-based locking, single and batch
//! property I/O, action execution, telemetry, aliases and discovery
//! queries. Every call takes an [`ExecutionContext`] and is authorized
//! through the configured [`AuthorizationService`]; the default denies
//! everything. Failures cross the boundary as
//! [`SerializableDeviceFailure`]s.

pub mod locks;
pub mod telemetry;

pub use locks::{LockTable, LockToken};
pub use telemetry::{spawn_telemetry_forwarder, TelemetryFilter, TelemetryPacket};

use crate::blueprint::{BlueprintId, BlueprintProvider, ChildConfig};
use crate::descriptor::LockMode;
use crate::error::{DeviceError, HubResult, SerializableDeviceFailure};
use crate::fsm::{LifecycleEvent, LifecycleState};
use crate::message::{DeviceHubEvent, DeviceMessage, TopicBroker, TopicSubscription};
use crate::meta::{Address, Meta, Name, NameToken, ObservableMeta};
use crate::persistence::{Snapshot, StateMigratorRegistry, StatePersistenceService};
use crate::ports::{AuditLogService, AuditRecord, AuthorizationService, DenyAllAuthorization,
    InMemoryAuditLog};
use crate::runtime::{bindings, Device, DeviceScope};
use crate::state::Quality;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

const PHASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller identity and ambient call state.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Acting principal.
    pub principal: String,
    /// Correlates every event caused by this call.
    pub correlation_id: Uuid,
    /// Lease tokens the caller holds.
    pub locks: Vec<LockToken>,
}

impl ExecutionContext {
    /// Context for a named principal.
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            correlation_id: Uuid::new_v4(),
            locks: Vec::new(),
        }
    }

    /// Context for in-process system work.
    pub fn system() -> Self {
        Self::new("system")
    }

    /// Attach a held lease token.
    pub fn with_lock(mut self, token: LockToken) -> Self {
        self.locks.push(token);
        self
    }
}

/// Per-item outcome of a batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OperationResult<T> {
    /// The item succeeded.
    Success { value: T, quality: Quality },
    /// The item failed; the batch keeps going.
    Failure { failure: SerializableDeviceFailure },
}

/// Filter for [`DeviceHub::query_devices`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Name pattern (`*`/trailing `**`).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pattern: Option<Name>,
    /// Required capability name.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub capability: Option<String>,
}

/// Summary row returned by device queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Hub-local device name.
    pub name: Name,
    /// Blueprint id.
    pub blueprint: BlueprintId,
    /// Blueprint version text.
    pub version: String,
    /// Current lifecycle state.
    pub lifecycle: LifecycleState,
}

struct HubInner {
    id: Name,
    scope: DeviceScope,
    devices: RwLock<HashMap<Name, Device>>,
    aliases: RwLock<HashMap<Name, Name>>,
    remotes: RwLock<HashMap<Name, DeviceHub>>,
    events: broadcast::Sender<DeviceHubEvent>,
    broker: TopicBroker,
    locks: LockTable,
    provider: Arc<dyn BlueprintProvider>,
    authz: Arc<dyn AuthorizationService>,
    audit: Arc<dyn AuditLogService>,
    migrators: Arc<StateMigratorRegistry>,
    data: ObservableMeta,
}

/// Builder for a [`DeviceHub`].
pub struct DeviceHubBuilder {
    id: Name,
    provider: Option<Arc<dyn BlueprintProvider>>,
    authz: Arc<dyn AuthorizationService>,
    audit: Arc<dyn AuditLogService>,
    migrators: Arc<StateMigratorRegistry>,
}

impl DeviceHubBuilder {
    /// Start building a hub with the fail-closed defaults.
    pub fn new(id: impl Into<Name>) -> Self {
        Self {
            id: id.into(),
            provider: None,
            authz: Arc::new(DenyAllAuthorization),
            audit: Arc::new(InMemoryAuditLog::new()),
            migrators: Arc::new(StateMigratorRegistry::new()),
        }
    }

    /// Set the blueprint provider (required).
    pub fn provider(mut self, provider: Arc<dyn BlueprintProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Replace the authorization service.
    pub fn authorization(mut self, authz: Arc<dyn AuthorizationService>) -> Self {
        self.authz = authz;
        self
    }

    /// Replace the audit log.
    pub fn audit(mut self, audit: Arc<dyn AuditLogService>) -> Self {
        self.audit = audit;
        self
    }

    /// Set the migrator registry used by hot-swap restores.
    pub fn migrators(mut self, migrators: Arc<StateMigratorRegistry>) -> Self {
        self.migrators = migrators;
        self
    }

    /// Build the hub.
    pub fn build(self) -> Result<DeviceHub, DeviceError> {
        let provider = self
            .provider
            .ok_or_else(|| DeviceError::Validation("hub needs a blueprint provider".into()))?;
        let (events, _) = broadcast::channel(1024);
        Ok(DeviceHub {
            inner: Arc::new(HubInner {
                id: self.id,
                scope: DeviceScope::new(),
                devices: RwLock::new(HashMap::new()),
                aliases: RwLock::new(HashMap::new()),
                remotes: RwLock::new(HashMap::new()),
                events,
                broker: TopicBroker::new(),
                locks: LockTable::new(),
                provider,
                authz: self.authz,
                audit: self.audit,
                migrators: self.migrators,
                data: ObservableMeta::new(Meta::new()),
            }),
        })
    }
}

/// The control plane over one collection of devices.
#[derive(Clone)]
pub struct DeviceHub {
    inner: Arc<HubInner>,
}

impl DeviceHub {
    /// Start building a hub.
    pub fn builder(id: impl Into<Name>) -> DeviceHubBuilder {
        DeviceHubBuilder::new(id)
    }

    /// Route of this hub.
    pub fn id(&self) -> &Name {
        &self.inner.id
    }

    /// Hot stream of hub events.
    pub fn events(&self) -> broadcast::Receiver<DeviceHubEvent> {
        self.inner.events.subscribe()
    }

    /// Observable tree of current property values.
    pub fn data(&self) -> ObservableMeta {
        self.inner.data.clone()
    }

    /// Subscribe to the topic broker.
    pub fn subscribe_topics(&self, pattern: Name, buffer: usize) -> TopicSubscription {
        self.inner.broker.subscribe(pattern, buffer)
    }

    /// Subscribe to filtered telemetry.
    pub async fn subscribe_telemetry(
        &self,
        ctx: &ExecutionContext,
        filter: TelemetryFilter,
    ) -> HubResult<tokio::sync::mpsc::Receiver<TelemetryPacket>> {
        self.authorize(ctx, "hub.telemetry").await?;
        Ok(spawn_telemetry_forwarder(
            &self.inner.scope,
            self.inner.events.subscribe(),
            filter,
        ))
    }

    /// Register a peer hub reachable by route.
    pub async fn register_remote(&self, hub: DeviceHub) {
        self.inner
            .remotes
            .write()
            .await
            .insert(hub.id().clone(), hub);
    }

    /// Shut down the hub and every device scope under it.
    pub fn shutdown(&self) {
        self.inner.scope.cancel();
    }

    // ========================================================================
    // Attach / detach / start / stop
    // ========================================================================

    /// Attach a device. Transactional: on failure nothing remains
    /// attached, children included.
    pub async fn attach(
        &self,
        ctx: &ExecutionContext,
        name: impl Into<Name>,
        blueprint: impl Into<BlueprintId>,
        config: Meta,
    ) -> HubResult<()> {
        let name = name.into();
        let blueprint = blueprint.into();
        self.authorize(ctx, "hub.attach").await?;
        match self.attach_tree(name.clone(), blueprint.clone(), config).await {
            Ok(_) => {
                self.audit(ctx, "attach", &name.to_string(), "ok").await;
                Ok(())
            }
            Err(err) => {
                self.audit(ctx, "attach", &name.to_string(), "failed").await;
                Err(err.into())
            }
        }
    }

    /// All-or-nothing batch attach: the first failure rolls back every
    /// member attached earlier in the same batch.
    pub async fn attach_batch(
        &self,
        ctx: &ExecutionContext,
        batch: Vec<(Name, BlueprintId, Meta)>,
    ) -> HubResult<()> {
        self.authorize(ctx, "hub.attach").await?;
        let mut attached: Vec<Name> = Vec::new();
        for (name, blueprint, config) in batch {
            match self.attach_tree(name.clone(), blueprint, config).await {
                Ok(_) => attached.push(name),
                Err(err) => {
                    for done in attached.iter().rev() {
                        if let Err(rollback_err) = self.detach_tree(done).await {
                            tracing::warn!(device = %done, error = %rollback_err, "batch rollback detach failed");
                        }
                    }
                    return Err(DeviceError::Transaction {
                        message: format!("attach of '{name}' failed: {err}"),
                        rolled_back: attached.iter().map(Name::to_string).collect(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Detach a device and, children first, everything under it.
    pub async fn detach(&self, ctx: &ExecutionContext, name: impl Into<Name>) -> HubResult<()> {
        let name = name.into();
        self.authorize(ctx, "hub.detach").await?;
        self.detach_tree(&name)
            .await
            .map_err(SerializableDeviceFailure::from)?;
        self.audit(ctx, "detach", &name.to_string(), "ok").await;
        Ok(())
    }

    /// Start a device.
    pub async fn start(&self, ctx: &ExecutionContext, name: impl Into<Name>) -> HubResult<()> {
        let name = name.into();
        self.authorize(ctx, "hub.start").await?;
        let device = self.local_device(&name).await?;
        device.lifecycle().post(LifecycleEvent::Start);
        let state = device
            .lifecycle()
            .await_state(&[LifecycleState::Running, LifecycleState::Failed], PHASE_TIMEOUT)
            .await?;
        if state == LifecycleState::Failed {
            return Err(DeviceError::lifecycle("start", state).into());
        }
        Ok(())
    }

    /// Stop a device.
    pub async fn stop(&self, ctx: &ExecutionContext, name: impl Into<Name>) -> HubResult<()> {
        let name = name.into();
        self.authorize(ctx, "hub.stop").await?;
        let device = self.local_device(&name).await?;
        device.lifecycle().post(LifecycleEvent::Stop);
        let state = device
            .lifecycle()
            .await_state(&[LifecycleState::Stopped, LifecycleState::Failed], PHASE_TIMEOUT)
            .await?;
        if state == LifecycleState::Failed {
            return Err(DeviceError::lifecycle("stop", state).into());
        }
        Ok(())
    }

    // ========================================================================
    // Hot swap & reconfigure
    // ========================================================================

    /// Replace a device's blueprint in place, migrating persistent state.
    /// On failure the old device is restored from its own snapshot.
    pub async fn hot_swap(
        &self,
        ctx: &ExecutionContext,
        name: impl Into<Name>,
        new_blueprint: impl Into<BlueprintId>,
        config: Meta,
    ) -> HubResult<()> {
        let name = name.into();
        let new_blueprint = new_blueprint.into();
        self.authorize(ctx, "hub.hotSwap").await?;
        let outcome = self.swap_inner(&name, new_blueprint, config).await;
        let verdict = if outcome.is_ok() { "ok" } else { "failed" };
        self.audit(ctx, "hotSwap", &name.to_string(), verdict).await;
        outcome.map_err(Into::into)
    }

    /// Merge a configuration delta into a reconfigurable device. The
    /// device is rebuilt on its own blueprint with state carried over.
    pub async fn reconfigure(
        &self,
        ctx: &ExecutionContext,
        name: impl Into<Name>,
        delta: Meta,
    ) -> HubResult<()> {
        let name = name.into();
        self.authorize(ctx, "hub.reconfigure").await?;
        let device = self.local_device(&name).await?;
        if !device.declaration().has_capability("reconfigurable") {
            return Err(DeviceError::Validation(format!(
                "device '{name}' is not reconfigurable"
            ))
            .into());
        }
        let blueprint = device.declaration().id.clone();
        let merged = delta.layered_on(device.effective_meta());
        self.swap_inner(&name, blueprint, merged).await.map_err(Into::into)
    }

    async fn swap_inner(
        &self,
        name: &Name,
        new_blueprint: BlueprintId,
        config: Meta,
    ) -> Result<(), DeviceError> {
        let device = self.local_device(name).await?;
        let old_blueprint = device.declaration().id.clone();
        let old_config = device.effective_meta().clone();
        let old_schema = device.declaration().schema_version;

        if device.lifecycle().current() == LifecycleState::Running {
            device.lifecycle().post(LifecycleEvent::Stop);
            device
                .lifecycle()
                .await_state(&[LifecycleState::Stopped, LifecycleState::Failed], PHASE_TIMEOUT)
                .await?;
        }
        let snapshot = StatePersistenceService::snapshot(device.persistence(), old_schema);

        self.detach_tree(name).await?;

        let rollback = |failure: DeviceError| {
            let hub = self.clone();
            let name = name.clone();
            let old_blueprint = old_blueprint.clone();
            let old_config = old_config.clone();
            let snapshot = snapshot.clone();
            async move {
                tracing::warn!(device = %name, error = %failure, "hot swap failed; rolling back");
                if let Err(err) = hub.attach_tree(name.clone(), old_blueprint, old_config).await {
                    return DeviceError::Transaction {
                        message: format!("hot swap and rollback both failed: {failure}; {err}"),
                        rolled_back: vec![],
                    };
                }
                if let Ok(old) = hub.local_device(&name).await {
                    let _ = hub.restore_into(&old, &snapshot);
                    let _ = hub.start_internal(&old).await;
                }
                DeviceError::Transaction {
                    message: format!("hot swap failed and was rolled back: {failure}"),
                    rolled_back: vec![name.to_string()],
                }
            }
        };

        if let Err(err) = self.attach_tree(name.clone(), new_blueprint, config).await {
            return Err(rollback(err).await);
        }
        let fresh = self.local_device(name).await?;
        if let Err(err) = self.restore_into(&fresh, &snapshot) {
            let _ = self.detach_tree(name).await;
            return Err(rollback(err).await);
        }
        if let Err(err) = self.start_internal(&fresh).await {
            let _ = self.detach_tree(name).await;
            return Err(rollback(err).await);
        }
        Ok(())
    }

    fn restore_into(&self, device: &Device, snapshot: &Snapshot) -> Result<(), DeviceError> {
        StatePersistenceService::restore(
            device.persistence(),
            device.declaration().schema_version,
            snapshot,
            &self.inner.migrators,
        )
    }

    async fn start_internal(&self, device: &Device) -> Result<(), DeviceError> {
        device.lifecycle().post(LifecycleEvent::Start);
        let state = device
            .lifecycle()
            .await_state(&[LifecycleState::Running, LifecycleState::Failed], PHASE_TIMEOUT)
            .await?;
        if state == LifecycleState::Failed {
            return Err(DeviceError::lifecycle("start", state));
        }
        Ok(())
    }

    // ========================================================================
    // Property and action I/O
    // ========================================================================

    /// Read a property of a hub-local device.
    pub async fn read_property(
        &self,
        ctx: &ExecutionContext,
        device: impl Into<Name>,
        property: impl Into<Name>,
    ) -> HubResult<Meta> {
        let device = device.into();
        let property = property.into();
        self.authorize(ctx, "device.read").await?;
        let instance = self.local_device(&device).await?;
        if let Some(permission) = instance
            .declaration()
            .property(&property)
            .and_then(|d| d.permissions.read.clone())
        {
            self.authorize(ctx, &permission.0).await?;
        }
        self.with_property_locks(ctx, &instance, &property, || async {
            let reading = instance.read_state(&property).await?;
            Ok(reading.value.unwrap_or_default())
        })
        .await
        .map_err(Into::into)
    }

    /// Write a property of a hub-local device.
    pub async fn write_property(
        &self,
        ctx: &ExecutionContext,
        device: impl Into<Name>,
        property: impl Into<Name>,
        value: Meta,
    ) -> HubResult<()> {
        let device = device.into();
        let property = property.into();
        self.authorize(ctx, "device.write").await?;
        let instance = self.local_device(&device).await?;
        if let Some(permission) = instance
            .declaration()
            .property(&property)
            .and_then(|d| d.permissions.write.clone())
        {
            self.authorize(ctx, &permission.0).await?;
        }
        self.with_property_locks(ctx, &instance, &property, || async {
            instance.write(&property, value.clone()).await
        })
        .await
        .map_err(Into::into)
    }

    /// Execute an action of a hub-local device.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        device: impl Into<Name>,
        action: impl Into<Name>,
        input: Meta,
    ) -> HubResult<Meta> {
        let device = device.into();
        let action = action.into();
        self.authorize(ctx, "device.execute").await?;
        let instance = self.local_device(&device).await?;

        let descriptor = instance
            .declaration()
            .action(&action)
            .cloned()
            .ok_or_else(|| SerializableDeviceFailure::from(DeviceError::not_found("action", &action)))?;
        if let Some(permission) = &descriptor.permission {
            self.authorize(ctx, &permission.0).await?;
        }

        let mut transients = Vec::new();
        for lock in &descriptor.required_locks {
            let transient = self
                .inner
                .locks
                .check_or_acquire_transient(
                    instance.device_address(),
                    &lock.resource,
                    lock.mode,
                    &ctx.principal,
                    &ctx.locks,
                )
                .map_err(SerializableDeviceFailure::from)?;
            transients.extend(transient);
        }
        let outcome = instance.execute(&action, input).await;
        for token in transients {
            let _ = self.inner.locks.release(token);
        }
        outcome.map_err(Into::into)
    }

    /// Batch read across addresses. One failure never aborts the rest;
    /// items run with bounded parallelism.
    pub async fn read_properties(
        &self,
        ctx: &ExecutionContext,
        requests: BTreeMap<Address, BTreeSet<Name>>,
    ) -> HubResult<BTreeMap<Address, BTreeMap<Name, OperationResult<Meta>>>> {
        self.authorize(ctx, "device.read").await?;
        let mut items = Vec::new();
        for (address, properties) in requests {
            for property in properties {
                items.push((address.clone(), property));
            }
        }
        let results: Vec<(Address, Name, OperationResult<Meta>)> =
            futures::stream::iter(items.into_iter().map(|(address, property)| {
                let hub = self.clone();
                async move {
                    let outcome = hub.read_one(&address, &property).await;
                    (address, property, outcome)
                }
            }))
            .buffer_unordered(8)
            .collect()
            .await;

        let mut out: BTreeMap<Address, BTreeMap<Name, OperationResult<Meta>>> = BTreeMap::new();
        for (address, property, outcome) in results {
            out.entry(address).or_default().insert(property, outcome);
        }
        Ok(out)
    }

    /// Batch write across addresses; mirror of [`Self::read_properties`].
    pub async fn write_properties(
        &self,
        ctx: &ExecutionContext,
        requests: BTreeMap<Address, BTreeMap<Name, Meta>>,
    ) -> HubResult<BTreeMap<Address, BTreeMap<Name, OperationResult<()>>>> {
        self.authorize(ctx, "device.write").await?;
        let mut items = Vec::new();
        for (address, writes) in requests {
            for (property, value) in writes {
                items.push((address.clone(), property, value));
            }
        }
        let results: Vec<(Address, Name, OperationResult<()>)> =
            futures::stream::iter(items.into_iter().map(|(address, property, value)| {
                let hub = self.clone();
                async move {
                    let outcome = hub.write_one(&address, &property, value).await;
                    (address, property, outcome)
                }
            }))
            .buffer_unordered(8)
            .collect()
            .await;

        let mut out: BTreeMap<Address, BTreeMap<Name, OperationResult<()>>> = BTreeMap::new();
        for (address, property, outcome) in results {
            out.entry(address).or_default().insert(property, outcome);
        }
        Ok(out)
    }

    async fn read_one(&self, address: &Address, property: &Name) -> OperationResult<Meta> {
        let device = match self.find_device(address).await {
            Ok(device) => device,
            Err(failure) => return OperationResult::Failure { failure },
        };
        match device.read_state(property).await {
            Ok(reading) => OperationResult::Success {
                value: reading.value.unwrap_or_default(),
                quality: reading.quality,
            },
            Err(err) => OperationResult::Failure { failure: err.into() },
        }
    }

    async fn write_one(
        &self,
        address: &Address,
        property: &Name,
        value: Meta,
    ) -> OperationResult<()> {
        let device = match self.find_device(address).await {
            Ok(device) => device,
            Err(failure) => return OperationResult::Failure { failure },
        };
        match device.write(property, value).await {
            Ok(()) => OperationResult::Success {
                value: (),
                quality: Quality::Ok,
            },
            Err(err) => OperationResult::Failure { failure: err.into() },
        }
    }

    // ========================================================================
    // Locks
    // ========================================================================

    /// Acquire a lease on a device resource.
    pub async fn acquire_lock(
        &self,
        ctx: &ExecutionContext,
        address: &Address,
        resource: impl Into<Name>,
        mode: LockMode,
        duration: Duration,
    ) -> HubResult<LockToken> {
        self.authorize(ctx, "hub.lock").await?;
        self.inner
            .locks
            .acquire(address, &resource.into(), mode, duration, &ctx.principal, None)
            .map_err(Into::into)
    }

    /// Release a lease by token.
    pub async fn release_lock(&self, _ctx: &ExecutionContext, token: LockToken) -> HubResult<()> {
        self.inner.locks.release(token).map_err(Into::into)
    }

    /// Administratively drop every lease on a resource. Audited.
    pub async fn force_release_lock(
        &self,
        ctx: &ExecutionContext,
        address: &Address,
        resource: impl Into<Name>,
        reason: &str,
    ) -> HubResult<usize> {
        let resource = resource.into();
        self.authorize(ctx, "hub.admin").await?;
        let released = self.inner.locks.force_release(address, &resource);
        self.audit(
            ctx,
            "forceReleaseLock",
            &format!("{address}/{resource}"),
            &format!("released {released}: {reason}"),
        )
        .await;
        Ok(released)
    }

    // ========================================================================
    // Addressing, queries, aliases
    // ========================================================================

    /// Resolve a device by address, delegating to registered peer hubs
    /// for foreign routes.
    pub fn find_device<'a>(
        &'a self,
        address: &'a Address,
    ) -> BoxFuture<'a, HubResult<Device>> {
        Box::pin(async move {
            if address.route == self.inner.id {
                return self
                    .local_device(&address.device)
                    .await
                    .map_err(Into::into);
            }
            let remote = self.inner.remotes.read().await.get(&address.route).cloned();
            match remote {
                Some(hub) => hub.find_device(address).await,
                None => Err(DeviceError::not_found("hub route", &address.route).into()),
            }
        })
    }

    /// Page through devices matching a filter.
    pub async fn query_devices(
        &self,
        ctx: &ExecutionContext,
        filter: DeviceFilter,
        limit: usize,
        offset: usize,
    ) -> HubResult<Vec<DeviceInfo>> {
        self.authorize(ctx, "hub.query").await?;
        let devices = self.inner.devices.read().await;
        let mut rows: Vec<DeviceInfo> = devices
            .iter()
            .filter(|(name, device)| {
                filter
                    .pattern
                    .as_ref()
                    .map(|pattern| name.matches(pattern))
                    .unwrap_or(true)
                    && filter
                        .capability
                        .as_ref()
                        .map(|capability| device.declaration().has_capability(capability))
                        .unwrap_or(true)
            })
            .map(|(name, device)| DeviceInfo {
                name: name.clone(),
                blueprint: device.declaration().id.clone(),
                version: device.declaration().version.to_string(),
                lifecycle: device.lifecycle().current(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    /// Canonical name plus the aliases routed to a device; proposed
    /// aliases are registered when free.
    pub async fn negotiate_aliases(
        &self,
        ctx: &ExecutionContext,
        device: impl Into<Name>,
        proposed: Vec<Name>,
    ) -> HubResult<Vec<Name>> {
        let device = device.into();
        self.authorize(ctx, "hub.alias").await?;
        // the device must exist under its canonical name
        self.local_device(&device).await.map_err(SerializableDeviceFailure::from)?;

        let mut aliases = self.inner.aliases.write().await;
        let devices = self.inner.devices.read().await;
        for alias in proposed {
            if alias == device {
                continue;
            }
            if devices.contains_key(&alias) {
                return Err(DeviceError::Validation(format!(
                    "alias '{alias}' collides with an attached device"
                ))
                .into());
            }
            match aliases.get(&alias) {
                Some(existing) if *existing != device => {
                    return Err(DeviceError::Validation(format!(
                        "alias '{alias}' already routes to '{existing}'"
                    ))
                    .into());
                }
                _ => {
                    aliases.insert(alias, device.clone());
                }
            }
        }
        let mut known: Vec<Name> = aliases
            .iter()
            .filter(|(_, target)| **target == device)
            .map(|(alias, _)| alias.clone())
            .collect();
        known.sort();
        known.insert(0, device);
        Ok(known)
    }

    /// Names of currently attached devices.
    pub async fn device_names(&self) -> Vec<Name> {
        let mut names: Vec<Name> = self.inner.devices.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn authorize(&self, ctx: &ExecutionContext, permission: &str) -> Result<(), SerializableDeviceFailure> {
        self.inner
            .authz
            .check_permission(&ctx.principal, permission)
            .await
            .map_err(Into::into)
    }

    async fn audit(&self, ctx: &ExecutionContext, operation: &str, target: &str, outcome: &str) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            principal: ctx.principal.clone(),
            operation: operation.to_string(),
            target: target.to_string(),
            outcome: outcome.to_string(),
        };
        if let Err(err) = self.inner.audit.record(record).await {
            tracing::warn!(error = %err, "audit record failed");
        }
    }

    async fn local_device(&self, name: &Name) -> Result<Device, DeviceError> {
        let resolved = {
            let aliases = self.inner.aliases.read().await;
            aliases.get(name).cloned().unwrap_or_else(|| name.clone())
        };
        self.inner
            .devices
            .read()
            .await
            .get(&resolved)
            .cloned()
            .ok_or_else(|| DeviceError::not_found("device", name))
    }

    async fn with_property_locks<T, F, Fut>(
        &self,
        ctx: &ExecutionContext,
        device: &Device,
        property: &Name,
        op: F,
    ) -> Result<T, DeviceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, DeviceError>>,
    {
        let required = device
            .declaration()
            .property(property)
            .map(|descriptor| descriptor.required_locks.clone())
            .unwrap_or_default();
        let mut transients = Vec::new();
        for lock in &required {
            let transient = self.inner.locks.check_or_acquire_transient(
                device.device_address(),
                &lock.resource,
                lock.mode,
                &ctx.principal,
                &ctx.locks,
            )?;
            transients.extend(transient);
        }
        let outcome = op().await;
        for token in transients {
            let _ = self.inner.locks.release(token);
        }
        outcome
    }

    /// Attach a device and its local children. Returns every name that
    /// was attached, parent first.
    fn attach_tree(
        &self,
        name: Name,
        blueprint: BlueprintId,
        config: Meta,
    ) -> BoxFuture<'_, Result<Vec<Name>, DeviceError>> {
        Box::pin(async move {
            {
                let devices = self.inner.devices.read().await;
                if devices.contains_key(&name) {
                    return Err(DeviceError::Validation(format!(
                        "device '{name}' is already attached"
                    )));
                }
            }
            {
                let aliases = self.inner.aliases.read().await;
                if aliases.contains_key(&name) {
                    return Err(DeviceError::Validation(format!(
                        "name '{name}' is taken by an alias"
                    )));
                }
            }

            let executable = self.inner.provider.provide(&blueprint).await?;
            let address = Address::new(self.inner.id.clone(), name.clone());
            let device =
                Device::create(address.clone(), executable.clone(), config, &self.inner.scope)
                    .await?;

            self.forward_messages(&device);
            self.inner
                .devices
                .write()
                .await
                .insert(name.clone(), device.clone());

            device.lifecycle().post(LifecycleEvent::Attach);
            let state = device
                .lifecycle()
                .await_state(&[LifecycleState::Stopped, LifecycleState::Failed], PHASE_TIMEOUT)
                .await;
            match state {
                Ok(LifecycleState::Stopped) => {}
                Ok(other) => {
                    self.remove_device(&name).await;
                    return Err(DeviceError::lifecycle("attach", other));
                }
                Err(err) => {
                    self.remove_device(&name).await;
                    return Err(err);
                }
            }

            let mut attached = vec![name.clone()];

            // local children attach under the parent name; remote children
            // need a live peer transport, which is an external collaborator
            for (child_key, child_config) in &executable.declaration.children {
                match child_config {
                    ChildConfig::Local {
                        blueprint: child_blueprint,
                        meta,
                        bindings: child_bindings,
                        ..
                    } => {
                        let child_name = name.child(NameToken::new(child_key.as_str()));
                        let outcome = self
                            .attach_tree(child_name.clone(), child_blueprint.clone(), meta.clone())
                            .await;
                        match outcome {
                            Ok(mut names) => {
                                let wired = match self.local_device(&child_name).await {
                                    Ok(child) => {
                                        bindings::apply_bindings(&device, &child, child_bindings)
                                    }
                                    Err(err) => Err(err),
                                };
                                if let Err(err) = wired {
                                    self.rollback_attached(&attached, &names).await;
                                    return Err(err);
                                }
                                attached.append(&mut names);
                            }
                            Err(err) => {
                                self.rollback_attached(&attached, &[]).await;
                                return Err(err);
                            }
                        }
                    }
                    ChildConfig::Remote { peer, .. } => {
                        self.rollback_attached(&attached, &[]).await;
                        return Err(DeviceError::PeerConnection {
                            message: format!(
                                "remote child '{child_key}' needs a live peer connection '{peer}'"
                            ),
                            timed_out: false,
                        });
                    }
                }
            }

            self.emit_hub_message(DeviceMessage::DeviceAttached {
                source: address,
                blueprint: blueprint.to_string(),
                timestamp: Utc::now(),
            });
            Ok(attached)
        })
    }

    async fn rollback_attached(&self, attached: &[Name], extra: &[Name]) {
        let mut names: Vec<Name> = attached.iter().chain(extra.iter()).cloned().collect();
        // deepest first so every detach sees its children already gone
        names.sort_by_key(|name| std::cmp::Reverse(name.len()));
        for name in names {
            let present = self.inner.devices.read().await.contains_key(&name);
            if !present {
                continue;
            }
            if let Err(err) = self.detach_tree(&name).await {
                tracing::warn!(device = %name, error = %err, "rollback detach failed");
            }
        }
    }

    fn detach_tree<'a>(&'a self, name: &'a Name) -> BoxFuture<'a, Result<(), DeviceError>> {
        Box::pin(async move {
            let device = self.local_device(name).await?;

            // children first, deepest first
            let children: Vec<Name> = {
                let devices = self.inner.devices.read().await;
                let mut under: Vec<Name> = devices
                    .keys()
                    .filter(|candidate| candidate.starts_with(name) && candidate.len() == name.len() + 1)
                    .cloned()
                    .collect();
                under.sort();
                under
            };
            for child in children {
                self.detach_tree(&child).await?;
            }

            match device.lifecycle().current() {
                LifecycleState::Running => {
                    device.lifecycle().post(LifecycleEvent::Stop);
                    let _ = device
                        .lifecycle()
                        .await_state(&[LifecycleState::Stopped, LifecycleState::Failed], PHASE_TIMEOUT)
                        .await;
                }
                LifecycleState::Failed => {
                    device.lifecycle().post(LifecycleEvent::Reset);
                    let _ = device
                        .lifecycle()
                        .await_state(&[LifecycleState::Stopped], PHASE_TIMEOUT)
                        .await;
                }
                _ => {}
            }

            device.lifecycle().post(LifecycleEvent::Detach);
            let _ = device
                .lifecycle()
                .await_state(&[LifecycleState::Detached], PHASE_TIMEOUT)
                .await;

            self.remove_device(name).await;
            device.shutdown();

            self.emit_hub_message(DeviceMessage::DeviceDetached {
                source: Address::new(self.inner.id.clone(), name.clone()),
                timestamp: Utc::now(),
            });
            Ok(())
        })
    }

    async fn remove_device(&self, name: &Name) {
        self.inner.devices.write().await.remove(name);
        let mut aliases = self.inner.aliases.write().await;
        aliases.retain(|_, target| target != name);
    }

    fn forward_messages(&self, device: &Device) {
        let mut messages = device.messages();
        let events = self.inner.events.clone();
        let broker = self.inner.broker.clone();
        let data = self.inner.data.clone();
        let hub = self.inner.id.clone();
        device.scope().spawn(async move {
            loop {
                let message = match messages.recv().await {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "hub forwarder lagged behind device messages");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let DeviceMessage::PropertyChanged {
                    source, property, value, ..
                } = &message
                {
                    let path = source.device.plus(property);
                    let _ = data.set(&path, value.clone());
                }
                let topic = message.topic();
                broker.publish(&topic, &message);
                let _ = events.send(DeviceHubEvent {
                    hub: hub.clone(),
                    message,
                });
            }
        });
    }

    fn emit_hub_message(&self, message: DeviceMessage) {
        let topic = message.topic();
        self.inner.broker.publish(&topic, &message);
        let _ = self.inner.events.send(DeviceHubEvent {
            hub: self.inner.id.clone(),
            message,
        });
    }
}
