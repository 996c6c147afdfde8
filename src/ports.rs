//! # Service Ports
//!
//! Traits the core consumes but never implements against real backends:
//! authorization, secrets, discovery, time series, audit and state logs,
//! metrics, peer transport, workspace tasks and interactive signals.
//! In-memory reference implementations live next to the traits where the
//! runtime and the tests need a working default.
//!
//! Authorization is fail-closed: the default implementation denies every
//! call.

use crate::blueprint::QoS;
use crate::error::DeviceError;
use crate::message::DeviceHubEvent;
use crate::meta::{Address, Meta, Name};
use crate::state::StateValue;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Authorization
// ============================================================================

/// Permission checks for every control-plane call.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// Err on deny; Ok on allow.
    async fn check_permission(&self, principal: &str, permission: &str)
        -> Result<(), DeviceError>;
}

/// Fail-closed default: denies everything.
pub struct DenyAllAuthorization;

#[async_trait]
impl AuthorizationService for DenyAllAuthorization {
    async fn check_permission(&self, principal: &str, permission: &str) -> Result<(), DeviceError> {
        Err(DeviceError::Security {
            principal: principal.to_string(),
            permission: permission.to_string(),
        })
    }
}

/// Allows everything; composition roots opt into it explicitly.
pub struct AllowAllAuthorization;

#[async_trait]
impl AuthorizationService for AllowAllAuthorization {
    async fn check_permission(&self, _principal: &str, _permission: &str) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Static principal → permission grants; handy for tests and small
/// deployments.
#[derive(Default)]
pub struct StaticAuthorization {
    grants: HashMap<String, Vec<String>>,
}

impl StaticAuthorization {
    /// Empty grant table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a permission pattern to a principal. `*` grants everything.
    pub fn grant(mut self, principal: impl Into<String>, permission: impl Into<String>) -> Self {
        self.grants.entry(principal.into()).or_default().push(permission.into());
        self
    }
}

#[async_trait]
impl AuthorizationService for StaticAuthorization {
    async fn check_permission(&self, principal: &str, permission: &str) -> Result<(), DeviceError> {
        let allowed = self
            .grants
            .get(principal)
            .map(|grants| grants.iter().any(|g| g == "*" || g == permission))
            .unwrap_or(false);
        if allowed {
            Ok(())
        } else {
            Err(DeviceError::Security {
                principal: principal.to_string(),
                permission: permission.to_string(),
            })
        }
    }
}

// ============================================================================
// Secrets & discovery
// ============================================================================

/// Secret resolution for configuration hydration.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Resolve a secret reference; `None` when unknown.
    async fn resolve(&self, reference: &str) -> Result<Option<String>, DeviceError>;
}

/// Fixed secret map.
#[derive(Default)]
pub struct StaticSecretProvider {
    secrets: HashMap<String, String>,
}

impl StaticSecretProvider {
    /// Empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret.
    pub fn with(mut self, reference: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(reference.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn resolve(&self, reference: &str) -> Result<Option<String>, DeviceError> {
        Ok(self.secrets.get(reference).cloned())
    }
}

/// One update of a discovered service endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressUpdate {
    /// Service being tracked.
    pub service_id: String,
    /// Current address; `None` when the service disappeared.
    pub address: Option<Address>,
}

/// Service discovery.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    /// Stream of address updates for one service id.
    async fn discover(&self, service_id: &str) -> Result<mpsc::Receiver<AddressUpdate>, DeviceError>;
}

/// Hub presence change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubPresence {
    /// Route of the hub.
    pub route: Name,
    /// Whether it appeared (true) or disappeared (false).
    pub appeared: bool,
}

/// Discovery of peer hubs.
#[async_trait]
pub trait HubDiscoveryService: Send + Sync {
    /// Stream of hub appear/disappear events.
    async fn discover(&self) -> Result<mpsc::Receiver<HubPresence>, DeviceError>;
}

// ============================================================================
// Time series, audit and state logs
// ============================================================================

/// Aggregation applied when reading history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
pub enum Aggregation {
    None,
    Mean,
    Min,
    Max,
    Last,
}

/// Interpolation applied when reading history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
pub enum Interpolation {
    None,
    Linear,
    Previous,
}

/// Historical property storage.
#[async_trait]
pub trait TimeSeriesService: Send + Sync {
    /// Record one reading.
    async fn record(
        &self,
        address: &Address,
        property: &Name,
        value: &StateValue<Meta>,
    ) -> Result<(), DeviceError>;

    /// Read back a window of readings.
    #[allow(clippy::too_many_arguments)]
    async fn read_history(
        &self,
        address: &Address,
        property: &Name,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
        aggregation: Aggregation,
        interpolation: Interpolation,
    ) -> Result<Vec<StateValue<Meta>>, DeviceError>;
}

/// One audited control-plane operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Who did it.
    pub principal: String,
    /// What was done.
    pub operation: String,
    /// What it was done to.
    pub target: String,
    /// Free-form outcome note.
    pub outcome: String,
}

/// Audit trail of control-plane operations.
#[async_trait]
pub trait AuditLogService: Send + Sync {
    /// Append a record.
    async fn record(&self, record: AuditRecord) -> Result<(), DeviceError>;

    /// Records in a time window, oldest first.
    async fn query(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditRecord>, DeviceError>;
}

/// In-memory audit log.
#[derive(Default)]
pub struct InMemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditLogService for InMemoryAuditLog {
    async fn record(&self, record: AuditRecord) -> Result<(), DeviceError> {
        self.records.lock().expect("audit lock poisoned").push(record);
        Ok(())
    }

    async fn query(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditRecord>, DeviceError> {
        Ok(self
            .records
            .lock()
            .expect("audit lock poisoned")
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .cloned()
            .collect())
    }
}

/// Event-sourced view of past hub state.
#[async_trait]
pub trait StateLogService: Send + Sync {
    /// Replay hub events in a window, oldest first.
    async fn replay_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeviceHubEvent>, DeviceError>;

    /// Rebuild the property tree as of an instant.
    async fn get_snapshot_at(&self, at: DateTime<Utc>) -> Result<Meta, DeviceError>;
}

/// In-memory state log fed from the hub's event stream.
#[derive(Default)]
pub struct InMemoryStateLog {
    events: RwLock<Vec<(DateTime<Utc>, DeviceHubEvent)>>,
}

impl InMemoryStateLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one event.
    pub fn ingest(&self, event: DeviceHubEvent) {
        let at = event.message.timestamp();
        self.events.write().expect("state log lock poisoned").push((at, event));
    }
}

#[async_trait]
impl StateLogService for InMemoryStateLog {
    async fn replay_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeviceHubEvent>, DeviceError> {
        let mut events: Vec<(DateTime<Utc>, DeviceHubEvent)> = self
            .events
            .read()
            .expect("state log lock poisoned")
            .iter()
            .filter(|(at, _)| *at >= from && *at <= to)
            .cloned()
            .collect();
        events.sort_by_key(|(at, _)| *at);
        Ok(events.into_iter().map(|(_, event)| event).collect())
    }

    async fn get_snapshot_at(&self, at: DateTime<Utc>) -> Result<Meta, DeviceError> {
        let mut snapshot = Meta::new();
        let events = self.events.read().expect("state log lock poisoned");
        let mut ordered: Vec<&(DateTime<Utc>, DeviceHubEvent)> =
            events.iter().filter(|(ts, _)| *ts <= at).collect();
        ordered.sort_by_key(|(ts, _)| *ts);
        for (_, event) in ordered {
            if let crate::message::DeviceMessage::PropertyChanged {
                source,
                property,
                value,
                ..
            } = &event.message
            {
                let path = source.device.plus(property);
                let _ = snapshot.set(&path, value.clone());
            }
        }
        Ok(snapshot)
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// One scraped metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Metric name.
    pub name: String,
    /// Label set.
    pub labels: HashMap<String, String>,
    /// Sample value.
    pub value: f64,
    /// Sample instant.
    pub timestamp: DateTime<Utc>,
}

/// Pull-based metric source.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Scrape the current samples.
    async fn scrape(&self) -> Result<Vec<MetricValue>, DeviceError>;
}

// ============================================================================
// Peer transport
// ============================================================================

/// One unit of peer traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical topic of the payload.
    pub topic: Name,
    /// Serialized payload.
    pub payload: Bytes,
}

/// Direct binary channel between hubs.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Send an envelope under a delivery guarantee.
    async fn send(&self, envelope: Envelope, qos: QoS, timeout: Duration)
        -> Result<(), DeviceError>;

    /// Receive the next envelope.
    async fn receive(&self, timeout: Duration) -> Result<Envelope, DeviceError>;
}

// ============================================================================
// Workspace tasks & interactive signals
// ============================================================================

/// Executes workspace tasks referenced by plans and task actions.
#[async_trait]
pub trait WorkspaceTaskRunner: Send + Sync {
    /// Run a task to completion and return its result.
    async fn run_task(&self, task_id: &str, input: Meta) -> Result<Meta, DeviceError>;
}

/// Delivers interactive signals plans can await on.
#[async_trait]
pub trait SignalPort: Send + Sync {
    /// Block until the signal fires.
    async fn await_signal(&self, id: &str, prompt: &str) -> Result<(), DeviceError>;
}

/// In-memory signal hub.
#[derive(Default)]
pub struct InMemorySignalHub {
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

impl InMemorySignalHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire a signal, releasing every waiter.
    pub fn fire(&self, id: &str) {
        let waiters = self
            .waiters
            .lock()
            .expect("signal lock poisoned")
            .remove(id)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

#[async_trait]
impl SignalPort for InMemorySignalHub {
    async fn await_signal(&self, id: &str, prompt: &str) -> Result<(), DeviceError> {
        tracing::info!(signal = id, prompt = prompt, "awaiting signal");
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("signal lock poisoned")
            .entry(id.to_string())
            .or_default()
            .push(tx);
        rx.await
            .map_err(|_| DeviceError::Internal("signal hub dropped".into()))
    }
}
