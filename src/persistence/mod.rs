//! # Persistence & Migration
//!
//! Stateful properties snapshot into a [`Snapshot`]: a meta keyed by
//! property name plus the dirty counter and the schema version. Restoring
//! against an older schema runs a chain of [`StateMigrator`]s looked up
//! in the [`StateMigratorRegistry`]; restoring against a newer schema is
//! an error. Large binary artifacts travel beside the snapshot through
//! [`BlobStore`].

use crate::error::DeviceError;
use crate::meta::{Meta, Name};
use crate::state::PersistenceElements;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Serialized view of a device's persistent properties.
///
/// Reserved layout: `version` (dirty counter), `schemaVersion`, `state`
/// (property name → serialized value), optional `blobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Dirty counter at snapshot time.
    pub version: u64,
    /// Schema version of the producing device.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Property name → serialized value.
    pub state: Meta,
    /// Optional binary artifacts keyed by name.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub blobs: Option<BTreeMap<Name, Bytes>>,
}

/// One step of a schema migration chain.
pub trait StateMigrator: Send + Sync {
    /// Stable migrator id.
    fn id(&self) -> &str;

    /// Schema version this step consumes.
    fn from_version(&self) -> u32;

    /// Schema version this step produces.
    fn to_version(&self) -> u32;

    /// Rewrite the persistent state.
    fn migrate(&self, state: Meta) -> Result<Meta, DeviceError>;
}

/// Registry of migrators keyed by `(from, to)`.
///
/// Mutated only during setup; frozen before the hub starts.
#[derive(Default)]
pub struct StateMigratorRegistry {
    migrators: RwLock<HashMap<u32, Arc<dyn StateMigrator>>>,
    frozen: std::sync::atomic::AtomicBool,
}

impl StateMigratorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migrator step. One step per `from` version.
    pub fn register(&self, migrator: Arc<dyn StateMigrator>) -> Result<(), DeviceError> {
        if self.frozen.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DeviceError::Internal(
                "migrator registry is frozen".into(),
            ));
        }
        if migrator.to_version() <= migrator.from_version() {
            return Err(DeviceError::Validation(format!(
                "migrator '{}' does not increase the schema version ({} -> {})",
                migrator.id(),
                migrator.from_version(),
                migrator.to_version()
            )));
        }
        self.migrators
            .write()
            .expect("migrator lock poisoned")
            .insert(migrator.from_version(), migrator);
        Ok(())
    }

    /// Forbid further registration.
    pub fn freeze(&self) {
        self.frozen.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Chain of migrators from `from` to `to`, in application order.
    pub fn chain(&self, from: u32, to: u32) -> Result<Vec<Arc<dyn StateMigrator>>, DeviceError> {
        let migrators = self.migrators.read().expect("migrator lock poisoned");
        let mut chain = Vec::new();
        let mut version = from;
        while version < to {
            let step = migrators.get(&version).ok_or_else(|| {
                DeviceError::Migration(format!(
                    "no migrator from schema version {version} (target {to})"
                ))
            })?;
            version = step.to_version();
            chain.push(step.clone());
        }
        if version != to {
            return Err(DeviceError::Migration(format!(
                "migrator chain overshoots target: reached {version}, wanted {to}"
            )));
        }
        Ok(chain)
    }
}

/// Side channel for large binary artifacts.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist the artifacts of a device.
    async fn snapshot_blobs(&self, device: &Name) -> Result<BTreeMap<Name, Bytes>, DeviceError>;

    /// Restore previously persisted artifacts.
    async fn restore_blobs(
        &self,
        device: &Name,
        blobs: &BTreeMap<Name, Bytes>,
    ) -> Result<(), DeviceError>;
}

/// Snapshot/restore over a device's registered persistence elements.
pub struct StatePersistenceService;

impl StatePersistenceService {
    /// Serialize every registered stateful property.
    pub fn snapshot(elements: &PersistenceElements, schema_version: u32) -> Snapshot {
        let mut state = Meta::new();
        elements.for_each(|element| {
            // flat layout: one key per property, full name as the key text
            let _ = state.append(&element.name.to_string(), element.read());
        });
        Snapshot {
            version: elements.dirty_version(),
            schema_version,
            state,
            blobs: None,
        }
    }

    /// Restore a snapshot into a device's persistence elements.
    ///
    /// - A snapshot newer than the device fails.
    /// - An older snapshot runs the migrator chain first.
    /// - Per-property failures are logged and skipped; unknown keys are
    ///   warned and ignored.
    /// - On success the dirty counter resets to the snapshot version.
    pub fn restore(
        elements: &PersistenceElements,
        device_schema_version: u32,
        snapshot: &Snapshot,
        migrators: &StateMigratorRegistry,
    ) -> Result<(), DeviceError> {
        if snapshot.schema_version > device_schema_version {
            return Err(DeviceError::Migration(format!(
                "snapshot schema version {} is newer than device schema version {}",
                snapshot.schema_version, device_schema_version
            )));
        }

        let state = if snapshot.schema_version < device_schema_version {
            let chain = migrators.chain(snapshot.schema_version, device_schema_version)?;
            let mut state = snapshot.state.unsealed();
            for step in chain {
                tracing::info!(
                    migrator = step.id(),
                    from = step.from_version(),
                    to = step.to_version(),
                    "applying state migration"
                );
                state = step.migrate(state)?;
            }
            state
        } else {
            snapshot.state.clone()
        };

        for (key, nodes) in state.items() {
            let Some(node) = nodes.first() else { continue };
            let name: Name = match key.parse() {
                Ok(name) => name,
                Err(_) => {
                    tracing::warn!(key = %key, "snapshot key is not a valid name; ignored");
                    continue;
                }
            };
            match elements.restore_one(&name, node) {
                None => {
                    tracing::warn!(property = %name, "snapshot key unknown to device; ignored");
                }
                Some(Err(err)) => {
                    tracing::warn!(property = %name, error = %err, "property restore failed; skipped");
                }
                Some(Ok(())) => {}
            }
        }

        elements.reset_dirty(snapshot.version);
        Ok(())
    }
}
