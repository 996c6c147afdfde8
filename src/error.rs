//! Failure taxonomy
//!
//! Every failure in the control plane belongs to one of a closed set of
//! kinds. Inside the crate errors travel as [`DeviceError`]; at hub
//! boundaries they are wrapped into [`SerializableDeviceFailure`], a plain
//! serializable record that carries the kind, a message, an optional cause
//! chain and an optional structured fault payload.

use crate::meta::{AddressError, ConvertError, Meta, MetaError, Name, NameError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Closed set of failure kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
pub enum FailureKind {
    /// Input failed a static or runtime validation rule.
    Validation,
    /// Principal lacks permission.
    Security,
    /// Device, property, action, blueprint, migrator or secret missing.
    NotFound,
    /// Converter failure or incompatible value shape.
    TypeMismatch,
    /// Operation not valid in the current lifecycle state.
    Lifecycle,
    /// Lock contention, lease expiry or forced-release conflict.
    Lock,
    /// Soft or hard timeout expired.
    Timeout,
    /// Peer transport failure.
    PeerConnection,
    /// Partial batch failure with rollback details.
    Transaction,
    /// Missing migrator chain or migration logic failure.
    Migration,
    /// Invariant violation in the runtime.
    Internal,
}

/// Control-plane error with one variant per failure kind.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied for '{principal}': {permission}")]
    Security { principal: String, permission: String },

    #[error("{entity} not found: {name}")]
    NotFound { entity: &'static str, name: String },

    #[error("type mismatch: {0}")]
    TypeMismatch(#[from] ConvertError),

    #[error("operation '{operation}' not valid in lifecycle state {state}")]
    Lifecycle { operation: String, state: String },

    #[error("lock conflict on '{resource}': {reason}")]
    Lock { resource: String, reason: String },

    #[error("timed out after {after:?} (hard = {hard})")]
    Timeout { after: Duration, hard: bool },

    #[error("peer connection failure: {message}")]
    PeerConnection { message: String, timed_out: bool },

    #[error("transaction failed: {message}")]
    Transaction { message: String, rolled_back: Vec<String> },

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl DeviceError {
    /// The kind this error belongs to.
    pub fn kind(&self) -> FailureKind {
        match self {
            DeviceError::Validation(_) => FailureKind::Validation,
            DeviceError::Security { .. } => FailureKind::Security,
            DeviceError::NotFound { .. } => FailureKind::NotFound,
            DeviceError::TypeMismatch(_) => FailureKind::TypeMismatch,
            DeviceError::Lifecycle { .. } => FailureKind::Lifecycle,
            DeviceError::Lock { .. } => FailureKind::Lock,
            DeviceError::Timeout { .. } => FailureKind::Timeout,
            DeviceError::PeerConnection { .. } => FailureKind::PeerConnection,
            DeviceError::Transaction { .. } => FailureKind::Transaction,
            DeviceError::Migration(_) => FailureKind::Migration,
            DeviceError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Shorthand for a missing entity.
    pub fn not_found(entity: &'static str, name: impl ToString) -> Self {
        DeviceError::NotFound {
            entity,
            name: name.to_string(),
        }
    }

    /// Shorthand for a lifecycle violation.
    pub fn lifecycle(operation: impl Into<String>, state: impl ToString) -> Self {
        DeviceError::Lifecycle {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Soft timeout.
    pub fn soft_timeout(after: Duration) -> Self {
        DeviceError::Timeout { after, hard: false }
    }

    /// Hard deadline timeout.
    pub fn deadline(after: Duration) -> Self {
        DeviceError::Timeout { after, hard: true }
    }
}

impl From<NameError> for DeviceError {
    fn from(err: NameError) -> Self {
        DeviceError::Validation(err.to_string())
    }
}

impl From<AddressError> for DeviceError {
    fn from(err: AddressError) -> Self {
        DeviceError::Validation(err.to_string())
    }
}

impl From<MetaError> for DeviceError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::NoSuchNode(name) => DeviceError::not_found("meta node", name),
            other => DeviceError::Validation(other.to_string()),
        }
    }
}

/// Boundary form of a failure: serializable, with kind, message, cause
/// chain and optional structured fault payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct SerializableDeviceFailure {
    /// Failure kind.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
    /// Optional wrapped cause.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cause: Option<Box<SerializableDeviceFailure>>,
    /// Optional structured fault payload.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fault: Option<Meta>,
}

impl SerializableDeviceFailure {
    /// Build a failure from its parts.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            fault: None,
        }
    }

    /// Attach a cause.
    pub fn caused_by(mut self, cause: SerializableDeviceFailure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attach a fault payload.
    pub fn with_fault(mut self, fault: Meta) -> Self {
        self.fault = Some(fault);
        self
    }
}

impl From<DeviceError> for SerializableDeviceFailure {
    fn from(err: DeviceError) -> Self {
        let mut failure = SerializableDeviceFailure::new(err.kind(), err.to_string());
        if let DeviceError::PeerConnection { timed_out: true, .. } = &err {
            // a peer timeout keeps its transport kind but records the
            // timeout as the cause
            failure.cause = Some(Box::new(SerializableDeviceFailure::new(
                FailureKind::Timeout,
                "peer deadline expired",
            )));
        }
        if let DeviceError::Transaction { rolled_back, .. } = &err {
            if !rolled_back.is_empty() {
                let mut fault = Meta::new();
                for name in rolled_back {
                    let _ = fault.append("rolledBack", Meta::of(name.as_str()));
                }
                failure.fault = Some(fault);
            }
        }
        failure
    }
}

/// Result alias used by every hub-boundary call.
pub type HubResult<T> = Result<T, SerializableDeviceFailure>;

/// Convenience for wrapping a not-found name at the boundary.
pub fn device_not_found(name: &Name) -> SerializableDeviceFailure {
    DeviceError::not_found("device", name).into()
}
