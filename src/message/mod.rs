//! # Message Fabric
//!
//! Devices narrate everything they do as [`DeviceMessage`]s. The hub
//! multiplexes them into a hot stream of [`DeviceHubEvent`]s and feeds a
//! [`broker::TopicBroker`] for pattern subscription. Messages are
//! immutable, serializable and internally tagged, so adding a variant
//! never breaks consumers of older ones.

pub mod broker;

pub use broker::{TopicBroker, TopicSubscription};

use crate::error::SerializableDeviceFailure;
use crate::fsm::LifecycleState;
use crate::meta::{Address, Meta, Name, NameToken};
use crate::state::Quality;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything a device can tell the world.
///
/// Every variant carries the device-clock timestamp and the source
/// address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceMessage {
    /// A property accepted a new value.
    PropertyChanged {
        source: Address,
        property: Name,
        value: Meta,
        quality: Quality,
        timestamp: DateTime<Utc>,
    },
    /// The device (re)published its descriptor set.
    Description {
        source: Address,
        description: Meta,
        timestamp: DateTime<Utc>,
    },
    /// Lifecycle machine committed a transition.
    LifecycleStateChanged {
        source: Address,
        from: LifecycleState,
        to: LifecycleState,
        timestamp: DateTime<Utc>,
    },
    /// The device failed.
    DeviceError {
        source: Address,
        failure: SerializableDeviceFailure,
        timestamp: DateTime<Utc>,
    },
    /// A predicate property flipped.
    PredicateChanged {
        source: Address,
        predicate: Name,
        value: bool,
        timestamp: DateTime<Utc>,
    },
    /// A binary artifact is ready for pickup.
    BinaryReadyNotification {
        source: Address,
        stream: Name,
        size_bytes: u64,
        timestamp: DateTime<Utc>,
    },
    /// A peer requests binary data.
    BinaryDataRequest {
        source: Address,
        stream: Name,
        request_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A device joined the hub.
    DeviceAttached {
        source: Address,
        blueprint: String,
        timestamp: DateTime<Utc>,
    },
    /// A device left the hub.
    DeviceDetached {
        source: Address,
        timestamp: DateTime<Utc>,
    },
}

impl DeviceMessage {
    /// Source address of the message.
    pub fn source(&self) -> &Address {
        match self {
            DeviceMessage::PropertyChanged { source, .. }
            | DeviceMessage::Description { source, .. }
            | DeviceMessage::LifecycleStateChanged { source, .. }
            | DeviceMessage::DeviceError { source, .. }
            | DeviceMessage::PredicateChanged { source, .. }
            | DeviceMessage::BinaryReadyNotification { source, .. }
            | DeviceMessage::BinaryDataRequest { source, .. }
            | DeviceMessage::DeviceAttached { source, .. }
            | DeviceMessage::DeviceDetached { source, .. } => source,
        }
    }

    /// Device-clock timestamp of the message.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DeviceMessage::PropertyChanged { timestamp, .. }
            | DeviceMessage::Description { timestamp, .. }
            | DeviceMessage::LifecycleStateChanged { timestamp, .. }
            | DeviceMessage::DeviceError { timestamp, .. }
            | DeviceMessage::PredicateChanged { timestamp, .. }
            | DeviceMessage::BinaryReadyNotification { timestamp, .. }
            | DeviceMessage::BinaryDataRequest { timestamp, .. }
            | DeviceMessage::DeviceAttached { timestamp, .. }
            | DeviceMessage::DeviceDetached { timestamp, .. } => *timestamp,
        }
    }

    /// Discriminator used on the wire and in topics.
    pub fn message_type(&self) -> &'static str {
        match self {
            DeviceMessage::PropertyChanged { .. } => "PropertyChanged",
            DeviceMessage::Description { .. } => "Description",
            DeviceMessage::LifecycleStateChanged { .. } => "LifecycleStateChanged",
            DeviceMessage::DeviceError { .. } => "DeviceError",
            DeviceMessage::PredicateChanged { .. } => "PredicateChanged",
            DeviceMessage::BinaryReadyNotification { .. } => "BinaryReadyNotification",
            DeviceMessage::BinaryDataRequest { .. } => "BinaryDataRequest",
            DeviceMessage::DeviceAttached { .. } => "DeviceAttached",
            DeviceMessage::DeviceDetached { .. } => "DeviceDetached",
        }
    }

    /// Default broker topic: the device name followed by the message
    /// type, e.g. `motor.axis.PropertyChanged`.
    pub fn topic(&self) -> Name {
        self.source()
            .device
            .child(NameToken::new(self.message_type()))
    }
}

/// One entry of the hub's hot event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHubEvent {
    /// Route of the hub that observed the message.
    pub hub: Name,
    /// The message itself.
    pub message: DeviceMessage,
}
