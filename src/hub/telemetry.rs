//! Telemetry subscriptions
//!
//! A telemetry subscription is a filtered, hot view of property traffic:
//! pick devices by name pattern and optionally restrict to a property
//! subset; packets carry the raw timestamped value and its quality.

use crate::message::{DeviceHubEvent, DeviceMessage};
use crate::meta::{Meta, Name};
use crate::runtime::DeviceScope;
use crate::state::Quality;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::{broadcast, mpsc};

/// What a telemetry subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFilter {
    /// Device name pattern (`*`/trailing `**`).
    pub devices: Name,
    /// Property subset; `None` means every property.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub properties: Option<BTreeSet<Name>>,
}

impl TelemetryFilter {
    /// Everything from devices matching a pattern.
    pub fn devices(pattern: impl Into<Name>) -> Self {
        Self {
            devices: pattern.into(),
            properties: None,
        }
    }

    /// Restrict to a property subset.
    pub fn with_property(mut self, property: impl Into<Name>) -> Self {
        self.properties
            .get_or_insert_with(BTreeSet::new)
            .insert(property.into());
        self
    }

    fn accepts(&self, device: &Name, property: &Name) -> bool {
        device.matches(&self.devices)
            && self
                .properties
                .as_ref()
                .map(|subset| subset.contains(property))
                .unwrap_or(true)
    }
}

/// One telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    /// Source device.
    pub device: Name,
    /// Property that changed.
    pub property: Name,
    /// Raw value.
    pub value: Meta,
    /// Quality of the reading.
    pub quality: Quality,
    /// Device-clock timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Spawn a forwarder from the hub event stream into a bounded telemetry
/// channel. Packets for one `(device, property)` pair arrive in
/// timestamp order because the source stream is already ordered per
/// property.
pub fn spawn_telemetry_forwarder(
    scope: &DeviceScope,
    mut events: broadcast::Receiver<DeviceHubEvent>,
    filter: TelemetryFilter,
) -> mpsc::Receiver<TelemetryPacket> {
    let (tx, rx) = mpsc::channel(64);
    scope.spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "telemetry subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let DeviceMessage::PropertyChanged {
                source,
                property,
                value,
                quality,
                timestamp,
            } = event.message
            else {
                continue;
            };
            if !filter.accepts(&source.device, &property) {
                continue;
            }
            let packet = TelemetryPacket {
                device: source.device,
                property,
                value,
                quality,
                timestamp,
            };
            if tx.send(packet).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_device_pattern() {
        let filter = TelemetryFilter::devices("sensors.**");
        assert!(filter.accepts(&"sensors.temp".into(), &"value".into()));
        assert!(!filter.accepts(&"actuators.motor".into(), &"value".into()));
    }

    #[test]
    fn test_filter_property_subset() {
        let filter = TelemetryFilter::devices("**").with_property("position");
        assert!(filter.accepts(&"m".into(), &"position".into()));
        assert!(!filter.accepts(&"m".into(), &"velocity".into()));
    }
}
