//! Timestamped, quality-tagged values
//!
//! Every reading in the state graph is a [`StateValue`]: an optional
//! payload plus the instant it was produced and a [`Quality`] tag.
//! Combining readings takes the newest timestamp and the worst quality.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quality of a reading, ordered from best to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
pub enum Quality {
    /// Fresh and trustworthy.
    Ok,
    /// Valid but past its expected refresh interval.
    Stale,
    /// Present but known to violate its contract.
    Invalid,
    /// Produced by a failing computation or source.
    Error,
}

impl Quality {
    /// Worst of two qualities.
    pub fn worst(self, other: Quality) -> Quality {
        self.max(other)
    }
}

/// A reading: optional value, production instant, quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateValue<T> {
    /// The payload; `None` when nothing has been produced yet.
    pub value: Option<T>,
    /// When the reading was produced.
    pub timestamp: DateTime<Utc>,
    /// Trustworthiness of the reading.
    pub quality: Quality,
}

impl<T> StateValue<T> {
    /// A fresh `Ok` reading stamped now.
    pub fn now(value: T) -> Self {
        Self {
            value: Some(value),
            timestamp: Utc::now(),
            quality: Quality::Ok,
        }
    }

    /// An empty reading stamped now.
    pub fn empty() -> Self {
        Self {
            value: None,
            timestamp: Utc::now(),
            quality: Quality::Ok,
        }
    }

    /// A reading with explicit parts.
    pub fn new(value: Option<T>, timestamp: DateTime<Utc>, quality: Quality) -> Self {
        Self { value, timestamp, quality }
    }

    /// Same reading with a different quality.
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Map the payload, keeping timestamp and quality.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StateValue<U> {
        StateValue {
            value: self.value.map(f),
            timestamp: self.timestamp,
            quality: self.quality,
        }
    }

    /// Borrowed view of the payload.
    pub fn as_ref(&self) -> StateValue<&T> {
        StateValue {
            value: self.value.as_ref(),
            timestamp: self.timestamp,
            quality: self.quality,
        }
    }
}

/// Combination metadata for a set of input readings: newest timestamp,
/// worst quality.
pub fn combine_meta<T>(inputs: &[&StateValue<T>]) -> (DateTime<Utc>, Quality) {
    let timestamp = inputs
        .iter()
        .map(|sv| sv.timestamp)
        .max()
        .unwrap_or_else(Utc::now);
    let quality = inputs
        .iter()
        .map(|sv| sv.quality)
        .max()
        .unwrap_or(Quality::Ok);
    (timestamp, quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_quality_order() {
        assert!(Quality::Ok < Quality::Stale);
        assert!(Quality::Stale < Quality::Invalid);
        assert!(Quality::Invalid < Quality::Error);
        assert_eq!(Quality::Ok.worst(Quality::Invalid), Quality::Invalid);
    }

    #[test]
    fn test_combine_meta_takes_max_timestamp_and_worst_quality() {
        let early = Utc.timestamp_opt(1_000, 0).unwrap();
        let late = Utc.timestamp_opt(2_000, 0).unwrap();
        let a = StateValue::new(Some(1.0), early, Quality::Stale);
        let b = StateValue::new(Some(2.0), late, Quality::Ok);
        let (ts, quality) = combine_meta(&[&a, &b]);
        assert_eq!(ts, late);
        assert_eq!(quality, Quality::Stale);
    }

    #[test]
    fn test_map_keeps_meta() {
        let reading = StateValue::now(2i64);
        let ts = reading.timestamp;
        let mapped = reading.map(|v| v * 10);
        assert_eq!(mapped.value, Some(20));
        assert_eq!(mapped.timestamp, ts);
        assert_eq!(mapped.quality, Quality::Ok);
    }
}
