//! Device addresses
//!
//! An [`Address`] pairs a hub-identifying route with a device name local
//! to that hub. Textual form is `route::device`.

use super::name::{Name, NameError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing textual addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address '{0}' is missing the '::' separator")]
    MissingSeparator(String),

    #[error("invalid route in address: {0}")]
    InvalidRoute(NameError),

    #[error("invalid device name in address: {0}")]
    InvalidDevice(NameError),
}

/// Location of a device: the hub route plus the hub-local device name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// Hub-identifying route.
    pub route: Name,
    /// Device name local to that hub.
    pub device: Name,
}

impl Address {
    /// Create an address from its parts.
    pub fn new(route: Name, device: Name) -> Self {
        Self { route, device }
    }

    /// Address of a child component of this device.
    pub fn child(&self, token: impl Into<super::name::NameToken>) -> Address {
        Address {
            route: self.route.clone(),
            device: self.device.child(token),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.route, self.device)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (route, device) = s
            .split_once("::")
            .ok_or_else(|| AddressError::MissingSeparator(s.to_string()))?;
        Ok(Address {
            route: Name::parse(route).map_err(AddressError::InvalidRoute)?,
            device: Name::parse(device).map_err(AddressError::InvalidDevice)?,
        })
    }
}
