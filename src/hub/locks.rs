//! Lease-based locking
//!
//! The hub owns a lock table keyed by `(address, resource)`. Leases are
//! time-bounded: expired leases are purged on the next operation touching
//! the resource. `SharedRead` composes with other shared holders;
//! `ExclusiveWrite` excludes everything. Re-acquiring with the same token
//! renews the lease.

use crate::descriptor::LockMode;
use crate::error::DeviceError;
use crate::meta::{Address, Name};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Opaque lease token handed to the lock owner.
pub type LockToken = Uuid;

#[derive(Debug, Clone)]
struct Lease {
    token: LockToken,
    principal: String,
    mode: LockMode,
    expires_at: DateTime<Utc>,
}

/// Table of active leases.
#[derive(Default)]
pub struct LockTable {
    leases: Mutex<HashMap<(Address, Name), Vec<Lease>>>,
}

impl LockTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lease. Returns a fresh token, or renews when the caller
    /// already holds the resource under `renew_token`.
    pub fn acquire(
        &self,
        address: &Address,
        resource: &Name,
        mode: LockMode,
        duration: Duration,
        principal: &str,
        renew_token: Option<LockToken>,
    ) -> Result<LockToken, DeviceError> {
        let mut table = self.leases.lock().expect("lock table poisoned");
        let key = (address.clone(), resource.clone());
        let now = Utc::now();
        let leases = table.entry(key).or_default();
        leases.retain(|lease| lease.expires_at > now);

        let expires_at = now
            + chrono::Duration::from_std(duration)
                .map_err(|e| DeviceError::Validation(format!("bad lease duration: {e}")))?;

        if let Some(token) = renew_token {
            if let Some(lease) = leases.iter_mut().find(|l| l.token == token) {
                lease.expires_at = expires_at;
                return Ok(token);
            }
        }

        let conflict = leases.iter().any(|lease| {
            mode == LockMode::ExclusiveWrite || lease.mode == LockMode::ExclusiveWrite
        });
        if conflict {
            return Err(DeviceError::Lock {
                resource: format!("{address}/{resource}"),
                reason: "held in a conflicting mode".into(),
            });
        }

        let token = Uuid::new_v4();
        leases.push(Lease {
            token,
            principal: principal.to_string(),
            mode,
            expires_at,
        });
        Ok(token)
    }

    /// Release a lease by token. Unknown tokens are lock errors.
    pub fn release(&self, token: LockToken) -> Result<(), DeviceError> {
        let mut table = self.leases.lock().expect("lock table poisoned");
        for leases in table.values_mut() {
            let before = leases.len();
            leases.retain(|lease| lease.token != token);
            if leases.len() < before {
                return Ok(());
            }
        }
        Err(DeviceError::Lock {
            resource: "<unknown>".into(),
            reason: format!("no lease for token {token}"),
        })
    }

    /// Drop every lease on a resource, regardless of holder.
    pub fn force_release(&self, address: &Address, resource: &Name) -> usize {
        let mut table = self.leases.lock().expect("lock table poisoned");
        match table.get_mut(&(address.clone(), resource.clone())) {
            Some(leases) => {
                let count = leases.len();
                leases.clear();
                count
            }
            None => 0,
        }
    }

    /// Drop every lease held by a principal; used on owner-scope
    /// cancellation.
    pub fn release_principal(&self, principal: &str) -> usize {
        let mut table = self.leases.lock().expect("lock table poisoned");
        let mut released = 0;
        for leases in table.values_mut() {
            let before = leases.len();
            leases.retain(|lease| lease.principal != principal);
            released += before - leases.len();
        }
        released
    }

    /// Check that an operation on a resource may proceed under `mode`:
    /// either the caller presents a valid token, or the resource is free
    /// enough for a transient acquisition. Returns a transient token to
    /// release after the operation, or `None` when the caller's own lease
    /// covers it.
    pub fn check_or_acquire_transient(
        &self,
        address: &Address,
        resource: &Name,
        mode: LockMode,
        principal: &str,
        held: &[LockToken],
    ) -> Result<Option<LockToken>, DeviceError> {
        {
            let mut table = self.leases.lock().expect("lock table poisoned");
            let key = (address.clone(), resource.clone());
            let now = Utc::now();
            if let Some(leases) = table.get_mut(&key) {
                leases.retain(|lease| lease.expires_at > now);
                let covered = leases.iter().any(|lease| {
                    held.contains(&lease.token)
                        && (lease.mode == LockMode::ExclusiveWrite || lease.mode == mode)
                });
                if covered {
                    return Ok(None);
                }
            }
        }
        let token = self.acquire(
            address,
            resource,
            mode,
            Duration::from_secs(5),
            principal,
            None,
        )?;
        Ok(Some(token))
    }

    /// Active lease count for a resource (expired leases ignored).
    pub fn active_leases(&self, address: &Address, resource: &Name) -> usize {
        let table = self.leases.lock().expect("lock table poisoned");
        let now = Utc::now();
        table
            .get(&(address.clone(), resource.clone()))
            .map(|leases| leases.iter().filter(|l| l.expires_at > now).count())
            .unwrap_or(0)
    }
}
