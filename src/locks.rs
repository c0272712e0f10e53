//! Per-license mutual exclusion
//!
//! At most one mutation per license is in flight. Each license gets its own mutex,
//! created on first use; operations on different licenses never contend.
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::error::EngineError;
use crate::types::LicenseId;

/// What a caller does when the license it wants is locked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Return [`EngineError::LicenseBusy`] at once
    FailFast,
    /// Wait up to the given time, then return [`EngineError::LicenseBusy`]
    Wait(Duration),
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::Wait(Duration::from_millis(250))
    }
}

/// Held for the duration of one mutation; released on drop
pub struct LicenseGuard {
    license_id: LicenseId,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl LicenseGuard {
    pub fn license_id(&self) -> &LicenseId {
        &self.license_id
    }
}

impl Drop for LicenseGuard {
    fn drop(&mut self) {
        tracing::trace!(license_id = %self.license_id, "license lock released");
    }
}

#[derive(Default)]
pub struct LockRegistry {
    locks: DashMap<LicenseId, Arc<Mutex<()>>>,
    mode: LockMode,
}

impl LockRegistry {
    pub fn new(mode: LockMode) -> Self {
        Self {
            locks: DashMap::new(),
            mode,
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn acquire(&self, license_id: &LicenseId) -> Result<LicenseGuard, EngineError> {
        self.acquire_with(license_id, self.mode)
    }

    pub fn acquire_with(
        &self,
        license_id: &LicenseId,
        mode: LockMode,
    ) -> Result<LicenseGuard, EngineError> {
        // clone the mutex out so the map shard is not held while waiting
        let lock = self
            .locks
            .entry(license_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = match mode {
            LockMode::FailFast => lock.try_lock_arc(),
            LockMode::Wait(timeout) => lock.try_lock_arc_for(timeout),
        };

        match guard {
            Some(guard) => {
                tracing::trace!(license_id = %license_id, "license lock acquired");
                Ok(LicenseGuard {
                    license_id: license_id.clone(),
                    _guard: guard,
                })
            }
            None => {
                tracing::debug!(license_id = %license_id, ?mode, "license is busy");
                Err(EngineError::LicenseBusy(license_id.clone()))
            }
        }
    }
}
