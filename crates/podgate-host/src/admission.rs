//! Memory admission
//!
//! [`admit`] is the capacity rule. [`MemoryGate`] applies it and books the
//! memory in a single compare-and-swap, so concurrent uploads cannot jointly
//! overshoot the limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tracing::debug;

/// Bytes per MiB
pub const MIB: u64 = 1 << 20;

/// Whether `requested_mib` more fits under `max_fraction` of `total_bytes`
/// given `used_mib` already booked. A zero total admits nothing.
pub fn admit(requested_mib: u64, used_mib: u64, total_bytes: u64, max_fraction: f64) -> bool {
    if total_bytes == 0 {
        return false;
    }
    let needed = used_mib.saturating_add(requested_mib) as f64 * MIB as f64;
    needed / total_bytes as f64 <= max_fraction
}

/// Shared memory usage counter with atomic admission
#[derive(Debug)]
pub struct MemoryGate {
    used_mib: Arc<AtomicU64>,
    total_bytes: u64,
    max_fraction: f64,
}

impl MemoryGate {
    pub fn new(total_bytes: u64, max_fraction: f64) -> Self {
        Self {
            used_mib: Arc::new(AtomicU64::new(0)),
            total_bytes,
            max_fraction,
        }
    }

    /// Gate sized to the memory the operating system reports
    pub fn from_system(max_fraction: f64) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        debug!(total_bytes = sys.total_memory(), "host memory detected");
        Self::new(sys.total_memory(), max_fraction)
    }

    /// Book `mib` if it fits. The booking is undone when the returned
    /// reservation is dropped without [`MemoryReservation::commit`].
    pub fn try_reserve(&self, mib: u64) -> Option<MemoryReservation> {
        self.used_mib
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                admit(mib, used, self.total_bytes, self.max_fraction).then_some(used + mib)
            })
            .ok()
            .map(|_| MemoryReservation {
                used_mib: self.used_mib.clone(),
                mib,
                committed: false,
            })
    }

    /// Return memory held by a pod that has exited
    pub fn release(&self, mib: u64) {
        release(&self.used_mib, mib);
    }

    pub fn used_mib(&self) -> u64 {
        self.used_mib.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

fn release(counter: &AtomicU64, mib: u64) {
    // saturating so a double release cannot wrap
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
        Some(used.saturating_sub(mib))
    });
}

/// Memory booked for a pod that has not started yet
#[derive(Debug)]
#[must_use = "dropping a reservation releases it"]
pub struct MemoryReservation {
    used_mib: Arc<AtomicU64>,
    mib: u64,
    committed: bool,
}

impl MemoryReservation {
    pub fn mib(&self) -> u64 {
        self.mib
    }

    /// Hand the memory to the running pod
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if !self.committed {
            release(&self.used_mib, self.mib);
        }
    }
}
