//! Device lease pool.
//!
//! A [`DevicePool`] owns a fixed set of device contexts created once at
//! startup. Device-resident indexes borrow a context for the duration of
//! one logical operation through a [`Lease`]:
//!
//! - a lease is exclusive: while it is alive no other lease can be taken
//!   on the same slot;
//! - a lease is reference counted; dropping the last clone returns the
//!   slot and wakes one waiter;
//! - [`WeakLease`] observes a lease without keeping the slot.
//!
//! ```
//! use annex::{DevicePool, DevicePoolConfig};
//!
//! let pool = DevicePool::new(DevicePoolConfig::with_device_count(2)).unwrap();
//! let lease = pool.acquire().unwrap();
//! assert_eq!(pool.available(), 1);
//! drop(lease);
//! assert_eq!(pool.available(), 2);
//! ```

use crate::config::DevicePoolConfig;
use crate::error::{AnnexError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One compute device and its memory budget.
#[derive(Debug)]
pub struct DeviceContext {
    id: u32,
    memory_bytes: usize,
    used: AtomicUsize,
}

impl DeviceContext {
    fn new(id: u32, memory_bytes: usize) -> Self {
        Self {
            id,
            memory_bytes,
            used: AtomicUsize::new(0),
        }
    }

    /// Device ordinal.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Total memory budget in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    /// Bytes currently allocated.
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes still available.
    pub fn free_bytes(&self) -> usize {
        self.memory_bytes.saturating_sub(self.used_bytes())
    }

    /// Reserve `bytes` of device memory. The reservation is freed when the
    /// returned [`DeviceAllocation`] is dropped.
    pub fn allocate(self: &Arc<Self>, bytes: usize) -> Result<DeviceAllocation> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(bytes)
                .filter(|&next| next <= self.memory_bytes)
                .ok_or_else(|| {
                    AnnexError::device(format!(
                        "out of memory on device {}: requested {bytes} bytes, {} free",
                        self.id,
                        self.memory_bytes.saturating_sub(current)
                    ))
                })?;
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Ok(DeviceAllocation {
                        device: Arc::clone(self),
                        bytes,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// A reservation of device memory, freed on drop.
#[derive(Debug)]
pub struct DeviceAllocation {
    device: Arc<DeviceContext>,
    bytes: usize,
}

impl DeviceAllocation {
    /// Reserved size in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Device holding the reservation.
    pub fn device_id(&self) -> u32 {
        self.device.id
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.device.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct PoolState {
    in_use: Vec<bool>,
    any_waiters: usize,
    slot_waiters: Vec<usize>,
}

impl PoolState {
    fn free_slot(&self) -> Option<usize> {
        self.in_use.iter().position(|&used| !used)
    }
}

struct PoolShared {
    devices: Vec<Arc<DeviceContext>>,
    state: Mutex<PoolState>,
    any_free: Condvar,
    slot_free: Vec<Condvar>,
    timeout: Duration,
}

impl PoolShared {
    fn release_slot(&self, slot: usize) {
        let mut state = self.state.lock();
        if !state.in_use[slot] {
            return;
        }
        state.in_use[slot] = false;
        debug!(device = self.devices[slot].id, "device lease released");
        // a waiter pinned to this device takes precedence; otherwise wake one
        // waiter that accepts any device
        let woke = state.slot_waiters[slot] > 0 && self.slot_free[slot].notify_one();
        if !woke && state.any_waiters > 0 {
            self.any_free.notify_one();
        }
    }
}

/// Fixed set of device contexts leased one operation at a time.
#[derive(Clone)]
pub struct DevicePool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("timeout", &self.shared.timeout)
            .finish()
    }
}

impl DevicePool {
    /// Create every device context up front. Any invalid device makes the
    /// whole pool fail to start.
    pub fn new(config: DevicePoolConfig) -> Result<Self> {
        if config.devices.is_empty() {
            return Err(AnnexError::device("device pool needs at least one device"));
        }
        let mut seen = HashSet::new();
        for spec in &config.devices {
            if !seen.insert(spec.id) {
                return Err(AnnexError::device(format!("duplicate device id {}", spec.id)));
            }
            if spec.memory_bytes == 0 {
                return Err(AnnexError::device(format!(
                    "device {} has no memory budget",
                    spec.id
                )));
            }
        }

        let devices: Vec<Arc<DeviceContext>> = config
            .devices
            .iter()
            .map(|spec| Arc::new(DeviceContext::new(spec.id, spec.memory_bytes)))
            .collect();
        let n = devices.len();
        debug!(devices = n, timeout_ms = config.acquire_timeout_ms, "device pool started");

        Ok(Self {
            shared: Arc::new(PoolShared {
                devices,
                state: Mutex::new(PoolState {
                    in_use: vec![false; n],
                    any_waiters: 0,
                    slot_waiters: vec![0; n],
                }),
                any_free: Condvar::new(),
                slot_free: (0..n).map(|_| Condvar::new()).collect(),
                timeout: config.acquire_timeout(),
            }),
        })
    }

    /// Number of device slots.
    pub fn capacity(&self) -> usize {
        self.shared.devices.len()
    }

    /// Number of slots not currently leased.
    pub fn available(&self) -> usize {
        self.shared.state.lock().in_use.iter().filter(|&&u| !u).count()
    }

    /// Ids of all devices, in slot order.
    pub fn device_ids(&self) -> Vec<u32> {
        self.shared.devices.iter().map(|d| d.id).collect()
    }

    /// Context of device `id`, for status queries.
    pub fn device(&self, id: u32) -> Option<Arc<DeviceContext>> {
        self.shared.devices.iter().find(|d| d.id == id).cloned()
    }

    /// Lease any free device, waiting up to the configured timeout.
    pub fn acquire(&self) -> Result<Lease> {
        let deadline = Instant::now() + self.shared.timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(slot) = state.free_slot() {
                state.in_use[slot] = true;
                return Ok(self.lease(slot));
            }
            if self.shared.timeout.is_zero() {
                warn!("device pool exhausted");
                return Err(AnnexError::ResourceExhausted);
            }
            if Instant::now() >= deadline {
                warn!(timeout = ?self.shared.timeout, "timed out waiting for a device");
                return Err(AnnexError::Timeout);
            }
            state.any_waiters += 1;
            self.shared.any_free.wait_until(&mut state, deadline);
            state.any_waiters -= 1;
        }
    }

    /// Lease the specific device `id`, waiting up to the configured timeout.
    pub fn acquire_device(&self, id: u32) -> Result<Lease> {
        let slot = self.slot_of(id)?;
        let deadline = Instant::now() + self.shared.timeout;
        let mut state = self.shared.state.lock();
        loop {
            if !state.in_use[slot] {
                state.in_use[slot] = true;
                return Ok(self.lease(slot));
            }
            if self.shared.timeout.is_zero() {
                warn!(device = id, "device busy");
                return Err(AnnexError::ResourceExhausted);
            }
            if Instant::now() >= deadline {
                warn!(device = id, timeout = ?self.shared.timeout, "timed out waiting for device");
                return Err(AnnexError::Timeout);
            }
            state.slot_waiters[slot] += 1;
            self.shared.slot_free[slot].wait_until(&mut state, deadline);
            state.slot_waiters[slot] -= 1;
        }
    }

    /// Lease a free device if one is available right now.
    pub fn try_acquire(&self) -> Option<Lease> {
        let mut state = self.shared.state.lock();
        let slot = state.free_slot()?;
        state.in_use[slot] = true;
        Some(self.lease(slot))
    }

    /// Give a lease back. The slot is returned once every clone is gone.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Run `f` while holding a lease on any device. The slot is returned on
    /// every exit path, including a panic inside `f`.
    pub fn with_lease<R>(&self, f: impl FnOnce(&Lease) -> Result<R>) -> Result<R> {
        let lease = self.acquire()?;
        f(&lease)
    }

    /// Run `f` while holding a lease on device `id`.
    pub fn with_device<R>(&self, id: u32, f: impl FnOnce(&Lease) -> Result<R>) -> Result<R> {
        let lease = self.acquire_device(id)?;
        f(&lease)
    }

    fn slot_of(&self, id: u32) -> Result<usize> {
        self.shared
            .devices
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| AnnexError::device(format!("unknown device id {id}")))
    }

    fn lease(&self, slot: usize) -> Lease {
        let device = Arc::clone(&self.shared.devices[slot]);
        debug!(device = device.id, "device lease acquired");
        Lease {
            inner: Arc::new(LeaseInner {
                slot,
                device,
                pool: Arc::clone(&self.shared),
            }),
        }
    }
}

struct LeaseInner {
    slot: usize,
    device: Arc<DeviceContext>,
    pool: Arc<PoolShared>,
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        self.pool.release_slot(self.slot);
    }
}

/// Exclusive, reference-counted grant of one device slot.
#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("device", &self.inner.device.id)
            .finish()
    }
}

impl Lease {
    /// The leased device.
    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.inner.device
    }

    /// Ordinal of the leased device.
    pub fn device_id(&self) -> u32 {
        self.inner.device.id
    }

    /// A handle that observes this lease without extending it.
    pub fn downgrade(&self) -> WeakLease {
        WeakLease {
            inner: Arc::downgrade(&self.inner),
            device_id: self.inner.device.id,
        }
    }
}

/// Non-owning back-reference to a lease, for status checks.
#[derive(Clone, Debug)]
pub struct WeakLease {
    inner: Weak<LeaseInner>,
    device_id: u32,
}

impl Default for WeakLease {
    fn default() -> Self {
        Self {
            inner: Weak::new(),
            device_id: 0,
        }
    }
}

impl WeakLease {
    /// True while some clone of the originating lease is alive.
    pub fn is_active(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Device the lease was taken on.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}
