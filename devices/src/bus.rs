// Copyright 2021 Computer Architecture and Systems Lab
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Port and memory mapped I/O dispatch.
//!
//! A trapped guest access is routed to the handler that owns the address.
//! Ranges are kept in an ordered map whose keys compare equal when they
//! overlap, so a lookup with a one byte probe finds the owning range and an
//! insertion of an overlapping range is detected as an occupied entry.
use crate::event::EventChannel;
use parking_lot::RwLock;
use std::collections::btree_map::{BTreeMap, Entry};
use std::cmp::Ordering;
use std::sync::Arc;

/// Handler of trapped accesses.
///
/// `offset` is relative to the base of the range the handler was mapped at.
/// Handlers take `&self` because several vCPUs may access the same device at
/// once; they synchronize internally.
pub trait BusDevice
where
    Self: Send + Sync,
{
    fn read(&self, offset: u64, data: &mut [u8]);
    fn write(&self, offset: u64, data: &[u8]);
}

/// Representation of interval.
///
/// This implements interval tree by overloading PartialOrd, Ord, PartialEq, and Eq with ordered map (BTreeMap).
#[derive(Eq, Clone, Copy)]
pub struct BusRange {
    // [base, base + len)
    pub base: u64,
    pub len: u64,
}

impl BusRange {
    /// Create a new BusRange.
    #[inline(always)]
    pub fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }
}

impl core::fmt::Debug for BusRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        write!(f, "BusRange[{:#x}, {:#x})", self.base, self.end())
    }
}

impl core::cmp::Ord for BusRange {
    fn cmp(&self, other: &Self) -> Ordering {
        let has_overlapping = self.base < other.end() && self.end() > other.base;
        if has_overlapping {
            Ordering::Equal
        } else {
            self.base.cmp(&other.base)
        }
    }
}

impl core::cmp::PartialOrd for BusRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl core::cmp::PartialEq for BusRange {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("{0:?} overlaps an existing range")]
    Overlap(BusRange),
    #[error("empty range at {0:#x}")]
    Empty(u64),
    #[error("no range is mapped at {0:#x}")]
    NotMapped(u64),
    #[error("host refused the request: {0}")]
    Host(String),
}

/// An address space of trapped I/O.
pub struct Bus {
    name: &'static str,
    inner: RwLock<BTreeMap<BusRange, Arc<dyn BusDevice>>>,
}

impl Bus {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    /// Map `device` at `[base, base + len)`.
    pub fn insert(&self, base: u64, len: u64, device: Arc<dyn BusDevice>) -> Result<(), BusError> {
        if len == 0 {
            return Err(BusError::Empty(base));
        }
        let range = BusRange::new(base, len);
        match self.inner.write().entry(range) {
            Entry::Occupied(o) => Err(BusError::Overlap(*o.key())),
            Entry::Vacant(v) => {
                log::debug!("{}: map {:?}", self.name, range);
                v.insert(device);
                Ok(())
            }
        }
    }

    /// Unmap the range that starts at `base`.
    pub fn remove(&self, base: u64) -> Result<Arc<dyn BusDevice>, BusError> {
        let mut inner = self.inner.write();
        let probe = BusRange::new(base, 1);
        match inner.get_key_value(&probe) {
            Some((range, _)) if range.base == base => {
                log::debug!("{}: unmap {:?}", self.name, range);
                inner.remove(&probe).ok_or(BusError::NotMapped(base))
            }
            _ => Err(BusError::NotMapped(base)),
        }
    }

    fn resolve(&self, addr: u64) -> Option<(u64, Arc<dyn BusDevice>)> {
        // The lock is released before the handler runs. Handlers may remap
        // this bus (e.g. a BAR reprogrammed through config space).
        self.inner
            .read()
            .get_key_value(&BusRange::new(addr, 1))
            .map(|(range, dev)| (addr - range.base, dev.clone()))
    }

    /// Dispatch a read. Unclaimed reads float high.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> bool {
        match self.resolve(addr) {
            Some((offset, dev)) => {
                dev.read(offset, data);
                true
            }
            None => {
                log::trace!("{}: unclaimed read at {:#x}", self.name, addr);
                data.fill(0xff);
                false
            }
        }
    }

    /// Dispatch a write. Unclaimed writes are dropped.
    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        match self.resolve(addr) {
            Some((offset, dev)) => {
                dev.write(offset, data);
                true
            }
            None => {
                log::trace!("{}: unclaimed write at {:#x}", self.name, addr);
                false
            }
        }
    }
}

/// Which trapped address space an access or a range belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoSpace {
    Port,
    Memory,
}

/// Collaborator that owns the guest's I/O address spaces.
///
/// Devices map and unmap their windows through it, e.g. when the guest
/// (re)programs a BAR.
pub trait IoDispatch
where
    Self: Send + Sync,
{
    fn map(&self, space: IoSpace, base: u64, len: u64, device: Arc<dyn BusDevice>) -> Result<(), BusError>;

    fn unmap(&self, space: IoSpace, base: u64) -> Result<(), BusError>;

    /// Deliver guest writes to `addr` straight to `event`, bypassing the
    /// trap path.
    ///
    /// Returns `false` if the dispatcher can not do so; the trapped write then
    /// still reaches the mapped handler.
    fn attach_notify(&self, _space: IoSpace, _addr: u64, _event: &EventChannel) -> Result<bool, BusError> {
        Ok(false)
    }

    fn detach_notify(&self, _space: IoSpace, _addr: u64, _event: &EventChannel) -> Result<(), BusError> {
        Ok(())
    }
}

/// The port and memory buses of one virtual machine.
pub struct IoBuses {
    pub pio: Bus,
    pub mmio: Bus,
}

impl IoBuses {
    pub fn new() -> Self {
        Self {
            pio: Bus::new("pio"),
            mmio: Bus::new("mmio"),
        }
    }

    #[inline]
    pub fn bus(&self, space: IoSpace) -> &Bus {
        match space {
            IoSpace::Port => &self.pio,
            IoSpace::Memory => &self.mmio,
        }
    }
}

impl Default for IoBuses {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDispatch for IoBuses {
    fn map(&self, space: IoSpace, base: u64, len: u64, device: Arc<dyn BusDevice>) -> Result<(), BusError> {
        self.bus(space).insert(base, len, device)
    }

    fn unmap(&self, space: IoSpace, base: u64) -> Result<(), BusError> {
        self.bus(space).remove(base).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl BusDevice for Recorder {
        fn read(&self, offset: u64, data: &mut [u8]) {
            data.fill(offset as u8);
        }
        fn write(&self, offset: u64, data: &[u8]) {
            self.writes.lock().push((offset, data.to_vec()));
        }
    }

    #[test]
    fn dispatch_by_offset() {
        let bus = Bus::new("test");
        let dev = Arc::new(Recorder::default());
        bus.insert(0x1000, 0x100, dev.clone()).unwrap();
        assert!(bus.write(0x1010, &[1, 2]));
        let mut b = [0; 2];
        assert!(bus.read(0x10ff, &mut b));
        assert_eq!(b, [0xff, 0xff]);
        assert!(bus.read(0x1004, &mut b));
        assert_eq!(b, [4, 4]);
        assert_eq!(dev.writes.lock().as_slice(), &[(0x10, vec![1, 2])]);
    }

    #[test]
    fn unclaimed_access() {
        let bus = Bus::new("test");
        bus.insert(0x1000, 0x100, Arc::new(Recorder::default())).unwrap();
        let mut b = [0; 4];
        assert!(!bus.read(0x1100, &mut b));
        assert_eq!(b, [0xff; 4]);
        assert!(!bus.write(0xfff, &[0]));
    }

    #[test]
    fn overlap_is_rejected() {
        let bus = Bus::new("test");
        bus.insert(0x1000, 0x100, Arc::new(Recorder::default())).unwrap();
        assert!(matches!(
            bus.insert(0x10f0, 0x20, Arc::new(Recorder::default())),
            Err(BusError::Overlap(_))
        ));
        assert!(bus.insert(0x1100, 0x20, Arc::new(Recorder::default())).is_ok());
        assert!(matches!(bus.insert(0x2000, 0, Arc::new(Recorder::default())), Err(BusError::Empty(_))));
    }

    #[test]
    fn remove_requires_base() {
        let bus = Bus::new("test");
        bus.insert(0x1000, 0x100, Arc::new(Recorder::default())).unwrap();
        assert!(matches!(bus.remove(0x1010), Err(BusError::NotMapped(_))));
        assert!(bus.remove(0x1000).is_ok());
        assert!(!bus.write(0x1000, &[0]));
    }
}
