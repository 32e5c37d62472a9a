//! Configuration mechanism #1.
//!
//! The guest writes a [`ConfigAddress`] into the 32-bit latch at port 0xcf8
//! and then accesses the selected dword through the data window at
//! 0xcfc..=0xcff. Only bus 0, function 0 is populated.
use super::{BarChange, BarRegion, PciDevice, PciError};
use crate::bus::{BusDevice, IoDispatch};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Port of the address latch.
pub const CONFIG_ADDRESS_PORT: u64 = 0xcf8;
/// Ports claimed by the mechanism: the latch and the data window.
pub const CONFIG_PORT_LEN: u64 = 8;

const NUM_SLOTS: usize = 32;

/// Content of the address latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigAddress(pub u32);

impl ConfigAddress {
    #[inline]
    pub const fn new(bus: u8, slot: u8, func: u8, offset: u8) -> Self {
        Self(
            0x8000_0000
                | ((bus as u32) << 16)
                | (((slot & 0x1f) as u32) << 11)
                | (((func & 0x7) as u32) << 8)
                | ((offset & 0xfc) as u32),
        )
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    #[inline]
    pub fn bus(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline]
    pub fn slot(&self) -> u8 {
        ((self.0 >> 11) & 0x1f) as u8
    }

    #[inline]
    pub fn function(&self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    #[inline]
    pub fn register(&self) -> usize {
        (self.0 & 0xfc) as usize
    }
}

pub struct PciBus {
    slots: RwLock<Vec<Option<Arc<dyn PciDevice>>>>,
    address: Mutex<ConfigAddress>,
    dispatch: Weak<dyn IoDispatch>,
    /// BAR windows currently mapped on the dispatcher, by slot and index.
    windows: Mutex<BTreeMap<(u8, u8), BarRegion>>,
}

impl PciBus {
    /// `dispatch` receives the BAR windows of every function on the bus.
    pub fn new(dispatch: Weak<dyn IoDispatch>) -> Self {
        Self {
            slots: RwLock::new(vec![None; NUM_SLOTS]),
            address: Mutex::new(ConfigAddress(0)),
            dispatch,
            windows: Mutex::new(BTreeMap::new()),
        }
    }

    /// Attach `device` to the first free slot, returning the slot number.
    pub fn add_device(&self, device: Arc<dyn PciDevice>) -> Result<u8, PciError> {
        let mut slots = self.slots.write();
        // Slot 0 is left for a host bridge.
        let slot = (1..NUM_SLOTS)
            .find(|i| slots[*i].is_none())
            .ok_or(PciError::BusFull)?;
        slots[slot] = Some(device);
        log::info!("pci: device attached at 00:{:02x}.0", slot);
        Ok(slot as u8)
    }

    fn device(&self, bus: u8, slot: u8, func: u8) -> Option<Arc<dyn PciDevice>> {
        if bus != 0 || func != 0 {
            return None;
        }
        self.slots.read().get(slot as usize).cloned().flatten()
    }

    /// Read `data.len()` bytes of the configuration space of `bus:slot.func`.
    /// Absent functions read as all-ones.
    pub fn config_read(&self, bus: u8, slot: u8, func: u8, offset: usize, data: &mut [u8]) {
        match self.device(bus, slot, func) {
            Some(dev) => dev.config_read(offset, data),
            None => data.fill(0xff),
        }
    }

    /// Write the configuration space of `bus:slot.func` and apply the
    /// resulting BAR changes.
    pub fn config_write(&self, bus: u8, slot: u8, func: u8, offset: usize, data: &[u8]) {
        if let Some(dev) = self.device(bus, slot, func) {
            let changes = dev.config_write(offset, data);
            if !changes.is_empty() {
                self.apply(slot, &*dev, &changes);
            }
        }
    }

    fn apply(&self, slot: u8, dev: &dyn PciDevice, changes: &[BarChange]) {
        let dispatch = match self.dispatch.upgrade() {
            Some(d) => d,
            None => return,
        };
        let mut windows = self.windows.lock();
        for change in changes {
            // Only what this bus mapped is unmapped; a BAR that failed to map
            // decodes nothing.
            let old = windows.remove(&(slot, change.index));
            if let Some(old) = old {
                if let Err(e) = dispatch.unmap(old.space, old.base) {
                    log::warn!("pci: failed to unmap BAR{}: {}", old.index, e);
                }
            }
            let new = change.new.filter(|new| match dev.bar_device(new.index) {
                Some(handler) => match dispatch.map(new.space, new.base, new.len, handler) {
                    Ok(()) => true,
                    Err(e) => {
                        // The guest programmed an overlapping window.
                        log::warn!("pci: failed to map BAR{} at {:#x}: {}", new.index, new.base, e);
                        false
                    }
                },
                None => false,
            });
            if let Some(new) = new {
                windows.insert((slot, change.index), new);
            }
            if old.is_some() || new.is_some() {
                let applied = BarChange {
                    index: change.index,
                    old,
                    new,
                };
                dev.bar_changed(&applied, &*dispatch);
            }
        }
    }
}

impl BusDevice for PciBus {
    fn read(&self, offset: u64, data: &mut [u8]) {
        match offset {
            0 if data.len() == 4 => data.copy_from_slice(&self.address.lock().0.to_le_bytes()),
            4..=7 => {
                let address = *self.address.lock();
                if !address.enabled() {
                    data.fill(0xff);
                    return;
                }
                self.config_read(
                    address.bus(),
                    address.slot(),
                    address.function(),
                    address.register() + (offset as usize - 4),
                    data,
                )
            }
            _ => data.fill(0xff),
        }
    }

    fn write(&self, offset: u64, data: &[u8]) {
        match offset {
            0 if data.len() == 4 => {
                let v = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                *self.address.lock() = ConfigAddress(v);
            }
            4..=7 => {
                let address = *self.address.lock();
                if address.enabled() {
                    self.config_write(
                        address.bus(),
                        address.slot(),
                        address.function(),
                        address.register() + (offset as usize - 4),
                        data,
                    )
                }
            }
            _ => log::trace!("pci: ignored write at cf8+{}", offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{IoBuses, IoSpace};
    use crate::pci::{BarKind, BarRegion, Command, PciConfigSpace, PciHeaderInfo};

    struct Dummy {
        config: Mutex<PciConfigSpace>,
        changes: Mutex<Vec<BarChange>>,
    }

    struct Window;

    impl BusDevice for Window {
        fn read(&self, offset: u64, data: &mut [u8]) {
            data.fill(offset as u8 + 1);
        }
        fn write(&self, _offset: u64, _data: &[u8]) {}
    }

    impl PciDevice for Dummy {
        fn config_read(&self, offset: usize, data: &mut [u8]) {
            self.config.lock().read(offset, data)
        }
        fn config_write(&self, offset: usize, data: &[u8]) -> Vec<BarChange> {
            self.config.lock().write(offset, data)
        }
        fn bar_device(&self, _index: u8) -> Option<Arc<dyn BusDevice>> {
            Some(Arc::new(Window))
        }
        fn bar_changed(&self, change: &BarChange, _dispatch: &dyn IoDispatch) {
            self.changes.lock().push(*change);
        }
    }

    fn setup() -> (Arc<IoBuses>, Arc<PciBus>, Arc<Dummy>) {
        let buses = Arc::new(IoBuses::new());
        let dispatch: Arc<dyn IoDispatch> = buses.clone();
        let pci = Arc::new(PciBus::new(Arc::downgrade(&dispatch)));
        buses.pio.insert(CONFIG_ADDRESS_PORT, CONFIG_PORT_LEN, pci.clone()).unwrap();
        let mut config = PciConfigSpace::new(PciHeaderInfo {
            vendor_id: 0x1af4,
            device_id: 0x1042,
            revision_id: 1,
            class_code: 0x01_80_00,
            subsystem_vendor_id: 0x1af4,
            subsystem_id: 2,
            interrupt_pin: 1,
            interrupt_line: 5,
        });
        config.add_bar(0, BarKind::Memory32 { prefetchable: false }, 0x1000).unwrap();
        let dev = Arc::new(Dummy {
            config: Mutex::new(config),
            changes: Mutex::new(Vec::new()),
        });
        assert_eq!(pci.add_device(dev.clone()).unwrap(), 1);
        (buses, pci, dev)
    }

    fn outl(buses: &IoBuses, port: u64, v: u32) {
        buses.pio.write(port, &v.to_le_bytes());
    }

    fn inl(buses: &IoBuses, port: u64) -> u32 {
        let mut b = [0; 4];
        buses.pio.read(port, &mut b);
        u32::from_le_bytes(b)
    }

    #[test]
    fn address_encoding() {
        let a = ConfigAddress::new(0, 3, 0, 0x12);
        assert_eq!(a.0, 0x8000_1810);
        assert_eq!((a.bus(), a.slot(), a.function(), a.register()), (0, 3, 0, 0x10));
        // The address latch reads back.
        let (buses, _pci, _dev) = setup();
        outl(&buses, 0xcf8, a.0);
        assert_eq!(inl(&buses, 0xcf8), a.0);
    }

    #[test]
    fn enumerate_through_ports() {
        let (buses, _pci, _dev) = setup();
        outl(&buses, 0xcf8, ConfigAddress::new(0, 1, 0, 0).0);
        assert_eq!(inl(&buses, 0xcfc), 0x1042_1af4);
        // Byte access inside the data window.
        let mut b = [0; 1];
        outl(&buses, 0xcf8, ConfigAddress::new(0, 1, 0, 0x3c).0);
        buses.pio.read(0xcfd, &mut b);
        assert_eq!(b[0], 1);
        // Empty slot and other functions.
        outl(&buses, 0xcf8, ConfigAddress::new(0, 2, 0, 0).0);
        assert_eq!(inl(&buses, 0xcfc), u32::MAX);
        outl(&buses, 0xcf8, ConfigAddress::new(0, 1, 1, 0).0);
        assert_eq!(inl(&buses, 0xcfc), u32::MAX);
        // Disabled latch.
        outl(&buses, 0xcf8, 0);
        assert_eq!(inl(&buses, 0xcfc), u32::MAX);
    }

    #[test]
    fn bar_is_mapped_on_enable() {
        let (buses, _pci, dev) = setup();
        outl(&buses, 0xcf8, ConfigAddress::new(0, 1, 0, 0x10).0);
        outl(&buses, 0xcfc, 0xfebf_0000);
        let mut b = [0; 1];
        assert!(!buses.mmio.read(0xfebf_0004, &mut b));

        outl(&buses, 0xcf8, ConfigAddress::new(0, 1, 0, 0x04).0);
        outl(&buses, 0xcfc, Command::MEMORY_SPACE.bits() as u32);
        assert!(buses.mmio.read(0xfebf_0004, &mut b));
        assert_eq!(b[0], 5);
        assert_eq!(
            dev.changes.lock().last().and_then(|c| c.new),
            Some(BarRegion {
                index: 0,
                space: IoSpace::Memory,
                base: 0xfebf_0000,
                len: 0x1000
            })
        );

        outl(&buses, 0xcfc, 0);
        assert!(!buses.mmio.read(0xfebf_0004, &mut b));
    }

    #[test]
    fn overlapping_bar_is_reported_unmapped() {
        let (buses, _pci, dev) = setup();
        buses.mmio.insert(0xfeb0_0000, 0x1000, Arc::new(Window)).unwrap();
        outl(&buses, 0xcf8, ConfigAddress::new(0, 1, 0, 0x10).0);
        outl(&buses, 0xcfc, 0xfebf_0000);
        outl(&buses, 0xcf8, ConfigAddress::new(0, 1, 0, 0x04).0);
        outl(&buses, 0xcfc, Command::MEMORY_SPACE.bits() as u32);
        assert!(dev.changes.lock().last().and_then(|c| c.new).is_some());

        // Move the enabled BAR onto the other window.
        outl(&buses, 0xcf8, ConfigAddress::new(0, 1, 0, 0x10).0);
        outl(&buses, 0xcfc, 0xfeb0_0000);
        let last = *dev.changes.lock().last().unwrap();
        assert_eq!(last.old.map(|r| r.base), Some(0xfebf_0000));
        assert_eq!(last.new, None);
        let mut b = [0; 1];
        assert!(!buses.mmio.read(0xfebf_0004, &mut b));
        // The other window still answers.
        assert!(buses.mmio.read(0xfeb0_0004, &mut b));
        assert_eq!(b[0], 5);

        // Moving it off again leaves the other window alone.
        outl(&buses, 0xcfc, 0xfec0_0000);
        let last = *dev.changes.lock().last().unwrap();
        assert_eq!(last.old, None);
        assert_eq!(last.new.map(|r| r.base), Some(0xfec0_0000));
        assert!(buses.mmio.read(0xfeb0_0004, &mut b));
        assert!(buses.mmio.read(0xfec0_0004, &mut b));
    }
}
