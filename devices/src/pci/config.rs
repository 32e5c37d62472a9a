//! Emulated configuration space of one PCI function.
use super::bar::{BarChange, BarKind, BarRegion, BarSlot};
use super::cap::CapabilityIterator;
use super::header::*;
use super::PciError;

/// The 256-byte configuration space seen by the guest.
///
/// Plain registers are stored as bytes and guarded by a per-byte write mask.
/// BARs and the command register are post-processed after every write to
/// compute which BAR windows started or stopped decoding.
pub struct PciConfigSpace {
    regs: [u8; CONFIG_SPACE_SIZE],
    wmask: [u8; CONFIG_SPACE_SIZE],
    bars: [Option<BarSlot>; NUM_BARS],
    next_cap: usize,
    last_cap: Option<usize>,
}

impl PciConfigSpace {
    pub fn new(info: PciHeaderInfo) -> Self {
        let mut this = Self {
            regs: [0; CONFIG_SPACE_SIZE],
            wmask: [0; CONFIG_SPACE_SIZE],
            bars: [None; NUM_BARS],
            next_cap: CAPABILITY_START,
            last_cap: None,
        };
        this.put(VENDOR_ID, &info.vendor_id.to_le_bytes());
        this.put(DEVICE_ID, &info.device_id.to_le_bytes());
        this.put(REVISION_ID, &[info.revision_id]);
        this.put(CLASS_CODE, &info.class_code.to_le_bytes()[..3]);
        this.put(HEADER_TYPE, &[0]);
        this.put(SUBSYSTEM_VENDOR_ID, &info.subsystem_vendor_id.to_le_bytes());
        this.put(SUBSYSTEM_ID, &info.subsystem_id.to_le_bytes());
        this.put(INTERRUPT_LINE, &[info.interrupt_line]);
        this.put(INTERRUPT_PIN, &[info.interrupt_pin]);

        let command = Command::IO_SPACE
            | Command::MEMORY_SPACE
            | Command::BUS_MASTER
            | Command::INTERRUPT_DISABLE;
        this.set_writable_mask(COMMAND, &command.bits().to_le_bytes());
        this.set_writable_mask(CACHE_LINE_SIZE, &[0xff]);
        this.set_writable_mask(LATENCY_TIMER, &[0xff]);
        this.set_writable_mask(INTERRUPT_LINE, &[0xff]);
        this
    }

    fn put(&mut self, offset: usize, bytes: &[u8]) {
        self.regs[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn set_writable_mask(&mut self, offset: usize, mask: &[u8]) {
        self.wmask[offset..offset + mask.len()].copy_from_slice(mask);
    }

    /// Let the guest write `[offset, offset + len)`.
    ///
    /// Used for capability fields that the driver programs.
    pub fn set_writable(&mut self, offset: usize, len: usize) -> Result<(), PciError> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= CONFIG_SPACE_SIZE && offset >= CAPABILITY_START)
            .ok_or(PciError::InvalidOffset(offset))?;
        self.wmask[offset..end].fill(0xff);
        Ok(())
    }

    /// Implement BAR `index`.
    ///
    /// `size` must be a power of two within the limits of `kind`.
    pub fn add_bar(&mut self, index: usize, kind: BarKind, size: u64) -> Result<(), PciError> {
        if index >= NUM_BARS {
            return Err(PciError::InvalidBar(index));
        }
        if self.bars[index].is_some() {
            return Err(PciError::BarInUse(index));
        }
        if !size.is_power_of_two() || size < kind.min_size() || size > kind.max_size() {
            return Err(PciError::InvalidBarSize(size));
        }
        self.bars[index] = Some(BarSlot {
            kind,
            size,
            probing: false,
        });
        self.put(BAR0 + 4 * index, &kind.type_bits().to_le_bytes());
        Ok(())
    }

    /// Append a capability and link it into the list.
    ///
    /// `body` is everything after the two-byte (id, next) header. Returns the
    /// capability's offset.
    pub fn add_capability(&mut self, id: u8, body: &[u8]) -> Result<u8, PciError> {
        let offset = self.next_cap;
        let end = offset + 2 + body.len();
        if end > CONFIG_SPACE_SIZE {
            return Err(PciError::CapabilitySpaceExhausted);
        }
        self.put(offset, &[id, 0]);
        self.put(offset + 2, body);
        match self.last_cap {
            Some(last) => self.regs[last + 1] = offset as u8,
            None => self.regs[CAPABILITY_POINTER] = offset as u8,
        }
        let status = Status::from_bits_truncate(self.register_u16(STATUS)) | Status::CAPABILITIES_LIST;
        self.put(STATUS, &status.bits().to_le_bytes());
        self.last_cap = Some(offset);
        self.next_cap = (end + 3) & !3;
        Ok(offset as u8)
    }

    /// Get iterator for enumerating the capabilties of device.
    #[inline]
    pub fn capabilities(&self) -> CapabilityIterator<'_> {
        CapabilityIterator {
            next: if Status::from_bits_truncate(self.register_u16(STATUS))
                .contains(Status::CAPABILITIES_LIST)
            {
                self.regs[CAPABILITY_POINTER]
            } else {
                0
            },
            config: self,
            budget: (CONFIG_SPACE_SIZE / 4) as u8,
        }
    }

    #[inline]
    pub fn register_u8(&self, offset: usize) -> u8 {
        self.regs.get(offset).copied().unwrap_or(0xff)
    }

    pub fn register_u16(&self, offset: usize) -> u16 {
        let mut b = [0; 2];
        self.read(offset, &mut b);
        u16::from_le_bytes(b)
    }

    pub fn register_u32(&self, offset: usize) -> u32 {
        let mut b = [0; 4];
        self.read(offset, &mut b);
        u32::from_le_bytes(b)
    }

    #[inline]
    pub fn command(&self) -> Command {
        Command::from_bits_truncate(self.register_u16(COMMAND))
    }

    fn valid_access(offset: usize, len: usize) -> bool {
        matches!(len, 1 | 2 | 4) && offset.checked_add(len).map_or(false, |end| end <= CONFIG_SPACE_SIZE)
    }

    /// Guest read. Malformed accesses read as all-ones.
    pub fn read(&self, offset: usize, data: &mut [u8]) {
        if Self::valid_access(offset, data.len()) {
            data.copy_from_slice(&self.regs[offset..offset + data.len()]);
        } else {
            data.fill(0xff);
        }
    }

    /// Guest write.
    ///
    /// Returns the BAR windows whose decoding changed; malformed accesses are
    /// ignored.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Vec<BarChange> {
        if !Self::valid_access(offset, data.len()) {
            log::warn!("pci: ignoring config write of {} bytes at {:#x}", data.len(), offset);
            return Vec::new();
        }
        let before = self.decoded_regions();

        let bar_area = BAR0..BAR0 + 4 * NUM_BARS;
        let mut touched = [false; NUM_BARS];
        let mut bar_regs = [0u32; NUM_BARS];
        for (i, reg) in bar_regs.iter_mut().enumerate() {
            *reg = self.register_u32(BAR0 + 4 * i);
        }
        for (i, b) in data.iter().enumerate() {
            let off = offset + i;
            if bar_area.contains(&off) {
                let index = (off - BAR0) / 4;
                let shift = 8 * ((off - BAR0) % 4);
                bar_regs[index] = (bar_regs[index] & !(0xff << shift)) | ((*b as u32) << shift);
                touched[index] = true;
            } else {
                self.regs[off] = (self.regs[off] & !self.wmask[off]) | (b & self.wmask[off]);
            }
        }
        for index in 0..NUM_BARS {
            if touched[index] {
                self.write_bar(index, bar_regs[index]);
            }
        }

        let after = self.decoded_regions();
        (0..NUM_BARS)
            .filter(|i| before[*i] != after[*i])
            .map(|i| BarChange {
                index: i as u8,
                old: before[i],
                new: after[i],
            })
            .collect()
    }

    fn write_bar(&mut self, index: usize, raw: u32) {
        let value = match self.bars[index].as_mut() {
            Some(slot) => {
                // Sizing probe: the address bits read back as the negated size.
                slot.probing = raw == u32::MAX;
                (raw & slot.addr_mask()) | slot.kind.type_bits()
            }
            None => 0,
        };
        self.put(BAR0 + 4 * index, &value.to_le_bytes());
    }

    /// The window BAR `index` currently decodes, if any.
    pub fn bar_region(&self, index: usize) -> Option<BarRegion> {
        let slot = self.bars.get(index).copied().flatten()?;
        let enabled = match slot.kind {
            BarKind::Memory32 { .. } => self.command().contains(Command::MEMORY_SPACE),
            BarKind::Io => self.command().contains(Command::IO_SPACE),
        };
        let base = (self.register_u32(BAR0 + 4 * index) & slot.addr_mask()) as u64;
        if !enabled || slot.probing || base == 0 {
            return None;
        }
        Some(BarRegion {
            index: index as u8,
            space: slot.kind.space(),
            base,
            len: slot.size,
        })
    }

    fn decoded_regions(&self) -> [Option<BarRegion>; NUM_BARS] {
        let mut regions = [None; NUM_BARS];
        for (i, r) in regions.iter_mut().enumerate() {
            *r = self.bar_region(i);
        }
        regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::IoSpace;

    fn info() -> PciHeaderInfo {
        PciHeaderInfo {
            vendor_id: 0x1af4,
            device_id: 0x1041,
            revision_id: 1,
            class_code: 0x02_00_00,
            subsystem_vendor_id: 0x1af4,
            subsystem_id: 1,
            interrupt_pin: 1,
            interrupt_line: 5,
        }
    }

    #[test]
    fn header_layout() {
        let cfg = PciConfigSpace::new(info());
        assert_eq!(cfg.register_u32(0x00), 0x1041_1af4);
        assert_eq!(cfg.register_u32(0x08), 0x0200_0001);
        assert_eq!(cfg.register_u8(0x0e), 0);
        assert_eq!(cfg.register_u16(0x2c), 0x1af4);
        assert_eq!(cfg.register_u8(0x3c), 5);
        assert_eq!(cfg.register_u8(0x3d), 1);
        assert_eq!(cfg.register_u16(0x06) & Status::CAPABILITIES_LIST.bits(), 0);
    }

    #[test]
    fn read_only_fields_ignore_writes() {
        let mut cfg = PciConfigSpace::new(info());
        cfg.write(0x00, &0xdead_beefu32.to_le_bytes());
        assert_eq!(cfg.register_u32(0x00), 0x1041_1af4);
        cfg.write(0x04, &0xffffu16.to_le_bytes());
        assert_eq!(cfg.register_u16(0x04), 0x0407);
        cfg.write(0x3c, &[11]);
        assert_eq!(cfg.register_u8(0x3c), 11);
    }

    #[test]
    fn malformed_accesses() {
        let mut cfg = PciConfigSpace::new(info());
        let mut b = [0; 4];
        cfg.read(0xfe, &mut b);
        assert_eq!(b, [0xff; 4]);
        let mut b = [0; 3];
        cfg.read(0, &mut b);
        assert_eq!(b, [0xff; 3]);
        assert!(cfg.write(0xfd, &[0; 4]).is_empty());
    }

    #[test]
    fn bar_probe_reads_back_size() {
        let mut cfg = PciConfigSpace::new(info());
        cfg.add_bar(0, BarKind::Memory32 { prefetchable: false }, 0x4000).unwrap();
        cfg.write(0x04, &(Command::MEMORY_SPACE.bits()).to_le_bytes());
        assert!(cfg.write(0x10, &u32::MAX.to_le_bytes()).is_empty());
        let v = cfg.register_u32(0x10);
        assert_eq!(!v + 1, 0x4000);
        assert_eq!(cfg.bar_region(0), None);
    }

    #[test]
    fn io_bar_probe() {
        let mut cfg = PciConfigSpace::new(info());
        cfg.add_bar(1, BarKind::Io, 0x20).unwrap();
        cfg.write(0x14, &u32::MAX.to_le_bytes());
        let v = cfg.register_u32(0x14);
        assert_eq!(v & 1, 1);
        assert_eq!(!(v & !0x3) + 1, 0x20);
    }

    #[test]
    fn bar_address_is_aligned_to_size() {
        let mut cfg = PciConfigSpace::new(info());
        cfg.add_bar(0, BarKind::Memory32 { prefetchable: true }, 0x4000).unwrap();
        cfg.write(0x10, &0xfebf_1234u32.to_le_bytes());
        assert_eq!(cfg.register_u32(0x10), 0xfebf_0000 | 0x8);
    }

    #[test]
    fn activation_follows_command_and_address() {
        let mut cfg = PciConfigSpace::new(info());
        cfg.add_bar(0, BarKind::Memory32 { prefetchable: false }, 0x4000).unwrap();
        assert!(cfg.write(0x10, &0xfebf_0000u32.to_le_bytes()).is_empty());

        let region = BarRegion {
            index: 0,
            space: IoSpace::Memory,
            base: 0xfebf_0000,
            len: 0x4000,
        };
        let changes = cfg.write(0x04, &Command::MEMORY_SPACE.bits().to_le_bytes());
        assert_eq!(
            changes,
            vec![BarChange {
                index: 0,
                old: None,
                new: Some(region)
            }]
        );

        let changes = cfg.write(0x10, &0xfeb0_0000u32.to_le_bytes());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old, Some(region));
        assert_eq!(changes[0].new.map(|r| r.base), Some(0xfeb0_0000));

        let changes = cfg.write(0x04, &0u16.to_le_bytes());
        assert_eq!(changes[0].new, None);
    }

    #[test]
    fn unimplemented_bar_reads_zero() {
        let mut cfg = PciConfigSpace::new(info());
        cfg.write(0x18, &u32::MAX.to_le_bytes());
        assert_eq!(cfg.register_u32(0x18), 0);
    }

    #[test]
    fn bar_validation() {
        let mut cfg = PciConfigSpace::new(info());
        assert!(matches!(
            cfg.add_bar(6, BarKind::Io, 4),
            Err(PciError::InvalidBar(6))
        ));
        assert!(matches!(
            cfg.add_bar(0, BarKind::Memory32 { prefetchable: false }, 0x3000),
            Err(PciError::InvalidBarSize(0x3000))
        ));
        cfg.add_bar(0, BarKind::Io, 4).unwrap();
        assert!(matches!(cfg.add_bar(0, BarKind::Io, 4), Err(PciError::BarInUse(0))));
    }

    #[test]
    fn capability_list() {
        let mut cfg = PciConfigSpace::new(info());
        let a = cfg.add_capability(0x09, &[16, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let b = cfg.add_capability(0x05, &[0; 3]).unwrap();
        assert_eq!(a, 0x40);
        assert_eq!(b, 0x50);
        assert_eq!(cfg.register_u8(0x34), 0x40);
        assert_eq!(cfg.register_u8(0x41), 0x50);
        assert_ne!(cfg.register_u16(0x06) & Status::CAPABILITIES_LIST.bits(), 0);
        let ids: Vec<_> = cfg.capabilities().map(|c| (c.offset, c.id)).collect();
        assert_eq!(ids, vec![(0x40, 0x09), (0x50, 0x05)]);
        // read-only
        cfg.write(0x42, &[0xaa]);
        assert_eq!(cfg.register_u8(0x42), 16);
    }

    #[test]
    fn capability_space_is_bounded() {
        let mut cfg = PciConfigSpace::new(info());
        while cfg.add_capability(0x09, &[0; 18]).is_ok() {}
        assert!(matches!(
            cfg.add_capability(0x09, &[0; 18]),
            Err(PciError::CapabilitySpaceExhausted)
        ));
        assert!(cfg.capabilities().count() <= (CONFIG_SPACE_SIZE - CAPABILITY_START) / 20);
    }
}
