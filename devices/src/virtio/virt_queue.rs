//! Device side of a virtqueue.
//!
//! The guest driver and this device share the ring memory and nothing else.
//! Each side advances its own indices and publishes progress through a
//! single 16-bit word (a descriptor's flags in the packed format, a ring
//! index in the split format), written with release ordering and read with
//! acquire ordering. Every access to ring memory is translated through the
//! address space at the time it is made.
use super::{packed, split, QueueError};
use memory::{Gpa, GuestAddressSpace};

bitflags::bitflags! {
    pub struct VirtqDescFlags: u16 {
        /// The buffer is continuing via the next field
        const NEXT = 1 << 0;
        /// The buffer is device write-only (otherwise device read-only).
        const WRITE = 1 << 1;
        /// The buffer contains a list of buffer descriptors.
        const INDIRECT = 1 << 2;
        /// Packed ring: the descriptor was made available by the driver.
        const AVAIL = 1 << 7;
        /// Packed ring: the descriptor was used by the device.
        const USED = 1 << 15;
    }
}

/// One buffer of a chain, as published by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Address (guest-physical)
    pub addr: Gpa,
    /// Length.
    pub len: u32,
    /// NEXT and WRITE only; ring bookkeeping bits are stripped.
    pub flags: VirtqDescFlags,
}

impl Descriptor {
    #[inline]
    pub fn is_write_only(&self) -> bool {
        self.flags.contains(VirtqDescFlags::WRITE)
    }
}

/// A chain of descriptors popped from the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    /// Buffer id (packed) or head index (split), echoed in the used entry.
    pub id: u16,
    /// Ring entries the chain occupies: its length in the packed format,
    /// always 1 in the split format.
    pub count: u16,
    pub descriptors: Vec<Descriptor>,
}

/// Ring wrap counter.
///
/// Counts passes over the end of the ring modulo 2 and starts cleared. The
/// bit exchanged through descriptor flags is the virtio wrap bit, which is
/// the inverse of the counter: drivers start their first pass with it set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WrapCounter(bool);

impl WrapCounter {
    /// 0 before the first wrap, then alternating.
    #[inline]
    pub fn value(self) -> u8 {
        self.0 as u8
    }

    #[inline]
    pub fn toggle(&mut self) {
        self.0 = !self.0;
    }

    /// The wrap bit compared against AVAIL/USED.
    #[inline]
    pub(crate) fn bit(self) -> bool {
        !self.0
    }
}

/// Move a ring index forward by `by <= size` entries.
#[inline]
pub(crate) fn advance(idx: &mut u16, wrap: &mut WrapCounter, by: u16, size: u16) {
    let next = *idx as u32 + by as u32;
    if next >= size as u32 {
        *idx = (next - size as u32) as u16;
        wrap.toggle();
    } else {
        *idx = next as u16;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingFormat {
    Split,
    Packed,
}

/// Guest placement of a ring.
///
/// `driver` is the available ring (split) or the driver event suppression
/// area (packed); `device` is the used ring or the device event suppression
/// area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingLayout {
    pub size: u16,
    pub desc: Gpa,
    pub driver: Gpa,
    pub device: Gpa,
}

impl RingLayout {
    /// Check size, alignment and that every area lies in guest memory.
    pub fn validate(&self, format: RingFormat, mem: &GuestAddressSpace) -> Result<(), QueueError> {
        if self.size == 0 || !self.size.is_power_of_two() {
            return Err(QueueError::ProtocolViolation("ring size is not a power of two"));
        }
        let n = self.size as usize;
        let areas = match format {
            RingFormat::Packed => [
                (self.desc, 16, packed::DESC_SIZE * n),
                (self.driver, 4, packed::EVENT_SIZE),
                (self.device, 4, packed::EVENT_SIZE),
            ],
            RingFormat::Split => [
                (self.desc, 16, split::DESC_SIZE * n),
                (self.driver, 2, split::avail_size(n)),
                (self.device, 4, split::used_size(n)),
            ],
        };
        for (addr, align, len) in areas {
            if !addr.is_aligned(align) {
                return Err(QueueError::ProtocolViolation("misaligned ring area"));
            }
            mem.translate(addr, len)?;
        }
        Ok(())
    }
}

/// Indices of both sides of a ring.
///
/// In the packed format `driver_idx` is the next slot the device expects the
/// driver to fill and `device_idx` the next slot the device writes a used
/// entry to. In the split format they are the free running
/// `last_avail_idx` and `used.idx`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingState {
    pub driver_idx: u16,
    pub avail_wrap: WrapCounter,
    pub device_idx: u16,
    pub used_wrap: WrapCounter,
}

/// Which guest address of a queue the driver programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueArea {
    Desc,
    Driver,
    Device,
}

/// The device's view of one virtqueue.
pub struct VirtQueue {
    index: u16,
    max_size: u16,
    layout: RingLayout,
    state: RingState,
    format: RingFormat,
    enabled: bool,
}

impl VirtQueue {
    pub fn new(index: u16, max_size: u16) -> Self {
        Self {
            index,
            max_size,
            layout: RingLayout {
                size: max_size,
                ..Default::default()
            },
            state: RingState::default(),
            format: RingFormat::Split,
            enabled: false,
        }
    }

    #[inline]
    pub fn index(&self) -> u16 {
        self.index
    }

    #[inline]
    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    #[inline]
    pub fn size(&self) -> u16 {
        self.layout.size
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn format(&self) -> RingFormat {
        self.format
    }

    #[inline]
    pub fn state(&self) -> RingState {
        self.state
    }

    #[inline]
    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    #[inline]
    pub fn area(&self, area: QueueArea) -> Gpa {
        match area {
            QueueArea::Desc => self.layout.desc,
            QueueArea::Driver => self.layout.driver,
            QueueArea::Device => self.layout.device,
        }
    }

    /// Set the ring size. Returns false for sizes that are not a power of
    /// two within `1..=max_size`, or while the queue is enabled.
    pub fn set_size(&mut self, size: u16) -> bool {
        if self.enabled || size == 0 || !size.is_power_of_two() || size > self.max_size {
            return false;
        }
        self.layout.size = size;
        true
    }

    /// Program one of the guest addresses. Ignored while enabled.
    pub fn set_area(&mut self, area: QueueArea, addr: Gpa) -> bool {
        if self.enabled {
            return false;
        }
        match area {
            QueueArea::Desc => self.layout.desc = addr,
            QueueArea::Driver => self.layout.driver = addr,
            QueueArea::Device => self.layout.device = addr,
        }
        true
    }

    /// Start serving the ring in `format`.
    pub fn enable(&mut self, format: RingFormat, mem: &GuestAddressSpace) -> Result<(), QueueError> {
        self.layout.validate(format, mem)?;
        self.format = format;
        self.state = RingState::default();
        self.enabled = true;
        Ok(())
    }

    /// Forget the ring: disabled, default size, indices and wrap counters
    /// back to their initial values.
    pub fn reset(&mut self) {
        self.enabled = false;
        self.layout = RingLayout {
            size: self.max_size,
            ..Default::default()
        };
        self.state = RingState::default();
        self.format = RingFormat::Split;
    }

    /// Take the next available chain, if any.
    pub fn pop(&mut self, mem: &GuestAddressSpace) -> Result<Option<DescriptorChain>, QueueError> {
        if !self.enabled {
            return Err(QueueError::NotReady);
        }
        match self.format {
            RingFormat::Packed => packed::pop(mem, &self.layout, &mut self.state),
            RingFormat::Split => split::pop(mem, &self.layout, &mut self.state),
        }
    }

    /// Return `chain` to the driver with `len` bytes written.
    pub fn push_used(
        &mut self,
        mem: &GuestAddressSpace,
        chain: &DescriptorChain,
        len: u32,
    ) -> Result<(), QueueError> {
        if !self.enabled {
            return Err(QueueError::NotReady);
        }
        match self.format {
            RingFormat::Packed => packed::push_used(mem, &self.layout, &mut self.state, chain, len),
            RingFormat::Split => split::push_used(mem, &self.layout, &mut self.state, chain, len),
        }
    }

    /// Whether the driver wants an interrupt for used entries.
    pub fn needs_interrupt(&self, mem: &GuestAddressSpace) -> bool {
        match self.format {
            RingFormat::Packed => packed::needs_interrupt(mem, &self.layout),
            RingFormat::Split => split::needs_interrupt(mem, &self.layout),
        }
    }
}

impl core::fmt::Debug for VirtQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtQueue")
            .field("index", &self.index)
            .field("format", &self.format)
            .field("enabled", &self.enabled)
            .field("layout", &self.layout)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_wraps_once() {
        let (mut idx, mut wrap) = (6, WrapCounter::default());
        advance(&mut idx, &mut wrap, 1, 8);
        assert_eq!((idx, wrap.value()), (7, 0));
        advance(&mut idx, &mut wrap, 3, 8);
        assert_eq!((idx, wrap.value()), (2, 1));
        advance(&mut idx, &mut wrap, 8, 8);
        assert_eq!((idx, wrap.value()), (2, 0));
    }

    #[test]
    fn wrap_counter_starts_cleared() {
        let w = WrapCounter::default();
        assert_eq!(w.value(), 0);
        assert!(w.bit());
    }

    #[test]
    fn size_must_be_power_of_two() {
        let mut q = VirtQueue::new(0, 64);
        assert!(!q.set_size(0));
        assert!(!q.set_size(48));
        assert!(!q.set_size(128));
        assert!(q.set_size(16));
        assert_eq!(q.size(), 16);
    }

    #[test]
    fn enable_checks_layout() {
        let mem = GuestAddressSpace::new(0x10000).unwrap();
        let mut q = VirtQueue::new(0, 16);
        q.set_area(QueueArea::Desc, Gpa::new(0x1008));
        q.set_area(QueueArea::Driver, Gpa::new(0x2000));
        q.set_area(QueueArea::Device, Gpa::new(0x3000));
        assert!(matches!(
            q.enable(RingFormat::Packed, &mem),
            Err(QueueError::ProtocolViolation(_))
        ));
        q.set_area(QueueArea::Desc, Gpa::new(0xfff0));
        assert!(matches!(
            q.enable(RingFormat::Packed, &mem),
            Err(QueueError::AddressFault(_))
        ));
        q.set_area(QueueArea::Desc, Gpa::new(0x1000));
        q.enable(RingFormat::Packed, &mem).unwrap();
        assert!(q.is_enabled());
        assert!(!q.set_area(QueueArea::Desc, Gpa::new(0x4000)));
        q.reset();
        assert!(!q.is_enabled());
        assert_eq!(q.area(QueueArea::Desc), Gpa::new(0));
        assert!(matches!(q.pop(&mem), Err(QueueError::NotReady)));
    }
}
