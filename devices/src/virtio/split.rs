//! Split ring, device side.
//!
//! Used when the driver did not accept `VIRTIO_F_RING_PACKED`.
//!
//! ```text
//! struct virtq_desc  { le64 addr; le32 len; le16 flags; le16 next; };
//! struct virtq_avail { le16 flags; le16 idx; le16 ring[N]; le16 used_event; };
//! struct virtq_used  { le16 flags; le16 idx; struct { le32 id; le32 len; } ring[N]; le16 avail_event; };
//! ```
use super::virt_queue::{Descriptor, DescriptorChain, RingLayout, RingState, VirtqDescFlags};
use super::QueueError;
use memory::{Gpa, GuestAddressSpace, MemoryError};

/// Size of a split descriptor.
pub const DESC_SIZE: usize = 16;

/// Avail ring flag: the driver does not want used buffer notifications.
const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

#[inline]
pub(crate) fn avail_size(n: usize) -> usize {
    6 + 2 * n
}

#[inline]
pub(crate) fn used_size(n: usize) -> usize {
    6 + 8 * n
}

fn at(base: Gpa, offset: u64) -> Result<Gpa, QueueError> {
    base.checked_add(offset)
        .ok_or(QueueError::AddressFault(MemoryError::OutOfBounds { gpa: base, len: 0 }))
}

pub(crate) fn desc_addr(layout: &RingLayout, index: u16) -> Result<Gpa, QueueError> {
    at(layout.desc, index as u64 * DESC_SIZE as u64)
}

pub(crate) fn pop(
    mem: &GuestAddressSpace,
    layout: &RingLayout,
    state: &mut RingState,
) -> Result<Option<DescriptorChain>, QueueError> {
    let size = layout.size;
    let avail_idx = mem.load_u16_acquire(at(layout.driver, 2)?)?;
    let pending = avail_idx.wrapping_sub(state.driver_idx);
    if pending == 0 {
        return Ok(None);
    }
    if pending > size {
        return Err(QueueError::ProtocolViolation("available index ran ahead of the ring"));
    }
    let pos = state.driver_idx % size;
    let head = mem.read_u16(at(layout.driver, 4 + 2 * pos as u64)?)?;
    if head >= size {
        return Err(QueueError::ProtocolViolation("head descriptor index out of range"));
    }

    let mut descriptors = Vec::new();
    let mut index = head;
    loop {
        let view = mem.translate(desc_addr(layout, index)?, DESC_SIZE)?;
        let mut raw = [0; DESC_SIZE];
        view.read(0, &mut raw)?;
        let flags = VirtqDescFlags::from_bits_truncate(u16::from_le_bytes([raw[12], raw[13]]));
        if flags.contains(VirtqDescFlags::INDIRECT) {
            return Err(QueueError::ProtocolViolation("indirect descriptor was not negotiated"));
        }
        descriptors.push(Descriptor {
            addr: Gpa::new(u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ])),
            len: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: flags & (VirtqDescFlags::NEXT | VirtqDescFlags::WRITE),
        });
        if !flags.contains(VirtqDescFlags::NEXT) {
            break;
        }
        let next = u16::from_le_bytes([raw[14], raw[15]]);
        if next >= size {
            return Err(QueueError::ProtocolViolation("next descriptor index out of range"));
        }
        if descriptors.len() >= size as usize {
            return Err(QueueError::ProtocolViolation("descriptor chain loops"));
        }
        index = next;
    }

    state.driver_idx = state.driver_idx.wrapping_add(1);
    if state.driver_idx % size == 0 {
        state.avail_wrap.toggle();
    }
    Ok(Some(DescriptorChain {
        id: head,
        count: 1,
        descriptors,
    }))
}

pub(crate) fn push_used(
    mem: &GuestAddressSpace,
    layout: &RingLayout,
    state: &mut RingState,
    chain: &DescriptorChain,
    len: u32,
) -> Result<(), QueueError> {
    let size = layout.size;
    let elem = at(layout.device, 4 + 8 * (state.device_idx % size) as u64)?;
    let view = mem.translate(elem, 8)?;
    view.write(0, &(chain.id as u32).to_le_bytes())?;
    view.write(4, &len.to_le_bytes())?;

    state.device_idx = state.device_idx.wrapping_add(1);
    if state.device_idx % size == 0 {
        state.used_wrap.toggle();
    }
    // Publishes the element written above.
    mem.store_u16_release(at(layout.device, 2)?, state.device_idx)?;
    Ok(())
}

pub(crate) fn needs_interrupt(mem: &GuestAddressSpace, layout: &RingLayout) -> bool {
    match mem.read_u16(layout.driver) {
        Ok(flags) => flags & VRING_AVAIL_F_NO_INTERRUPT == 0,
        Err(_) => true,
    }
}
