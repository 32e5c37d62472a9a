//! Packed ring, device side.
//!
//! ```text
//! struct pvirtq_desc {            struct pvirtq_event_suppress {
//!     le64 addr;     // 0             le16 desc; // 0
//!     le32 len;      // 8             le16 flags; // 2
//!     le16 id;       // 12        };
//!     le16 flags;    // 14
//! };
//! ```
//!
//! A slot is available to the device when its AVAIL bit equals the wrap bit
//! of the driver's pass and its USED bit differs from it; the device marks a
//! slot used by setting both bits to the wrap bit of its own pass.
use super::virt_queue::{advance, Descriptor, DescriptorChain, RingLayout, RingState, VirtqDescFlags, WrapCounter};
use super::QueueError;
use memory::{Gpa, GuestAddressSpace, MemoryError};

/// Size of a packed descriptor.
pub const DESC_SIZE: usize = 16;
/// Size of an event suppression area.
pub const EVENT_SIZE: usize = 4;

const LEN_OFFSET: u64 = 8;
const ID_OFFSET: u64 = 12;
const FLAGS_OFFSET: u64 = 14;

/// Event suppression flags.
const RING_EVENT_FLAGS_DISABLE: u16 = 0x1;

pub(crate) fn slot(layout: &RingLayout, idx: u16) -> Result<Gpa, QueueError> {
    layout
        .desc
        .checked_add(idx as u64 * DESC_SIZE as u64)
        .ok_or(QueueError::AddressFault(MemoryError::OutOfBounds {
            gpa: layout.desc,
            len: DESC_SIZE,
        }))
}

#[inline]
pub(crate) fn is_available(flags: VirtqDescFlags, wrap: WrapCounter) -> bool {
    flags.contains(VirtqDescFlags::AVAIL) == wrap.bit() && flags.contains(VirtqDescFlags::USED) != wrap.bit()
}

#[inline]
pub(crate) fn is_used(flags: VirtqDescFlags, wrap: WrapCounter) -> bool {
    flags.contains(VirtqDescFlags::AVAIL) == wrap.bit() && flags.contains(VirtqDescFlags::USED) == wrap.bit()
}

pub(crate) fn pop(
    mem: &GuestAddressSpace,
    layout: &RingLayout,
    state: &mut RingState,
) -> Result<Option<DescriptorChain>, QueueError> {
    let head = slot(layout, state.driver_idx)?;
    mem.translate(head, DESC_SIZE)?;
    let head_flags = VirtqDescFlags::from_bits_truncate(mem.load_u16_acquire(head + FLAGS_OFFSET)?);
    if !is_available(head_flags, state.avail_wrap) {
        return Ok(None);
    }

    let (mut idx, mut wrap) = (state.driver_idx, state.avail_wrap);
    let mut descriptors = Vec::new();
    let mut flags = head_flags;
    let id = loop {
        let desc = slot(layout, idx)?;
        let view = mem.translate(desc, DESC_SIZE)?;
        let mut raw = [0; DESC_SIZE];
        view.read(0, &mut raw)?;
        if !descriptors.is_empty() {
            // The head's flags were loaded with acquire ordering; the rest of
            // the chain was written before them.
            flags = VirtqDescFlags::from_bits_truncate(u16::from_le_bytes([raw[14], raw[15]]));
        }
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
        advance(&mut idx, &mut wrap, 1, layout.size);
        if !flags.contains(VirtqDescFlags::NEXT) {
            break u16::from_le_bytes([raw[12], raw[13]]);
        }
        if descriptors.len() >= layout.size as usize {
            return Err(QueueError::ProtocolViolation("descriptor chain is longer than the ring"));
        }
    };

    state.driver_idx = idx;
    state.avail_wrap = wrap;
    Ok(Some(DescriptorChain {
        id,
        count: descriptors.len() as u16,
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
    let desc = slot(layout, state.device_idx)?;
    let view = mem.translate(desc, DESC_SIZE)?;
    view.write(LEN_OFFSET as usize, &len.to_le_bytes())?;
    view.write(ID_OFFSET as usize, &chain.id.to_le_bytes())?;

    let mut flags = VirtqDescFlags::empty();
    if state.used_wrap.bit() {
        flags |= VirtqDescFlags::AVAIL | VirtqDescFlags::USED;
    }
    if len > 0 {
        flags |= VirtqDescFlags::WRITE;
    }
    // Publishes the id and len written above.
    mem.store_u16_release(desc + FLAGS_OFFSET, flags.bits())?;
    advance(&mut state.device_idx, &mut state.used_wrap, chain.count, layout.size);
    Ok(())
}

/// The driver may disable used buffer notifications through its event
/// suppression area.
pub(crate) fn needs_interrupt(mem: &GuestAddressSpace, layout: &RingLayout) -> bool {
    match layout.driver.checked_add(2).map(|flags| mem.read_u16(flags)) {
        Some(Ok(flags)) => flags & 0x3 != RING_EVENT_FLAGS_DISABLE,
        _ => true,
    }
}
