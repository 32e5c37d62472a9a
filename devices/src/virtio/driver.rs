//! Driver side of the rings.
//!
//! The half of the protocol a guest driver runs: publish buffer chains and
//! reclaim them once the device has used them. A driver never has more
//! descriptors in flight than the ring holds; an enqueue that does not fit
//! first reclaims whatever the device has returned and otherwise fails with
//! [`QueueError::QueueFull`].
use super::packed::{self, is_used};
use super::split;
use super::virt_queue::{advance, RingFormat, RingLayout, VirtqDescFlags, WrapCounter};
use super::QueueError;
use crossbeam_queue::ArrayQueue;
use memory::{Gpa, GuestAddressSpace};
use std::collections::VecDeque;

/// A buffer handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverBuffer {
    pub addr: Gpa,
    pub len: u32,
    /// Device write-only.
    pub writable: bool,
}

impl DriverBuffer {
    pub fn readable(addr: u64, len: u32) -> Self {
        Self {
            addr: Gpa::new(addr),
            len,
            writable: false,
        }
    }

    pub fn writable(addr: u64, len: u32) -> Self {
        Self {
            addr: Gpa::new(addr),
            len,
            writable: true,
        }
    }
}

/// A chain returned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedElement {
    pub id: u16,
    pub len: u32,
}

pub trait QueueDriver {
    /// Publish `buffers` as one chain, returning its id.
    fn enqueue(&mut self, mem: &GuestAddressSpace, buffers: &[DriverBuffer]) -> Result<u16, QueueError>;

    /// Take the next chain the device has used.
    fn reclaim(&mut self, mem: &GuestAddressSpace) -> Result<Option<UsedElement>, QueueError>;

    /// Descriptors not in flight.
    fn num_free(&self) -> u16;
}

fn check_chain(buffers: &[DriverBuffer], size: u16) -> Result<u16, QueueError> {
    if buffers.is_empty() {
        return Err(QueueError::ProtocolViolation("empty descriptor chain"));
    }
    if buffers.len() > size as usize {
        return Err(QueueError::ProtocolViolation("descriptor chain is longer than the ring"));
    }
    Ok(buffers.len() as u16)
}

/// Driver of a packed ring.
pub struct PackedDriver {
    layout: RingLayout,
    driver_idx: u16,
    avail_wrap: WrapCounter,
    used_idx: u16,
    used_wrap: WrapCounter,
    num_free: u16,
    ids: ArrayQueue<u16>,
    chain_len: Vec<u16>,
    completed: VecDeque<UsedElement>,
}

impl PackedDriver {
    /// Take over the ring at `layout`, clearing its memory.
    pub fn new(mem: &GuestAddressSpace, layout: RingLayout) -> Result<Self, QueueError> {
        layout.validate(RingFormat::Packed, mem)?;
        let n = layout.size as usize;
        mem.write(layout.desc, &vec![0; n * packed::DESC_SIZE])?;
        mem.write(layout.driver, &[0; packed::EVENT_SIZE])?;
        mem.write(layout.device, &[0; packed::EVENT_SIZE])?;
        let ids = ArrayQueue::new(n);
        for id in 0..layout.size {
            let _ = ids.push(id);
        }
        Ok(Self {
            layout,
            driver_idx: 0,
            avail_wrap: WrapCounter::default(),
            used_idx: 0,
            used_wrap: WrapCounter::default(),
            num_free: layout.size,
            ids,
            chain_len: vec![0; n],
            completed: VecDeque::new(),
        })
    }

    #[inline]
    pub fn avail_wrap(&self) -> WrapCounter {
        self.avail_wrap
    }

    #[inline]
    pub fn used_wrap(&self) -> WrapCounter {
        self.used_wrap
    }

    /// Ask the device not to interrupt (or to interrupt again).
    pub fn suppress_interrupts(&self, mem: &GuestAddressSpace, suppress: bool) -> Result<(), QueueError> {
        mem.write_u16(self.layout.driver + 2, suppress as u16)?;
        Ok(())
    }

    fn reclaim_from_ring(&mut self, mem: &GuestAddressSpace) -> Result<Option<UsedElement>, QueueError> {
        let desc = packed::slot(&self.layout, self.used_idx)?;
        mem.translate(desc, packed::DESC_SIZE)?;
        let flags = VirtqDescFlags::from_bits_truncate(mem.load_u16_acquire(desc + 14)?);
        if !is_used(flags, self.used_wrap) {
            return Ok(None);
        }
        let id = mem.read_u16(desc + 12)?;
        let len = mem.read_u32(desc + 8)?;
        let count = match self.chain_len.get(id as usize) {
            Some(c) if *c > 0 => *c,
            _ => return Err(QueueError::ProtocolViolation("device returned an unknown buffer id")),
        };
        self.chain_len[id as usize] = 0;
        advance(&mut self.used_idx, &mut self.used_wrap, count, self.layout.size);
        self.num_free += count;
        self.ids
            .push(id)
            .map_err(|_| QueueError::ProtocolViolation("buffer id returned twice"))?;
        Ok(Some(UsedElement { id, len }))
    }
}

impl QueueDriver for PackedDriver {
    fn enqueue(&mut self, mem: &GuestAddressSpace, buffers: &[DriverBuffer]) -> Result<u16, QueueError> {
        let count = check_chain(buffers, self.layout.size)?;
        while count > self.num_free {
            match self.reclaim_from_ring(mem)? {
                Some(used) => self.completed.push_back(used),
                None => return Err(QueueError::QueueFull),
            }
        }
        let id = self.ids.pop().ok_or(QueueError::QueueFull)?;

        let head = packed::slot(&self.layout, self.driver_idx)?;
        let (mut idx, mut wrap) = (self.driver_idx, self.avail_wrap);
        let mut head_flags = VirtqDescFlags::empty();
        for (i, buf) in buffers.iter().enumerate() {
            let desc = packed::slot(&self.layout, idx)?;
            let view = mem.translate(desc, packed::DESC_SIZE)?;
            view.write(0, &buf.addr.as_u64().to_le_bytes())?;
            view.write(8, &buf.len.to_le_bytes())?;
            view.write(12, &id.to_le_bytes())?;
            let mut flags = if wrap.bit() {
                VirtqDescFlags::AVAIL
            } else {
                VirtqDescFlags::USED
            };
            if i + 1 < buffers.len() {
                flags |= VirtqDescFlags::NEXT;
            }
            if buf.writable {
                flags |= VirtqDescFlags::WRITE;
            }
            if i == 0 {
                head_flags = flags;
            } else {
                view.write(14, &flags.bits().to_le_bytes())?;
            }
            advance(&mut idx, &mut wrap, 1, self.layout.size);
        }
        // Makes the whole chain visible at once.
        mem.store_u16_release(head + 14, head_flags.bits())?;

        self.driver_idx = idx;
        self.avail_wrap = wrap;
        self.num_free -= count;
        self.chain_len[id as usize] = count;
        Ok(id)
    }

    fn reclaim(&mut self, mem: &GuestAddressSpace) -> Result<Option<UsedElement>, QueueError> {
        match self.completed.pop_front() {
            Some(used) => Ok(Some(used)),
            None => self.reclaim_from_ring(mem),
        }
    }

    fn num_free(&self) -> u16 {
        self.num_free
    }
}

/// Driver of a split ring.
pub struct SplitDriver {
    layout: RingLayout,
    free: ArrayQueue<u16>,
    avail_idx: u16,
    last_used: u16,
    chains: Vec<Vec<u16>>,
    completed: VecDeque<UsedElement>,
}

impl SplitDriver {
    /// Take over the ring at `layout`, clearing its memory.
    pub fn new(mem: &GuestAddressSpace, layout: RingLayout) -> Result<Self, QueueError> {
        layout.validate(RingFormat::Split, mem)?;
        let n = layout.size as usize;
        mem.write(layout.desc, &vec![0; n * split::DESC_SIZE])?;
        mem.write(layout.driver, &vec![0; split::avail_size(n)])?;
        mem.write(layout.device, &vec![0; split::used_size(n)])?;
        let free = ArrayQueue::new(n);
        for i in 0..layout.size {
            let _ = free.push(i);
        }
        Ok(Self {
            layout,
            free,
            avail_idx: 0,
            last_used: 0,
            chains: vec![Vec::new(); n],
            completed: VecDeque::new(),
        })
    }

    /// Ask the device not to interrupt (or to interrupt again).
    pub fn suppress_interrupts(&self, mem: &GuestAddressSpace, suppress: bool) -> Result<(), QueueError> {
        mem.write_u16(self.layout.driver, suppress as u16)?;
        Ok(())
    }

    fn reclaim_from_ring(&mut self, mem: &GuestAddressSpace) -> Result<Option<UsedElement>, QueueError> {
        let used_idx = mem.load_u16_acquire(self.layout.device + 2)?;
        if used_idx == self.last_used {
            return Ok(None);
        }
        let elem = self.layout.device + 4 + 8 * (self.last_used % self.layout.size) as u64;
        let id = mem.read_u32(elem)?;
        let len = mem.read_u32(elem + 4)?;
        let chain = match self.chains.get_mut(id as usize) {
            Some(c) if !c.is_empty() => core::mem::take(c),
            _ => return Err(QueueError::ProtocolViolation("device returned an unknown head")),
        };
        for desc in chain {
            let _ = self.free.push(desc);
        }
        self.last_used = self.last_used.wrapping_add(1);
        Ok(Some(UsedElement { id: id as u16, len }))
    }
}

impl QueueDriver for SplitDriver {
    fn enqueue(&mut self, mem: &GuestAddressSpace, buffers: &[DriverBuffer]) -> Result<u16, QueueError> {
        let count = check_chain(buffers, self.layout.size)?;
        while count as usize > self.free.len() {
            match self.reclaim_from_ring(mem)? {
                Some(used) => self.completed.push_back(used),
                None => return Err(QueueError::QueueFull),
            }
        }
        let mut indices = Vec::with_capacity(buffers.len());
        for _ in buffers {
            indices.push(self.free.pop().ok_or(QueueError::QueueFull)?);
        }
        for (i, buf) in buffers.iter().enumerate() {
            let view = mem.translate(split::desc_addr(&self.layout, indices[i])?, split::DESC_SIZE)?;
            let mut flags = VirtqDescFlags::empty();
            let mut next = 0;
            if i + 1 < buffers.len() {
                flags |= VirtqDescFlags::NEXT;
                next = indices[i + 1];
            }
            if buf.writable {
                flags |= VirtqDescFlags::WRITE;
            }
            view.write(0, &buf.addr.as_u64().to_le_bytes())?;
            view.write(8, &buf.len.to_le_bytes())?;
            view.write(12, &flags.bits().to_le_bytes())?;
            view.write(14, &next.to_le_bytes())?;
        }
        let head = indices[0];
        let slot = self.layout.driver + 4 + 2 * (self.avail_idx % self.layout.size) as u64;
        mem.write_u16(slot, head)?;
        self.avail_idx = self.avail_idx.wrapping_add(1);
        // Makes the ring entry and the descriptors visible.
        mem.store_u16_release(self.layout.driver + 2, self.avail_idx)?;
        self.chains[head as usize] = indices;
        Ok(head)
    }

    fn reclaim(&mut self, mem: &GuestAddressSpace) -> Result<Option<UsedElement>, QueueError> {
        match self.completed.pop_front() {
            Some(used) => Ok(Some(used)),
            None => self.reclaim_from_ring(mem),
        }
    }

    fn num_free(&self) -> u16 {
        self.free.len() as u16
    }
}
