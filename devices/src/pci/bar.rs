use crate::bus::IoSpace;

/// Enumeration of Base Address Register (BAR) types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    /// Bar on the Memory Space, 32-bit decoder.
    // Bit3: Prefetchable, Bit 2-1: Type
    Memory32 { prefetchable: bool },
    /// Bar on the IO Space.
    Io,
}

impl BarKind {
    /// Read-only low bits of the register.
    #[inline]
    pub(crate) fn type_bits(&self) -> u32 {
        match self {
            BarKind::Memory32 { prefetchable: true } => 1 << 3,
            BarKind::Memory32 { prefetchable: false } => 0,
            BarKind::Io => 1,
        }
    }

    #[inline]
    pub fn space(&self) -> IoSpace {
        match self {
            BarKind::Memory32 { .. } => IoSpace::Memory,
            BarKind::Io => IoSpace::Port,
        }
    }

    #[inline]
    pub(crate) fn min_size(&self) -> u64 {
        match self {
            BarKind::Memory32 { .. } => 16,
            BarKind::Io => 4,
        }
    }

    #[inline]
    pub(crate) fn max_size(&self) -> u64 {
        match self {
            BarKind::Memory32 { .. } => 1 << 31,
            BarKind::Io => 1 << 8,
        }
    }
}

/// A BAR implemented by a function.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BarSlot {
    pub kind: BarKind,
    pub size: u64,
    /// The last write was a sizing probe.
    pub probing: bool,
}

impl BarSlot {
    /// Writable address bits of the register. The size is at least the
    /// kind's minimum, so the read-only type bits are always outside.
    #[inline]
    pub fn addr_mask(&self) -> u32 {
        !(self.size as u32 - 1)
    }
}

/// A BAR window currently decoded by a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarRegion {
    pub index: u8,
    pub space: IoSpace,
    pub base: u64,
    pub len: u64,
}

/// The decoded window of BAR `index` changed.
///
/// `old` must be unmapped and `new` mapped by the owner of the I/O
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarChange {
    pub index: u8,
    pub old: Option<BarRegion>,
    pub new: Option<BarRegion>,
}
