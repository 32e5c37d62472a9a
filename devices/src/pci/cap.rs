use super::config::PciConfigSpace;

/// Capability ID of vendor specific capabilities.
pub const CAP_ID_VENDOR: u8 = 0x09;

/// Device's capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Offset of the capability in config space.
    pub offset: u8,
    /// Capability ID.
    pub id: u8,
}

#[doc(hidden)]
pub struct CapabilityIterator<'a> {
    pub(crate) next: u8,
    pub(crate) config: &'a PciConfigSpace,
    // A malformed list could loop; a config space holds at most 64 dwords.
    pub(crate) budget: u8,
}

impl<'a> core::iter::Iterator for CapabilityIterator<'a> {
    type Item = Capability;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next != 0 && self.budget != 0 {
            let cur = self.next;
            self.budget -= 1;
            self.next = self.config.register_u8(cur as usize + 1);
            Some(Capability {
                offset: cur,
                id: self.config.register_u8(cur as usize),
            })
        } else {
            None
        }
    }
}
