//! PCI transport.
//!
//! Every emulated function publishes a [`PciConfigSpace`]; the [`PciBus`]
//! routes configuration mechanism #1 accesses to it and maps the windows of
//! its BARs into the I/O dispatcher when the guest enables them.
mod bar;
mod bus;
mod cap;
mod config;
pub mod header;

pub use bar::{BarChange, BarKind, BarRegion};
pub use bus::{ConfigAddress, PciBus, CONFIG_ADDRESS_PORT, CONFIG_PORT_LEN};
pub use cap::{Capability, CapabilityIterator, CAP_ID_VENDOR};
pub use config::PciConfigSpace;
pub use header::{Command, PciHeaderInfo, Status};

use crate::bus::{BusDevice, IoDispatch};
use std::sync::Arc;

/// Vendor id of virtio devices.
pub const VIRTIO_VENDOR_ID: u16 = 0x1af4;

#[derive(Debug, thiserror::Error)]
pub enum PciError {
    #[error("BAR{0} does not exist")]
    InvalidBar(usize),
    #[error("BAR{0} is already implemented")]
    BarInUse(usize),
    #[error("invalid BAR size {0:#x}")]
    InvalidBarSize(u64),
    #[error("invalid configuration space offset {0:#x}")]
    InvalidOffset(usize),
    #[error("no room left for capabilities")]
    CapabilitySpaceExhausted,
    #[error("no free slot on the bus")]
    BusFull,
}

/// A function attached to the [`PciBus`].
pub trait PciDevice
where
    Self: Send + Sync,
{
    fn config_read(&self, offset: usize, data: &mut [u8]);

    /// Returns the BAR windows whose decoding changed because of the write.
    fn config_write(&self, offset: usize, data: &[u8]) -> Vec<BarChange>;

    /// Handler of the accesses that hit BAR `index`.
    fn bar_device(&self, index: u8) -> Option<Arc<dyn BusDevice>>;

    /// Called after `change` was applied to `dispatch`.
    fn bar_changed(&self, _change: &BarChange, _dispatch: &dyn IoDispatch) {}
}
