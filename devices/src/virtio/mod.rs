//! Virtio over PCI.
//!
//! A [`VirtioPciDevice`] publishes the modern virtio PCI interface: the
//! vendor capabilities pointing into BAR0, the common configuration through
//! which the driver negotiates features and programs queues, the notify
//! window and the ISR. Buffers are served by a [`VirtioBackend`] on a worker
//! thread that is woken through an [`EventChannel`](crate::event::EventChannel).
mod chain;
pub mod driver;
mod packed;
mod pci;
mod split;
mod tys;
mod virt_queue;
mod worker;

pub use chain::ChainBuffers;
pub use pci::{layout, QueueSnapshot, VirtioPciDevice};
pub use tys::{DeviceType, IsrStatus, PciCapabilityType, Status, VirtIoFeaturesCommon};
pub use virt_queue::{
    Descriptor, DescriptorChain, QueueArea, RingFormat, RingLayout, RingState, VirtQueue,
    VirtqDescFlags, WrapCounter,
};

use memory::MemoryError;

/// Errors of a single queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A guest address of a ring or buffer is outside of guest memory.
    #[error("guest address fault: {0}")]
    AddressFault(#[from] MemoryError),
    /// The driver broke the ring protocol. The device is failed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// Every descriptor is in flight.
    #[error("queue is full")]
    QueueFull,
    #[error("queue is not enabled")]
    NotReady,
}

#[derive(Debug, thiserror::Error)]
pub enum VirtioError {
    #[error("failed to create event channel: {0}")]
    Event(#[source] std::io::Error),
    #[error(transparent)]
    Pci(#[from] crate::pci::PciError),
    #[error("queue size {0} is not a power of two")]
    InvalidQueueSize(u16),
    #[error("{0} queues do not fit the transport")]
    InvalidQueueCount(u16),
    #[error("notify multiplier {0} is neither 0 nor an even power of two")]
    InvalidNotifyMultiplier(u32),
}

/// Device specific part of a virtio device.
///
/// The transport owns negotiation, rings and interrupts; the backend sees
/// one translated chain at a time.
pub trait VirtioBackend
where
    Self: Send,
{
    fn device_type(&self) -> DeviceType;

    /// Device specific feature bits. The transport adds `VERSION_1` and
    /// `RING_PACKED`.
    fn features(&self) -> u64 {
        0
    }

    fn num_queues(&self) -> u16;

    /// Length of the device specific configuration.
    fn config_len(&self) -> usize {
        0
    }

    fn read_config(&self, _offset: usize, data: &mut [u8]) {
        data.fill(0);
    }

    fn write_config(&mut self, _offset: usize, _data: &[u8]) {}

    /// Serve one chain popped from `queue`.
    ///
    /// Returns the number of bytes written into the device-writable buffers.
    fn process(&mut self, queue: u16, chain: &ChainBuffers<'_>) -> Result<u32, QueueError>;

    /// Status byte written into a chain whose buffers do not translate, if
    /// the device type has one.
    fn fault_status(&self) -> Option<u8> {
        None
    }

    /// The driver reset the device.
    fn reset(&mut self) {}
}

/// Tunables of the PCI transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Distance between the notify addresses of two queues. 0 means a single
    /// address for every queue; the written value selects the queue.
    pub notify_multiplier: u32,
    /// Largest ring the device accepts.
    pub queue_max_size: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            notify_multiplier: 4,
            queue_max_size: 128,
        }
    }
}
