use crate::hypervisor::HostHypervisor;
use devices::bus::{BusDevice, BusError, IoBuses, IoDispatch, IoSpace};
use devices::event::EventChannel;
use std::sync::Arc;

/// The emulated buses of a VM, with queue notifications handed to the host.
///
/// Windows are mapped on the trapped buses. Notify addresses are registered
/// as host ioevents so that guest kicks signal the device's channel without
/// a vmexit.
pub struct HostIoDispatch<H: HostHypervisor> {
    buses: IoBuses,
    host: Arc<H>,
}

impl<H: HostHypervisor> HostIoDispatch<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self {
            buses: IoBuses::new(),
            host,
        }
    }

    #[inline]
    pub fn buses(&self) -> &IoBuses {
        &self.buses
    }
}

impl<H: HostHypervisor> IoDispatch for HostIoDispatch<H> {
    fn map(&self, space: IoSpace, base: u64, len: u64, device: Arc<dyn BusDevice>) -> Result<(), BusError> {
        self.buses.map(space, base, len, device)
    }

    fn unmap(&self, space: IoSpace, base: u64) -> Result<(), BusError> {
        self.buses.unmap(space, base)
    }

    fn attach_notify(&self, space: IoSpace, addr: u64, event: &EventChannel) -> Result<bool, BusError> {
        self.host
            .register_ioevent(event, space, addr)
            .map_err(|e| BusError::Host(e.to_string()))?;
        Ok(true)
    }

    fn detach_notify(&self, space: IoSpace, addr: u64, event: &EventChannel) -> Result<(), BusError> {
        self.host
            .unregister_ioevent(event, space, addr)
            .map_err(|e| BusError::Host(e.to_string()))
    }
}
