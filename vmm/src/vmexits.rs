//! Interface to play with vmexits.
use crate::hypervisor::VcpuExit;
use crate::VmError;
use devices::bus::IoBuses;

/// What the vCPU loop does after a handled exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmexitResult {
    /// Re-enter the guest.
    Ok,
    /// The guest halted; this vCPU stops.
    Halted,
    /// The guest powered off.
    Shutdown,
}

/// Controller that defines action on vmexit.
pub trait VmexitController
where
    Self: Sync,
{
    /// Handle the vmexit on this controller.
    ///
    /// Returns [`VmError::HandleVmexitFailed`] when failed to handle vmexit on this controller.
    fn handle(&self, exit: &mut VcpuExit<'_>) -> Result<VmexitResult, VmError>;
}

/// Forwards port and MMIO exits to the emulated buses.
impl VmexitController for IoBuses {
    fn handle(&self, exit: &mut VcpuExit<'_>) -> Result<VmexitResult, VmError> {
        match exit {
            VcpuExit::IoIn(port, data) => {
                self.pio.read(*port as u64, data);
            }
            VcpuExit::IoOut(port, data) => {
                self.pio.write(*port as u64, data);
            }
            VcpuExit::MmioRead(addr, data) => {
                self.mmio.read(*addr, data);
            }
            VcpuExit::MmioWrite(addr, data) => {
                self.mmio.write(*addr, data);
            }
            _ => return Err(VmError::HandleVmexitFailed(format!("{:?}", exit))),
        }
        Ok(VmexitResult::Ok)
    }
}
