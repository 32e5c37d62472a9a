//! Virtual cpu.
use crate::arch::Arch;
use crate::hypervisor::{HostVcpu, VcpuExit};
use crate::vmexits::{VmexitController, VmexitResult};
use crate::{HostResultExt, VmError};
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle of a [`VCpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VCpuState {
    /// Initialised, never entered.
    Created,
    Running,
    /// Stopped on a guest halt or a kick.
    Halted,
    /// The guest powered off.
    Shutdown,
}

/// One initialised vCPU of a [`VirtualMachine`](crate::VirtualMachine).
pub struct VCpu<V: HostVcpu> {
    id: u32,
    arch: Arch,
    host: V,
    state: VCpuState,
}

impl<V: HostVcpu> VCpu<V> {
    pub(crate) fn new(id: u32, arch: Arch, host: V) -> Self {
        Self {
            id,
            arch,
            host,
            state: VCpuState::Created,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    #[inline]
    pub fn state(&self) -> VCpuState {
        self.state
    }

    /// The host's vCPU handle.
    #[inline]
    pub fn host(&self) -> &V {
        &self.host
    }

    /// Run the guest until it halts or powers off, or until `kicked` is
    /// found set before an entry.
    ///
    /// I/O exits go to `controller`; an exit no controller handles stops the
    /// vCPU with [`VmError::HandleVmexitFailed`].
    pub fn run<C: VmexitController>(&mut self, controller: &C, kicked: &AtomicBool) -> Result<VmexitResult, VmError> {
        self.state = VCpuState::Running;
        let Self { id, host, state, .. } = self;
        loop {
            // Check whether this vcpu is kicked.
            if kicked.load(Ordering::SeqCst) {
                *state = VCpuState::Halted;
                return Ok(VmexitResult::Halted);
            }
            let mut exit = match host.run() {
                Ok(exit) => exit,
                Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => continue,
                Err(e) => {
                    *state = VCpuState::Halted;
                    return Err(VmError::Host { op: "vcpu_run", source: e });
                }
            };
            let result = match exit {
                VcpuExit::Halt => Ok(VmexitResult::Halted),
                VcpuExit::Shutdown => Ok(VmexitResult::Shutdown),
                _ => controller.handle(&mut exit),
            };
            match result {
                Ok(VmexitResult::Ok) => (),
                Ok(VmexitResult::Halted) => {
                    log::info!("vcpu{}: halted", id);
                    *state = VCpuState::Halted;
                    return Ok(VmexitResult::Halted);
                }
                Ok(VmexitResult::Shutdown) => {
                    log::info!("vcpu{}: shutdown", id);
                    *state = VCpuState::Shutdown;
                    return Ok(VmexitResult::Shutdown);
                }
                Err(e) => {
                    log::error!("vcpu{}: {}", id, e);
                    *state = VCpuState::Halted;
                    return Err(e);
                }
            }
        }
    }

    /// Current general purpose registers.
    pub fn registers(&self) -> Result<crate::hypervisor::Registers, VmError> {
        self.host.get_regs().op("get_regs")
    }
}
