//! The hypervisor core.
//!
//! A [`VmBuilder`] takes a [`HostHypervisor`] and a [`VmConfig`], maps the
//! guest memory into the host, performs the architecture's VM-level setup,
//! attaches virtio devices on the PCI bus and finally creates and
//! initialises the vCPUs. The result is a [`VirtualMachine`] whose vCPUs
//! forward their I/O exits to the emulated buses.

pub mod arch;
mod config;
mod dispatch;
pub mod hypervisor;
#[cfg(target_os = "linux")]
pub mod kvm;
mod vcpu;
mod vm;
mod vmexits;

pub use arch::{Arch, VCpuInitializer};
pub use config::VmConfig;
pub use dispatch::HostIoDispatch;
pub use hypervisor::{HostError, HostHypervisor, HostVcpu, VcpuExit};
pub use vcpu::{VCpu, VCpuState};
pub use vm::{VirtualMachine, VmBuilder};
pub use vmexits::{VmexitController, VmexitResult};

/// Errors of the hypervisor core.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Memory(#[from] memory::MemoryError),
    /// A host call failed.
    #[error("{op} failed: {source}")]
    Host {
        op: &'static str,
        #[source]
        source: HostError,
    },
    #[error(transparent)]
    Bus(#[from] devices::bus::BusError),
    #[error(transparent)]
    Pci(#[from] devices::pci::PciError),
    #[error(transparent)]
    Virtio(#[from] devices::virtio::VirtioError),
    #[error("event channel: {0}")]
    Event(#[source] std::io::Error),
    /// The host does not run vCPUs of the requested architecture.
    #[error("{0:?} guests are not supported by this host")]
    UnsupportedArch(Arch),
    /// The host accepted only `written` of `expected` MSRs.
    #[error("host accepted {written} of {expected} MSRs")]
    ShortMsrWrite { written: usize, expected: usize },
    /// No controller handled a vmexit.
    #[error("unhandled vmexit: {0}")]
    HandleVmexitFailed(String),
    #[error("vCPU thread: {0}")]
    VcpuThread(String),
}

/// Attach the name of the host call to its error.
pub(crate) trait HostResultExt<T> {
    fn op(self, op: &'static str) -> Result<T, VmError>;
}

impl<T> HostResultExt<T> for Result<T, HostError> {
    #[inline]
    fn op(self, op: &'static str) -> Result<T, VmError> {
        self.map_err(|source| VmError::Host { op, source })
    }
}
