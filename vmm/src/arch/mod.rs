//! Architecture specific VM and vCPU bring-up.
//!
//! The strategy is picked once per VM from its [`Arch`] and dispatched by
//! matching on [`VCpuInitializer`]; there is no runtime probing of the guest.
pub mod arm64;
pub mod x86_64;

use crate::hypervisor::HostHypervisor;
use crate::VmError;
use devices::bus::IoSpace;

/// Guest physical address the kernel image is entered at.
pub const KERNEL_ENTRY: u64 = 0x10_0000;
/// Guest physical address of the boot parameter block.
pub const BOOT_PARAMS: u64 = 0x1_0000;

/// Guest memory ends below this address; the range above holds the
/// platform's reserved pages and device windows.
pub const MEMORY_LIMIT: u64 = 0xc000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    /// Architecture of the machine this crate is built for.
    pub const fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else {
            Arch::X86_64
        }
    }

    /// Where the guest reaches the PCI configuration mechanism.
    pub fn pci_config_window(&self) -> (IoSpace, u64) {
        match self {
            Arch::X86_64 => (IoSpace::Port, devices::pci::CONFIG_ADDRESS_PORT),
            Arch::Arm64 => (IoSpace::Memory, arm64::PCI_CONFIG_BASE),
        }
    }
}

/// Sets up the VM and its vCPUs for one architecture's boot contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VCpuInitializer {
    /// The core programs registers, CPUID and MSRs itself (x86_64).
    Manual(x86_64::ManualConfig),
    /// The host picks the CPU model (arm64).
    HostDelegated(arm64::HostDelegated),
}

impl VCpuInitializer {
    pub fn new(arch: Arch, vcpus: u32) -> Self {
        match arch {
            Arch::X86_64 => VCpuInitializer::Manual(x86_64::ManualConfig::default()),
            Arch::Arm64 => VCpuInitializer::HostDelegated(arm64::HostDelegated::new(vcpus)),
        }
    }

    pub fn arch(&self) -> Arch {
        match self {
            VCpuInitializer::Manual(_) => Arch::X86_64,
            VCpuInitializer::HostDelegated(_) => Arch::Arm64,
        }
    }

    /// VM-level setup, before any vCPU exists.
    pub fn setup_vm<H: HostHypervisor>(&self, host: &H) -> Result<(), VmError> {
        match self {
            VCpuInitializer::Manual(c) => c.setup_vm(host),
            VCpuInitializer::HostDelegated(c) => c.setup_vm(host),
        }
    }

    /// Initialise vCPU `id`. The boot vCPU also gets the entry state.
    pub fn setup_vcpu<H: HostHypervisor>(
        &self,
        host: &H,
        vcpu: &H::Vcpu,
        id: u32,
        boot: bool,
    ) -> Result<(), VmError> {
        match self {
            VCpuInitializer::Manual(c) => c.setup_vcpu(host, vcpu, id, boot),
            VCpuInitializer::HostDelegated(c) => c.setup_vcpu(host, vcpu, boot),
        }
    }

    /// VM-level setup that needs every vCPU.
    pub fn finish_vm<H: HostHypervisor>(&self, host: &H) -> Result<(), VmError> {
        match self {
            VCpuInitializer::Manual(_) => Ok(()),
            VCpuInitializer::HostDelegated(c) => c.finish_vm(host),
        }
    }
}
