//! Capabilities the hypervisor core needs from the host.
//!
//! Every ioctl-style call the core issues goes through [`HostHypervisor`] or
//! [`HostVcpu`]. The KVM backend implements them on Linux; tests inject a
//! recording fake.
use crate::arch::Arch;
use devices::bus::IoSpace;
use devices::event::EventChannel;

/// Error of a host call; carries the host's errno.
pub type HostError = vmm_sys_util::errno::Error;

/// General purpose registers of an x86_64 vCPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// A segment register, in the hidden (descriptor cache) format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    /// Default operation size.
    pub db: u8,
    pub s: u8,
    pub l: u8,
    /// Granularity.
    pub g: u8,
    pub avl: u8,
}

/// The special registers the core programs. Backends keep every other
/// piece of the host's special register state as it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialRegisters {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

/// One CPUID leaf as reported by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidEntry {
    pub function: u32,
    pub index: u32,
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsrEntry {
    pub msr_index: u32,
    pub msr_value: u64,
}

/// CPU model an arm64 vCPU is initialised with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VcpuTarget {
    pub target: u32,
    pub features: [u32; 7],
}

/// Guest placement of the GICv3 frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GicLayout {
    pub dist_base: u64,
    pub dist_size: u64,
    pub redist_base: u64,
    pub redist_size: u64,
}

/// Why a vCPU stopped running guest code.
#[derive(Debug)]
pub enum VcpuExit<'a> {
    IoIn(u16, &'a mut [u8]),
    IoOut(u16, &'a [u8]),
    MmioRead(u64, &'a mut [u8]),
    MmioWrite(u64, &'a [u8]),
    Halt,
    Shutdown,
    /// Anything else, described by the backend.
    Unhandled(String),
}

/// A virtual machine on the host.
pub trait HostHypervisor
where
    Self: Send + Sync + 'static,
{
    type Vcpu: HostVcpu;

    /// Architecture of the vCPUs this host runs.
    fn arch(&self) -> Arch;

    /// Back guest physical `[guest_addr, guest_addr + size)` with host memory
    /// at `host_addr`.
    fn set_user_memory(&self, slot: u32, guest_addr: u64, size: u64, host_addr: u64) -> Result<(), HostError>;

    fn set_tss_address(&self, addr: u64) -> Result<(), HostError>;

    fn set_identity_map_address(&self, addr: u64) -> Result<(), HostError>;

    /// Create the in-kernel PIC, IOAPIC and local APICs.
    fn create_irq_chip(&self) -> Result<(), HostError>;

    /// Create the in-kernel interval timer.
    fn create_pit(&self) -> Result<(), HostError>;

    fn create_gic(&self, layout: &GicLayout) -> Result<(), HostError>;

    /// Last step of interrupt controller setup, once every vCPU exists.
    fn finalize_irq_chip(&self) -> Result<(), HostError>;

    fn create_vcpu(&self, id: u32) -> Result<Self::Vcpu, HostError>;

    /// CPUID leaves the host supports, at most `capacity` of them.
    fn supported_cpuid(&self, capacity: usize) -> Result<Vec<CpuidEntry>, HostError>;

    fn preferred_target(&self) -> Result<VcpuTarget, HostError>;

    /// Inject interrupt line `gsi` whenever `event` is signalled.
    fn register_irqfd(&self, event: &EventChannel, gsi: u32) -> Result<(), HostError>;

    /// Signal `event` on guest writes to `addr` without exiting to the core.
    fn register_ioevent(&self, event: &EventChannel, space: IoSpace, addr: u64) -> Result<(), HostError>;

    fn unregister_ioevent(&self, event: &EventChannel, space: IoSpace, addr: u64) -> Result<(), HostError>;
}

/// A vCPU on the host.
pub trait HostVcpu
where
    Self: Send,
{
    fn get_regs(&self) -> Result<Registers, HostError>;

    fn set_regs(&self, regs: &Registers) -> Result<(), HostError>;

    fn get_sregs(&self) -> Result<SpecialRegisters, HostError>;

    fn set_sregs(&self, sregs: &SpecialRegisters) -> Result<(), HostError>;

    fn set_cpuid(&self, entries: &[CpuidEntry]) -> Result<(), HostError>;

    /// Returns the number of entries the host accepted.
    fn set_msrs(&self, entries: &[MsrEntry]) -> Result<usize, HostError>;

    fn init(&self, target: &VcpuTarget) -> Result<(), HostError>;

    /// Run guest code until the next exit.
    fn run(&mut self) -> Result<VcpuExit<'_>, HostError>;
}
