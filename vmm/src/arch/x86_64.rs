//! x86_64: the core configures every vCPU by hand.
use super::{BOOT_PARAMS, KERNEL_ENTRY};
use crate::hypervisor::{CpuidEntry, HostHypervisor, HostVcpu, MsrEntry, Registers, Segment};
use crate::{HostResultExt, VmError};

/// TSS pages the host virtualization needs in guest physical space.
pub const TSS_ADDRESS: u64 = 0xffff_d000;
/// Identity map page used by the host when switching modes.
pub const IDENTITY_MAP_ADDRESS: u64 = 0xffff_c000;

/// Number of CPUID leaves asked from the host. The host reports as many as
/// it has, usually far fewer.
pub const CPUID_ENTRY_CAPACITY: usize = 256;

/// Hypervisor signature leaf.
pub const CPUID_SIGNATURE_LEAF: u32 = 0x4000_0000;
/// "KVMKVMKVM\0\0\0" in ebx, ecx, edx.
const SIGNATURE: [u32; 3] = [0x4b4d_564b, 0x564b_4d56, 0x0000_004d];
/// Highest hypervisor leaf advertised through the signature leaf.
const HYPERVISOR_FEATURES_LEAF: u32 = 0x4000_0001;
const CPUID_FEATURE_LEAF: u32 = 1;

pub const MSR_IA32_TSC: u32 = 0x10;
pub const MSR_IA32_SYSENTER_CS: u32 = 0x174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x176;
pub const MSR_IA32_MISC_ENABLE: u32 = 0x1a0;
pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_CSTAR: u32 = 0xc000_0083;
pub const MSR_SYSCALL_MASK: u32 = 0xc000_0084;
pub const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;

/// IA32_MISC_ENABLE: fast string operations.
pub const MISC_ENABLE_FAST_STRING: u64 = 1 << 0;

bitflags::bitflags! {
    /// Cr0 Register.
    #[repr(transparent)]
    pub struct Cr0: u64 {
        /// Protected mode enable.
        const PE = 1 << 0;
        /// Paging.
        const PG = 1 << 31;
    }
}

/// Initial RFLAGS: only the always-one bit.
const RFLAGS_RESERVED: u64 = 0x2;

/// Entry state of the boot vCPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualConfig {
    pub entry: u64,
    pub boot_params: u64,
}

impl Default for ManualConfig {
    fn default() -> Self {
        Self {
            entry: KERNEL_ENTRY,
            boot_params: BOOT_PARAMS,
        }
    }
}

/// Rewrite the host's CPUID leaves for vCPU `id`.
///
/// Leaves that are absent are left absent.
pub fn patch_cpuid(entries: &mut [CpuidEntry], id: u32) {
    let mut signature = false;
    for entry in entries.iter_mut() {
        match entry.function {
            CPUID_FEATURE_LEAF => {
                // Initial APIC id.
                entry.ebx = (entry.ebx & 0x00ff_ffff) | (id << 24);
            }
            CPUID_SIGNATURE_LEAF => {
                entry.eax = HYPERVISOR_FEATURES_LEAF;
                entry.ebx = SIGNATURE[0];
                entry.ecx = SIGNATURE[1];
                entry.edx = SIGNATURE[2];
                signature = true;
            }
            _ => (),
        }
    }
    if !signature {
        log::info!("vcpu{}: host reports no hypervisor signature leaf; not advertising one", id);
    }
}

/// MSRs every vCPU starts with.
pub fn boot_msrs() -> Vec<MsrEntry> {
    let msr = |msr_index, msr_value| MsrEntry { msr_index, msr_value };
    vec![
        msr(MSR_IA32_MISC_ENABLE, MISC_ENABLE_FAST_STRING),
        msr(MSR_IA32_TSC, 0),
        msr(MSR_IA32_SYSENTER_CS, 0),
        msr(MSR_IA32_SYSENTER_ESP, 0),
        msr(MSR_IA32_SYSENTER_EIP, 0),
        msr(MSR_STAR, 0),
        msr(MSR_LSTAR, 0),
        msr(MSR_CSTAR, 0),
        msr(MSR_SYSCALL_MASK, 0),
        msr(MSR_KERNEL_GS_BASE, 0),
    ]
}

/// Flat 4GiB segment.
fn flat_segment(selector: u16, type_: u8, db: u8) -> Segment {
    Segment {
        base: 0,
        limit: 0xffff_ffff,
        selector,
        type_,
        present: 1,
        dpl: 0,
        db,
        s: 1,
        l: 0,
        g: 1,
        avl: 0,
    }
}

impl ManualConfig {
    pub(super) fn setup_vm<H: HostHypervisor>(&self, host: &H) -> Result<(), VmError> {
        host.set_tss_address(TSS_ADDRESS).op("set_tss_address")?;
        host.set_identity_map_address(IDENTITY_MAP_ADDRESS)
            .op("set_identity_map_address")?;
        host.create_irq_chip().op("create_irq_chip")?;
        host.create_pit().op("create_pit")?;
        log::info!("x86_64: irq chip and PIT created");
        Ok(())
    }

    pub(super) fn setup_vcpu<H: HostHypervisor>(
        &self,
        host: &H,
        vcpu: &H::Vcpu,
        id: u32,
        boot: bool,
    ) -> Result<(), VmError> {
        let mut cpuid = host.supported_cpuid(CPUID_ENTRY_CAPACITY).op("supported_cpuid")?;
        patch_cpuid(&mut cpuid, id);
        vcpu.set_cpuid(&cpuid).op("set_cpuid")?;

        let msrs = boot_msrs();
        let written = vcpu.set_msrs(&msrs).op("set_msrs")?;
        if written != msrs.len() {
            return Err(VmError::ShortMsrWrite {
                written,
                expected: msrs.len(),
            });
        }

        if boot {
            self.setup_boot_registers(vcpu)?;
        }
        log::debug!("vcpu{}: {} cpuid leaves, {} msrs", id, cpuid.len(), msrs.len());
        Ok(())
    }

    fn setup_boot_registers<V: HostVcpu>(&self, vcpu: &V) -> Result<(), VmError> {
        let mut sregs = vcpu.get_sregs().op("get_sregs")?;
        let code = flat_segment(0x10, 0xb, 1);
        let data = flat_segment(0x18, 0x3, 0);
        sregs.cs = code;
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = Segment { db: 1, ..data };
        sregs.cr0 |= Cr0::PE.bits();
        vcpu.set_sregs(&sregs).op("set_sregs")?;

        let regs = Registers {
            rflags: RFLAGS_RESERVED,
            rip: self.entry,
            rsi: self.boot_params,
            ..Default::default()
        };
        vcpu.set_regs(&regs).op("set_regs")?;
        Ok(())
    }
}
