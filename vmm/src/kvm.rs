//! KVM backend of the host capabilities.
use crate::arch::Arch;
use crate::hypervisor::{
    CpuidEntry, GicLayout, HostError, HostHypervisor, HostVcpu, MsrEntry, Registers, Segment, SpecialRegisters,
    VcpuExit, VcpuTarget,
};
use crate::{HostResultExt, VmError};
use devices::bus::IoSpace;
use devices::event::EventChannel;
use kvm_bindings::*;
use kvm_ioctls::{DeviceFd, IoEventAddress, Kvm, NoDatamatch, VcpuFd, VmFd};
use parking_lot::Mutex;

fn unsupported() -> HostError {
    HostError::new(libc::ENOSYS)
}

fn io_event_address(space: IoSpace, addr: u64) -> IoEventAddress {
    match space {
        IoSpace::Port => IoEventAddress::Pio(addr),
        IoSpace::Memory => IoEventAddress::Mmio(addr),
    }
}

/// A KVM virtual machine.
pub struct KvmHypervisor {
    kvm: Kvm,
    vm: VmFd,
    gic: Mutex<Option<DeviceFd>>,
}

impl KvmHypervisor {
    /// Open `/dev/kvm` and create an empty VM.
    pub fn new() -> Result<Self, VmError> {
        if !cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            return Err(VmError::UnsupportedArch(Arch::host()));
        }
        let kvm = Kvm::new().op("open /dev/kvm")?;
        let vm = kvm.create_vm().op("create_vm")?;
        Ok(Self {
            kvm,
            vm,
            gic: Mutex::new(None),
        })
    }

    #[cfg(target_arch = "aarch64")]
    fn gic_attr(&self, group: u32, attr: u64, addr: u64) -> Result<(), HostError> {
        let gic = self.gic.lock();
        let fd = gic.as_ref().ok_or_else(|| HostError::new(libc::ENODEV))?;
        fd.set_device_attr(&kvm_device_attr {
            flags: 0,
            group,
            attr,
            addr,
        })
    }
}

impl HostHypervisor for KvmHypervisor {
    type Vcpu = KvmVcpu;

    fn arch(&self) -> Arch {
        Arch::host()
    }

    fn set_user_memory(&self, slot: u32, guest_addr: u64, size: u64, host_addr: u64) -> Result<(), HostError> {
        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: guest_addr,
            memory_size: size,
            userspace_addr: host_addr,
        };
        // SAFETY: the region is owned by the VM's address space, which the
        // VirtualMachine drops after this VM handle.
        unsafe { self.vm.set_user_memory_region(region) }
    }

    fn set_tss_address(&self, addr: u64) -> Result<(), HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            self.vm.set_tss_address(addr as usize)
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = addr;
            Err(unsupported())
        }
    }

    fn set_identity_map_address(&self, addr: u64) -> Result<(), HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            self.vm.set_identity_map_address(addr)
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = addr;
            Err(unsupported())
        }
    }

    fn create_irq_chip(&self) -> Result<(), HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            self.vm.create_irq_chip()
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Err(unsupported())
        }
    }

    fn create_pit(&self) -> Result<(), HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            let config = kvm_pit_config {
                flags: KVM_PIT_SPEAKER_DUMMY,
                ..Default::default()
            };
            self.vm.create_pit2(config)
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Err(unsupported())
        }
    }

    fn create_gic(&self, layout: &GicLayout) -> Result<(), HostError> {
        #[cfg(target_arch = "aarch64")]
        {
            let mut device = kvm_create_device {
                type_: kvm_device_type_KVM_DEV_TYPE_ARM_VGIC_V3,
                fd: 0,
                flags: 0,
            };
            let fd = self.vm.create_device(&mut device)?;
            *self.gic.lock() = Some(fd);
            let dist = layout.dist_base;
            let redist = layout.redist_base;
            self.gic_attr(
                KVM_DEV_ARM_VGIC_GRP_ADDR,
                KVM_VGIC_V3_ADDR_TYPE_DIST as u64,
                &dist as *const u64 as u64,
            )?;
            self.gic_attr(
                KVM_DEV_ARM_VGIC_GRP_ADDR,
                KVM_VGIC_V3_ADDR_TYPE_REDIST as u64,
                &redist as *const u64 as u64,
            )
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = layout;
            Err(unsupported())
        }
    }

    fn finalize_irq_chip(&self) -> Result<(), HostError> {
        #[cfg(target_arch = "aarch64")]
        {
            self.gic_attr(KVM_DEV_ARM_VGIC_GRP_CTRL, KVM_DEV_ARM_VGIC_CTRL_INIT as u64, 0)
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            // The in-kernel irq chip of x86 is complete once created.
            Ok(())
        }
    }

    fn create_vcpu(&self, id: u32) -> Result<KvmVcpu, HostError> {
        Ok(KvmVcpu {
            fd: self.vm.create_vcpu(id as u64)?,
        })
    }

    fn supported_cpuid(&self, capacity: usize) -> Result<Vec<CpuidEntry>, HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            let cpuid = self.kvm.get_supported_cpuid(capacity.min(KVM_MAX_CPUID_ENTRIES))?;
            Ok(cpuid.as_slice().iter().map(CpuidEntry::from).collect())
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (capacity, &self.kvm);
            Err(unsupported())
        }
    }

    fn preferred_target(&self) -> Result<VcpuTarget, HostError> {
        #[cfg(target_arch = "aarch64")]
        {
            let mut init = kvm_vcpu_init::default();
            self.vm.get_preferred_target(&mut init)?;
            Ok(VcpuTarget {
                target: init.target,
                features: init.features,
            })
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            Err(unsupported())
        }
    }

    fn register_irqfd(&self, event: &EventChannel, gsi: u32) -> Result<(), HostError> {
        self.vm.register_irqfd(event.event_fd(), gsi)
    }

    fn register_ioevent(&self, event: &EventChannel, space: IoSpace, addr: u64) -> Result<(), HostError> {
        self.vm
            .register_ioevent(event.event_fd(), &io_event_address(space, addr), NoDatamatch)
    }

    fn unregister_ioevent(&self, event: &EventChannel, space: IoSpace, addr: u64) -> Result<(), HostError> {
        self.vm
            .unregister_ioevent(event.event_fd(), &io_event_address(space, addr), NoDatamatch)
    }
}

/// A KVM vCPU.
pub struct KvmVcpu {
    fd: VcpuFd,
}

#[cfg(target_arch = "x86_64")]
impl From<&kvm_cpuid_entry2> for CpuidEntry {
    fn from(e: &kvm_cpuid_entry2) -> Self {
        Self {
            function: e.function,
            index: e.index,
            flags: e.flags,
            eax: e.eax,
            ebx: e.ebx,
            ecx: e.ecx,
            edx: e.edx,
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl From<&CpuidEntry> for kvm_cpuid_entry2 {
    fn from(e: &CpuidEntry) -> Self {
        kvm_cpuid_entry2 {
            function: e.function,
            index: e.index,
            flags: e.flags,
            eax: e.eax,
            ebx: e.ebx,
            ecx: e.ecx,
            edx: e.edx,
            ..Default::default()
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl From<&kvm_segment> for Segment {
    fn from(s: &kvm_segment) -> Self {
        Self {
            base: s.base,
            limit: s.limit,
            selector: s.selector,
            type_: s.type_,
            present: s.present,
            dpl: s.dpl,
            db: s.db,
            s: s.s,
            l: s.l,
            g: s.g,
            avl: s.avl,
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Segment {
    fn apply(&self, s: &mut kvm_segment) {
        s.base = self.base;
        s.limit = self.limit;
        s.selector = self.selector;
        s.type_ = self.type_;
        s.present = self.present;
        s.dpl = self.dpl;
        s.db = self.db;
        s.s = self.s;
        s.l = self.l;
        s.g = self.g;
        s.avl = self.avl;
        s.unusable = 0;
    }
}

impl HostVcpu for KvmVcpu {
    fn get_regs(&self) -> Result<Registers, HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            let r = self.fd.get_regs()?;
            Ok(Registers {
                rax: r.rax,
                rbx: r.rbx,
                rcx: r.rcx,
                rdx: r.rdx,
                rsi: r.rsi,
                rdi: r.rdi,
                rsp: r.rsp,
                rbp: r.rbp,
                r8: r.r8,
                r9: r.r9,
                r10: r.r10,
                r11: r.r11,
                r12: r.r12,
                r13: r.r13,
                r14: r.r14,
                r15: r.r15,
                rip: r.rip,
                rflags: r.rflags,
            })
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Err(unsupported())
        }
    }

    fn set_regs(&self, regs: &Registers) -> Result<(), HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            self.fd.set_regs(&kvm_regs {
                rax: regs.rax,
                rbx: regs.rbx,
                rcx: regs.rcx,
                rdx: regs.rdx,
                rsi: regs.rsi,
                rdi: regs.rdi,
                rsp: regs.rsp,
                rbp: regs.rbp,
                r8: regs.r8,
                r9: regs.r9,
                r10: regs.r10,
                r11: regs.r11,
                r12: regs.r12,
                r13: regs.r13,
                r14: regs.r14,
                r15: regs.r15,
                rip: regs.rip,
                rflags: regs.rflags,
            })
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = regs;
            Err(unsupported())
        }
    }

    fn get_sregs(&self) -> Result<SpecialRegisters, HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            let s = self.fd.get_sregs()?;
            Ok(SpecialRegisters {
                cs: (&s.cs).into(),
                ds: (&s.ds).into(),
                es: (&s.es).into(),
                fs: (&s.fs).into(),
                gs: (&s.gs).into(),
                ss: (&s.ss).into(),
                cr0: s.cr0,
                cr3: s.cr3,
                cr4: s.cr4,
                efer: s.efer,
            })
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Err(unsupported())
        }
    }

    fn set_sregs(&self, sregs: &SpecialRegisters) -> Result<(), HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            // Everything the core does not model keeps the host's value.
            let mut s = self.fd.get_sregs()?;
            sregs.cs.apply(&mut s.cs);
            sregs.ds.apply(&mut s.ds);
            sregs.es.apply(&mut s.es);
            sregs.fs.apply(&mut s.fs);
            sregs.gs.apply(&mut s.gs);
            sregs.ss.apply(&mut s.ss);
            s.cr0 = sregs.cr0;
            s.cr3 = sregs.cr3;
            s.cr4 = sregs.cr4;
            s.efer = sregs.efer;
            self.fd.set_sregs(&s)
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = sregs;
            Err(unsupported())
        }
    }

    fn set_cpuid(&self, entries: &[CpuidEntry]) -> Result<(), HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            let raw: Vec<kvm_cpuid_entry2> = entries.iter().map(kvm_cpuid_entry2::from).collect();
            let cpuid = CpuId::from_entries(&raw).map_err(|_| HostError::new(libc::EINVAL))?;
            self.fd.set_cpuid2(&cpuid)
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = entries;
            Err(unsupported())
        }
    }

    fn set_msrs(&self, entries: &[MsrEntry]) -> Result<usize, HostError> {
        #[cfg(target_arch = "x86_64")]
        {
            let raw: Vec<kvm_msr_entry> = entries
                .iter()
                .map(|e| kvm_msr_entry {
                    index: e.msr_index,
                    data: e.msr_value,
                    ..Default::default()
                })
                .collect();
            let msrs = Msrs::from_entries(&raw).map_err(|_| HostError::new(libc::EINVAL))?;
            self.fd.set_msrs(&msrs)
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = entries;
            Err(unsupported())
        }
    }

    fn init(&self, target: &VcpuTarget) -> Result<(), HostError> {
        #[cfg(target_arch = "aarch64")]
        {
            self.fd.vcpu_init(&kvm_vcpu_init {
                target: target.target,
                features: target.features,
            })
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = target;
            Err(unsupported())
        }
    }

    fn run(&mut self) -> Result<VcpuExit<'_>, HostError> {
        use kvm_ioctls::VcpuExit as Kvm;
        Ok(match self.fd.run()? {
            Kvm::IoIn(port, data) => VcpuExit::IoIn(port, data),
            Kvm::IoOut(port, data) => VcpuExit::IoOut(port, data),
            Kvm::MmioRead(addr, data) => VcpuExit::MmioRead(addr, data),
            Kvm::MmioWrite(addr, data) => VcpuExit::MmioWrite(addr, data),
            Kvm::Hlt => VcpuExit::Halt,
            Kvm::Shutdown | Kvm::SystemEvent(..) => VcpuExit::Shutdown,
            other => VcpuExit::Unhandled(format!("{:?}", other)),
        })
    }
}
