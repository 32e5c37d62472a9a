//! A host that records every call instead of talking to a hypervisor.
#![allow(dead_code)]
use devices::bus::IoSpace;
use devices::event::EventChannel;
use devices::virtio::{ChainBuffers, DeviceType, QueueError, VirtioBackend};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use vmm::hypervisor::{
    CpuidEntry, GicLayout, MsrEntry, Registers, SpecialRegisters, VcpuTarget,
};
use vmm::{Arch, HostError, HostHypervisor, HostVcpu, VcpuExit};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetUserMemory { slot: u32, guest_addr: u64, size: u64 },
    SetTssAddress(u64),
    SetIdentityMapAddress(u64),
    CreateIrqChip,
    CreatePit,
    CreateGic(GicLayout),
    FinalizeIrqChip,
    CreateVcpu(u32),
    SupportedCpuid(usize),
    PreferredTarget,
    RegisterIrqfd(u32),
    RegisterIoevent(IoSpace, u64),
    UnregisterIoevent(IoSpace, u64),
    SetRegs(u32, Registers),
    GetSregs(u32),
    SetSregs(u32, SpecialRegisters),
    SetCpuid(u32, Vec<CpuidEntry>),
    SetMsrs(u32, Vec<MsrEntry>),
    Init(u32, VcpuTarget),
}

/// What a fake vCPU does on each entry.
#[derive(Debug, Clone)]
pub enum Exit {
    Out(u16, Vec<u8>),
    In(u16, usize),
    Shutdown,
    Unhandled,
}

pub type Log = Arc<Mutex<Vec<Call>>>;

pub struct FakeHost {
    pub arch: Arch,
    pub cpuid: Vec<CpuidEntry>,
    /// Accept at most this many MSRs.
    pub msr_limit: Option<usize>,
    pub target: VcpuTarget,
    /// Host call that fails with EIO.
    pub fail_on: Option<&'static str>,
    pub calls: Log,
    /// Per vCPU id; an exhausted script halts.
    pub scripts: Mutex<VecDeque<Vec<Exit>>>,
    /// Bytes each `In` exit was answered with.
    pub reads: Arc<Mutex<Vec<Vec<u8>>>>,
}

pub const INITIAL_CR0: u64 = 0x10;

pub fn leaf(function: u32, ebx: u32) -> CpuidEntry {
    CpuidEntry {
        function,
        ebx,
        ..Default::default()
    }
}

impl FakeHost {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            cpuid: vec![leaf(0, 0x756e_6547), leaf(1, 0x0008_0800), leaf(0x4000_0000, 0)],
            msr_limit: None,
            target: VcpuTarget {
                target: 5,
                features: [0; 7],
            },
            fail_on: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            scripts: Mutex::new(VecDeque::new()),
            reads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn script(self, exits: Vec<Exit>) -> Self {
        self.scripts.lock().push_back(exits);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record(&self, op: &'static str, call: Call) -> Result<(), HostError> {
        self.calls.lock().push(call);
        match self.fail_on {
            Some(f) if f == op => Err(HostError::new(libc::EIO)),
            _ => Ok(()),
        }
    }
}

impl HostHypervisor for FakeHost {
    type Vcpu = FakeVcpu;

    fn arch(&self) -> Arch {
        self.arch
    }

    fn set_user_memory(&self, slot: u32, guest_addr: u64, size: u64, _host_addr: u64) -> Result<(), HostError> {
        self.record("set_user_memory", Call::SetUserMemory { slot, guest_addr, size })
    }

    fn set_tss_address(&self, addr: u64) -> Result<(), HostError> {
        self.record("set_tss_address", Call::SetTssAddress(addr))
    }

    fn set_identity_map_address(&self, addr: u64) -> Result<(), HostError> {
        self.record("set_identity_map_address", Call::SetIdentityMapAddress(addr))
    }

    fn create_irq_chip(&self) -> Result<(), HostError> {
        self.record("create_irq_chip", Call::CreateIrqChip)
    }

    fn create_pit(&self) -> Result<(), HostError> {
        self.record("create_pit", Call::CreatePit)
    }

    fn create_gic(&self, layout: &GicLayout) -> Result<(), HostError> {
        self.record("create_gic", Call::CreateGic(*layout))
    }

    fn finalize_irq_chip(&self) -> Result<(), HostError> {
        self.record("finalize_irq_chip", Call::FinalizeIrqChip)
    }

    fn create_vcpu(&self, id: u32) -> Result<FakeVcpu, HostError> {
        self.record("create_vcpu", Call::CreateVcpu(id))?;
        Ok(FakeVcpu {
            id,
            calls: self.calls.clone(),
            msr_limit: self.msr_limit,
            exits: self.scripts.lock().pop_front().unwrap_or_default().into(),
            buf: Vec::new(),
            pending_read: false,
            reads: self.reads.clone(),
        })
    }

    fn supported_cpuid(&self, capacity: usize) -> Result<Vec<CpuidEntry>, HostError> {
        self.record("supported_cpuid", Call::SupportedCpuid(capacity))?;
        Ok(self.cpuid.iter().copied().take(capacity).collect())
    }

    fn preferred_target(&self) -> Result<VcpuTarget, HostError> {
        self.record("preferred_target", Call::PreferredTarget)?;
        Ok(self.target)
    }

    fn register_irqfd(&self, _event: &EventChannel, gsi: u32) -> Result<(), HostError> {
        self.record("register_irqfd", Call::RegisterIrqfd(gsi))
    }

    fn register_ioevent(&self, _event: &EventChannel, space: IoSpace, addr: u64) -> Result<(), HostError> {
        self.record("register_ioevent", Call::RegisterIoevent(space, addr))
    }

    fn unregister_ioevent(&self, _event: &EventChannel, space: IoSpace, addr: u64) -> Result<(), HostError> {
        self.record("unregister_ioevent", Call::UnregisterIoevent(space, addr))
    }
}

pub struct FakeVcpu {
    id: u32,
    calls: Log,
    msr_limit: Option<usize>,
    exits: VecDeque<Exit>,
    buf: Vec<u8>,
    pending_read: bool,
    reads: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl HostVcpu for FakeVcpu {
    fn get_regs(&self) -> Result<Registers, HostError> {
        Ok(Registers::default())
    }

    fn set_regs(&self, regs: &Registers) -> Result<(), HostError> {
        self.calls.lock().push(Call::SetRegs(self.id, *regs));
        Ok(())
    }

    fn get_sregs(&self) -> Result<SpecialRegisters, HostError> {
        self.calls.lock().push(Call::GetSregs(self.id));
        Ok(SpecialRegisters {
            cr0: INITIAL_CR0,
            ..Default::default()
        })
    }

    fn set_sregs(&self, sregs: &SpecialRegisters) -> Result<(), HostError> {
        self.calls.lock().push(Call::SetSregs(self.id, *sregs));
        Ok(())
    }

    fn set_cpuid(&self, entries: &[CpuidEntry]) -> Result<(), HostError> {
        self.calls.lock().push(Call::SetCpuid(self.id, entries.to_vec()));
        Ok(())
    }

    fn set_msrs(&self, entries: &[MsrEntry]) -> Result<usize, HostError> {
        self.calls.lock().push(Call::SetMsrs(self.id, entries.to_vec()));
        Ok(self.msr_limit.map_or(entries.len(), |l| l.min(entries.len())))
    }

    fn init(&self, target: &VcpuTarget) -> Result<(), HostError> {
        self.calls.lock().push(Call::Init(self.id, *target));
        Ok(())
    }

    fn run(&mut self) -> Result<VcpuExit<'_>, HostError> {
        if self.pending_read {
            self.reads.lock().push(self.buf.clone());
            self.pending_read = false;
        }
        Ok(match self.exits.pop_front() {
            None => VcpuExit::Halt,
            Some(Exit::Out(port, data)) => {
                self.buf = data;
                VcpuExit::IoOut(port, &self.buf)
            }
            Some(Exit::In(port, len)) => {
                self.buf = vec![0; len];
                self.pending_read = true;
                VcpuExit::IoIn(port, &mut self.buf)
            }
            Some(Exit::Shutdown) => VcpuExit::Shutdown,
            Some(Exit::Unhandled) => VcpuExit::Unhandled("debug exception".into()),
        })
    }
}

/// Guest side of configuration mechanism #1, as vCPU exits.
pub fn config_write(slot: u8, reg: u8, value: u32) -> Vec<Exit> {
    vec![
        Exit::Out(0xcf8, devices::pci::ConfigAddress::new(0, slot, 0, reg).0.to_le_bytes().to_vec()),
        Exit::Out(0xcfc, value.to_le_bytes().to_vec()),
    ]
}

pub fn config_read(slot: u8, reg: u8) -> Vec<Exit> {
    vec![
        Exit::Out(0xcf8, devices::pci::ConfigAddress::new(0, slot, 0, reg).0.to_le_bytes().to_vec()),
        Exit::In(0xcfc, 4),
    ]
}

/// A console with two queues that completes every chain empty.
pub struct Sink;

impl VirtioBackend for Sink {
    fn device_type(&self) -> DeviceType {
        DeviceType::Console
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn process(&mut self, _queue: u16, _chain: &ChainBuffers<'_>) -> Result<u32, QueueError> {
        Ok(0)
    }
}
