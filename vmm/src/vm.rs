//! Virtual machine construction and lifecycle.
use crate::arch::{VCpuInitializer, MEMORY_LIMIT};
use crate::dispatch::HostIoDispatch;
use crate::hypervisor::HostHypervisor;
use crate::vcpu::VCpu;
use crate::vmexits::VmexitResult;
use crate::{HostResultExt, VmConfig, VmError};
use devices::bus::IoDispatch;
use devices::pci::{PciBus, CONFIG_PORT_LEN};
use devices::virtio::{TransportConfig, VirtioBackend, VirtioPciDevice};
use memory::{GuestAddressSpace, MemoryError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Builds a [`VirtualMachine`].
///
/// [`new`](Self::new) maps the guest memory and performs the VM-level
/// setup. Devices are attached afterward, and [`finalize`](Self::finalize)
/// creates the vCPUs.
pub struct VmBuilder<H: HostHypervisor> {
    config: VmConfig,
    initializer: VCpuInitializer,
    devices: Vec<Arc<VirtioPciDevice>>,
    pci: Arc<PciBus>,
    dispatch: Arc<HostIoDispatch<H>>,
    host: Arc<H>,
    memory: Arc<GuestAddressSpace>,
}

impl<H: HostHypervisor> VmBuilder<H> {
    pub fn new(host: Arc<H>, config: VmConfig) -> Result<Self, VmError> {
        if host.arch() != config.arch {
            return Err(VmError::UnsupportedArch(config.arch));
        }
        if config.memory_size as u64 > MEMORY_LIMIT {
            return Err(MemoryError::InvalidSize(config.memory_size).into());
        }

        let memory = Arc::new(GuestAddressSpace::new(config.memory_size)?);
        host.set_user_memory(0, 0, memory.size() as u64, memory.host_address())
            .op("set_user_memory")?;
        log::info!("vm: {:#x} bytes of guest memory mapped", memory.size());

        let initializer = VCpuInitializer::new(config.arch, config.vcpus);
        initializer.setup_vm(&*host)?;

        let dispatch = Arc::new(HostIoDispatch::new(host.clone()));
        let weak: Weak<dyn IoDispatch> = {
            let d: Arc<dyn IoDispatch> = dispatch.clone();
            Arc::downgrade(&d)
        };
        let pci = Arc::new(PciBus::new(weak));
        let (space, base) = config.arch.pci_config_window();
        dispatch.map(space, base, CONFIG_PORT_LEN, pci.clone())?;

        Ok(Self {
            config,
            initializer,
            devices: Vec::new(),
            pci,
            dispatch,
            host,
            memory,
        })
    }

    #[inline]
    pub fn memory(&self) -> &Arc<GuestAddressSpace> {
        &self.memory
    }

    /// Attach a virtio device with the default transport parameters.
    pub fn attach(&mut self, backend: Box<dyn VirtioBackend>) -> Result<Arc<VirtioPciDevice>, VmError> {
        self.attach_with(backend, TransportConfig::default())
    }

    /// Attach a virtio device on the next free slot and interrupt line.
    pub fn attach_with(
        &mut self,
        backend: Box<dyn VirtioBackend>,
        config: TransportConfig,
    ) -> Result<Arc<VirtioPciDevice>, VmError> {
        let irq = self.config.irq_base.wrapping_add(self.devices.len() as u8);
        let device = Arc::new(VirtioPciDevice::new(backend, self.memory.clone(), irq, config)?);
        self.host
            .register_irqfd(device.interrupt(), irq as u32)
            .op("register_irqfd")?;
        let slot = self.pci.add_device(device.clone())?;
        log::info!("vm: virtio-{:?} on slot {}, irq {}", device.device_type(), slot, irq);
        self.devices.push(device.clone());
        Ok(device)
    }

    /// Create and initialise every vCPU.
    pub fn finalize(self) -> Result<VirtualMachine<H>, VmError> {
        let Self {
            config,
            initializer,
            devices,
            pci,
            dispatch,
            host,
            memory,
        } = self;
        let mut vcpus = Vec::with_capacity(config.vcpus as usize);
        for id in 0..config.vcpus {
            let vcpu = host.create_vcpu(id).op("create_vcpu")?;
            initializer.setup_vcpu(&*host, &vcpu, id, id == 0)?;
            vcpus.push(VCpu::new(id, config.arch, vcpu));
        }
        initializer.finish_vm(&*host)?;
        log::info!("vm: {} vcpu(s) ready", vcpus.len());
        Ok(VirtualMachine {
            devices,
            vcpus,
            pci,
            dispatch,
            host,
            memory,
            kicked: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// A constructed virtual machine.
///
/// Fields drop in declaration order: device workers first, the guest
/// memory last.
pub struct VirtualMachine<H: HostHypervisor> {
    devices: Vec<Arc<VirtioPciDevice>>,
    vcpus: Vec<VCpu<H::Vcpu>>,
    pci: Arc<PciBus>,
    dispatch: Arc<HostIoDispatch<H>>,
    host: Arc<H>,
    memory: Arc<GuestAddressSpace>,
    kicked: Arc<AtomicBool>,
}

impl<H: HostHypervisor> VirtualMachine<H> {
    /// Run every vCPU on its own thread until all of them stop.
    ///
    /// Returns why each vCPU stopped, indexed by vCPU id.
    pub fn run(&mut self) -> Result<Vec<VmexitResult>, VmError> {
        let Self {
            vcpus,
            dispatch,
            kicked,
            ..
        } = self;
        let buses = dispatch.buses();
        let kicked: &AtomicBool = &**kicked;
        let results = crossbeam_utils::thread::scope(|s| {
            let mut handles = Vec::with_capacity(vcpus.len());
            for vcpu in vcpus.iter_mut() {
                let id = vcpu.id();
                let handle = s
                    .builder()
                    .name(format!("vcpu{}", id))
                    .spawn(move |_| vcpu.run(buses, kicked))
                    .map_err(|e| VmError::VcpuThread(e.to_string()))?;
                handles.push((id, handle));
            }
            handles
                .into_iter()
                .map(|(id, handle)| {
                    handle
                        .join()
                        .map_err(|_| VmError::VcpuThread(format!("vcpu{} panicked", id)))?
                })
                .collect::<Result<Vec<_>, VmError>>()
        })
        .map_err(|_| VmError::VcpuThread("vcpu scope panicked".into()))??;
        Ok(results)
    }

    /// Flag that stops every vCPU before its next guest entry.
    ///
    /// A vCPU already inside the guest stops at its next exit; setting the
    /// flag does not force one.
    // TODO: set `immediate_exit` and signal the vcpu threads so that a vCPU
    // blocked in KVM_RUN returns at once.
    pub fn kicker(&self) -> Arc<AtomicBool> {
        self.kicked.clone()
    }

    /// Set the kick flag and join every device worker.
    ///
    /// vCPUs stop before their next guest entry, as with [`Self::kicker`].
    pub fn shutdown(&self) {
        self.kicked.store(true, Ordering::SeqCst);
        for device in &self.devices {
            device.shutdown();
        }
    }

    #[inline]
    pub fn memory(&self) -> &Arc<GuestAddressSpace> {
        &self.memory
    }

    #[inline]
    pub fn vcpus(&self) -> &[VCpu<H::Vcpu>] {
        &self.vcpus
    }

    #[inline]
    pub fn devices(&self) -> &[Arc<VirtioPciDevice>] {
        &self.devices
    }

    #[inline]
    pub fn pci(&self) -> &Arc<PciBus> {
        &self.pci
    }

    #[inline]
    pub fn dispatch(&self) -> &Arc<HostIoDispatch<H>> {
        &self.dispatch
    }

    #[inline]
    pub fn host(&self) -> &Arc<H> {
        &self.host
    }
}

impl<H: HostHypervisor> Drop for VirtualMachine<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
