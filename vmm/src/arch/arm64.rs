//! arm64: the host chooses the CPU model; the core only places the GIC.
use crate::hypervisor::{GicLayout, HostHypervisor, HostVcpu};
use crate::{HostResultExt, VmError};

/// GICv3 distributor.
pub const GIC_DIST_BASE: u64 = 0xd000_0000;
pub const GIC_DIST_SIZE: u64 = 0x1_0000;
/// GICv3 redistributors, one frame pair per vCPU.
pub const GIC_REDIST_BASE: u64 = GIC_DIST_BASE + GIC_DIST_SIZE;
pub const GIC_REDIST_SIZE_PER_CPU: u64 = 0x2_0000;
/// The GIC range ends here; the PCI window follows.
pub const GIC_LIMIT: u64 = 0xe000_0000;

/// Address and data registers of the PCI configuration mechanism.
pub const PCI_CONFIG_BASE: u64 = 0xe000_0000 - 0x1000;

/// `kvm_vcpu_init` feature: start powered off, wait for PSCI CPU_ON.
pub const VCPU_FEATURE_POWER_OFF: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDelegated {
    pub gic: GicLayout,
}

impl HostDelegated {
    pub fn new(vcpus: u32) -> Self {
        let redist_size = (vcpus.max(1) as u64 * GIC_REDIST_SIZE_PER_CPU).min(PCI_CONFIG_BASE - GIC_REDIST_BASE);
        Self {
            gic: GicLayout {
                dist_base: GIC_DIST_BASE,
                dist_size: GIC_DIST_SIZE,
                redist_base: GIC_REDIST_BASE,
                redist_size,
            },
        }
    }

    pub(super) fn setup_vm<H: HostHypervisor>(&self, host: &H) -> Result<(), VmError> {
        host.create_gic(&self.gic).op("create_gic")?;
        log::info!(
            "arm64: GICv3 distributor at {:#x}, redistributors at {:#x}",
            self.gic.dist_base,
            self.gic.redist_base
        );
        Ok(())
    }

    pub(super) fn setup_vcpu<H: HostHypervisor>(&self, host: &H, vcpu: &H::Vcpu, boot: bool) -> Result<(), VmError> {
        let mut target = host.preferred_target().op("preferred_target")?;
        if !boot {
            target.features[0] |= 1 << VCPU_FEATURE_POWER_OFF;
        }
        vcpu.init(&target).op("vcpu_init")?;
        Ok(())
    }

    pub(super) fn finish_vm<H: HostHypervisor>(&self, host: &H) -> Result<(), VmError> {
        host.finalize_irq_chip().op("finalize_irq_chip")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gic_fits_below_pci_window() {
        let one = HostDelegated::new(1);
        assert_eq!(one.gic.redist_size, GIC_REDIST_SIZE_PER_CPU);
        let many = HostDelegated::new(512);
        assert!(many.gic.redist_base + many.gic.redist_size <= PCI_CONFIG_BASE);
        assert!(PCI_CONFIG_BASE < GIC_LIMIT);
    }
}
