use crate::arch::Arch;

/// Shape of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Bytes of guest memory, mapped from guest physical address 0.
    pub memory_size: usize,
    pub vcpus: u32,
    pub arch: Arch,
    /// Interrupt line of the first attached device; the next ones follow.
    pub irq_base: u8,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: 256 << 20,
            vcpus: 1,
            arch: Arch::host(),
            irq_base: 5,
        }
    }
}

impl VmConfig {
    pub fn memory_size(mut self, bytes: usize) -> Self {
        self.memory_size = bytes;
        self
    }

    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn irq_base(mut self, irq: u8) -> Self {
        self.irq_base = irq;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = VmConfig::default();
        assert_eq!(config.memory_size, 0x1000_0000);
        assert_eq!(config.vcpus, 1);
        assert_eq!(config.arch, Arch::host());
        assert_eq!(config.irq_base, 5);
    }

    #[test]
    fn setters_chain() {
        let config = VmConfig::default()
            .memory_size(64 << 20)
            .vcpus(4)
            .arch(Arch::Arm64)
            .irq_base(10);
        assert_eq!(
            config,
            VmConfig {
                memory_size: 64 << 20,
                vcpus: 4,
                arch: Arch::Arm64,
                irq_base: 10,
            }
        );
    }
}
