/// Device Types.
///
/// On top of the queues, config space and feature negotiation facilities built
/// into virtio, several devices are defined. The following device IDs are used
/// to identify different types of virtio devices.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
pub enum DeviceType {
    NetworkCard = 1,
    Block = 2,
    Console = 3,
    EntropySource = 4,
    MemoryBallonningTranditional = 5,
    ScsiHost = 8,
    Transport9P = 9,
    Gpu = 16,
    Input = 18,
    Socket = 19,
    Crypto = 20,
    IoMmu = 23,
    Memory = 24,
}

impl DeviceType {
    /// PCI device id of the modern (non-transitional) interface.
    #[inline]
    pub fn pci_device_id(&self) -> u16 {
        0x1040 + *self as u16
    }

    /// PCI class code, as `0x00CCSSPP`.
    pub fn pci_class_code(&self) -> u32 {
        match self {
            DeviceType::NetworkCard => 0x02_00_00,
            DeviceType::Block | DeviceType::ScsiHost => 0x01_80_00,
            DeviceType::Console => 0x07_80_00,
            DeviceType::Input => 0x09_80_00,
            DeviceType::Gpu => 0x03_80_00,
            _ => 0xff_00_00,
        }
    }
}

bitflags::bitflags! {
    /// VirtIo Device Status.
    #[repr(transparent)]
    pub struct Status: u8 {
        /// Indicates that the guest OS has found the device and recognized it
        /// as a valid virtio device.
        const ACKNOWLEDGE = 1 << 0;
        /// Indicates that the guest OS knows how to drive the device.
        const DRIVER = 1 << 1;
        /// Indicates that the driver is set up and ready to drive the device.
        const DRIVER_OK = 1 << 2;
        /// Indicates that the driver has acknowledged all the features it
        /// understands, and feature negotiation is complete.
        const FEATURES_OK = 1 << 3;
        /// Indicates that the device has experienced an error from which it
        /// can't recover.
        const DEVICE_NEEDS_RESET = 1 << 6;
        /// Indicates that something went wrong in the guest, and it has given
        /// up on the device. This could be an internal error, or the driver
        /// didn't like the device for some reason, or even a fatal error during
        /// device operation.
        const FAILED = 1 << 7;
    }
}

bitflags::bitflags! {
    pub struct VirtIoFeaturesCommon: u64 {
        /// Negotiating this feature indicates that the driver can use descriptors with the VIRTQ_DESC_F_INDIRECT flag set.
        const RING_INDIRECT_DESC = 1 << 28;
        /// This feature enables the used_event and the avail_event fields.
        const RING_EVENT_IDX = 1 << 29;
        /// Set by virtio 1.x devices and drivers; legacy ones never offer it.
        const VERSION_1 = 1 << 32;
        /// This feature indicates that the device can be used on a platform where device access to data in memory is limited and/or translated.
        const ACCESS_PLATFORM = 1 << 33;
        /// This feature indicates support for the packed virtqueue layout.
        const RING_PACKED = 1 << 34;
        /// This feature indicates that all buffers are used by the device in the same order in which they have been made available.
        const IN_ORDER = 1 << 35;
    }
}

bitflags::bitflags! {
    pub struct IsrStatus: u8 {
        const QUEUE_INTERRUPT = 1 << 0;
        const DEVICE_CONFIGURATION_INTERRUPT = 1 << 1;
    }
}

/// The type of a virtio PCI capability.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
pub enum PciCapabilityType {
    /// Common configuration
    CommonCfg = 1,
    /// Notifications
    NotifyCfg = 2,
    /// ISR Status
    IsrCfg = 3,
    /// Device specific configuration
    DeviceCfg = 4,
    /// PCI configuration access
    PciCfg = 5,
}
