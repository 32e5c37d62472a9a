//! Type 0 configuration header.

// register    offset  bits 31-24  bits 23-16  bits 15-8   bits 7-0
// 00  00  Device ID   Vendor ID
// 01  04  Status  Command
// 02  08  Class code  Subclass    Prog IF Revision ID
// 03  0C  BIST    Header type Latency Timer   Cache Line Size
// 04  10  Base address #0 (BAR0)
// 05  14  Base address #1 (BAR1)
// 06  18  Base address #2 (BAR2)
// 07  1C  Base address #3 (BAR3)
// 08  20  Base address #4 (BAR4)
// 09  24  Base address #5 (BAR5)
// 0A  28  Cardbus CIS Pointer
// 0B  2C  Subsystem ID    Subsystem Vendor ID
// 0C  30  Expansion ROM base address
// 0D  34  Reserved    Capabilities Pointer
// 0E  38  Reserved
// 0F  3C  Max latency Min Grant   Interrupt PIN   Interrupt Line
pub const VENDOR_ID: usize = 0x00;
pub const DEVICE_ID: usize = 0x02;
pub const COMMAND: usize = 0x04;
pub const STATUS: usize = 0x06;
pub const REVISION_ID: usize = 0x08;
pub const CLASS_CODE: usize = 0x09;
pub const CACHE_LINE_SIZE: usize = 0x0c;
pub const LATENCY_TIMER: usize = 0x0d;
pub const HEADER_TYPE: usize = 0x0e;
pub const BAR0: usize = 0x10;
pub const SUBSYSTEM_VENDOR_ID: usize = 0x2c;
pub const SUBSYSTEM_ID: usize = 0x2e;
pub const CAPABILITY_POINTER: usize = 0x34;
pub const INTERRUPT_LINE: usize = 0x3c;
pub const INTERRUPT_PIN: usize = 0x3d;

/// First offset usable by the capability list.
pub const CAPABILITY_START: usize = 0x40;

/// Size of the legacy configuration space.
pub const CONFIG_SPACE_SIZE: usize = 0x100;

/// Number of base address registers of a type 0 header.
pub const NUM_BARS: usize = 6;

bitflags::bitflags! {
    /// Pci device command.
    pub struct Command: u16 {
        /// If set to 1 the device can respond to I/O Space accesses; otherwise, the device's response is disabled.
        const IO_SPACE = 1 << 0;
        /// If set to 1 the device can respond to Memory Space accesses; otherwise, the device's response is disabled.
        const MEMORY_SPACE = 1 << 1;
        /// If set to 1 the device can behave as a bus master; otherwise, the device can not generate PCI accesses.
        const BUS_MASTER = 1 << 2;
        /// If set to 1 the assertion of the devices INTx# signal is disabled; otherwise, assertion of the signal is enabled.
        const INTERRUPT_DISABLE = 1 << 10;
    }
}

bitflags::bitflags! {
    /// Pci device status.
    pub struct Status: u16 {
        /// If set to 1 the device implements the pointer for a New Capabilities Linked list at offset 0x34; otherwise, the linked list is not available.
        const CAPABILITIES_LIST = 1 << 4;
        /// Represents the state of the device's INTx# signal. If set to 1 and bit 10 of the Command register (Interrupt Disable bit) is set to 0 the signal will be asserted; otherwise, the signal will be ignored
        const INTERRUPT_STATUS = 1 << 3;
    }
}

/// Identity of a function, written once into its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciHeaderInfo {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    /// Class, subclass and programming interface, as `0x00CCSSPP`.
    pub class_code: u32,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    /// 0 for none, 1..=4 for INTA#..INTD#.
    pub interrupt_pin: u8,
    pub interrupt_line: u8,
}
