//! Emulated devices of the hypervisor.
//!
//! This crate contains the guest-visible I/O surface: the port and MMIO
//! buses, the PCI configuration space and bus, and the virtio transport with
//! its rings. Every device reaches guest memory only through
//! [`memory::GuestAddressSpace`].

pub mod bus;
pub mod event;
pub mod pci;
pub mod virtio;
