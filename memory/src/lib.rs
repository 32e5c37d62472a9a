//! Guest physical memory.
//!
//! A virtual machine sees one contiguous range of guest-physical addresses
//! starting at 0. This crate owns the host mapping that backs the range and
//! is the only place where a guest-supplied address becomes a host pointer.
//! Every translation is bounds checked and fails closed: a request that
//! leaves the mapping, or overflows while computing its end, is an error and
//! never a partial access.
mod addr;
mod space;

pub use addr::Gpa;
pub use space::{GuestAddressSpace, GuestSlice, Pod};

/// Errors raised by the guest address space.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The requested range is not fully inside the guest address space.
    #[error("{gpa:?}+{len:#x} is outside of the guest address space")]
    OutOfBounds { gpa: Gpa, len: usize },
    /// An atomic access was requested on a misaligned address.
    #[error("{gpa:?} is not aligned to {align} bytes")]
    Misaligned { gpa: Gpa, align: usize },
    /// The guest address space can not be of this size.
    #[error("invalid guest memory size {0:#x}")]
    InvalidSize(usize),
    /// The host refused to map the guest memory.
    #[error("failed to map guest memory: {0}")]
    Mmap(#[source] std::io::Error),
}
