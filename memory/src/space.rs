use crate::{Gpa, MemoryError};
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

/// Plain-old-data that can be copied in and out of guest memory.
///
/// # Safety
/// Every bit pattern must be a valid value of the type, and the type must
/// not contain padding or pointers.
pub unsafe trait Pod: Copy + 'static {}

macro_rules! impl_pod {
    ($($t:ty),*) => {
        $(unsafe impl Pod for $t {})*
    };
}

impl_pod!(u8, u16, u32, u64, i8, i16, i32, i64);

unsafe impl<T: Pod, const N: usize> Pod for [T; N] {}

/// The guest physical memory of a virtual machine.
///
/// Owns an anonymous host mapping of `size` bytes that backs guest physical
/// addresses `[0, size)`. The mapping is released when the address space is
/// dropped, so every user (vCPUs, device workers) holds it through an `Arc`
/// and the owner tears the users down first.
pub struct GuestAddressSpace {
    host: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is plain memory owned by this object. Concurrent
// accesses are coordinated by the users through the atomic helpers below,
// mirroring how the guest itself shares the memory with devices.
unsafe impl Send for GuestAddressSpace {}
unsafe impl Sync for GuestAddressSpace {}

impl GuestAddressSpace {
    /// Map `size` bytes of zeroed guest memory.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 || size as u64 > i64::MAX as u64 {
            return Err(MemoryError::InvalidSize(size));
        }
        // SAFETY: anonymous private mapping without a backing file; the
        // result is checked against MAP_FAILED before use.
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MemoryError::Mmap(std::io::Error::last_os_error()));
        }
        let host = NonNull::new(addr as *mut u8).ok_or_else(|| {
            MemoryError::Mmap(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned a null mapping",
            ))
        })?;
        log::debug!("guest memory: {:#x} bytes mapped at {:p}", size, host);
        Ok(Self { host, size })
    }

    /// Size of the guest address space in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host virtual address of guest physical address 0.
    ///
    /// Used to register the mapping with the host hypervisor.
    #[inline]
    pub fn host_address(&self) -> u64 {
        self.host.as_ptr() as u64
    }

    /// Translate `[gpa, gpa + len)` into a host view.
    ///
    /// Fails if any byte of the range is outside of the address space,
    /// including when `gpa + len` overflows.
    pub fn translate(&self, gpa: Gpa, len: usize) -> Result<GuestSlice<'_>, MemoryError> {
        let fault = || MemoryError::OutOfBounds { gpa, len };
        let end = gpa.as_u64().checked_add(len as u64).ok_or_else(fault)?;
        if end > self.size as u64 {
            return Err(fault());
        }
        Ok(GuestSlice {
            gpa,
            // SAFETY: `gpa + len <= size`, so the pointer stays in the
            // mapping.
            ptr: unsafe { self.host.as_ptr().add(gpa.as_u64() as usize) },
            len,
            _space: PhantomData,
        })
    }

    /// Copy guest memory at `gpa` into `buf`.
    pub fn read(&self, gpa: Gpa, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.translate(gpa, buf.len())?.read(0, buf)
    }

    /// Copy `data` into guest memory at `gpa`.
    pub fn write(&self, gpa: Gpa, data: &[u8]) -> Result<(), MemoryError> {
        self.translate(gpa, data.len())?.write(0, data)
    }

    /// Read a little-endian u16.
    pub fn read_u16(&self, gpa: Gpa) -> Result<u16, MemoryError> {
        let mut b = [0; 2];
        self.read(gpa, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&self, gpa: Gpa) -> Result<u32, MemoryError> {
        let mut b = [0; 4];
        self.read(gpa, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Read a little-endian u64.
    pub fn read_u64(&self, gpa: Gpa) -> Result<u64, MemoryError> {
        let mut b = [0; 8];
        self.read(gpa, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Write a little-endian u16.
    pub fn write_u16(&self, gpa: Gpa, v: u16) -> Result<(), MemoryError> {
        self.write(gpa, &v.to_le_bytes())
    }

    /// Write a little-endian u32.
    pub fn write_u32(&self, gpa: Gpa, v: u32) -> Result<(), MemoryError> {
        self.write(gpa, &v.to_le_bytes())
    }

    /// Write a little-endian u64.
    pub fn write_u64(&self, gpa: Gpa, v: u64) -> Result<(), MemoryError> {
        self.write(gpa, &v.to_le_bytes())
    }

    /// Copy a `T` out of guest memory at `gpa`, in host byte order.
    pub fn read_obj<T: Pod>(&self, gpa: Gpa) -> Result<T, MemoryError> {
        let slice = self.translate(gpa, core::mem::size_of::<T>())?;
        // SAFETY: in bounds for `size_of::<T>()` bytes, any bit pattern is a
        // valid `T`, and the read tolerates misalignment.
        Ok(unsafe { core::ptr::read_unaligned(slice.ptr as *const T) })
    }

    /// Copy `value` into guest memory at `gpa`, in host byte order.
    pub fn write_obj<T: Pod>(&self, gpa: Gpa, value: T) -> Result<(), MemoryError> {
        let slice = self.translate(gpa, core::mem::size_of::<T>())?;
        // SAFETY: in bounds for `size_of::<T>()` bytes; unaligned write.
        unsafe { core::ptr::write_unaligned(slice.ptr as *mut T, value) };
        Ok(())
    }

    fn aligned(&self, gpa: Gpa, align: usize) -> Result<*mut u8, MemoryError> {
        if !gpa.is_aligned(align as u64) {
            return Err(MemoryError::Misaligned { gpa, align });
        }
        Ok(self.translate(gpa, align)?.ptr)
    }

    /// Load a little-endian u16 with acquire ordering.
    ///
    /// Every access through the address space that follows in program order
    /// observes the memory the other side published before its matching
    /// release store.
    pub fn load_u16_acquire(&self, gpa: Gpa) -> Result<u16, MemoryError> {
        let ptr = self.aligned(gpa, 2)?;
        // SAFETY: in bounds and 2-byte aligned (the mapping is page aligned),
        // and AtomicU16 has the layout of u16.
        let atomic = unsafe { &*(ptr as *const AtomicU16) };
        Ok(u16::from_le(atomic.load(Ordering::Acquire)))
    }

    /// Store a little-endian u16 with release ordering.
    pub fn store_u16_release(&self, gpa: Gpa, v: u16) -> Result<(), MemoryError> {
        let ptr = self.aligned(gpa, 2)?;
        // SAFETY: as in `load_u16_acquire`.
        let atomic = unsafe { &*(ptr as *const AtomicU16) };
        atomic.store(v.to_le(), Ordering::Release);
        Ok(())
    }

    /// Load a little-endian u32 with acquire ordering.
    pub fn load_u32_acquire(&self, gpa: Gpa) -> Result<u32, MemoryError> {
        let ptr = self.aligned(gpa, 4)?;
        // SAFETY: in bounds and 4-byte aligned; AtomicU32 has the layout of
        // u32.
        let atomic = unsafe { &*(ptr as *const AtomicU32) };
        Ok(u32::from_le(atomic.load(Ordering::Acquire)))
    }

    /// Store a little-endian u32 with release ordering.
    pub fn store_u32_release(&self, gpa: Gpa, v: u32) -> Result<(), MemoryError> {
        let ptr = self.aligned(gpa, 4)?;
        // SAFETY: as in `load_u32_acquire`.
        let atomic = unsafe { &*(ptr as *const AtomicU32) };
        atomic.store(v.to_le(), Ordering::Release);
        Ok(())
    }
}

impl Drop for GuestAddressSpace {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly the region created in `new`. All borrowed
        // `GuestSlice`s are tied to `&self` and therefore already gone.
        unsafe {
            libc::munmap(self.host.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

impl core::fmt::Debug for GuestAddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GuestAddressSpace")
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

/// A bounds-checked view of guest memory.
///
/// The view borrows the address space and can not outlive it. It never
/// claims exclusive access: the guest may change the bytes at any time.
#[derive(Clone, Copy)]
pub struct GuestSlice<'a> {
    gpa: Gpa,
    ptr: *mut u8,
    len: usize,
    _space: PhantomData<&'a GuestAddressSpace>,
}

// SAFETY: a slice is a borrowed window of a `Sync` address space.
unsafe impl Send for GuestSlice<'_> {}
unsafe impl Sync for GuestSlice<'_> {}

impl<'a> GuestSlice<'a> {
    /// Guest physical address of the first byte.
    #[inline]
    pub fn gpa(&self) -> Gpa {
        self.gpa
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host pointer of the first byte.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// A narrower view starting `offset` bytes into this one.
    pub fn subslice(&self, offset: usize, len: usize) -> Result<GuestSlice<'a>, MemoryError> {
        let fault = || MemoryError::OutOfBounds {
            gpa: self.gpa.checked_add(offset as u64).unwrap_or(self.gpa),
            len,
        };
        let end = offset.checked_add(len).ok_or_else(fault)?;
        if end > self.len {
            return Err(fault());
        }
        Ok(GuestSlice {
            gpa: self.gpa + offset as u64,
            // SAFETY: `offset + len <= self.len`.
            ptr: unsafe { self.ptr.add(offset) },
            len,
            _space: PhantomData,
        })
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the view.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let src = self.subslice(offset, buf.len())?;
        // SAFETY: `src` is in bounds and `buf` is a distinct host buffer.
        unsafe { core::ptr::copy_nonoverlapping(src.ptr as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy `data` into the view starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        let dst = self.subslice(offset, data.len())?;
        // SAFETY: `dst` is in bounds and `data` is a distinct host buffer.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst.ptr, data.len()) };
        Ok(())
    }

    /// Copy the whole view into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = vec![0; self.len];
        // SAFETY: exactly `len` bytes, matching the view.
        unsafe { core::ptr::copy_nonoverlapping(self.ptr as *const u8, v.as_mut_ptr(), self.len) };
        v
    }
}

impl core::fmt::Debug for GuestSlice<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "GuestSlice({:?}, {:#x})", self.gpa, self.len)
    }
}
