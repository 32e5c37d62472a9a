use super::virt_queue::DescriptorChain;
use super::QueueError;
use memory::{GuestAddressSpace, GuestSlice};

/// The buffers of a chain, translated into host views.
///
/// Views are valid for the processing of one chain only; nothing is cached
/// across chains.
pub struct ChainBuffers<'a> {
    readable: Vec<GuestSlice<'a>>,
    writable: Vec<GuestSlice<'a>>,
}

impl DescriptorChain {
    /// Translate every buffer of the chain.
    ///
    /// Fails with [`QueueError::AddressFault`] if any buffer leaves guest
    /// memory.
    pub fn translate<'a>(&self, mem: &'a GuestAddressSpace) -> Result<ChainBuffers<'a>, QueueError> {
        let mut buffers = ChainBuffers {
            readable: Vec::new(),
            writable: Vec::new(),
        };
        for desc in &self.descriptors {
            let view = mem.translate(desc.addr, desc.len as usize)?;
            if desc.is_write_only() {
                buffers.writable.push(view);
            } else {
                buffers.readable.push(view);
            }
        }
        Ok(buffers)
    }

    /// Write `status` into the last byte of the last device-writable buffer
    /// that lies in guest memory. Returns the number of bytes written.
    pub fn write_fault_status(&self, mem: &GuestAddressSpace, status: u8) -> u32 {
        let written = self
            .descriptors
            .iter()
            .rev()
            .filter(|d| d.is_write_only() && d.len > 0)
            .filter_map(|d| d.addr.checked_add(d.len as u64 - 1))
            .any(|gpa| mem.write(gpa, &[status]).is_ok());
        written as u32
    }
}

impl<'a> ChainBuffers<'a> {
    /// Device-readable buffers, in chain order.
    #[inline]
    pub fn readable(&self) -> &[GuestSlice<'a>] {
        &self.readable
    }

    /// Device-writable buffers, in chain order.
    #[inline]
    pub fn writable(&self) -> &[GuestSlice<'a>] {
        &self.writable
    }

    pub fn readable_len(&self) -> usize {
        self.readable.iter().map(|s| s.len()).sum()
    }

    pub fn writable_len(&self) -> usize {
        self.writable.iter().map(|s| s.len()).sum()
    }

    /// Concatenate the device-readable buffers.
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.readable_len());
        for s in &self.readable {
            out.extend_from_slice(&s.to_vec());
        }
        out
    }

    /// Write `data` into the device-writable buffers as if they were one
    /// contiguous buffer, starting `offset` bytes in.
    ///
    /// Returns the number of bytes written, which is short if the buffers
    /// end first.
    pub fn write_at(&self, mut offset: usize, mut data: &[u8]) -> Result<usize, QueueError> {
        let mut written = 0;
        for s in &self.writable {
            if data.is_empty() {
                break;
            }
            if offset >= s.len() {
                offset -= s.len();
                continue;
            }
            let n = data.len().min(s.len() - offset);
            s.write(offset, &data[..n])?;
            written += n;
            data = &data[n..];
            offset = 0;
        }
        Ok(written)
    }
}
