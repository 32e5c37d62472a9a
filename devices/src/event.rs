//! Event channels.
//!
//! An [`EventChannel`] is a counter shared by exactly one signalling side and
//! one waiting side: the vCPU thread (or the host kernel) signals a device
//! worker that a queue has work, and the worker signals the host that an
//! interrupt must be injected. Signals coalesce; one wake may stand for many
//! signals.
use std::io;
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

pub struct EventChannel {
    fd: EventFd,
}

impl EventChannel {
    /// Create a channel whose [`wait`](Self::wait) blocks.
    pub fn new() -> io::Result<Self> {
        Ok(Self { fd: EventFd::new(0)? })
    }

    /// Create a channel whose waits never block; see
    /// [`try_wait`](Self::try_wait).
    pub fn new_nonblocking() -> io::Result<Self> {
        Ok(Self {
            fd: EventFd::new(EFD_NONBLOCK)?,
        })
    }

    /// Signal the channel.
    pub fn signal(&self) -> io::Result<()> {
        self.fd.write(1)
    }

    /// Block until signalled, returning the number of coalesced signals.
    pub fn wait(&self) -> io::Result<u64> {
        self.fd.read()
    }

    /// Consume pending signals without blocking.
    ///
    /// Only meaningful on channels made with
    /// [`new_nonblocking`](Self::new_nonblocking); a blocking channel would
    /// block here.
    pub fn try_wait(&self) -> io::Result<Option<u64>> {
        match self.fd.read() {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Another handle to the same channel.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    /// The underlying eventfd, for registration with the host hypervisor.
    #[inline]
    pub fn event_fd(&self) -> &EventFd {
        &self.fd
    }
}

impl core::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use std::os::unix::io::AsRawFd;
        write!(f, "EventChannel(fd={})", self.fd.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_coalesce() {
        let ch = EventChannel::new_nonblocking().unwrap();
        assert_eq!(ch.try_wait().unwrap(), None);
        ch.signal().unwrap();
        ch.signal().unwrap();
        assert_eq!(ch.try_wait().unwrap(), Some(2));
        assert_eq!(ch.try_wait().unwrap(), None);
    }

    #[test]
    fn wakes_waiter_on_another_thread() {
        let ch = EventChannel::new().unwrap();
        let other = ch.try_clone().unwrap();
        let waiter = std::thread::spawn(move || other.wait().unwrap());
        ch.signal().unwrap();
        assert_eq!(waiter.join().unwrap(), 1);
    }
}
