//! The thread serving the queues of one device.
//!
//! The worker sleeps on the device's notify channel. Each wakeup drains every
//! enabled queue: chains are popped, handed to the backend and returned to
//! the driver, and the interrupt channel is signalled once per batch. The
//! worker takes the lock of the queue it drains and the backend lock, never
//! the common configuration lock.
use super::pci::Transport;
use super::tys::{IsrStatus, Status};
use super::virt_queue::DescriptorChain;
use super::QueueError;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub(crate) struct Worker {
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn(transport: Arc<Transport>) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("virtio-{:?}", transport.device_type).to_lowercase())
            .spawn(move || run(&transport))?;
        Ok(Self { handle })
    }

    pub(crate) fn join(self) {
        if self.handle.join().is_err() {
            log::error!("virtio worker panicked");
        }
    }
}

fn run(t: &Transport) {
    log::debug!("virtio-{:?}: worker started", t.device_type);
    loop {
        if let Err(e) = t.notify.wait() {
            log::error!("virtio-{:?}: notify wait failed: {}", t.device_type, e);
            break;
        }
        if !t.running.load(Ordering::Acquire) {
            break;
        }
        if t.status().contains(Status::FAILED) {
            continue;
        }
        if let Err(e) = drain(t) {
            t.fail(&e);
        }
    }
    log::debug!("virtio-{:?}: worker stopped", t.device_type);
}

/// Serve everything the driver made available.
fn drain(t: &Transport) -> Result<(), QueueError> {
    let mem = &*t.memory;
    let mut interrupt = false;
    for queue in &t.queues {
        let mut q = queue.lock();
        if !q.is_enabled() {
            continue;
        }
        let mut completed = 0usize;
        while let Some(chain) = q.pop(mem)? {
            let len = process(t, q.index(), &chain)?;
            q.push_used(mem, &chain, len)?;
            completed += 1;
        }
        if completed > 0 {
            log::trace!("virtio-{:?}: queue {} completed {}", t.device_type, q.index(), completed);
            interrupt |= q.needs_interrupt(mem);
        }
    }
    if interrupt {
        t.isr.fetch_or(IsrStatus::QUEUE_INTERRUPT.bits(), Ordering::AcqRel);
        if let Err(e) = t.interrupt.signal() {
            log::error!("virtio-{:?}: failed to signal interrupt: {}", t.device_type, e);
        }
    }
    Ok(())
}

/// Run the backend on one chain. Returns the used length.
///
/// Buffer faults complete the chain; a protocol violation fails the device.
fn process(t: &Transport, queue: u16, chain: &DescriptorChain) -> Result<u32, QueueError> {
    let mut backend = t.backend.lock();
    let result = chain
        .translate(&t.memory)
        .and_then(|buffers| backend.process(queue, &buffers));
    let len = match result {
        Ok(len) => len,
        Err(QueueError::AddressFault(e)) => {
            log::warn!(
                "virtio-{:?}: chain {} on queue {}: {}",
                t.device_type,
                chain.id,
                queue,
                e
            );
            match backend.fault_status() {
                Some(status) => chain.write_fault_status(&t.memory, status),
                None => 0,
            }
        }
        Err(e @ QueueError::ProtocolViolation(_)) => return Err(e),
        Err(e) => {
            log::warn!(
                "virtio-{:?}: backend failed chain {} on queue {}: {}",
                t.device_type,
                chain.id,
                queue,
                e
            );
            0
        }
    };
    Ok(len)
}
