//! A driver and the device sharing one ring in guest memory.
use devices::virtio::driver::{DriverBuffer, PackedDriver, QueueDriver, SplitDriver, UsedElement};
use devices::virtio::{QueueArea, QueueError, RingFormat, RingLayout, VirtQueue, VirtqDescFlags};
use memory::{Gpa, GuestAddressSpace};
use proptest::prelude::*;

const N: u16 = 8;

fn packed_layout() -> RingLayout {
    RingLayout {
        size: N,
        desc: Gpa::new(0x1000),
        driver: Gpa::new(0x2000),
        device: Gpa::new(0x2010),
    }
}

fn split_layout() -> RingLayout {
    RingLayout {
        size: N,
        desc: Gpa::new(0x1000),
        driver: Gpa::new(0x2000),
        device: Gpa::new(0x3000),
    }
}

fn device_queue(mem: &GuestAddressSpace, layout: RingLayout, format: RingFormat) -> VirtQueue {
    let mut q = VirtQueue::new(0, N);
    assert!(q.set_size(layout.size));
    assert!(q.set_area(QueueArea::Desc, layout.desc));
    assert!(q.set_area(QueueArea::Driver, layout.driver));
    assert!(q.set_area(QueueArea::Device, layout.device));
    q.enable(format, mem).unwrap();
    q
}

fn packed_pair() -> (GuestAddressSpace, PackedDriver, VirtQueue) {
    let mem = GuestAddressSpace::new(0x10000).unwrap();
    let driver = PackedDriver::new(&mem, packed_layout()).unwrap();
    let q = device_queue(&mem, packed_layout(), RingFormat::Packed);
    (mem, driver, q)
}

fn buffer(i: u16) -> DriverBuffer {
    DriverBuffer::readable(0x8000 + i as u64 * 0x100, 0x10)
}

proptest! {
    #[test]
    fn fewer_than_size_round_trip_in_order(k in 1..N) {
        let (mem, mut driver, mut q) = packed_pair();
        let ids: Vec<u16> = (0..k).map(|i| driver.enqueue(&mem, &[buffer(i)]).unwrap()).collect();
        prop_assert_eq!(driver.avail_wrap().value(), 0);

        let mut chains = Vec::new();
        while let Some(chain) = q.pop(&mem).unwrap() {
            chains.push(chain);
        }
        prop_assert_eq!(chains.iter().map(|c| c.id).collect::<Vec<_>>(), ids.clone());
        for (i, c) in chains.iter().enumerate() {
            prop_assert_eq!(c.descriptors[0].addr, buffer(i as u16).addr);
        }
        prop_assert_eq!(q.state().avail_wrap.value(), 0);

        for c in &chains {
            q.push_used(&mem, c, 0).unwrap();
        }
        prop_assert_eq!(q.state().used_wrap.value(), 0);
        let used: Vec<u16> = std::iter::from_fn(|| driver.reclaim(&mem).unwrap()).map(|u| u.id).collect();
        prop_assert_eq!(used, ids);
        prop_assert_eq!(driver.used_wrap().value(), 0);
        prop_assert_eq!(driver.num_free(), N);
    }

    #[test]
    fn chains_of_any_length_keep_their_buffers(lens in proptest::collection::vec(1u16..4, 1..6)) {
        let (mem, mut driver, mut q) = packed_pair();
        for (round, len) in lens.iter().enumerate() {
            let bufs: Vec<DriverBuffer> = (0..*len)
                .map(|i| DriverBuffer::writable(0x8000 + (round as u64 * 4 + i as u64) * 0x10, 0x10))
                .collect();
            let id = driver.enqueue(&mem, &bufs).unwrap();
            let chain = q.pop(&mem).unwrap().unwrap();
            prop_assert_eq!(chain.id, id);
            prop_assert_eq!(chain.count, *len);
            prop_assert!(chain.descriptors.iter().all(|d| d.is_write_only()));
            q.push_used(&mem, &chain, 3).unwrap();
            prop_assert_eq!(driver.reclaim(&mem).unwrap(), Some(UsedElement { id, len: 3 }));
        }
    }
}

#[test]
fn full_ring_rejects_until_consumed() {
    let (mem, mut driver, mut q) = packed_pair();
    for i in 0..N {
        driver.enqueue(&mem, &[buffer(i)]).unwrap();
    }
    assert_eq!(driver.num_free(), 0);
    assert!(matches!(driver.enqueue(&mem, &[buffer(0)]), Err(QueueError::QueueFull)));

    // Popped but not yet used: still full.
    let first = q.pop(&mem).unwrap().unwrap();
    assert!(matches!(driver.enqueue(&mem, &[buffer(0)]), Err(QueueError::QueueFull)));

    q.push_used(&mem, &first, 0).unwrap();
    let id = driver.enqueue(&mem, &[buffer(0)]).unwrap();
    assert_eq!(id, first.id);
    // The entry reclaimed to make room is still reported.
    assert_eq!(driver.reclaim(&mem).unwrap(), Some(UsedElement { id: first.id, len: 0 }));
}

#[test]
fn one_pass_toggles_each_wrap_counter_once() {
    let (mem, mut driver, mut q) = packed_pair();
    for i in 0..N {
        driver.enqueue(&mem, &[buffer(i)]).unwrap();
    }
    assert_eq!(driver.avail_wrap().value(), 1);

    let mut chains = Vec::new();
    while let Some(chain) = q.pop(&mem).unwrap() {
        chains.push(chain);
    }
    assert_eq!(chains.len(), N as usize);
    assert_eq!(q.state().avail_wrap.value(), 1);
    assert_eq!(q.state().used_wrap.value(), 0);

    for c in &chains {
        q.push_used(&mem, c, 0).unwrap();
    }
    assert_eq!(q.state().used_wrap.value(), 1);
    while driver.reclaim(&mem).unwrap().is_some() {}
    assert_eq!(driver.used_wrap().value(), 1);

    // Second pass, with the inverted flag encoding.
    let id = driver.enqueue(&mem, &[buffer(1)]).unwrap();
    let chain = q.pop(&mem).unwrap().unwrap();
    assert_eq!(chain.id, id);
    assert_eq!(chain.descriptors[0].addr, buffer(1).addr);
    assert!(q.pop(&mem).unwrap().is_none());
}

#[test]
fn used_flags_follow_written_length() {
    let (mem, mut driver, mut q) = packed_pair();
    driver.enqueue(&mem, &[DriverBuffer::writable(0x8000, 4)]).unwrap();
    let chain = q.pop(&mem).unwrap().unwrap();
    q.push_used(&mem, &chain, 4).unwrap();
    let flags = VirtqDescFlags::from_bits_truncate(mem.read_u16(Gpa::new(0x1000 + 14)).unwrap());
    assert_eq!(flags, VirtqDescFlags::AVAIL | VirtqDescFlags::USED | VirtqDescFlags::WRITE);
}

#[test]
fn indirect_descriptor_is_a_violation() {
    let (mem, _driver, mut q) = packed_pair();
    mem.write_u64(Gpa::new(0x1000), 0x8000).unwrap();
    mem.write_u32(Gpa::new(0x1008), 16).unwrap();
    let flags = VirtqDescFlags::AVAIL | VirtqDescFlags::INDIRECT;
    mem.write_u16(Gpa::new(0x100e), flags.bits()).unwrap();
    assert!(matches!(q.pop(&mem), Err(QueueError::ProtocolViolation(_))));
}

#[test]
fn event_suppression() {
    let (mem, driver, q) = packed_pair();
    assert!(q.needs_interrupt(&mem));
    driver.suppress_interrupts(&mem, true).unwrap();
    assert!(!q.needs_interrupt(&mem));
    driver.suppress_interrupts(&mem, false).unwrap();
    assert!(q.needs_interrupt(&mem));
}

#[test]
fn split_ring_round_trip() {
    let mem = GuestAddressSpace::new(0x10000).unwrap();
    let mut driver = SplitDriver::new(&mem, split_layout()).unwrap();
    let mut q = device_queue(&mem, split_layout(), RingFormat::Split);
    mem.write(Gpa::new(0x8000), b"split").unwrap();

    let head = driver
        .enqueue(&mem, &[DriverBuffer::readable(0x8000, 5), DriverBuffer::writable(0x9000, 5)])
        .unwrap();
    assert_eq!(driver.num_free(), N - 2);
    let chain = q.pop(&mem).unwrap().unwrap();
    assert_eq!(chain.id, head);
    assert_eq!(chain.descriptors.len(), 2);

    let buffers = chain.translate(&mem).unwrap();
    let data = buffers.read_all();
    assert_eq!(buffers.write_at(0, &data).unwrap(), 5);
    q.push_used(&mem, &chain, 5).unwrap();
    assert_eq!(driver.reclaim(&mem).unwrap(), Some(UsedElement { id: head, len: 5 }));
    assert_eq!(driver.num_free(), N);
    let mut out = [0; 5];
    mem.read(Gpa::new(0x9000), &mut out).unwrap();
    assert_eq!(&out, b"split");

    driver.suppress_interrupts(&mem, true).unwrap();
    assert!(!q.needs_interrupt(&mem));
}

#[test]
fn split_ring_wraps_free_running_indices() {
    let mem = GuestAddressSpace::new(0x10000).unwrap();
    let mut driver = SplitDriver::new(&mem, split_layout()).unwrap();
    let mut q = device_queue(&mem, split_layout(), RingFormat::Split);
    for round in 0..3 * N {
        let id = driver.enqueue(&mem, &[buffer(round % N)]).unwrap();
        let chain = q.pop(&mem).unwrap().unwrap();
        assert_eq!(chain.id, id);
        q.push_used(&mem, &chain, 1).unwrap();
        assert_eq!(driver.reclaim(&mem).unwrap(), Some(UsedElement { id, len: 1 }));
    }
    assert_eq!(q.state().driver_idx, 3 * N);
    assert_eq!(q.state().avail_wrap.value(), 1);
}

#[test]
fn split_avail_index_running_ahead_is_a_violation() {
    let mem = GuestAddressSpace::new(0x10000).unwrap();
    let mut q = device_queue(&mem, split_layout(), RingFormat::Split);
    mem.write_u16(Gpa::new(0x2002), N + 1).unwrap();
    assert!(matches!(q.pop(&mem), Err(QueueError::ProtocolViolation(_))));
}
