use memory::{Gpa, GuestAddressSpace, MemoryError};
use proptest::prelude::*;

const SIZE: usize = 0x4000;

proptest! {
    #[test]
    fn in_range_requests_round_trip(gpa in 0u64..SIZE as u64, data in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mem = GuestAddressSpace::new(SIZE).unwrap();
        let fits = gpa + data.len() as u64 <= SIZE as u64;
        let slice = mem.translate(Gpa::new(gpa), data.len());
        prop_assert_eq!(slice.is_ok(), fits);
        if let Ok(slice) = slice {
            prop_assert_eq!(slice.len(), data.len());
            slice.write(0, &data).unwrap();
            let mut back = vec![0; data.len()];
            mem.read(Gpa::new(gpa), &mut back).unwrap();
            prop_assert_eq!(back, data);
        }
    }

    #[test]
    fn out_of_range_requests_fail_closed(gpa in any::<u64>(), len in 1usize..0x10000) {
        let mem = GuestAddressSpace::new(SIZE).unwrap();
        let inside = gpa.checked_add(len as u64).map_or(false, |end| end <= SIZE as u64);
        match mem.translate(Gpa::new(gpa), len) {
            Ok(_) => prop_assert!(inside),
            Err(MemoryError::OutOfBounds { gpa: g, len: l }) => {
                prop_assert!(!inside);
                prop_assert_eq!(g, Gpa::new(gpa));
                prop_assert_eq!(l, len);
            }
            Err(e) => prop_assert!(false, "unexpected error {}", e),
        }
    }
}

#[test]
fn writes_are_visible_to_other_threads() {
    let mem = std::sync::Arc::new(GuestAddressSpace::new(SIZE).unwrap());
    let writer = mem.clone();
    std::thread::spawn(move || {
        writer.write_u32(Gpa::new(0x100), 0xdead_beef).unwrap();
        writer.store_u16_release(Gpa::new(0x104), 1).unwrap();
    })
    .join()
    .unwrap();
    assert_eq!(mem.load_u16_acquire(Gpa::new(0x104)).unwrap(), 1);
    assert_eq!(mem.read_u32(Gpa::new(0x100)).unwrap(), 0xdead_beef);
}
