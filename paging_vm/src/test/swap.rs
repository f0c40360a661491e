use rand::{rngs::SmallRng, RngCore, SeedableRng};

use super::{allocate_zero_pages, get_test_vm, random_page, read_page, user_page};
use crate::PageState;

#[test]
fn test_swap_round_trip() {
    const SEED: u64 = 1657496584631578942;
    const PAGE_COUNT: usize = 8;
    let mut rand = SmallRng::seed_from_u64(SEED);

    let vm = get_test_vm("test_swap_round_trip", 2, PAGE_COUNT);
    let space = vm.create_address_space();
    allocate_zero_pages(&vm, space, 0, PAGE_COUNT);

    let contents: Vec<Vec<u8>> = (0..PAGE_COUNT).map(|_| random_page(&mut rand)).collect();
    for (index, data) in contents.iter().enumerate() {
        vm.write_user(space, user_page(index), data).unwrap();
    }

    let stats = vm.stats();
    assert_eq!(stats.live_frames, 2);
    assert_eq!(stats.evictions, PAGE_COUNT - 2);
    assert_eq!(stats.swap_slots_used, PAGE_COUNT - 2);

    // two passes, the second reads pages that went out to swap again
    for _ in 0..2 {
        for (index, data) in contents.iter().enumerate() {
            assert_eq!(&read_page(&vm, space, user_page(index)), data);
        }
    }

    // at most one slot per page ever in use, freed slots are reused
    assert!(vm.stats().swap_slots_used <= PAGE_COUNT - 2);

    vm.destroy_address_space(space).unwrap();
    assert_eq!(vm.stats().swap_slots_used, 0);
    assert_eq!(vm.stats().live_frames, 0);
    assert_eq!(vm.stats().free_frames, 2);
}

#[test]
fn test_random_access_under_pressure() {
    const SEED: u64 = 4611686018427387903;
    const PAGE_COUNT: usize = 12;
    const ACCESS_COUNT: usize = 300;
    let mut rand = SmallRng::seed_from_u64(SEED);

    let vm = get_test_vm("test_random_access_under_pressure", 3, PAGE_COUNT);
    let space = vm.create_address_space();
    allocate_zero_pages(&vm, space, 0, PAGE_COUNT);

    let mut contents = vec![vec![0u8; crate::PAGE_SIZE]; PAGE_COUNT];
    for _ in 0..ACCESS_COUNT {
        let index = rand.next_u32() as usize % PAGE_COUNT;
        if rand.next_u32() % 3 == 0 {
            let data = random_page(&mut rand);
            vm.write_user(space, user_page(index), &data).unwrap();
            contents[index] = data;
        } else {
            assert_eq!(
                read_page(&vm, space, user_page(index)),
                contents[index],
                "content of page {} lost",
                index
            );
        }
    }

    for index in 0..PAGE_COUNT {
        let info = vm.page_info(space, user_page(index)).unwrap();
        if info.state == PageState::Anon {
            // resident or swapped, never both
            assert_ne!(info.resident, info.swapped_out);
            assert_eq!(info.swap_slot.is_some(), info.swapped_out);
        }
    }

    vm.destroy_address_space(space).unwrap();
    assert_eq!(vm.stats().swap_slots_used, 0);
}

#[test]
#[should_panic(expected = "out of user frames")]
fn test_no_user_frames_is_fatal() {
    let vm = get_test_vm("test_no_user_frames_is_fatal", 0, 4);
    let space = vm.create_address_space();
    allocate_zero_pages(&vm, space, 0, 1);

    let _ = vm.materialize(space, user_page(0));
}
