use super::{
    allocate_zero_pages, create_file, get_test_vm, open_handles, read_page, user_page,
};
use crate::{
    modules::filesystem::FileSystem, PageInitializer, PageState, PageType, PteFlags, VirtAddr,
    VmError, PAGE_SIZE,
};

#[test]
fn test_shared_until_written() {
    let vm = get_test_vm("test_shared_until_written", 8, 8);
    let parent = vm.create_address_space();
    let va = user_page(0);
    allocate_zero_pages(&vm, parent, 0, 1);
    vm.write_user(parent, va, &[0xAA; PAGE_SIZE]).unwrap();

    let child = vm.fork(parent).unwrap();
    assert_eq!(vm.stats().live_frames, 1);
    assert_eq!(vm.frame_sharers(parent, va), 2);

    for space in [parent, child] {
        let flags = vm.pte_flags(space, va).unwrap();
        assert!(!flags.contains(PteFlags::WRITABLE));
        assert!(flags.contains(PteFlags::DIRTY));
        assert!(!vm.page_info(space, va).unwrap().cow_writable);
    }

    assert_eq!(read_page(&vm, parent, va), read_page(&vm, child, va));
    assert_eq!(vm.stats().live_frames, 1);

    vm.write_user(child, va, &[0xBB]).unwrap();
    assert_eq!(vm.stats().live_frames, 2);
    assert_eq!(vm.stats().cow_copies, 1);

    assert_eq!(read_page(&vm, parent, va), vec![0xAA; PAGE_SIZE]);
    let child_data = read_page(&vm, child, va);
    assert_eq!(child_data[0], 0xBB);
    assert!(child_data[1..].iter().all(|item| *item == 0xAA));
    assert!(vm.pte_flags(child, va).unwrap().contains(PteFlags::WRITABLE));

    // the parent is the last one on its frame and just gets it back
    vm.write_user(parent, VirtAddr(va.0 + 1), &[0xCC]).unwrap();
    assert_eq!(vm.stats().live_frames, 2);
    assert_eq!(vm.stats().cow_copies, 1);
    assert!(vm.page_info(parent, va).unwrap().cow_writable);
    assert_eq!(read_page(&vm, child, va)[1], 0xAA);

    vm.destroy_address_space(parent).unwrap();
    vm.destroy_address_space(child).unwrap();
    assert_eq!(vm.stats().live_frames, 0);
}

#[test]
fn test_fork_keeps_read_only_pages_read_only() {
    let vm = get_test_vm("test_fork_keeps_read_only_pages_read_only", 4, 4);
    let parent = vm.create_address_space();
    let va = user_page(0);
    vm.allocate_lazy_page(parent, PageType::Anon, va, false, PageInitializer::Zero)
        .unwrap();
    vm.materialize(parent, va).unwrap();

    let child = vm.fork(parent).unwrap();
    assert_eq!(
        vm.write_user(child, va, &[1]),
        Err(VmError::WriteProtected(va))
    );
    assert_eq!(vm.stats().cow_copies, 0);
    assert_eq!(
        vm.duplicate_address_space(parent, child),
        Err(VmError::InvalidArgument)
    );
}

#[test]
fn test_fork_copies_swapped_pages() {
    let vm = get_test_vm("test_fork_copies_swapped_pages", 1, 8);
    let parent = vm.create_address_space();
    allocate_zero_pages(&vm, parent, 0, 2);

    vm.write_user(parent, user_page(0), &[1; PAGE_SIZE]).unwrap();
    vm.write_user(parent, user_page(1), &[2; PAGE_SIZE]).unwrap();
    assert!(vm.page_info(parent, user_page(0)).unwrap().swapped_out);

    let child = vm.fork(parent).unwrap();
    let copied = vm.page_info(child, user_page(0)).unwrap();
    assert!(copied.swapped_out);
    assert_ne!(copied.swap_slot, vm.page_info(parent, user_page(0)).unwrap().swap_slot);
    assert_eq!(vm.stats().swap_slots_used, 2);

    vm.destroy_address_space(parent).unwrap();
    assert_eq!(vm.stats().swap_slots_used, 1);
    assert_eq!(vm.stats().live_frames, 1);

    assert_eq!(read_page(&vm, child, user_page(0)), vec![1; PAGE_SIZE]);
    assert_eq!(read_page(&vm, child, user_page(1)), vec![2; PAGE_SIZE]);

    vm.destroy_address_space(child).unwrap();
    assert_eq!(vm.stats().swap_slots_used, 0);
    assert_eq!(vm.stats().live_frames, 0);
}

#[test]
fn test_evicting_shared_frame() {
    let vm = get_test_vm("test_evicting_shared_frame", 1, 8);
    let parent = vm.create_address_space();
    allocate_zero_pages(&vm, parent, 0, 2);
    vm.write_user(parent, user_page(0), &[0x11; PAGE_SIZE]).unwrap();

    let child = vm.fork(parent).unwrap();

    // the shared frame goes out for both of them
    vm.materialize(parent, user_page(1)).unwrap();
    assert!(vm.page_info(parent, user_page(0)).unwrap().swapped_out);
    assert!(vm.page_info(child, user_page(0)).unwrap().swapped_out);
    assert_eq!(vm.stats().swap_slots_used, 2);

    assert_eq!(read_page(&vm, child, user_page(0)), vec![0x11; PAGE_SIZE]);
    let info = vm.page_info(child, user_page(0)).unwrap();
    assert_eq!(info.state, PageState::Anon);
    assert!(info.cow_writable);

    // came back as a private frame, writing needs no copy
    vm.write_user(child, user_page(0), &[0x22]).unwrap();
    assert_eq!(vm.stats().cow_copies, 0);
    assert_eq!(read_page(&vm, parent, user_page(0)), vec![0x11; PAGE_SIZE]);
}

#[test]
fn test_file_handles_across_fork() {
    let vm = get_test_vm("test_file_handles_across_fork", 8, 4);
    let parent = vm.create_address_space();
    let va = user_page(0);
    let file = create_file(&vm, "shared", vec![3; PAGE_SIZE]);

    vm.mmap(parent, va, PAGE_SIZE, true, file, 0).unwrap();
    assert_eq!(open_handles(&vm), 2);
    vm.write_user(parent, va, &[9; 4]).unwrap();

    let child = vm.fork(parent).unwrap();
    assert_eq!(open_handles(&vm), 2);
    assert_eq!(vm.frame_sharers(child, va), 2);

    // breaking the sharing splits the handle as well
    vm.write_user(child, VirtAddr(va.0 + 8), &[5; 4]).unwrap();
    assert_eq!(open_handles(&vm), 3);

    vm.munmap(parent, va).unwrap();
    assert_eq!(open_handles(&vm), 2);
    let contents = vm.with_files(|fs| fs.contents("shared").unwrap().to_vec());
    assert_eq!(&contents[..12], &[9, 9, 9, 9, 3, 3, 3, 3, 3, 3, 3, 3]);

    vm.destroy_address_space(child).unwrap();
    assert_eq!(open_handles(&vm), 1);
    let contents = vm.with_files(|fs| fs.contents("shared").unwrap().to_vec());
    assert_eq!(&contents[..12], &[9, 9, 9, 9, 3, 3, 3, 3, 5, 5, 5, 5]);

    vm.with_files(|fs| fs.close(file));
    assert_eq!(open_handles(&vm), 0);
}

#[test]
fn test_shared_handle_outlives_parent() {
    let vm = get_test_vm("test_shared_handle_outlives_parent", 8, 4);
    let parent = vm.create_address_space();
    let va = user_page(0);
    let file = create_file(&vm, "shared", vec![6; 100]);

    vm.mmap(parent, va, 100, false, file, 0).unwrap();
    read_page(&vm, parent, va);

    let child = vm.fork(parent).unwrap();
    vm.destroy_address_space(parent).unwrap();
    assert_eq!(open_handles(&vm), 2);

    // clean pages are dropped, not written back
    let data = read_page(&vm, child, va);
    assert_eq!(&data[..100], &[6; 100]);
    assert!(data[100..].iter().all(|item| *item == 0));

    vm.munmap(child, va).unwrap();
    assert_eq!(open_handles(&vm), 1);
    assert_eq!(vm.with_files(|fs| fs.contents("shared").unwrap().to_vec()), vec![6; 100]);
}

#[test]
fn test_failed_fork_leaves_parent_intact() {
    let vm = get_test_vm("test_failed_fork_leaves_parent_intact", 4, 4);
    let parent = vm.create_address_space();
    allocate_zero_pages(&vm, parent, 0, 1);
    vm.write_user(parent, user_page(0), &[3; 8]).unwrap();

    // a lazy file page whose handle went away behind the vm's back
    let file = create_file(&vm, "data", vec![1; PAGE_SIZE]);
    let chunk = PageInitializer::FileChunk(crate::FilePage {
        file: Some(file),
        offset: 0,
        data_bytes: PAGE_SIZE,
        zero_bytes: 0,
        is_last: true,
    });
    vm.allocate_lazy_page(parent, PageType::File, user_page(1), true, chunk)
        .unwrap();
    vm.with_files(|fs| fs.close(file));

    assert_eq!(vm.fork(parent), Err(VmError::Io));

    // the half built child is gone again, frame and handles included
    assert_eq!(vm.frame_sharers(parent, user_page(0)), 1);
    assert_eq!(vm.stats().live_frames, 1);
    assert_eq!(open_handles(&vm), 0);

    vm.write_user(parent, user_page(0), &[4; 8]).unwrap();
    assert_eq!(&read_page(&vm, parent, user_page(0))[..8], &[4; 8]);
    assert_eq!(vm.stats().cow_copies, 0);
}

#[test]
#[should_panic(expected = "out of user frames")]
fn test_cow_copy_cannot_evict_its_source() {
    let vm = get_test_vm("test_cow_copy_cannot_evict_its_source", 1, 4);
    let parent = vm.create_address_space();
    allocate_zero_pages(&vm, parent, 0, 1);
    vm.write_user(parent, user_page(0), &[1; 8]).unwrap();

    let child = vm.fork(parent).unwrap();
    assert_eq!(vm.frame_sharers(child, user_page(0)), 2);

    // the only frame is the one being copied
    let _ = vm.write_user(child, user_page(0), &[2; 8]);
}
