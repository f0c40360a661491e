use rand::{rngs::SmallRng, RngCore};

use crate::{
    modules::{
        filesystem::{FileId, FileSystem, MemFileSystem},
        persistent_storage::{test::get_test_storage, FilePersistentStorageModule},
    },
    PageInitializer, PageType, SpaceId, VirtAddr, Vm, VmConfig, PAGE_SIZE, SECTORS_PER_SLOT,
};

mod cow;
mod stack;
mod swap;

pub(crate) type TestVm = Vm<MemFileSystem, FilePersistentStorageModule>;

/// Start of the user region the tests place their pages in
pub(crate) const USER_BASE: usize = 0x1000_0000;

pub(crate) fn user_page(index: usize) -> VirtAddr {
    VirtAddr(USER_BASE + index * PAGE_SIZE)
}

#[cfg(not(no_std))]
pub(crate) fn get_test_vm(test_name: &str, user_frames: usize, swap_slots: usize) -> TestVm {
    get_test_vm_with_config(
        test_name,
        VmConfig {
            user_frames,
            ..VmConfig::default()
        },
        swap_slots,
    )
}

#[cfg(not(no_std))]
pub(crate) fn get_test_vm_with_config(test_name: &str, config: VmConfig, swap_slots: usize) -> TestVm {
    let _ = env_logger::builder().is_test(true).try_init();

    let storage = get_test_storage(test_name, swap_slots * SECTORS_PER_SLOT);
    Vm::new(config, MemFileSystem::new(), storage)
}

/// Creates the file `name` and returns an open handle to it
pub(crate) fn create_file(vm: &TestVm, name: &str, data: Vec<u8>) -> FileId {
    vm.with_files(|fs| {
        assert!(fs.create(name, data));
        fs.open(name).unwrap()
    })
}

pub(crate) fn open_handles(vm: &TestVm) -> usize {
    vm.with_files(|fs| fs.open_handles())
}

pub(crate) fn allocate_zero_pages(vm: &TestVm, space: SpaceId, first: usize, count: usize) {
    for index in first..first + count {
        vm.allocate_lazy_page(space, PageType::Anon, user_page(index), true, PageInitializer::Zero)
            .unwrap();
    }
}

pub(crate) fn random_page(rand: &mut SmallRng) -> Vec<u8> {
    let mut data = vec![0u8; PAGE_SIZE];
    rand.fill_bytes(&mut data);
    data
}

pub(crate) fn read_page(vm: &TestVm, space: SpaceId, va: VirtAddr) -> Vec<u8> {
    let mut data = vec![0u8; PAGE_SIZE];
    vm.read_user(space, va, &mut data).unwrap();
    data
}
