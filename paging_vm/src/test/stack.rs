use super::{get_test_vm, get_test_vm_with_config};
use crate::{
    FaultInfo, PageState, VirtAddr, VmConfig, VmError, KERN_BASE, PAGE_SIZE, STACK_GROWTH_SLACK,
    USER_STACK,
};

fn user_fault(addr: usize, rsp: usize, write: bool) -> FaultInfo {
    FaultInfo {
        addr: VirtAddr(addr),
        user: true,
        write,
        not_present: true,
        rsp: VirtAddr(rsp),
    }
}

#[test]
fn test_push_grows_stack() {
    let vm = get_test_vm("test_push_grows_stack", 8, 4);
    let space = vm.create_address_space();
    vm.setup_stack(space).unwrap();

    let rsp = USER_STACK - 3 * PAGE_SIZE;
    vm.try_handle_fault(space, user_fault(rsp - 32, rsp, true))
        .unwrap();
    assert_eq!(vm.stack_pages(space), Ok(4));

    let bottom = vm.page_info(space, VirtAddr(USER_STACK - 4 * PAGE_SIZE)).unwrap();
    assert!(bottom.is_stack);
    assert!(bottom.resident);

    // pages in between wait for their first access
    let between = vm.page_info(space, VirtAddr(USER_STACK - 2 * PAGE_SIZE)).unwrap();
    assert!(between.is_stack);
    assert_eq!(between.state, PageState::Uninit);
    assert_eq!(vm.stats().live_frames, 2);
}

#[test]
fn test_far_below_stack_pointer_is_not_stack() {
    let vm = get_test_vm("test_far_below_stack_pointer_is_not_stack", 8, 4);
    let space = vm.create_address_space();
    vm.setup_stack(space).unwrap();

    let rsp = USER_STACK - PAGE_SIZE;
    let addr = rsp - STACK_GROWTH_SLACK - 1;
    assert_eq!(
        vm.try_handle_fault(space, user_fault(addr, rsp, true)),
        Err(VmError::NotPresent(VirtAddr(addr)))
    );
    assert_eq!(vm.stack_pages(space), Ok(1));
}

#[test]
fn test_kernel_fault_uses_saved_stack_pointer() {
    let vm = get_test_vm("test_kernel_fault_uses_saved_stack_pointer", 8, 4);
    let space = vm.create_address_space();
    vm.setup_stack(space).unwrap();

    let rsp = VirtAddr(USER_STACK - PAGE_SIZE - 8);
    vm.set_stack_pointer(space, rsp).unwrap();

    // a system call writing to the user stack, the trap frame has no user rsp
    let fault = FaultInfo {
        addr: rsp,
        user: false,
        write: true,
        not_present: true,
        rsp: VirtAddr(0),
    };
    vm.try_handle_fault(space, fault).unwrap();
    assert_eq!(vm.stack_pages(space), Ok(2));

    // user accesses go through the same path
    vm.write_user(space, rsp, &[1; 8]).unwrap();
    let mut buffer = [0u8; 8];
    vm.read_user(space, rsp, &mut buffer).unwrap();
    assert_eq!(buffer, [1; 8]);
}

#[test]
fn test_stack_page_limit() {
    let config = VmConfig {
        user_frames: 8,
        max_stack_pages: 4,
    };
    let vm = get_test_vm_with_config("test_stack_page_limit", config, 4);
    let space = vm.create_address_space();
    vm.setup_stack(space).unwrap();

    let last = USER_STACK - 4 * PAGE_SIZE + 8;
    vm.try_handle_fault(space, user_fault(last, last, true))
        .unwrap();
    assert_eq!(vm.stack_pages(space), Ok(4));

    let beyond = USER_STACK - 5 * PAGE_SIZE + 8;
    assert_eq!(
        vm.try_handle_fault(space, user_fault(beyond, beyond, true)),
        Err(VmError::StackOverflow(VirtAddr(beyond)))
    );
    assert_eq!(vm.stack_pages(space), Ok(4));
    assert!(vm.page_info(space, VirtAddr(beyond)).is_none());
    assert_eq!(VmError::StackOverflow(VirtAddr(beyond)).exit_status(), -1);
}

#[test]
fn test_kernel_addresses_rejected() {
    let vm = get_test_vm("test_kernel_addresses_rejected", 8, 4);
    let space = vm.create_address_space();

    assert_eq!(
        vm.try_handle_fault(space, user_fault(KERN_BASE, USER_STACK, false)),
        Err(VmError::KernelAddress(VirtAddr(KERN_BASE)))
    );

    let mut buffer = [0u8; 4];
    assert_eq!(
        vm.read_user(space, VirtAddr(KERN_BASE + 16), &mut buffer),
        Err(VmError::KernelAddress(VirtAddr(KERN_BASE + 16)))
    );
    assert_eq!(
        vm.read_user(space, VirtAddr(0), &mut buffer),
        Err(VmError::NotPresent(VirtAddr(0)))
    );
}
