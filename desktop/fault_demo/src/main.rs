/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use env_logger::{Builder, Env};
use log::info;
use paging_vm::{
    modules::{
        filesystem::{FileSystem, MemFileSystem},
        persistent_storage::FilePersistentStorageModule,
    },
    PageInitializer, PageType, SegmentLoad, VirtAddr, Vm, VmConfig, VmError, PAGE_SIZE,
    SECTORS_PER_SLOT,
};

const CODE_BASE: usize = 0x400000;
const HEAP_BASE: usize = 0x1000_0000;
const MMAP_BASE: usize = 0x2000_0000;

fn run(vm: &Vm<MemFileSystem, FilePersistentStorageModule>) -> Result<(), VmError> {
    let program = vm.with_files(|fs| {
        fs.create("program", (0..6000).map(|i| (i % 256) as u8).collect());
        fs.create("notes.txt", b"the quick brown fox".to_vec());
        fs.open("program")
    });
    let program = program.ok_or(VmError::InvalidArgument)?;

    let parent = vm.create_address_space();
    vm.load_segment(
        parent,
        VirtAddr(CODE_BASE),
        SegmentLoad {
            file: program,
            offset: 0,
            read_bytes: 6000,
            zero_bytes: 2 * PAGE_SIZE - 6000,
        },
        false,
    )?;
    let rsp = vm.setup_stack(parent)?;

    // push a few frames worth of data, the stack grows on demand
    let rsp = VirtAddr(rsp.as_usize() - 3 * PAGE_SIZE);
    vm.set_stack_pointer(parent, rsp)?;
    vm.write_user(parent, rsp, &[0x5A; 64])?;

    // a heap bigger than physical memory
    for page in 0..12 {
        let va = VirtAddr(HEAP_BASE + page * PAGE_SIZE);
        vm.allocate_lazy_page(parent, PageType::Anon, va, true, PageInitializer::Zero)?;
        vm.write_user(parent, va, &[page as u8; 32])?;
    }

    let mut code = [0u8; 16];
    vm.read_user(parent, VirtAddr(CODE_BASE + PAGE_SIZE), &mut code)?;
    info!("code at {:#x}: {:?}", CODE_BASE + PAGE_SIZE, code);

    let child = vm.fork(parent)?;
    vm.write_user(child, VirtAddr(HEAP_BASE), b"child")?;

    let mut parent_view = [0u8; 5];
    let mut child_view = [0u8; 5];
    vm.read_user(parent, VirtAddr(HEAP_BASE), &mut parent_view)?;
    vm.read_user(child, VirtAddr(HEAP_BASE), &mut child_view)?;
    info!("after fork: parent {:?}, child {:?}", parent_view, child_view);

    let notes = vm
        .with_files(|fs| fs.open("notes.txt"))
        .ok_or(VmError::InvalidArgument)?;
    let mapping = vm.mmap(child, VirtAddr(MMAP_BASE), 19, true, notes, 0)?;
    vm.write_user(child, VirtAddr(mapping.as_usize() + 4), b"QUICK")?;
    vm.munmap(child, mapping)?;

    let written = vm.with_files(|fs| fs.contents("notes.txt").map(|data| data.to_vec()));
    if let Some(written) = written {
        info!("notes.txt: {}", String::from_utf8_lossy(&written));
    }

    vm.destroy_address_space(child)?;
    vm.destroy_address_space(parent)?;
    vm.with_files(|fs| {
        fs.close(notes);
        fs.close(program);
    });

    Ok(())
}

fn main() {
    Builder::from_env(Env::default())
        .filter_level(log::LevelFilter::Debug)
        .format_module_path(false)
        .init();

    let storage = FilePersistentStorageModule::new(
        "/tmp/paging_vm_fault_demo.swap".to_string(),
        64 * SECTORS_PER_SLOT,
    )
    .unwrap();
    let config = VmConfig {
        user_frames: 8,
        ..VmConfig::default()
    };
    let vm = Vm::new(config, MemFileSystem::new(), storage);
    info!(
        "stack limited to {} pages",
        vm.config().max_stack_pages
    );

    if let Err(err) = run(&vm) {
        eprintln!("process terminated with {}: {}", err.exit_status(), err);
    }

    let stats = vm.stats();
    println!(
        "frames: {} allocations, {} evictions, {} cow copies",
        stats.frame_allocations, stats.evictions, stats.cow_copies
    );
    println!(
        "swap: {} of {} slots in use",
        stats.swap_slots_used, stats.swap_slots
    );
}
