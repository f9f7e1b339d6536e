//! The init process.
//!
//! The first real process: it builds the kernel-segment and shared kseg3
//! page tables, the per-user-process page tables and the segment table
//! rows, seeds the VM-layer semaphores, then creates one setup process per
//! user program plus the delay daemon. Each setup process installs its
//! trap bindings, streams its tape image onto the backing store and drops
//! into user mode, faulting its pages in lazily. The init process waits on
//! the master semaphore for every user process to finish, then terminates.

use super::io::{self, p, v};
use super::{
    seg_table_row, table_header, vm, EntryLo, ENTRYHI_SHIFT, EXEC_TOP, KSEGOS_PTE_SIZE,
    KUSEG3_ADDR, KUSEG_PTE_SIZE, MAX_USER_PROC, OS_CODE_TOP, UPROC_ENTRY, UPROC_STACK_SIZE,
};
use crate::devices::{
    self, DISK_INT, DISK_SEEK, EOB, READ_BLK, READY, SECTOR_SHIFT, SEEK_SHIFT, TAPE_INT, WRITE_BLK,
};
use crate::machine::{
    self, State, TrapKind, ALL_OFF, ASID_SHIFT, MODE_SYSTEM, MODE_USER, PAGE_SIZE, VM_ON,
};
use crate::syscalls::{
    SYS_CREATE_PROCESS, SYS_PASSEREN, SYS_SPECIFY_TRAP_VECTORS, SYS_TERMINATE_PROCESS,
    SYS_VERHOGEN, SYS_WAIT_FOR_CLOCK, SYS_WAIT_FOR_IO,
};

/// Entry point of the first process created at boot.
pub extern "C" fn init_proc() -> ! {
    let globals = vm();
    let ram_top = machine::ram_top();

    unsafe {
        let g = &mut *globals;

        // kernel segment: identity-mapped, always valid, global
        g.kseg_os.header = table_header(KSEGOS_PTE_SIZE);
        for (i, entry) in g.kseg_os.entries.iter_mut().enumerate() {
            let tag = (0x20000 + i as u32) << ENTRYHI_SHIFT;
            entry.hi = tag;
            entry.lo = tag | (EntryLo::DIRTY | EntryLo::VALID | EntryLo::GLOBAL).bits();
        }

        // shared kseg3: invalid until faulted in
        g.kuseg3.header = table_header(KUSEG_PTE_SIZE);
        for (i, entry) in g.kuseg3.entries.iter_mut().enumerate() {
            entry.hi = (0xC0000 + i as u32) << ENTRYHI_SHIFT;
            entry.lo = (EntryLo::DIRTY | EntryLo::GLOBAL).bits();
        }

        g.swap_sem.set(1);
        for sem in g.mutex_sems.iter() {
            sem.set(1);
        }
        g.master_sem.set(0);

        for asid in 1..=MAX_USER_PROC {
            let uproc = &mut g.uprocs[asid - 1];
            uproc.pte.header = table_header(KUSEG_PTE_SIZE);
            for (j, entry) in uproc.pte.entries.iter_mut().enumerate() {
                entry.hi = ((0x80000 + j as u32) << ENTRYHI_SHIFT) | ((asid as u32) << ASID_SHIFT);
                entry.lo = EntryLo::DIRTY.bits();
            }
            // the last entry doubles as the stack page just under kseg3
            uproc.pte.entries[KUSEG_PTE_SIZE - 1].hi =
                (0xBFFFF << ENTRYHI_SHIFT) | ((asid as u32) << ASID_SHIFT);
            uproc.sem.set(0);

            let row = seg_table_row(asid);
            (*row).kseg_os = &g.kseg_os as *const _ as usize as u32;
            (*row).kuseg2 = &uproc.pte as *const _ as usize as u32;
            (*row).kuseg3 = &g.kuseg3 as *const _ as usize as u32;

            let mut state = State::zeroed();
            state.cp15_entry_hi = asid << ASID_SHIFT;
            state.sp = ram_top - 3 * PAGE_SIZE;
            state.pc = uproc_start as usize;
            state.cpsr = ALL_OFF | MODE_SYSTEM;
            machine::syscall(SYS_CREATE_PROCESS, &state as *const State as usize, 0, 0);
        }

        // the delay daemon gets an ASID of its own past the user range
        let mut daemon_state = State::zeroed();
        daemon_state.cp15_entry_hi = (MAX_USER_PROC + 2) << ASID_SHIFT;
        daemon_state.sp = EXEC_TOP - MAX_USER_PROC * UPROC_STACK_SIZE;
        daemon_state.pc = delay_daemon as usize;
        daemon_state.cpsr = ALL_OFF | MODE_SYSTEM;
        machine::syscall(SYS_CREATE_PROCESS, &daemon_state as *const State as usize, 0, 0);

        // rendezvous: one master P per user process created
        for _ in 0..MAX_USER_PROC {
            machine::syscall(SYS_PASSEREN, g.master_sem.addr(), 0, 0);
        }
    }

    machine::syscall(SYS_TERMINATE_PROCESS, 0, 0, 0);
    unreachable!("terminated process resumed")
}

/// Per-user-process setup, still in kernel mode: install the three trap
/// bindings, copy the tape image to the backing store, then switch to the
/// user image.
extern "C" fn uproc_start() -> ! {
    let asid = machine::current_asid();
    let globals = vm();

    // exception stacks are carved downward from EXEC_TOP: syscall and
    // program traps share the top page, TLB traps get the one below
    let stack_top = EXEC_TOP - (asid - 1) * UPROC_STACK_SIZE;
    let sys_top = stack_top;
    let prog_top = stack_top;
    let tlb_top = stack_top - PAGE_SIZE;

    unsafe {
        let uproc = &mut (*globals).uprocs[asid - 1];
        for kind in [TrapKind::Tlb, TrapKind::Prog, TrapKind::Sys] {
            let index = kind as usize;
            let new_state = &mut uproc.new_trap[index];
            *new_state = State::zeroed();
            new_state.cp15_entry_hi = asid << ASID_SHIFT;
            new_state.cpsr = ALL_OFF;
            new_state.cp15_control = ALL_OFF | VM_ON;
            match kind {
                TrapKind::Tlb => {
                    new_state.sp = tlb_top;
                    new_state.pc = super::fault::vm_fault_handler as usize;
                }
                TrapKind::Prog => {
                    new_state.sp = prog_top;
                    new_state.pc = super::fault::vm_prog_trap_handler as usize;
                }
                TrapKind::Sys => {
                    new_state.sp = sys_top;
                    new_state.pc = io::vm_syscall_handler as usize;
                }
            }
            machine::syscall(
                SYS_SPECIFY_TRAP_VECTORS,
                index,
                &mut uproc.old_trap[index] as *mut State as usize,
                new_state as *const State as usize,
            );
        }
    }

    load_image(asid);

    // over to the user program: VM on, user mode, stack at the top of
    // kuseg2, pages faulted in on demand
    let mut start = State::zeroed();
    machine::store_state(&mut start);
    start.cp15_entry_hi = asid << ASID_SHIFT;
    start.sp = KUSEG3_ADDR;
    start.cpsr = ALL_OFF | MODE_USER;
    start.cp15_control = VM_ON;
    start.pc = UPROC_ENTRY;
    machine::load_state(&start)
}

/// Stream this process's tape image block-by-block onto the backing store
/// (cylinder = block number, sector = ASID - 1), staging each block
/// through the per-process tape buffer page.
fn load_image(asid: usize) {
    let tape_slot = devices::sem_index(TAPE_INT, asid - 1);
    let tape = devices::device(tape_slot);
    let disk = devices::device(devices::BACKING_STORE);
    let buffer = OS_CODE_TOP + (asid - 1) * PAGE_SIZE;

    let tape_mutex = io::mutex_addr(tape_slot);
    let backing_mutex = io::mutex_addr(devices::BACKING_STORE);
    p(tape_mutex);

    let mut block: usize = 0;
    let mut finished = false;
    let mut tape_status = READY;

    while tape_status & 0xFF == READY && !finished {
        machine::set_int_enabled(false);
        tape.write_data0(buffer);
        tape.write_command(READ_BLK);
        tape_status = machine::syscall(SYS_WAIT_FOR_IO, TAPE_INT, asid - 1, 0);
        machine::set_int_enabled(true);

        p(backing_mutex);

        machine::set_int_enabled(false);
        disk.write_command((block << SEEK_SHIFT) | DISK_SEEK);
        let disk_status = machine::syscall(SYS_WAIT_FOR_IO, DISK_INT, 0, 0);
        machine::set_int_enabled(true);

        if disk_status & 0xFF == READY {
            machine::set_int_enabled(false);
            disk.write_data0(buffer);
            disk.write_command(((asid - 1) << SECTOR_SHIFT) | WRITE_BLK);
            machine::syscall(SYS_WAIT_FOR_IO, DISK_INT, 0, 0);
            machine::set_int_enabled(true);
        }

        v(backing_mutex);

        // the post-read marker says whether another block follows
        if tape.data1() != EOB {
            finished = true;
        }
        block += 1;
    }

    v(tape_mutex);
}

/// The delay daemon: once per pseudo-clock tick, wake every sleeper whose
/// time has come.
extern "C" fn delay_daemon() -> ! {
    let globals = vm();
    loop {
        machine::syscall(SYS_WAIT_FOR_CLOCK, 0, 0, 0);
        let now = machine::stck();

        loop {
            machine::set_int_enabled(false);
            let due = unsafe { (*globals).adl.head_wake_time() }.is_some_and(|t| t <= now);
            let sleeper = if due {
                unsafe { (*globals).adl.remove_delay() }
            } else {
                None
            };
            machine::set_int_enabled(true);

            match (due, sleeper) {
                (false, _) => break,
                (true, Some(asid)) => {
                    let sem = unsafe { (*globals).uprocs[asid as usize - 1].sem.addr() };
                    machine::syscall(SYS_VERHOGEN, sem, 0, 0);
                }
                // the head was due a moment ago; an empty pop means the
                // list is corrupt
                (true, None) => machine::panic_halt(),
            }
        }
    }
}
