//! Page-fault service for user processes.
//!
//! Installed through SYS5 by every user process at startup, so it runs in
//! the faulting process's context with VM on. A miss picks a victim frame
//! round-robin, pages the evictee out to the backing store, pages the
//! missing page in, rewires the swap pool and the page tables and resumes
//! the faulting instruction. Page-table and TLB edits happen with
//! interrupts masked so no preemption can expose a half-built mapping.

use super::io;
use super::{swap_pool_start, vm, EntryLo, PteEntry, KUSEG3_SEG, KUSEG_PTE_SIZE};
use crate::devices::{READ_BLK, WRITE_BLK};
use crate::machine::{
    self, State, TrapKind, CAUSE_MASK, CAUSE_TLB_LOAD, CAUSE_TLB_STORE, PAGE_SIZE,
};
use crate::syscalls::{SYS_PASSEREN, SYS_VERHOGEN};
use bit_field::BitField;

/// VM-level program traps have no recovery: the process dies.
pub extern "C" fn vm_prog_trap_handler() -> ! {
    let asid = machine::current_asid() as i32;
    io::virtual_death(asid)
}

/// VM-level TLB trap handler.
pub extern "C" fn vm_fault_handler() -> ! {
    let asid = machine::current_asid();
    let globals = vm();
    let old: *const State =
        unsafe { &(*globals).uprocs[asid - 1].old_trap[TrapKind::Tlb as usize] as *const State };

    let cause = unsafe { (*old).cp15_cause } & CAUSE_MASK;
    if cause != CAUSE_TLB_LOAD && cause != CAUSE_TLB_STORE {
        // only a missing page is serviceable here
        io::virtual_death(asid as i32);
    }

    let entry_hi = unsafe { (*old).cp15_entry_hi };
    let seg = entry_hi.get_bits(30..32);
    let mut page = entry_hi.get_bits(12..30);
    if page >= KUSEG_PTE_SIZE {
        // references above the table land on the top (stack) entry
        page = KUSEG_PTE_SIZE - 1;
    }

    let swap_sem_addr = unsafe { (*globals).swap_sem.addr() };
    machine::syscall(SYS_PASSEREN, swap_sem_addr, 0, 0);

    let frame = unsafe { (*globals).swap_pool.choose_frame() };
    let frame_addr = swap_pool_start() + frame * PAGE_SIZE;

    let victim = unsafe { *(*globals).swap_pool.entry(frame) };
    if victim.asid != -1 {
        machine::set_int_enabled(false);
        unsafe {
            let pte = victim.pte as *mut PteEntry;
            (*pte).lo &= !EntryLo::VALID.bits();
        }
        machine::tlb_clear();
        machine::set_int_enabled(true);

        io::read_write_backing(victim.page_no, victim.asid as usize, WRITE_BLK, frame_addr);
    }

    io::read_write_backing(page, asid, READ_BLK, frame_addr);

    machine::set_int_enabled(false);
    unsafe {
        let pte: *mut PteEntry = if seg == KUSEG3_SEG {
            &mut (*globals).kuseg3.entries[page] as *mut PteEntry
        } else {
            &mut (*globals).uprocs[asid - 1].pte.entries[page] as *mut PteEntry
        };
        let flags = if seg == KUSEG3_SEG {
            EntryLo::VALID | EntryLo::DIRTY | EntryLo::GLOBAL
        } else {
            EntryLo::VALID | EntryLo::DIRTY
        };
        (*pte).lo = frame_addr as u32 | flags.bits();
        (*globals)
            .swap_pool
            .occupy(frame, asid as i32, seg, page, pte as usize);
    }
    machine::tlb_clear();
    machine::set_int_enabled(true);

    machine::syscall(SYS_VERHOGEN, swap_sem_addr, 0, 0);
    machine::load_state(old)
}
