//! Kernel syscalls 1-8, the program-trap and TLB-trap entries, and the
//! pass-up-or-die policy.
//!
//! Syscall entry reads the saved state from the syscall-old area, advances
//! its PC past the trapping instruction and stashes it in the current PCB.
//! A privileged syscall issued from user mode is rewritten as a
//! reserved-instruction program trap; anything above 8 is passed up (or
//! kills the offender's subtree) as a syscall trap.

use crate::machine::{self, Area, State, TrapKind, CAUSE_RESERVED_INSTR, MODE_MASK, MODE_SYSTEM};
use crate::pcb::{Pid, TrapBinding};
use crate::scheduler::{
    self, begin_burst, charge_current, device_sem_addr, enqueue_ready, is_device_sem, Kernel, Next,
    CLOCK_SEM,
};
use crate::sync;

pub const SYS_CREATE_PROCESS: usize = 1;
pub const SYS_TERMINATE_PROCESS: usize = 2;
pub const SYS_VERHOGEN: usize = 3;
pub const SYS_PASSEREN: usize = 4;
pub const SYS_SPECIFY_TRAP_VECTORS: usize = 5;
pub const SYS_GET_CPU_TIME: usize = 6;
pub const SYS_WAIT_FOR_CLOCK: usize = 7;
pub const SYS_WAIT_FOR_IO: usize = 8;

pub const SUCCESS: usize = 0;
pub const FAILURE: usize = usize::MAX;

/// Instruction width: the saved PC points back at the SWI itself.
const SYSCALL_PC_STEP: usize = 8;

/// Syscall trap entry, installed in the syscall new area at boot.
pub extern "C" fn syscall_entry() -> ! {
    let old = machine::area(Area::SyscallOld);
    let next = {
        let mut k = scheduler::KERNEL.lock();
        let saved = unsafe {
            (*old).pc = (*old).pc.wrapping_add(SYSCALL_PC_STEP);
            *old
        };
        let current = k.current.expect("syscall with no current process");
        k.pcbs[current].state = saved;
        handle_syscall(&mut k, &saved)
    };
    scheduler::finish(next)
}

/// Program trap entry, installed in the program-trap new area at boot.
pub extern "C" fn prog_trap_entry() -> ! {
    let next = {
        let mut k = scheduler::KERNEL.lock();
        pass_up_or_die(&mut k, TrapKind::Prog)
    };
    scheduler::finish(next)
}

/// Nucleus TLB trap entry, installed in the TLB new area at boot.
pub extern "C" fn tlb_trap_entry() -> ! {
    let next = {
        let mut k = scheduler::KERNEL.lock();
        pass_up_or_die(&mut k, TrapKind::Tlb)
    };
    scheduler::finish(next)
}

fn handle_syscall(k: &mut Kernel, saved: &State) -> Next {
    let number = saved.a1;
    let privileged = saved.cpsr & MODE_MASK == MODE_SYSTEM;

    if privileged {
        match number {
            SYS_CREATE_PROCESS => create_process(k, saved),
            SYS_TERMINATE_PROCESS => terminate_current(k),
            SYS_VERHOGEN => verhogen(k, saved.a2),
            SYS_PASSEREN => passeren(k, saved.a2),
            SYS_SPECIFY_TRAP_VECTORS => specify_trap_vectors(k, saved),
            SYS_GET_CPU_TIME => get_cpu_time(k),
            SYS_WAIT_FOR_CLOCK => wait_for_clock(k),
            SYS_WAIT_FOR_IO => wait_for_io(k, saved),
            _ => pass_up_or_die(k, TrapKind::Sys),
        }
    } else if (SYS_CREATE_PROCESS..=SYS_WAIT_FOR_IO).contains(&number) {
        // a privileged service requested from user mode becomes a
        // reserved-instruction program trap
        unsafe {
            let prog_old = machine::area(Area::ProgTrapOld);
            *prog_old = *machine::area(Area::SyscallOld);
            (*prog_old).cp15_cause = CAUSE_RESERVED_INSTR;
        }
        pass_up_or_die(k, TrapKind::Prog)
    } else {
        pass_up_or_die(k, TrapKind::Sys)
    }
}

/// SYS1: allocate a PCB for the state in a2, adopt it as a child of the
/// caller and make it ready. The caller learns success or failure in its
/// result register.
fn create_process(k: &mut Kernel, saved: &State) -> Next {
    let current = k.current.expect("syscall with no current process");
    match k.pcbs.alloc() {
        Some(new) => {
            k.process_count += 1;
            k.pcbs[new].state = unsafe { *(saved.a2 as *const State) };
            k.pcbs.insert_child(current, new);
            enqueue_ready(k, new);
            k.pcbs[current].state.a1 = SUCCESS;
        }
        None => {
            k.pcbs[current].state.a1 = FAILURE;
        }
    }
    Next::Resume
}

/// SYS2: kill the caller and every descendant, then give the CPU away.
fn terminate_current(k: &mut Kernel) -> Next {
    let current = k.current.expect("syscall with no current process");
    terminate_tree(k, current);
    k.current = None;
    Next::Schedule
}

/// Depth-first teardown of `root` and all its progeny. Each PCB comes off
/// whatever structure holds it: the ready queue, an ASL wait queue, or the
/// current slot. A victim blocked on an ordinary semaphore gives back the
/// token it had consumed; one parked on a device semaphore instead leaves
/// the pending I/O to the soft-block bookkeeping.
pub fn terminate_tree(k: &mut Kernel, root: Pid) {
    while let Some(child) = k.pcbs.remove_child(root) {
        terminate_tree(k, child);
    }

    if k.current == Some(root) {
        k.pcbs.detach(root);
    } else if k.pcbs[root].sem_addr.is_none() {
        let mut ready = k.ready;
        k.pcbs.unlink(&mut ready, root);
        k.ready = ready;
    } else {
        let addr = k.pcbs[root].sem_addr.expect("blocked PCB without an address");
        k.asl.out_blocked(&mut k.pcbs, root);
        if is_device_sem(addr) {
            k.soft_block_count -= 1;
        } else {
            unsafe {
                sync::adjust(addr, 1);
            }
        }
    }

    k.pcbs.free(root);
    k.process_count -= 1;
}

/// SYS3: V the semaphore at `addr` and wake its head waiter if the new
/// value still owes one.
fn verhogen(k: &mut Kernel, addr: usize) -> Next {
    let value = unsafe { sync::adjust(addr, 1) };
    if value <= 0 {
        if let Some(p) = k.asl.remove_blocked(&mut k.pcbs, addr) {
            k.pcbs[p].sem_addr = None;
            enqueue_ready(k, p);
        }
    }
    Next::Resume
}

/// SYS4: P the semaphore at `addr`; a negative result blocks the caller.
fn passeren(k: &mut Kernel, addr: usize) -> Next {
    let value = unsafe { sync::adjust(addr, -1) };
    if value < 0 {
        let current = k.current.expect("syscall with no current process");
        charge_current(k);
        if !k.asl.insert_blocked(&mut k.pcbs, addr, current) {
            crate::log_warn!("syscalls: semaphore descriptor pool exhausted");
        }
        k.current = None;
        Next::Schedule
    } else {
        Next::Resume
    }
}

/// SYS5: record one (old, new) exception-state pair for the trap class in
/// a2. A second registration for the same class, or a junk class code,
/// kills the whole subtree.
fn specify_trap_vectors(k: &mut Kernel, saved: &State) -> Next {
    let current = k.current.expect("syscall with no current process");
    if let Some(kind) = TrapKind::from_code(saved.a2) {
        let slot = &mut k.pcbs[current].trap_areas[kind as usize];
        if slot.is_none() {
            *slot = Some(TrapBinding {
                old: saved.a3,
                new: saved.a4,
            });
            return Next::Resume;
        }
    }
    terminate_tree(k, current);
    k.current = None;
    Next::Schedule
}

/// SYS6: bill the burst so far and report the caller's accumulated CPU
/// time in its result register.
fn get_cpu_time(k: &mut Kernel) -> Next {
    charge_current(k);
    let current = k.current.expect("syscall with no current process");
    k.pcbs[current].state.a1 = k.pcbs[current].cpu_time as usize;
    begin_burst(k);
    Next::Resume
}

/// SYS7: P the pseudo-clock semaphore. The clock is reset to zero on every
/// tick, so the caller always blocks until the next one.
fn wait_for_clock(k: &mut Kernel) -> Next {
    let addr = device_sem_addr(CLOCK_SEM);
    let value = unsafe { sync::adjust(addr, -1) };
    if value < 0 {
        let current = k.current.expect("syscall with no current process");
        charge_current(k);
        if !k.asl.insert_blocked(&mut k.pcbs, addr, current) {
            crate::log_warn!("syscalls: semaphore descriptor pool exhausted");
        }
        k.current = None;
        k.soft_block_count += 1;
        Next::Schedule
    } else {
        // unreachable while the tick keeps resetting the clock to zero
        Next::Resume
    }
}

/// SYS8: P the device semaphore for (line, unit, direction). If the
/// completion already arrived, hand back the latched status instead of
/// blocking.
fn wait_for_io(k: &mut Kernel, saved: &State) -> Next {
    use crate::devices::{sem_index, DEV_PER_INT, TERM_INT, WRITE_TERM};

    let line = saved.a2;
    let unit = saved.a3;
    let mut slot = sem_index(line, unit);
    if line == TERM_INT && saved.a4 == WRITE_TERM {
        slot += DEV_PER_INT;
    }

    let addr = device_sem_addr(slot);
    let value = unsafe { sync::adjust(addr, -1) };
    if value < 0 {
        let current = k.current.expect("syscall with no current process");
        charge_current(k);
        if !k.asl.insert_blocked(&mut k.pcbs, addr, current) {
            crate::log_warn!("syscalls: semaphore descriptor pool exhausted");
        }
        k.current = None;
        k.soft_block_count += 1;
        Next::Schedule
    } else {
        let current = k.current.expect("syscall with no current process");
        k.pcbs[current].state.a1 = k.dev_status[slot];
        Next::Resume
    }
}

/// Deliver a trap to the handler the current process installed for it, or
/// kill the process and its progeny if it never installed one.
pub fn pass_up_or_die(k: &mut Kernel, kind: TrapKind) -> Next {
    let current = k.current.expect("trap with no current process");
    if let Some(binding) = k.pcbs[current].trap_areas[kind as usize] {
        unsafe {
            *(binding.old as *mut State) = *machine::old_area_of(kind);
            k.pcbs[current].state = *(binding.new as *const State);
        }
        Next::Resume
    } else {
        terminate_tree(k, current);
        k.current = None;
        Next::Schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::host;
    use crate::scheduler::DEVICE_SEMS;
    use crate::sync::Semaphore;

    /// A kernel with one running process, the way syscall entry leaves it.
    fn kernel_with_current() -> (Kernel, Pid) {
        let mut k = Kernel::new();
        let p = k.pcbs.alloc().unwrap();
        k.process_count = 1;
        k.current = Some(p);
        (k, p)
    }

    fn sys_state(number: usize, a2: usize, a3: usize, a4: usize) -> State {
        let mut s = State::zeroed();
        s.a1 = number;
        s.a2 = a2;
        s.a3 = a3;
        s.a4 = a4;
        s.cpsr = MODE_SYSTEM;
        s
    }

    #[test]
    fn create_process_adopts_and_readies_the_child() {
        let _guard = host::lock();
        let (mut k, parent) = kernel_with_current();
        let mut child_state = State::zeroed();
        child_state.pc = 0x1234;
        let saved = sys_state(SYS_CREATE_PROCESS, &child_state as *const State as usize, 0, 0);

        assert!(matches!(handle_syscall(&mut k, &saved), Next::Resume));
        assert_eq!(k.process_count, 2);
        assert_eq!(k.pcbs[parent].state.a1, SUCCESS);
        let child = k.pcbs.head(k.ready).expect("child is ready");
        assert_eq!(k.pcbs.parent_of(child), Some(parent));
        assert_eq!(k.pcbs[child].state.pc, 0x1234);
    }

    #[test]
    fn create_process_fails_cleanly_when_the_pool_is_dry() {
        let _guard = host::lock();
        let (mut k, parent) = kernel_with_current();
        while k.pcbs.alloc().is_some() {}
        let child_state = State::zeroed();
        let saved = sys_state(SYS_CREATE_PROCESS, &child_state as *const State as usize, 0, 0);

        assert!(matches!(handle_syscall(&mut k, &saved), Next::Resume));
        assert_eq!(k.process_count, 1);
        assert_eq!(k.pcbs[parent].state.a1, FAILURE);
    }

    #[test]
    fn terminate_reaps_the_whole_subtree() {
        let _guard = host::lock();
        let (mut k, root) = kernel_with_current();

        // two children: one ready, one blocked on an ordinary semaphore
        let ready_child = k.pcbs.alloc().unwrap();
        let blocked_child = k.pcbs.alloc().unwrap();
        k.process_count = 3;
        k.pcbs.insert_child(root, ready_child);
        k.pcbs.insert_child(root, blocked_child);
        enqueue_ready(&mut k, ready_child);
        let sem = Semaphore::new(-1);
        k.asl.insert_blocked(&mut k.pcbs, sem.addr(), blocked_child);

        assert!(matches!(
            handle_syscall(&mut k, &sys_state(SYS_TERMINATE_PROCESS, 0, 0, 0)),
            Next::Schedule
        ));
        assert_eq!(k.process_count, 0);
        assert!(k.current.is_none());
        assert!(k.ready.is_none());
        // the blocked child released the token it was holding
        assert_eq!(sem.value(), 0);
        // all the PCBs went home to the pool
        let mut reclaimed = 0;
        while k.pcbs.alloc().is_some() {
            reclaimed += 1;
        }
        assert_eq!(reclaimed, crate::pcb::MAX_PROC);
    }

    #[test]
    fn terminating_a_device_waiter_fixes_the_soft_block_count() {
        let _guard = host::lock();
        let (mut k, root) = kernel_with_current();
        let waiter = k.pcbs.alloc().unwrap();
        k.process_count = 2;
        k.pcbs.insert_child(root, waiter);

        let slot = 3;
        DEVICE_SEMS[slot].set(-1);
        k.asl.insert_blocked(&mut k.pcbs, device_sem_addr(slot), waiter);
        k.soft_block_count = 1;

        handle_syscall(&mut k, &sys_state(SYS_TERMINATE_PROCESS, 0, 0, 0));
        assert_eq!(k.soft_block_count, 0);
        assert_eq!(k.process_count, 0);
        // the device semaphore keeps its debt: hardware will still complete
        assert_eq!(DEVICE_SEMS[slot].value(), -1);
        DEVICE_SEMS[slot].set(0);
    }

    #[test]
    fn p_and_v_pair_up_fifo() {
        let _guard = host::lock();
        let sem = Semaphore::new(1);

        // P on a positive semaphore returns straight away
        let (mut k, first) = kernel_with_current();
        let saved_p = sys_state(SYS_PASSEREN, sem.addr(), 0, 0);
        assert!(matches!(handle_syscall(&mut k, &saved_p), Next::Resume));
        assert_eq!(sem.value(), 0);
        assert_eq!(k.current, Some(first));

        // a second P blocks the caller
        assert!(matches!(handle_syscall(&mut k, &saved_p), Next::Schedule));
        assert_eq!(sem.value(), -1);
        assert!(k.current.is_none());
        assert_eq!(k.pcbs[first].sem_addr, Some(sem.addr()));

        // V from another process releases the waiter onto the ready queue
        let second = k.pcbs.alloc().unwrap();
        k.process_count += 1;
        k.current = Some(second);
        let saved_v = sys_state(SYS_VERHOGEN, sem.addr(), 0, 0);
        assert!(matches!(handle_syscall(&mut k, &saved_v), Next::Resume));
        assert_eq!(sem.value(), 0);
        assert_eq!(k.pcbs.head(k.ready), Some(first));
        assert_eq!(k.pcbs[first].sem_addr, None);
    }

    #[test]
    fn second_vector_registration_kills_the_caller() {
        let _guard = host::lock();
        let (mut k, _p) = kernel_with_current();
        let saved = sys_state(SYS_SPECIFY_TRAP_VECTORS, TrapKind::Sys as usize, 0x9000, 0x9100);
        assert!(matches!(handle_syscall(&mut k, &saved), Next::Resume));

        assert!(matches!(handle_syscall(&mut k, &saved), Next::Schedule));
        assert_eq!(k.process_count, 0);
        assert!(k.current.is_none());
    }

    #[test]
    fn wait_for_clock_always_blocks_and_counts_softly() {
        let _guard = host::lock();
        DEVICE_SEMS[CLOCK_SEM].set(0);
        let (mut k, p) = kernel_with_current();

        assert!(matches!(
            handle_syscall(&mut k, &sys_state(SYS_WAIT_FOR_CLOCK, 0, 0, 0)),
            Next::Schedule
        ));
        assert_eq!(k.soft_block_count, 1);
        assert!(k.current.is_none());
        assert_eq!(k.pcbs[p].sem_addr, Some(device_sem_addr(CLOCK_SEM)));
        DEVICE_SEMS[CLOCK_SEM].set(0);
    }

    #[test]
    fn wait_for_io_returns_a_latched_status_without_blocking() {
        let _guard = host::lock();
        let slot = 10; // tape unit 2
        DEVICE_SEMS[slot].set(1);
        let (mut k, p) = kernel_with_current();
        k.dev_status[slot] = 0x2A01;

        let saved = sys_state(SYS_WAIT_FOR_IO, 4, 2, 0);
        assert!(matches!(handle_syscall(&mut k, &saved), Next::Resume));
        assert_eq!(k.pcbs[p].state.a1, 0x2A01);
        assert_eq!(k.soft_block_count, 0);
        DEVICE_SEMS[slot].set(0);
    }

    #[test]
    fn terminal_write_waits_use_the_second_semaphore_bank() {
        let _guard = host::lock();
        let slot = 32 + 8; // terminal 0, write side
        DEVICE_SEMS[slot].set(0);
        let (mut k, p) = kernel_with_current();

        let saved = sys_state(SYS_WAIT_FOR_IO, 7, 0, crate::devices::WRITE_TERM);
        assert!(matches!(handle_syscall(&mut k, &saved), Next::Schedule));
        assert_eq!(k.pcbs[p].sem_addr, Some(device_sem_addr(slot)));
        assert_eq!(k.soft_block_count, 1);
        DEVICE_SEMS[slot].set(0);
    }

    #[test]
    fn pass_up_copies_the_trap_states_both_ways() {
        let _guard = host::lock();
        let (mut k, p) = kernel_with_current();

        let mut old_buffer = State::zeroed();
        let mut new_state = State::zeroed();
        new_state.pc = 0xCAFE;
        k.pcbs[p].trap_areas[TrapKind::Prog as usize] = Some(TrapBinding {
            old: &mut old_buffer as *mut State as usize,
            new: &new_state as *const State as usize,
        });

        unsafe {
            (*machine::area(Area::ProgTrapOld)).pc = 0xBEEF;
        }
        assert!(matches!(pass_up_or_die(&mut k, TrapKind::Prog), Next::Resume));
        assert_eq!(old_buffer.pc, 0xBEEF);
        assert_eq!(k.pcbs[p].state.pc, 0xCAFE);
    }

    #[test]
    fn die_without_a_binding_clears_the_tree() {
        let _guard = host::lock();
        let (mut k, _p) = kernel_with_current();
        assert!(matches!(pass_up_or_die(&mut k, TrapKind::Tlb), Next::Schedule));
        assert_eq!(k.process_count, 0);
    }

    #[test]
    fn user_mode_kernel_syscall_is_rewritten_as_a_program_trap() {
        let _guard = host::lock();
        let (mut k, _p) = kernel_with_current();
        let mut saved = sys_state(SYS_CREATE_PROCESS, 0, 0, 0);
        saved.cpsr = crate::machine::MODE_USER;
        unsafe {
            (*machine::area(Area::SyscallOld)).pc = 0x4444;
        }

        // no program-trap binding installed: the offender dies
        assert!(matches!(handle_syscall(&mut k, &saved), Next::Schedule));
        assert_eq!(k.process_count, 0);
        let prog_old = unsafe { *machine::area(Area::ProgTrapOld) };
        assert_eq!(prog_old.pc, 0x4444);
        assert_eq!(prog_old.cp15_cause, CAUSE_RESERVED_INSTR);
    }
}
