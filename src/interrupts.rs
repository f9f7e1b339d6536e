//! The interrupt handler.
//!
//! One interrupt is serviced per entry, highest-priority line first: the
//! interval timer (line 2, carrying both quantum expiry and the pseudo
//! clock), then disk, tape, network, printer and terminal devices. Device
//! completions V the matching device semaphore, hand the status register
//! to the released waiter (or latch it for a late WaitForIO) and ACK the
//! device.

use crate::devices::{self, sem_index, ACK, DEV_PER_INT, DISK_INT, READY, TERM_INT};
use crate::machine::{self, Area};
use crate::scheduler::{
    self, begin_burst, charge_current, device_sem_addr, enqueue_ready, Kernel, Next, CLOCK_SEM,
    DEVICE_SEMS, INTERVAL_TIME, QUANTUM,
};
use crate::sync;
use bit_field::BitField;

/// Pending-line bit for interrupt line `n` in the top byte of the cause
/// register.
fn line_bit(line: usize) -> usize {
    1 << line
}

pub const LINE_TWO: usize = 1 << 2;

/// Instruction width: the interrupted instruction must run again.
const INTERRUPT_PC_STEP: usize = 4;

/// Interrupt entry, installed in the interrupt new area at boot.
pub extern "C" fn interrupt_entry() -> ! {
    let old = machine::area(Area::InterruptOld);
    let next = {
        let mut k = scheduler::KERNEL.lock();
        let saved = unsafe {
            (*old).pc = (*old).pc.wrapping_sub(INTERRUPT_PC_STEP);
            *old
        };
        // the interrupt may not be on the running process's behalf, but the
        // time it spent up to here still is
        if let Some(current) = k.current {
            charge_current(&mut k);
            k.pcbs[current].state = saved;
        }
        let pending = saved.cp15_cause.get_bits(24..32);
        dispatch_interrupt(&mut k, pending)
    };
    scheduler::finish(next)
}

fn dispatch_interrupt(k: &mut Kernel, pending: usize) -> Next {
    if pending & LINE_TWO != 0 {
        return timer_interrupt(k);
    }
    for line in DISK_INT..=TERM_INT {
        if pending & line_bit(line) != 0 {
            let unit = devices::pending_unit(line);
            if line == TERM_INT {
                return terminal_interrupt(k, unit);
            }
            return device_interrupt(k, line, unit);
        }
    }
    crate::log_error!("interrupts: no recognized line in cause bits {:#04x}", pending);
    machine::panic_halt()
}

/// Line 2: either the pseudo-clock tick or the end of the current quantum,
/// depending on what the scheduler armed.
fn timer_interrupt(k: &mut Kernel) -> Next {
    if k.int_timer_flag || k.time_left <= 0 {
        // pseudo-tick: everyone waiting on the clock wakes at once
        let addr = device_sem_addr(CLOCK_SEM);
        while let Some(p) = k.asl.remove_blocked(&mut k.pcbs, addr) {
            k.pcbs[p].sem_addr = None;
            k.soft_block_count -= 1;
            enqueue_ready(k, p);
        }
        DEVICE_SEMS[CLOCK_SEM].set(0);
        machine::set_timer(QUANTUM);
        k.time_left = INTERVAL_TIME;
        k.int_timer_flag = false;
        return_from_interrupt(k)
    } else {
        // quantum expiry: back of the line
        if let Some(current) = k.current.take() {
            enqueue_ready(k, current);
        }
        machine::set_timer(QUANTUM);
        Next::Schedule
    }
}

/// Lines 3-6: disk, tape, network and printer completions.
fn device_interrupt(k: &mut Kernel, line: usize, unit: usize) -> Next {
    let slot = sem_index(line, unit);
    let dev = devices::device(slot);
    let status = dev.status();

    release_waiter(k, slot, status);
    dev.write_command(ACK);
    return_from_interrupt(k)
}

/// Line 7: terminals carry two subdevices; a finished transmission (status
/// no longer READY) takes precedence over a received character.
fn terminal_interrupt(k: &mut Kernel, unit: usize) -> Next {
    let mut slot = sem_index(TERM_INT, unit);
    let term = devices::terminal(unit);

    let transmitted = term.transm_status() & 0x0F != READY;
    let status = if transmitted {
        slot += DEV_PER_INT;
        term.transm_status()
    } else {
        term.recv_status()
    };

    release_waiter(k, slot, status);
    if transmitted {
        term.write_transm_command(ACK);
    } else {
        term.write_recv_command(ACK);
    }
    return_from_interrupt(k)
}

/// V the device semaphore for `slot`. A released waiter gets the status in
/// its result register; with nobody waiting the status is latched for the
/// WaitForIO that has yet to arrive.
fn release_waiter(k: &mut Kernel, slot: usize, status: usize) {
    let addr = device_sem_addr(slot);
    let value = unsafe { sync::adjust(addr, 1) };
    if value <= 0 {
        match k.asl.remove_blocked(&mut k.pcbs, addr) {
            Some(p) => {
                k.pcbs[p].sem_addr = None;
                k.pcbs[p].state.a1 = status;
                k.soft_block_count -= 1;
                enqueue_ready(k, p);
            }
            None => k.dev_status[slot] = status,
        }
    } else {
        k.dev_status[slot] = status;
    }
}

fn return_from_interrupt(k: &mut Kernel) -> Next {
    if k.current.is_some() {
        begin_burst(k);
        Next::Resume
    } else {
        Next::Schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::host;
    use std::sync::atomic::Ordering;

    #[test]
    fn quantum_expiry_requeues_current_at_the_tail() {
        let _guard = host::lock();
        let mut k = Kernel::new();
        let running = k.pcbs.alloc().unwrap();
        let waiting = k.pcbs.alloc().unwrap();
        k.process_count = 2;
        k.current = Some(running);
        enqueue_ready(&mut k, waiting);
        k.time_left = INTERVAL_TIME;
        k.int_timer_flag = false;

        assert!(matches!(timer_interrupt(&mut k), Next::Schedule));
        assert!(k.current.is_none());
        assert_eq!(k.pcbs.head(k.ready), Some(waiting));
        assert_eq!(k.ready, Some(running));
        assert_eq!(host::TIMER.load(Ordering::SeqCst), QUANTUM);
    }

    #[test]
    fn pseudo_tick_drains_every_clock_waiter_and_keeps_current() {
        let _guard = host::lock();
        DEVICE_SEMS[CLOCK_SEM].set(0);
        let mut k = Kernel::new();
        let running = k.pcbs.alloc().unwrap();
        let sleeper_a = k.pcbs.alloc().unwrap();
        let sleeper_b = k.pcbs.alloc().unwrap();
        k.process_count = 3;
        k.current = Some(running);

        let addr = device_sem_addr(CLOCK_SEM);
        DEVICE_SEMS[CLOCK_SEM].set(-2);
        k.asl.insert_blocked(&mut k.pcbs, addr, sleeper_a);
        k.asl.insert_blocked(&mut k.pcbs, addr, sleeper_b);
        k.soft_block_count = 2;
        k.int_timer_flag = true;

        assert!(matches!(timer_interrupt(&mut k), Next::Resume));
        assert_eq!(k.current, Some(running));
        assert_eq!(k.soft_block_count, 0);
        assert_eq!(DEVICE_SEMS[CLOCK_SEM].value(), 0);
        assert_eq!(k.time_left, INTERVAL_TIME);
        assert!(!k.int_timer_flag);
        let mut ready = k.ready;
        assert_eq!(k.pcbs.remove(&mut ready), Some(sleeper_a));
        assert_eq!(k.pcbs.remove(&mut ready), Some(sleeper_b));
        DEVICE_SEMS[CLOCK_SEM].set(0);
    }

    #[test]
    fn device_completion_wakes_the_waiter_with_its_status() {
        let _guard = host::lock();
        let slot = 1; // disk 1
        DEVICE_SEMS[slot].set(0);
        devices::test_support::reset_block(slot);
        let mut k = Kernel::new();
        let waiter = k.pcbs.alloc().unwrap();
        k.process_count = 1;

        DEVICE_SEMS[slot].set(-1);
        k.asl.insert_blocked(&mut k.pcbs, device_sem_addr(slot), waiter);
        k.soft_block_count = 1;

        devices::device(slot).status.write(READY as u32);
        assert!(matches!(device_interrupt(&mut k, DISK_INT, 1), Next::Schedule));
        assert_eq!(k.pcbs[waiter].state.a1, READY);
        assert_eq!(k.soft_block_count, 0);
        assert_eq!(k.pcbs.head(k.ready), Some(waiter));
        assert_eq!(devices::device(slot).command.read(), ACK as u32);
        DEVICE_SEMS[slot].set(0);
    }

    #[test]
    fn unclaimed_completion_is_latched_for_a_late_wait() {
        let _guard = host::lock();
        let slot = 2;
        DEVICE_SEMS[slot].set(0);
        devices::test_support::reset_block(slot);
        let mut k = Kernel::new();

        devices::device(slot).status.write(0x55);
        assert!(matches!(device_interrupt(&mut k, DISK_INT, 2), Next::Schedule));
        assert_eq!(k.dev_status[slot], 0x55);
        assert_eq!(DEVICE_SEMS[slot].value(), 1);
        DEVICE_SEMS[slot].set(0);
    }

    #[test]
    fn terminal_transmit_completion_uses_the_write_bank() {
        let _guard = host::lock();
        let read_slot = sem_index(TERM_INT, 0);
        let write_slot = read_slot + DEV_PER_INT;
        DEVICE_SEMS[write_slot].set(0);
        devices::test_support::reset_block(read_slot);
        let mut k = Kernel::new();
        let writer = k.pcbs.alloc().unwrap();
        k.process_count = 1;

        DEVICE_SEMS[write_slot].set(-1);
        k.asl
            .insert_blocked(&mut k.pcbs, device_sem_addr(write_slot), writer);
        k.soft_block_count = 1;

        let term = devices::terminal(0);
        term.recv_status.write(READY as u32);
        term.transm_status
            .write((crate::devices::TRANSMIT_CHAR as u32) | (b'x' as u32) << 8);

        assert!(matches!(terminal_interrupt(&mut k, 0), Next::Schedule));
        assert_eq!(
            k.pcbs[writer].state.a1 & 0xFF,
            crate::devices::TRANSMIT_CHAR
        );
        assert_eq!(term.transm_command.read(), ACK as u32);
        assert_eq!(term.recv_command.read(), 0);
        DEVICE_SEMS[write_slot].set(0);
    }
}
