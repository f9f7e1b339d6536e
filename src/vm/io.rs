//! User-level syscalls 9-18 and the device plumbing behind them.
//!
//! Every user process installs a syscall binding pointing at
//! `vm_syscall_handler`, so these run in the calling process's context
//! with VM on and reach the nucleus again through SYSCALL. Device command
//! sequences ("set the command registers, then WaitForIO") execute with
//! interrupts masked up to the syscall so the completion interrupt cannot
//! slip in between.

use super::{vm, KUSEG2_ADDR, TAPE_BUFF_TOP, TIME_SCALE};
use crate::devices::{
    self, CHAR_SHIFT, DISK_INT, DISK_SEEK, HEAD_SHIFT, PRINT0_DEV, PRINTER_INT, PRINT_CHAR,
    READ_BLK, READY, READ_TERM, RECEIVE_CHAR, RECV_CHAR, SECTOR_SHIFT, SEEK_SHIFT, TERM_INT,
    TERM_READ_SEM, TERM_WRITE_SEM, TRANSMIT_CHAR, TRANS_CHAR, WRITE_BLK, WRITE_TERM,
};
use crate::machine::{self, State, TrapKind, PAGE_SIZE, WORD_LEN};
use crate::syscalls::{SYS_PASSEREN, SYS_TERMINATE_PROCESS, SYS_VERHOGEN, SYS_WAIT_FOR_IO};

pub const SYS_READ_TERMINAL: usize = 9;
pub const SYS_WRITE_TERMINAL: usize = 10;
pub const SYS_VSEM_VIRT: usize = 11;
pub const SYS_PSEM_VIRT: usize = 12;
pub const SYS_DELAY: usize = 13;
pub const SYS_DISK_PUT: usize = 14;
pub const SYS_DISK_GET: usize = 15;
pub const SYS_WRITE_PRINTER: usize = 16;
pub const SYS_GET_TOD: usize = 17;
pub const SYS_VM_TERMINATE: usize = 18;

/// Line-feed terminates a terminal read.
const LINE_FEED: usize = 0x0A;

/// VM-level syscall dispatcher.
pub extern "C" fn vm_syscall_handler() -> ! {
    let asid = machine::current_asid();
    let globals = vm();
    let old: *mut State =
        unsafe { &mut (*globals).uprocs[asid - 1].old_trap[TrapKind::Sys as usize] as *mut State };
    let saved = unsafe { *old };

    match saved.a1 {
        SYS_READ_TERMINAL => read_terminal(saved.a2, asid, old),
        SYS_WRITE_TERMINAL => write_terminal(saved.a2, saved.a3, asid),
        SYS_VSEM_VIRT => vsem_virt(saved.a2, asid),
        SYS_PSEM_VIRT => psem_virt(saved.a2, asid),
        SYS_DELAY => delay(saved.a2 as i64, asid),
        SYS_DISK_PUT => disk_io(saved.a2, saved.a3, saved.a4, WRITE_BLK, asid, old),
        SYS_DISK_GET => disk_io(saved.a2, saved.a3, saved.a4, READ_BLK, asid, old),
        SYS_WRITE_PRINTER => write_printer(saved.a2, saved.a3, asid),
        SYS_GET_TOD => unsafe {
            (*old).a1 = machine::stck() as usize;
        },
        SYS_VM_TERMINATE => virtual_death(asid as i32),
        _ => virtual_death(asid as i32),
    }

    machine::load_state(old)
}

pub(super) fn p(addr: usize) {
    machine::syscall(SYS_PASSEREN, addr, 0, 0);
}

pub(super) fn v(addr: usize) {
    machine::syscall(SYS_VERHOGEN, addr, 0, 0);
}

pub(super) fn mutex_addr(slot: usize) -> usize {
    unsafe { (*vm()).mutex_sems[slot].addr() }
}

fn uproc_sem_addr(asid: usize) -> usize {
    unsafe { (*vm()).uprocs[asid - 1].sem.addr() }
}

/// SYS9: pull characters from the caller's terminal into `addr` until a
/// line feed arrives; the line feed itself is neither stored nor counted.
/// The count lands in the caller's result register.
fn read_terminal(addr: usize, asid: usize, old: *mut State) {
    let term = devices::terminal(asid - 1);
    let mutex = mutex_addr(TERM_READ_SEM + asid - 1);
    p(mutex);

    let mut count: usize = 0;
    let mut cursor = addr;
    loop {
        machine::set_int_enabled(false);
        term.write_recv_command(RECV_CHAR);
        let status = machine::syscall(SYS_WAIT_FOR_IO, TERM_INT, asid - 1, READ_TERM);
        machine::set_int_enabled(true);

        if status & 0xFF != RECEIVE_CHAR {
            crate::log_error!("io: terminal {} receive returned {:#x}", asid - 1, status);
            machine::panic_halt();
        }
        let ch = (status >> CHAR_SHIFT) & 0xFF;
        if ch == LINE_FEED {
            break;
        }
        unsafe {
            (cursor as *mut u8).write_volatile(ch as u8);
        }
        cursor += 1;
        count += 1;
    }

    unsafe {
        (*old).a1 = count;
    }
    v(mutex);
}

/// SYS10: push `len` characters from `addr` out through the caller's
/// terminal transmitter.
fn write_terminal(addr: usize, len: usize, asid: usize) {
    let term = devices::terminal(asid - 1);
    let mutex = mutex_addr(TERM_WRITE_SEM + asid - 1);
    p(mutex);

    for i in 0..len {
        let ch = unsafe { ((addr + i) as *const u8).read_volatile() };

        machine::set_int_enabled(false);
        term.write_transm_command(TRANS_CHAR | (ch as usize) << CHAR_SHIFT);
        let status = machine::syscall(SYS_WAIT_FOR_IO, TERM_INT, asid - 1, WRITE_TERM);
        machine::set_int_enabled(true);

        if status & 0xFF != TRANSMIT_CHAR {
            crate::log_error!("io: terminal {} transmit returned {:#x}", asid - 1, status);
            machine::panic_halt();
        }
    }

    v(mutex);
}

/// SYS11: V a virtual semaphore; a released waiter gets its private
/// semaphore V'd through the nucleus. An owed wakeup with no recorded
/// waiter is unrecoverable for the caller.
fn vsem_virt(vsem_addr: usize, asid: usize) {
    let globals = vm();
    let value = unsafe { crate::sync::adjust(vsem_addr, 1) };
    if value <= 0 {
        machine::set_int_enabled(false);
        let released = unsafe { (*globals).avsl.v_remove_blocked(vsem_addr) };
        machine::set_int_enabled(true);
        match released {
            Some(peer) => v(uproc_sem_addr(peer as usize)),
            None => virtual_death(asid as i32),
        }
    }
}

/// SYS12: P a virtual semaphore; going negative records the caller on the
/// AVSL and parks it on its private semaphore.
fn psem_virt(vsem_addr: usize, asid: usize) {
    let globals = vm();
    let value = unsafe { crate::sync::adjust(vsem_addr, -1) };
    if value < 0 {
        machine::set_int_enabled(false);
        let inserted = unsafe { (*globals).avsl.v_insert_blocked(vsem_addr, asid as i32) };
        machine::set_int_enabled(true);
        if !inserted {
            virtual_death(asid as i32);
        }
        p(uproc_sem_addr(asid));
    }
}

/// SYS13: sleep for `seconds`. The caller parks on its private semaphore;
/// the delay daemon V's it once the wake time passes.
fn delay(seconds: i64, asid: usize) {
    let globals = vm();
    let wake_time = machine::stck() + seconds * TIME_SCALE;

    machine::set_int_enabled(false);
    let queued = unsafe {
        (*globals)
            .avsl
            .v_insert_blocked(uproc_sem_addr(asid), asid as i32)
            && (*globals).adl.insert_delay(wake_time, asid as i32)
    };
    machine::set_int_enabled(true);

    if !queued {
        virtual_death(asid as i32);
    }
    p(uproc_sem_addr(asid));
}

/// Decompose a 1-D sector number into (head, sector, cylinder).
pub fn disk_coords(sect_no: usize) -> (usize, usize, usize) {
    let head = sect_no % 2;
    let sector = (sect_no / 2) % 8;
    let cylinder = sect_no / 16;
    (head, sector, cylinder)
}

/// SYS14/15: move one page between the caller's address space and a
/// general disk, staged through the per-disk kernel buffer. Disk 0 and
/// addresses below kuseg2 are off limits.
fn disk_io(addr: usize, disk_no: usize, sect_no: usize, command: usize, asid: usize, old: *mut State) {
    if disk_no as i32 <= 0 || addr < KUSEG2_ADDR {
        virtual_death(asid as i32);
    }
    if command != WRITE_BLK && command != READ_BLK {
        machine::panic_halt();
    }

    let (head, sector, cylinder) = disk_coords(sect_no);
    let buffer = TAPE_BUFF_TOP + disk_no * PAGE_SIZE;
    let disk = devices::device(disk_no);
    let mutex = mutex_addr(disk_no);
    p(mutex);

    if command == WRITE_BLK {
        copy_page(addr, buffer);
    }

    machine::set_int_enabled(false);
    disk.write_command((cylinder << SEEK_SHIFT) | DISK_SEEK);
    let mut status = machine::syscall(SYS_WAIT_FOR_IO, DISK_INT, disk_no, 0);
    machine::set_int_enabled(true);

    if status & 0xFF == READY {
        machine::set_int_enabled(false);
        disk.write_data0(buffer);
        disk.write_command((head << HEAD_SHIFT) | (sector << SECTOR_SHIFT) | command);
        status = machine::syscall(SYS_WAIT_FOR_IO, DISK_INT, disk_no, 0);
        machine::set_int_enabled(true);
    }

    if command == READ_BLK {
        copy_page(buffer, addr);
    }

    unsafe {
        (*old).a1 = status;
    }
    v(mutex);
}

/// SYS16: push `len` characters from `addr` through the caller's printer.
fn write_printer(addr: usize, len: usize, asid: usize) {
    let printer = devices::device(PRINT0_DEV + asid - 1);
    let mutex = mutex_addr(PRINT0_DEV + asid - 1);
    p(mutex);

    for i in 0..len {
        let ch = unsafe { ((addr + i) as *const u8).read_volatile() };

        machine::set_int_enabled(false);
        printer.write_data0(ch as usize);
        printer.write_command(PRINT_CHAR);
        let status = machine::syscall(SYS_WAIT_FOR_IO, PRINTER_INT, asid - 1, 0);
        machine::set_int_enabled(true);

        if status & 0xFF != READY {
            crate::log_error!("io: printer {} returned {:#x}", asid - 1, status);
            machine::panic_halt();
        }
    }

    v(mutex);
}

/// Move one page between the backing store and a physical frame:
/// cylinder = page number, sector = ASID - 1, head 0. Seek first, then
/// transfer, each as its own atomic command + WaitForIO pair.
pub fn read_write_backing(page_no: usize, asid: usize, command: usize, frame_addr: usize) {
    if command != WRITE_BLK && command != READ_BLK {
        machine::panic_halt();
    }

    let disk = devices::device(devices::BACKING_STORE);
    let mutex = mutex_addr(devices::BACKING_STORE);
    p(mutex);

    machine::set_int_enabled(false);
    disk.write_command((page_no << SEEK_SHIFT) | DISK_SEEK);
    let status = machine::syscall(SYS_WAIT_FOR_IO, DISK_INT, 0, 0);
    machine::set_int_enabled(true);

    if status & 0xFF == READY {
        machine::set_int_enabled(false);
        disk.write_data0(frame_addr);
        disk.write_command(((asid - 1) << SECTOR_SHIFT) | command);
        machine::syscall(SYS_WAIT_FOR_IO, DISK_INT, 0, 0);
        machine::set_int_enabled(true);
    }

    v(mutex);
}

/// Graceful end of a user process: scrub its swap-pool frames, flush the
/// TLB, signal the init-process rendezvous and terminate the subtree.
pub fn virtual_death(asid: i32) -> ! {
    let globals = vm();
    let swap_sem = unsafe { (*globals).swap_sem.addr() };

    p(swap_sem);
    machine::set_int_enabled(false);
    let modified = unsafe { (*globals).swap_pool.release_asid(asid) };
    if modified {
        machine::tlb_clear();
    }
    machine::set_int_enabled(true);
    v(swap_sem);

    v(unsafe { (*globals).master_sem.addr() });
    machine::syscall(SYS_TERMINATE_PROCESS, 0, 0, 0);
    unreachable!("terminated process resumed")
}

/// Copy one page, word by word.
pub fn copy_page(source: usize, target: usize) {
    let words = PAGE_SIZE / WORD_LEN;
    let mut src = source as *const u32;
    let mut dst = target as *mut u32;
    for _ in 0..words {
        unsafe {
            dst.write_volatile(src.read_volatile());
            src = src.add(1);
            dst = dst.add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_numbers_decompose_into_disk_geometry() {
        assert_eq!(disk_coords(0), (0, 0, 0));
        assert_eq!(disk_coords(1), (1, 0, 0));
        assert_eq!(disk_coords(2), (0, 1, 0));
        assert_eq!(disk_coords(15), (1, 7, 0));
        assert_eq!(disk_coords(16), (0, 0, 1));
        assert_eq!(disk_coords(35), (1, 1, 2));
    }

    #[test]
    fn disk_buffers_sit_in_the_disk_buffer_band() {
        use crate::vm::{DISK_BUFF_TOP, TAPE_BUFF_TOP};
        let buffer = TAPE_BUFF_TOP + 1 * PAGE_SIZE;
        assert!(buffer >= TAPE_BUFF_TOP && buffer < DISK_BUFF_TOP);
    }

    #[test]
    fn pages_round_trip_through_copy_page() {
        let src: Vec<u32> = (0..(PAGE_SIZE / WORD_LEN) as u32).collect();
        let mut dst = vec![0u32; PAGE_SIZE / WORD_LEN];
        copy_page(src.as_ptr() as usize, dst.as_mut_ptr() as usize);
        assert_eq!(src, dst);
    }
}
