//! The uARM machine contract: the saved processor state, the low-memory
//! trap-vector areas, the bus registers and the ROM primitives.
//!
//! Everything the rest of the kernel knows about the simulated hardware
//! funnels through here. On the target the primitives are the ROM support
//! routines and the fixed bus addresses; under `cfg(test)` the module is a
//! host-side double (an atomic TOD counter, a recorded timer, an emulated
//! vector area and `panic!`-ing control sinks) so the nucleus logic can be
//! unit-tested. Register-sized values travel as `usize`, which is the
//! machine word on the target.

use bit_field::BitField;

pub const PAGE_SIZE: usize = 4096;
pub const WORD_LEN: usize = 4;

/* current program status (cpsr) bit patterns */
pub const ALL_OFF: usize = 0;
pub const IRQ_DISABLED: usize = 0x80;
pub const FIQ_DISABLED: usize = 0x40;
pub const INT_ENABLE_MASK: usize = 0xFFFF_FF3F;
pub const INT_DISABLE_BITS: usize = 0x0000_00C0;

pub const MODE_MASK: usize = 0x1F;
pub const MODE_USER: usize = 0x10;
pub const MODE_SYSTEM: usize = 0x1F;

/* system control (cp15) bit patterns */
pub const VM_ON: usize = 0x1;

/* cause register */
pub const CAUSE_MASK: usize = 0xFF;
pub const CAUSE_TLB_LOAD: usize = 14;
pub const CAUSE_TLB_STORE: usize = 15;
pub const CAUSE_RESERVED_INSTR: usize = 20;

/* entryHI fields */
pub const ASID_SHIFT: u32 = 6;

/// One saved processor state: the 22 words the machine stores/loads on a
/// trap, in hardware order.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct State {
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub v1: usize,
    pub v2: usize,
    pub v3: usize,
    pub v4: usize,
    pub v5: usize,
    pub v6: usize,
    pub sl: usize,
    pub fp: usize,
    pub ip: usize,
    pub sp: usize,
    pub lr: usize,
    pub pc: usize,
    pub cpsr: usize,
    pub cp15_control: usize,
    pub cp15_entry_hi: usize,
    pub cp15_cause: usize,
    pub tod_hi: usize,
    pub tod_lo: usize,
}

impl State {
    pub const fn zeroed() -> State {
        State {
            a1: 0,
            a2: 0,
            a3: 0,
            a4: 0,
            v1: 0,
            v2: 0,
            v3: 0,
            v4: 0,
            v5: 0,
            v6: 0,
            sl: 0,
            fp: 0,
            ip: 0,
            sp: 0,
            lr: 0,
            pc: 0,
            cpsr: 0,
            cp15_control: 0,
            cp15_entry_hi: 0,
            cp15_cause: 0,
            tod_hi: 0,
            tod_lo: 0,
        }
    }
}

/// The four (old, new) state pairs the machine exchanges states through.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Area {
    InterruptOld = 0,
    InterruptNew = 1,
    TlbOld = 2,
    TlbNew = 3,
    ProgTrapOld = 4,
    ProgTrapNew = 5,
    SyscallOld = 6,
    SyscallNew = 7,
}

/// The three pass-up trap classes, in the order SYS5 numbers them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TrapKind {
    Tlb = 0,
    Prog = 1,
    Sys = 2,
}

pub const TRAP_TYPES: usize = 3;

impl TrapKind {
    pub fn from_code(code: usize) -> Option<TrapKind> {
        match code {
            0 => Some(TrapKind::Tlb),
            1 => Some(TrapKind::Prog),
            2 => Some(TrapKind::Sys),
            _ => None,
        }
    }

    pub fn old_area(self) -> Area {
        match self {
            TrapKind::Tlb => Area::TlbOld,
            TrapKind::Prog => Area::ProgTrapOld,
            TrapKind::Sys => Area::SyscallOld,
        }
    }
}

/// ASID field of an entryHI value.
pub fn asid_of(entry_hi: usize) -> usize {
    entry_hi.get_bits(6..12)
}

/// ASID of the faulting/running address space, from the live entryHI.
pub fn current_asid() -> usize {
    asid_of(entry_hi())
}

/// Mask or unmask IRQ/FIQ in the live processor status.
pub fn set_int_enabled(on: bool) {
    let status = status();
    if on {
        set_status(status & INT_ENABLE_MASK);
    } else {
        set_status(status | INT_DISABLE_BITS);
    }
}

pub fn old_area_of(kind: TrapKind) -> *mut State {
    area(kind.old_area())
}

#[cfg(not(test))]
mod bios {
    use super::{Area, State};
    use volatile::Volatile;

    /* low-memory addresses of the (old, new) state areas */
    const INTERRUPT_OLD_ADDR: usize = 0x7000;
    const INTERRUPT_NEW_ADDR: usize = 0x7058;
    const TLB_OLD_ADDR: usize = 0x70B0;
    const TLB_NEW_ADDR: usize = 0x7108;
    const PROG_TRAP_OLD_ADDR: usize = 0x7160;
    const PROG_TRAP_NEW_ADDR: usize = 0x71B8;
    const SYSCALL_OLD_ADDR: usize = 0x7210;
    const SYSCALL_NEW_ADDR: usize = 0x7268;

    /* bus register area */
    const BUS_REG_AREA_ADDR: usize = 0x2D0;
    pub const INT_BITMAP_ADDR: usize = 0x6FE0;

    #[repr(C)]
    #[allow(dead_code)] // layout carries fields the kernel never reads
    struct BusRegArea {
        rambase: Volatile<u32>,
        ramtop: Volatile<u32>,
        devregbase: Volatile<u32>,
        todhi: Volatile<u32>,
        todlo: Volatile<u32>,
        intervaltimer: Volatile<u32>,
        timescale: Volatile<u32>,
    }

    fn bus() -> &'static BusRegArea {
        unsafe { &*(BUS_REG_AREA_ADDR as *const BusRegArea) }
    }

    extern "C" {
        fn LDST(state: *const State) -> !;
        fn STST(state: *mut State);
        fn HALT() -> !;
        fn PANIC() -> !;
        fn WAIT();
        fn setTIMER(value: i32);
        fn getSTATUS() -> u32;
        fn setSTATUS(value: u32);
        fn getEntryHi() -> u32;
        fn TLBCLR();
        fn SYSCALL(number: u32, a2: u32, a3: u32, a4: u32) -> u32;
    }

    pub fn area(a: Area) -> *mut State {
        let addr = match a {
            Area::InterruptOld => INTERRUPT_OLD_ADDR,
            Area::InterruptNew => INTERRUPT_NEW_ADDR,
            Area::TlbOld => TLB_OLD_ADDR,
            Area::TlbNew => TLB_NEW_ADDR,
            Area::ProgTrapOld => PROG_TRAP_OLD_ADDR,
            Area::ProgTrapNew => PROG_TRAP_NEW_ADDR,
            Area::SyscallOld => SYSCALL_OLD_ADDR,
            Area::SyscallNew => SYSCALL_NEW_ADDR,
        };
        addr as *mut State
    }

    pub fn ram_top() -> usize {
        bus().ramtop.read() as usize
    }

    pub fn dev_reg_base() -> usize {
        bus().devregbase.read() as usize
    }

    /// Current time of day in microseconds.
    pub fn stck() -> i64 {
        (bus().todlo.read() / bus().timescale.read()) as i64
    }

    pub fn load_state(state: *const State) -> ! {
        unsafe { LDST(state) }
    }

    pub fn store_state(state: &mut State) {
        unsafe { STST(state) }
    }

    pub fn halt() -> ! {
        unsafe { HALT() }
    }

    pub fn panic_halt() -> ! {
        unsafe { PANIC() }
    }

    pub fn wait_for_interrupt() {
        unsafe { WAIT() }
    }

    pub fn set_timer(value: i64) {
        unsafe { setTIMER(value as i32) }
    }

    pub fn status() -> usize {
        unsafe { getSTATUS() as usize }
    }

    pub fn set_status(value: usize) {
        unsafe { setSTATUS(value as u32) }
    }

    pub fn entry_hi() -> usize {
        unsafe { getEntryHi() as usize }
    }

    pub fn tlb_clear() {
        unsafe { TLBCLR() }
    }

    pub fn syscall(number: usize, a2: usize, a3: usize, a4: usize) -> usize {
        unsafe { SYSCALL(number as u32, a2 as u32, a3 as u32, a4 as u32) as usize }
    }
}

#[cfg(test)]
mod bios {
    //! Host-side double of the machine. Control sinks panic with a
    //! recognizable message; clocks and registers are plain statics that
    //! tests read back through `machine::host`.
    use super::{Area, State};
    use crate::sync::KCell;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    pub static TOD: AtomicI64 = AtomicI64::new(0);
    pub static TIMER: AtomicI64 = AtomicI64::new(0);
    pub static STATUS: AtomicUsize = AtomicUsize::new(0);
    pub static ENTRY_HI: AtomicUsize = AtomicUsize::new(0);
    pub static AREAS: KCell<[State; 8]> = KCell::new([State::zeroed(); 8]);
    pub static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    pub fn area(a: Area) -> *mut State {
        unsafe { (*AREAS.get()).as_mut_ptr().add(a as usize) }
    }

    pub fn ram_top() -> usize {
        0x0100_0000
    }

    pub fn dev_reg_base() -> usize {
        unreachable!("device registers are reached through devices::device on the host")
    }

    pub fn stck() -> i64 {
        // monotonic: every reading costs one microsecond
        TOD.fetch_add(1, Ordering::SeqCst)
    }

    pub fn load_state(_state: *const State) -> ! {
        panic!("machine: LDST")
    }

    pub fn store_state(state: &mut State) {
        *state = State::zeroed();
    }

    pub fn halt() -> ! {
        panic!("machine: HALT")
    }

    pub fn panic_halt() -> ! {
        panic!("machine: PANIC")
    }

    pub fn wait_for_interrupt() {
        panic!("machine: WAIT")
    }

    pub fn set_timer(value: i64) {
        TIMER.store(value, Ordering::SeqCst);
    }

    pub fn status() -> usize {
        STATUS.load(Ordering::SeqCst)
    }

    pub fn set_status(value: usize) {
        STATUS.store(value, Ordering::SeqCst);
    }

    pub fn entry_hi() -> usize {
        ENTRY_HI.load(Ordering::SeqCst)
    }

    pub fn tlb_clear() {}

    pub fn syscall(_number: usize, _a2: usize, _a3: usize, _a4: usize) -> usize {
        panic!("machine: SYSCALL issued on the host")
    }
}

pub use bios::{
    area, dev_reg_base, entry_hi, halt, load_state, panic_halt, ram_top, set_status, set_timer,
    status, stck, store_state, syscall, tlb_clear, wait_for_interrupt,
};

#[cfg(not(test))]
pub use bios::INT_BITMAP_ADDR;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asid_lives_in_bits_6_to_11() {
        assert_eq!(asid_of(1 << ASID_SHIFT), 1);
        assert_eq!(asid_of(0x8000_0000 | (3 << ASID_SHIFT)), 3);
        assert_eq!(asid_of(0xFFFF_F03F), 0);
    }

    #[test]
    fn int_masking_round_trips_through_the_status_word() {
        let _guard = host::lock();
        set_status(ALL_OFF | MODE_SYSTEM);
        set_int_enabled(false);
        assert_eq!(status() & INT_DISABLE_BITS, INT_DISABLE_BITS);
        set_int_enabled(true);
        assert_eq!(status() & INT_DISABLE_BITS, 0);
        assert_eq!(status() & MODE_MASK, MODE_SYSTEM);
    }
}
