//! The scheduler and the nucleus globals.
//!
//! Every kernel entry point (syscall, trap, interrupt) locks `KERNEL`,
//! mutates it, drops the lock and then either reloads the current process
//! or falls into `schedule`. `schedule` is the one place that tail-calls
//! the machine's load-state primitive; nothing below it ever returns.

use crate::asl::Asl;
use crate::machine::{self, State};
use crate::pcb::{PcbPool, Pid};
use crate::sync::Semaphore;
use lazy_static::lazy_static;
use spin::Mutex;

/// Wall-clock budget for one process burst, in microseconds.
pub const QUANTUM: i64 = 5000;
/// Pseudo-clock period, in microseconds.
pub const INTERVAL_TIME: i64 = 100_000;

/// Device semaphores: 5 lines x 8 units, a second bank of 8 for terminal
/// writes, and the pseudo-clock in the last slot.
pub const MAX_SEMA: usize = 49;
pub const CLOCK_SEM: usize = 48;

pub struct Kernel {
    pub pcbs: PcbPool,
    pub asl: Asl,
    /// Tail of the ready queue.
    pub ready: Option<Pid>,
    pub current: Option<Pid>,
    pub process_count: i32,
    /// Processes blocked on a device or pseudo-clock semaphore.
    pub soft_block_count: i32,
    /// TOD at which the current burst started.
    pub start_tod: i64,
    /// Time remaining until the next pseudo-clock tick.
    pub time_left: i64,
    /// The armed interval timer ends in a pseudo-tick, not a quantum.
    pub int_timer_flag: bool,
    /// Latched status words for completions that beat their WaitForIO.
    pub dev_status: [usize; MAX_SEMA],
}

impl Kernel {
    pub fn new() -> Kernel {
        Kernel {
            pcbs: PcbPool::new(),
            asl: Asl::new(),
            ready: None,
            current: None,
            process_count: 0,
            soft_block_count: 0,
            start_tod: 0,
            time_left: INTERVAL_TIME,
            int_timer_flag: false,
            dev_status: [0; MAX_SEMA],
        }
    }
}

impl Default for Kernel {
    fn default() -> Kernel {
        Kernel::new()
    }
}

lazy_static! {
    pub static ref KERNEL: Mutex<Kernel> = Mutex::new(Kernel::new());
}

const SEM_ZERO: Semaphore = Semaphore::new(0);

/// The device semaphore array. It lives outside the kernel lock so its
/// cells have stable addresses comparable against user-supplied semaphore
/// words: "blocked on a device" is an address-range test.
pub static DEVICE_SEMS: [Semaphore; MAX_SEMA] = [SEM_ZERO; MAX_SEMA];

pub fn device_sem_addr(index: usize) -> usize {
    DEVICE_SEMS[index].addr()
}

pub fn is_device_sem(addr: usize) -> bool {
    addr >= DEVICE_SEMS[0].addr() && addr <= DEVICE_SEMS[MAX_SEMA - 1].addr()
}

/// How a kernel entry point leaves: reload the current process, or give
/// the CPU away.
pub enum Next {
    Resume,
    Schedule,
}

/// What the scheduler decided to do with the CPU.
pub enum Decision {
    Run(*const State),
    Halt,
    Deadlock,
    Wait,
}

/// Close the current burst: bill the elapsed time to the running process
/// and count it against the pseudo-clock.
pub fn charge_current(k: &mut Kernel) {
    let stop = machine::stck();
    let elapsed = stop - k.start_tod;
    if let Some(current) = k.current {
        k.pcbs[current].cpu_time += elapsed;
    }
    k.time_left -= elapsed;
}

/// Open a new burst for the current process.
pub fn begin_burst(k: &mut Kernel) {
    k.start_tod = machine::stck();
}

pub fn enqueue_ready(k: &mut Kernel, p: Pid) {
    let mut ready = k.ready;
    k.pcbs.insert(&mut ready, p);
    k.ready = ready;
}

/// Pick the next job. With a ready PCB this arms the interval timer with
/// whichever deadline comes first (quantum end or pseudo-tick) and makes
/// the PCB current; with an empty ready queue it decides between halting,
/// deadlock and waiting for I/O.
pub fn next_job(k: &mut Kernel) -> Decision {
    let mut ready = k.ready;
    let job = k.pcbs.remove(&mut ready);
    k.ready = ready;

    match job {
        Some(p) => {
            k.current = Some(p);
            begin_burst(k);
            if k.time_left < 0 {
                k.time_left = 0;
            }
            if k.time_left < QUANTUM {
                // the pseudo-tick lands before this quantum would end
                machine::set_timer(k.time_left);
                k.int_timer_flag = true;
            } else {
                machine::set_timer(QUANTUM);
            }
            Decision::Run(&k.pcbs[p].state as *const State)
        }
        None => {
            k.current = None;
            if k.process_count == 0 {
                Decision::Halt
            } else if k.soft_block_count == 0 {
                Decision::Deadlock
            } else {
                machine::set_timer(k.time_left);
                k.int_timer_flag = true;
                Decision::Wait
            }
        }
    }
}

/// Give the CPU to the next ready process, or halt/panic/wait when there
/// is none. Never returns.
pub fn schedule() -> ! {
    let decision = {
        let mut k = KERNEL.lock();
        next_job(&mut k)
    };
    match decision {
        Decision::Run(state) => machine::load_state(state),
        Decision::Halt => machine::halt(),
        Decision::Deadlock => {
            crate::log_error!("scheduler: processes remain but nothing is ready or blocked");
            machine::panic_halt()
        }
        Decision::Wait => {
            machine::set_int_enabled(true);
            loop {
                machine::wait_for_interrupt();
            }
        }
    }
}

/// Apply a handler's exit decision. Never returns.
pub fn finish(next: Next) -> ! {
    match next {
        Next::Schedule => schedule(),
        Next::Resume => {
            let state = {
                let k = KERNEL.lock();
                let current = k.current.expect("resume with no current process");
                &k.pcbs[current].state as *const State
            };
            machine::load_state(state)
        }
    }
}
