#![cfg_attr(not(test), no_std)]

pub mod klog;
pub mod machine;
pub mod devices;
pub mod sync;
pub mod pcb;
pub mod asl;
pub mod scheduler;
pub mod syscalls;
pub mod interrupts;
pub mod vm;

#[cfg(not(test))]
use machine::{Area, PAGE_SIZE};

/// Kernel entry point: the boot sequence. The simulator hands control here
/// with interrupts masked; we wire the trap vectors, bring up the Phase 1
/// structures, seed the first process and dispatch it.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn main() -> ! {
    machine::set_status(
        machine::ALL_OFF | machine::IRQ_DISABLED | machine::FIQ_DISABLED | machine::MODE_SYSTEM,
    );

    klog::init();
    log_info!("JAEOS kernel booting.");

    let ram_top = machine::ram_top();

    // Each handler runs to completion on a fresh kernel stack at the top
    // of RAM, interrupts masked, system mode.
    install_vector(Area::SyscallNew, syscalls::syscall_entry as usize, ram_top);
    install_vector(Area::ProgTrapNew, syscalls::prog_trap_entry as usize, ram_top);
    install_vector(Area::TlbNew, syscalls::tlb_trap_entry as usize, ram_top);
    install_vector(
        Area::InterruptNew,
        interrupts::interrupt_entry as usize,
        ram_top,
    );

    {
        let mut k = scheduler::KERNEL.lock();

        let start = k.pcbs.alloc().expect("fresh PCB pool cannot be empty");
        machine::store_state(&mut k.pcbs[start].state);
        k.pcbs[start].state.pc = vm::init::init_proc as usize;
        k.pcbs[start].state.sp = ram_top - 2 * PAGE_SIZE;
        k.pcbs[start].state.cpsr = machine::ALL_OFF | machine::MODE_SYSTEM;

        k.time_left = scheduler::INTERVAL_TIME;
        k.int_timer_flag = false;
        machine::set_timer(scheduler::QUANTUM);

        k.process_count += 1;
        scheduler::enqueue_ready(&mut k, start);
    }

    log_info!("JAEOS nucleus up, dispatching the init process.");
    scheduler::schedule()
}

#[cfg(not(test))]
fn install_vector(area: Area, handler: usize, ram_top: usize) {
    let state = machine::area(area);
    unsafe {
        machine::store_state(&mut *state);
        (*state).pc = handler;
        (*state).sp = ram_top;
        (*state).cpsr = machine::ALL_OFF
            | machine::IRQ_DISABLED
            | machine::FIQ_DISABLED
            | machine::MODE_SYSTEM;
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log_error!("{}", info);
    machine::panic_halt()
}
