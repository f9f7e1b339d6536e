//! Typed access to the simulated device register area.
//!
//! Every device register read/write in the kernel funnels through this
//! module: `device` / `terminal` hand out references to volatile register
//! blocks keyed by flat device index, and the slot arithmetic shared by
//! WaitForIO, the interrupt handler and the VM layer lives here. Register
//! contents are 32-bit words; command/status values travel as `usize` like
//! every other register-sized value in the kernel.

use volatile::Volatile;

/* interrupt lines */
pub const DISK_INT: usize = 3;
pub const TAPE_INT: usize = 4;
pub const NET_INT: usize = 5;
pub const PRINTER_INT: usize = 6;
pub const TERM_INT: usize = 7;

pub const DEV_PER_INT: usize = 8;
pub const DEV_REG_SIZE: usize = 16;
pub const DEV_REG_LEN: usize = 4;

/* device COMMAND codes */
pub const RESET: usize = 0;
pub const ACK: usize = 1;
pub const PRINT_CHAR: usize = 2;
pub const TRANS_CHAR: usize = 2;
pub const RECV_CHAR: usize = 2;
pub const DISK_SEEK: usize = 2;
pub const READ_BLK: usize = 3;
pub const WRITE_BLK: usize = 4;

/* device STATUS codes */
pub const UNINSTALLED: usize = 0;
pub const READY: usize = 1;
pub const BUSY: usize = 3;
pub const TRANSMIT_CHAR: usize = 5;
pub const RECEIVE_CHAR: usize = 5;

/* tape block markers */
pub const EOT: usize = 0;
pub const EOF_MARK: usize = 1;
pub const EOB: usize = 2;
pub const TS: usize = 3;

/* command field shifts */
pub const CHAR_SHIFT: u32 = 8;
pub const SEEK_SHIFT: u32 = 8;
pub const SECTOR_SHIFT: u32 = 8;
pub const HEAD_SHIFT: u32 = 16;

/* well-known flat device indices */
pub const BACKING_STORE: usize = 0;
pub const PRINT0_DEV: usize = 24;
pub const TERM0_DEV: usize = 32;
pub const TERM_READ_SEM: usize = 32;
pub const TERM_WRITE_SEM: usize = 40;

/* WaitForIO terminal direction argument */
pub const READ_TERM: usize = 1;
pub const WRITE_TERM: usize = 0;

/// One 16-byte device register block.
#[repr(C)]
pub struct DeviceRegs {
    pub status: Volatile<u32>,
    pub command: Volatile<u32>,
    pub data0: Volatile<u32>,
    pub data1: Volatile<u32>,
}

impl DeviceRegs {
    pub fn status(&self) -> usize {
        self.status.read() as usize
    }

    pub fn write_command(&mut self, value: usize) {
        self.command.write(value as u32);
    }

    pub fn write_data0(&mut self, value: usize) {
        self.data0.write(value as u32);
    }

    pub fn data1(&self) -> usize {
        self.data1.read() as usize
    }
}

/// Terminal view of the same block: the four words split into a receiver
/// and a transmitter subdevice.
#[repr(C)]
pub struct TerminalRegs {
    pub recv_status: Volatile<u32>,
    pub recv_command: Volatile<u32>,
    pub transm_status: Volatile<u32>,
    pub transm_command: Volatile<u32>,
}

impl TerminalRegs {
    pub fn recv_status(&self) -> usize {
        self.recv_status.read() as usize
    }

    pub fn transm_status(&self) -> usize {
        self.transm_status.read() as usize
    }

    pub fn write_recv_command(&mut self, value: usize) {
        self.recv_command.write(value as u32);
    }

    pub fn write_transm_command(&mut self, value: usize) {
        self.transm_command.write(value as u32);
    }
}

/// Flat device/semaphore index for (line, unit).
pub fn sem_index(line: usize, unit: usize) -> usize {
    (line - DISK_INT) * DEV_PER_INT + unit
}

#[cfg(not(test))]
pub fn device(index: usize) -> &'static mut DeviceRegs {
    let addr = crate::machine::dev_reg_base() + index * DEV_REG_SIZE;
    unsafe { &mut *(addr as *mut DeviceRegs) }
}

#[cfg(not(test))]
pub fn terminal(unit: usize) -> &'static mut TerminalRegs {
    let index = sem_index(TERM_INT, unit);
    let addr = crate::machine::dev_reg_base() + index * DEV_REG_SIZE;
    unsafe { &mut *(addr as *mut TerminalRegs) }
}

/// Lowest-numbered unit raising an interrupt on `line`.
///
/// A line with its cause bit set but an empty bitmap word is a hardware
/// protocol violation the kernel cannot recover from.
#[cfg(not(test))]
pub fn pending_unit(line: usize) -> usize {
    let addr = crate::machine::INT_BITMAP_ADDR + (line - DISK_INT) * DEV_REG_LEN;
    let map = unsafe { (addr as *const u32).read_volatile() };
    let unit = map.trailing_zeros() as usize;
    if unit >= DEV_PER_INT {
        crate::log_error!("devices: line {} interrupt with empty bitmap", line);
        crate::machine::panic_halt();
    }
    unit
}


#[cfg(test)]
pub fn device(index: usize) -> &'static mut DeviceRegs {
    unsafe { &mut *((*host::BLOCKS.get()).as_mut_ptr().add(index) as *mut DeviceRegs) }
}

#[cfg(test)]
pub fn terminal(unit: usize) -> &'static mut TerminalRegs {
    let index = sem_index(TERM_INT, unit);
    unsafe { &mut *((*host::BLOCKS.get()).as_mut_ptr().add(index) as *mut TerminalRegs) }
}

#[cfg(test)]
pub fn pending_unit(line: usize) -> usize {
    let map = unsafe { (*host::BITMAPS.get())[line - DISK_INT] };
    let unit = map.trailing_zeros() as usize;
    if unit >= DEV_PER_INT {
        crate::machine::panic_halt();
    }
    unit
}

/// Test-only control over the device double.
#[cfg(test)]
pub mod test_support {
    use super::host;

    pub fn set_bitmap(line: usize, map: u32) {
        unsafe { (*host::BITMAPS.get())[line - super::DISK_INT] = map };
    }

    pub fn reset_block(index: usize) {
        unsafe { (*host::BLOCKS.get())[index] = [0; 4] };
    }
}
