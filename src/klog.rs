use lazy_static::lazy_static;
use spin::Mutex;

/// Size of the in-RAM diagnostic ring.
const LOG_SIZE: usize = 4096;

/// Kernel log sink. The simulated machine has no out-of-band console and
/// routing diagnostics through a managed device would disturb the device
/// semaphores, so log lines accumulate in a fixed ring that the simulator
/// (or a debugger) can dump straight from RAM.
pub struct LogRing {
    buf: [u8; LOG_SIZE],
    head: usize,
    len: usize,
}

impl LogRing {
    const fn new() -> LogRing {
        LogRing {
            buf: [0; LOG_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.head] = byte;
        self.head = (self.head + 1) % LOG_SIZE;
        if self.len < LOG_SIZE {
            self.len += 1;
        }
    }

    /// Copy the ring out in write order. Used by tests and by post-mortem
    /// RAM dumps.
    pub fn extract(&self, out: &mut [u8]) -> usize {
        let count = self.len.min(out.len());
        let start = (self.head + LOG_SIZE - self.len) % LOG_SIZE;
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = self.buf[(start + i) % LOG_SIZE];
        }
        count
    }
}

impl core::fmt::Write for LogRing {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.push(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref KLOG: Mutex<LogRing> = Mutex::new(LogRing::new());
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    KLOG.lock().write_fmt(args).expect("Writing to the kernel log failed");
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::klog::_print(format_args!("[INFO] "));
        $crate::klog::_print(format_args!($($arg)*));
        $crate::klog::_print(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::klog::_print(format_args!("[WARN] "));
        $crate::klog::_print(format_args!($($arg)*));
        $crate::klog::_print(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::klog::_print(format_args!("[ERROR] "));
        $crate::klog::_print(format_args!($($arg)*));
        $crate::klog::_print(format_args!("\n"));
    };
}

pub fn init() {
    let _ = KLOG.lock();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    #[test]
    fn ring_keeps_the_newest_bytes() {
        let mut ring = LogRing::new();
        for _ in 0..3 {
            ring.write_str("0123456789abcdef").unwrap();
        }
        let mut out = [0u8; LOG_SIZE];
        let n = ring.extract(&mut out);
        assert_eq!(n, 48);
        assert!(core::str::from_utf8(&out[..n]).unwrap().ends_with("abcdef"));

        // overflow the ring and make sure only the tail survives
        for _ in 0..LOG_SIZE {
            ring.write_str("x").unwrap();
        }
        ring.write_str("tail").unwrap();
        let n = ring.extract(&mut out);
        assert_eq!(n, LOG_SIZE);
        assert!(core::str::from_utf8(&out[..n]).unwrap().ends_with("tail"));
    }
}
