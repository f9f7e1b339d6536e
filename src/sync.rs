use core::cell::UnsafeCell;

/// A counting-semaphore cell identified by its memory address.
///
/// P/V in the nucleus operates on raw integer addresses so that device
/// semaphores, the VM-layer mutexes and user-supplied words all take the
/// same path; the ASL keys its descriptors on the same addresses. A
/// `Semaphore` is just a stable `i32` cell that hands its address out.
#[repr(transparent)]
pub struct Semaphore(UnsafeCell<i32>);

// Single CPU; cells are only touched from kernel entry points (interrupts
// masked) or under the VM-layer mutex protocol.
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(value: i32) -> Semaphore {
        Semaphore(UnsafeCell::new(value))
    }

    pub fn addr(&self) -> usize {
        self.0.get() as usize
    }

    pub fn value(&self) -> i32 {
        unsafe { self.0.get().read_volatile() }
    }

    pub fn set(&self, value: i32) {
        unsafe { self.0.get().write_volatile(value) }
    }
}

/// Add `delta` to the semaphore cell at `addr` and return the new value.
///
/// # Safety
/// `addr` must be a valid, aligned `i32` cell that stays alive for the
/// duration of the call.
pub unsafe fn adjust(addr: usize, delta: i32) -> i32 {
    let cell = addr as *mut i32;
    let value = cell.read_volatile().wrapping_add(delta);
    cell.write_volatile(value);
    value
}

/// Interior-mutable cell for single-CPU kernel globals that are guarded by
/// the semaphore protocol or by interrupt masking instead of a lock type.
pub struct KCell<T>(UnsafeCell<T>);

unsafe impl<T> Sync for KCell<T> {}

impl<T> KCell<T> {
    pub const fn new(value: T) -> KCell<T> {
        KCell(UnsafeCell::new(value))
    }

    pub fn get(&self) -> *mut T {
        self.0.get()
    }
}
