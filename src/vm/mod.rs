//! Virtual-memory support: page tables, the segment table, the swap pool
//! and the globals shared by the Phase 3 handlers.
//!
//! Everything here belongs to the VM support layer, which runs as ordinary
//! (kernel-mode) processes above the nucleus. Mutual exclusion follows the
//! Phase 3 discipline rather than a lock type: the swap-pool semaphore for
//! swap/page-table state, per-device mutex semaphores for buffers, and
//! interrupt masking around AVSL/ADL edits and TLB/page-table updates.

pub mod adl;
pub mod avsl;
pub mod fault;
pub mod init;
pub mod io;

use crate::machine::{State, PAGE_SIZE, TRAP_TYPES};
use crate::scheduler::MAX_SEMA;
use crate::sync::{KCell, Semaphore};
use adl::Adl;
use avsl::Avsl;
use bitflags::bitflags;

pub const MAX_USER_PROC: usize = 1;
pub const SWAP_SIZE: usize = 2 * MAX_USER_PROC;

pub const KUSEG_PTE_SIZE: usize = 32;
pub const KSEGOS_PTE_SIZE: usize = 64;

pub const PTE_MAGIC: u32 = 0x2A;
pub const MAGIC_SHIFT: u32 = 24;
pub const ENTRYHI_SHIFT: u32 = 12;

/* segment layout */
pub const SEG_TBL_START: usize = 0x7600;
pub const SEG_TBL_WIDTH: usize = 12;
pub const KUSEG2_ADDR: usize = 0x8000_0000;
pub const KUSEG3_ADDR: usize = 0xC000_0000;
pub const KUSEG3_SEG: usize = 3;

/* physical layout above the ROM-reserved pages */
pub const ROM_PAGE_START: usize = 0x2000_0000;
pub const OS_CODE_TOP: usize = ROM_PAGE_START + 32 * PAGE_SIZE;
pub const TAPE_BUFF_TOP: usize = OS_CODE_TOP + 8 * PAGE_SIZE;
pub const DISK_BUFF_TOP: usize = TAPE_BUFF_TOP + 8 * PAGE_SIZE;
pub const EXEC_TOP: usize = DISK_BUFF_TOP + (2 * MAX_USER_PROC) * PAGE_SIZE;
pub const UPROC_STACK_SIZE: usize = 2 * PAGE_SIZE;

/// Entry point of a loaded user image inside kuseg2.
pub const UPROC_ENTRY: usize = 0x8000_00B0;

/// Microseconds per Delay unit (one second).
pub const TIME_SCALE: i64 = 1_000_000;

bitflags! {
    /// Frame-side page table entry bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EntryLo: u32 {
        const GLOBAL = 1 << 8;
        const VALID = 1 << 9;
        const DIRTY = 1 << 10;
    }
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct PteEntry {
    pub hi: u32,
    pub lo: u32,
}

impl PteEntry {
    pub const fn zeroed() -> PteEntry {
        PteEntry { hi: 0, lo: 0 }
    }
}

/// Header word stamped on every page table: magic byte plus entry count.
pub fn table_header(entries: usize) -> u32 {
    (PTE_MAGIC << MAGIC_SHIFT) | entries as u32
}

/// A user-segment page table (kuseg2 or kuseg3).
#[repr(C)]
pub struct PageTable {
    pub header: u32,
    pub entries: [PteEntry; KUSEG_PTE_SIZE],
}

impl PageTable {
    pub const fn zeroed() -> PageTable {
        PageTable {
            header: 0,
            entries: [PteEntry::zeroed(); KUSEG_PTE_SIZE],
        }
    }
}

/// The kernel-segment page table shared by every address space.
#[repr(C)]
pub struct OsPageTable {
    pub header: u32,
    pub entries: [PteEntry; KSEGOS_PTE_SIZE],
}

impl OsPageTable {
    pub const fn zeroed() -> OsPageTable {
        OsPageTable {
            header: 0,
            entries: [PteEntry::zeroed(); KSEGOS_PTE_SIZE],
        }
    }
}

/// One ROM-defined segment table row: the three page tables of an address
/// space.
#[repr(C)]
pub struct SegTableRow {
    pub kseg_os: u32,
    pub kuseg2: u32,
    pub kuseg3: u32,
}

pub fn seg_table_row(asid: usize) -> *mut SegTableRow {
    (SEG_TBL_START + asid * SEG_TBL_WIDTH) as *mut SegTableRow
}

/// One swap-pool frame descriptor.
#[derive(Clone, Copy)]
pub struct SwapEntry {
    /// Occupying address space, -1 when free.
    pub asid: i32,
    pub seg_no: usize,
    pub page_no: usize,
    /// Address of the page table entry currently mapping this frame.
    pub pte: usize,
}

impl SwapEntry {
    const FREE: SwapEntry = SwapEntry {
        asid: -1,
        seg_no: 0,
        page_no: 0,
        pte: 0,
    };
}

/// The swap pool: which (ASID, page) occupies each physical frame, plus
/// the round-robin victim cursor.
pub struct SwapPool {
    entries: [SwapEntry; SWAP_SIZE],
    next_frame: usize,
}

impl SwapPool {
    pub const fn new() -> SwapPool {
        SwapPool {
            entries: [SwapEntry::FREE; SWAP_SIZE],
            next_frame: 0,
        }
    }

    /// Round-robin victim selection.
    pub fn choose_frame(&mut self) -> usize {
        self.next_frame = (self.next_frame + 1) % SWAP_SIZE;
        self.next_frame
    }

    pub fn entry(&self, frame: usize) -> &SwapEntry {
        &self.entries[frame]
    }

    /// Record that `frame` now holds (`asid`, `seg_no`, `page_no`) mapped
    /// through the PTE at `pte`.
    pub fn occupy(&mut self, frame: usize, asid: i32, seg_no: usize, page_no: usize, pte: usize) {
        self.entries[frame] = SwapEntry {
            asid,
            seg_no,
            page_no,
            pte,
        };
    }

    /// Invalidate every frame the given address space occupies by clearing
    /// the V bit through the back-pointer. Returns true if any mapping
    /// changed; the caller then flushes the TLB.
    ///
    /// # Safety
    /// The recorded PTE back-pointers must still reference live page table
    /// entries.
    pub unsafe fn release_asid(&mut self, asid: i32) -> bool {
        let mut modified = false;
        for entry in self.entries.iter_mut() {
            if entry.asid == asid {
                let pte = entry.pte as *mut PteEntry;
                (*pte).lo &= !EntryLo::VALID.bits();
                entry.asid = -1;
                modified = true;
            }
        }
        modified
    }
}

/// Per-user-process VM bookkeeping: the private synchronization semaphore,
/// the kuseg2 page table and the three (old, new) trap-state buffers.
pub struct UProc {
    pub sem: Semaphore,
    pub pte: PageTable,
    pub new_trap: [State; TRAP_TYPES],
    pub old_trap: [State; TRAP_TYPES],
}

impl UProc {
    const fn new() -> UProc {
        UProc {
            sem: Semaphore::new(0),
            pte: PageTable::zeroed(),
            new_trap: [State::zeroed(); TRAP_TYPES],
            old_trap: [State::zeroed(); TRAP_TYPES],
        }
    }
}

/// The Phase 3 globals.
pub struct VmGlobals {
    pub kseg_os: OsPageTable,
    pub kuseg3: PageTable,
    pub swap_pool: SwapPool,
    pub swap_sem: Semaphore,
    /// Mutual-exclusion semaphores, one per device slot.
    pub mutex_sems: [Semaphore; MAX_SEMA],
    /// Init-process rendezvous: each user process V's this on its way out.
    pub master_sem: Semaphore,
    pub uprocs: [UProc; MAX_USER_PROC],
    pub avsl: Avsl,
    pub adl: Adl,
}

const MUTEX_ONE: Semaphore = Semaphore::new(1);
const UPROC_NEW: UProc = UProc::new();

impl VmGlobals {
    const fn new() -> VmGlobals {
        VmGlobals {
            kseg_os: OsPageTable::zeroed(),
            kuseg3: PageTable::zeroed(),
            swap_pool: SwapPool::new(),
            swap_sem: Semaphore::new(1),
            mutex_sems: [MUTEX_ONE; MAX_SEMA],
            master_sem: Semaphore::new(0),
            uprocs: [UPROC_NEW; MAX_USER_PROC],
            avsl: Avsl::new(),
            adl: Adl::new(),
        }
    }
}

static VM: KCell<VmGlobals> = KCell::new(VmGlobals::new());

/// The VM-support globals. Access follows the Phase 3 mutual-exclusion
/// discipline described at module level.
pub fn vm() -> *mut VmGlobals {
    VM.get()
}

/// Base of the swap-pool frame band, just below the kernel stacks.
pub fn swap_pool_start() -> usize {
    crate::machine::ram_top() - 2 * PAGE_SIZE - SWAP_SIZE * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn victim_selection_cycles_round_robin() {
        let mut pool = SwapPool::new();
        let first = pool.choose_frame();
        let mut frame = first;
        for _ in 0..SWAP_SIZE {
            frame = pool.choose_frame();
        }
        assert_eq!(frame, first);
        assert!(first < SWAP_SIZE);
    }

    #[test]
    fn release_asid_clears_the_valid_bit_through_the_back_pointer() {
        let mut pool = SwapPool::new();
        let mut table = PageTable::zeroed();
        table.entries[4].lo = 0x1000 | (EntryLo::VALID | EntryLo::DIRTY).bits();
        let pte = &mut table.entries[4] as *mut PteEntry as usize;
        pool.occupy(0, 3, 2, 4, pte);

        assert!(unsafe { pool.release_asid(3) });
        assert_eq!(pool.entry(0).asid, -1);
        assert_eq!(table.entries[4].lo & EntryLo::VALID.bits(), 0);
        assert_ne!(table.entries[4].lo & EntryLo::DIRTY.bits(), 0);

        // nothing left to release
        assert!(!unsafe { pool.release_asid(3) });
    }

    #[test]
    fn header_carries_the_magic_byte_and_size() {
        assert_eq!(table_header(KUSEG_PTE_SIZE), 0x2A00_0020);
        assert_eq!(table_header(KSEGOS_PTE_SIZE) >> MAGIC_SHIFT, PTE_MAGIC);
    }
}
