//! Process control blocks.
//!
//! The PCB pool is a fixed arena of `MAX_PROC` slots with embedded index
//! links. Free PCBs live on a queue of their own; active PCBs sit on the
//! ready queue, on a semaphore's wait queue or in the `current` slot, never
//! more than one at a time. Queues are circular and doubly linked with an
//! external tail handle, so `insert` is O(1) and the head is `tail.next`.
//! Every PCB can also hang in a process tree through parent/child/sibling
//! links.

use crate::machine::{State, TRAP_TYPES};
use core::ops::{Index, IndexMut};

pub const MAX_PROC: usize = 20;

/// Index of a PCB slot in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Pid(u16);

impl Pid {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// One installed (old, new) exception-state pair, recorded as addresses in
/// the owning process's address space.
#[derive(Clone, Copy, Debug)]
pub struct TrapBinding {
    pub old: usize,
    pub new: usize,
}

#[derive(Clone, Copy)]
pub struct Pcb {
    next: Option<Pid>,
    prev: Option<Pid>,
    parent: Option<Pid>,
    child: Option<Pid>,
    next_sib: Option<Pid>,
    prev_sib: Option<Pid>,
    /// Saved processor state, reloaded when the process is dispatched.
    pub state: State,
    /// Accumulated CPU time in microseconds.
    pub cpu_time: i64,
    /// Address of the semaphore this PCB is blocked on, if any.
    pub sem_addr: Option<usize>,
    /// Pass-up bindings for the TLB / program-trap / syscall classes.
    pub trap_areas: [Option<TrapBinding>; TRAP_TYPES],
}

impl Pcb {
    const EMPTY: Pcb = Pcb {
        next: None,
        prev: None,
        parent: None,
        child: None,
        next_sib: None,
        prev_sib: None,
        state: State::zeroed(),
        cpu_time: 0,
        sem_addr: None,
        trap_areas: [None; TRAP_TYPES],
    };

    /// Reset every link and accounting field; the saved state is left for
    /// the next owner to overwrite.
    fn wash(&mut self) {
        self.next = None;
        self.prev = None;
        self.parent = None;
        self.child = None;
        self.next_sib = None;
        self.prev_sib = None;
        self.cpu_time = 0;
        self.sem_addr = None;
        self.trap_areas = [None; TRAP_TYPES];
    }
}

pub struct PcbPool {
    slots: [Pcb; MAX_PROC],
    /// Tail of the free queue.
    free: Option<Pid>,
}

impl PcbPool {
    pub fn new() -> PcbPool {
        let mut pool = PcbPool {
            slots: [Pcb::EMPTY; MAX_PROC],
            free: None,
        };
        for i in 0..MAX_PROC {
            pool.free(Pid(i as u16));
        }
        pool
    }

    /// Take a washed PCB off the free queue, or `None` if all are in use.
    pub fn alloc(&mut self) -> Option<Pid> {
        let mut free = self.free;
        let p = self.remove(&mut free);
        self.free = free;
        if let Some(p) = p {
            self.slots[p.idx()].wash();
        }
        p
    }

    /// Return a PCB to the free queue.
    pub fn free(&mut self, p: Pid) {
        self.slots[p.idx()].wash();
        let mut free = self.free;
        self.insert(&mut free, p);
        self.free = free;
    }

    // ── process queues ───────────────────────────────────────

    /// Insert `p` at the tail of the queue.
    pub fn insert(&mut self, tail: &mut Option<Pid>, p: Pid) {
        match *tail {
            None => {
                self.slots[p.idx()].next = Some(p);
                self.slots[p.idx()].prev = Some(p);
            }
            Some(t) => {
                let head = self.slots[t.idx()].next.expect("corrupt process queue");
                self.slots[p.idx()].next = Some(head);
                self.slots[head.idx()].prev = Some(p);
                self.slots[t.idx()].next = Some(p);
                self.slots[p.idx()].prev = Some(t);
            }
        }
        *tail = Some(p);
    }

    /// Peek at the head without removing it.
    pub fn head(&self, tail: Option<Pid>) -> Option<Pid> {
        tail.and_then(|t| self.slots[t.idx()].next)
    }

    /// Pop the head of the queue.
    pub fn remove(&mut self, tail: &mut Option<Pid>) -> Option<Pid> {
        let t = (*tail)?;
        let head = self.slots[t.idx()].next.expect("corrupt process queue");
        self.unlink(tail, head)
    }

    /// Remove a specific PCB from the queue, wherever it sits. Returns
    /// `None` if `p` is not on this queue.
    pub fn unlink(&mut self, tail: &mut Option<Pid>, p: Pid) -> Option<Pid> {
        let t = (*tail)?;
        if p == t {
            if self.slots[t.idx()].next != Some(t) {
                let prev = self.slots[t.idx()].prev.expect("corrupt process queue");
                let next = self.slots[t.idx()].next.expect("corrupt process queue");
                self.slots[prev.idx()].next = Some(next);
                self.slots[next.idx()].prev = Some(prev);
                *tail = Some(prev);
            } else {
                *tail = None;
            }
            self.slots[p.idx()].next = None;
            self.slots[p.idx()].prev = None;
            return Some(p);
        }

        let mut cursor = self.slots[t.idx()].next.expect("corrupt process queue");
        while cursor != t {
            if cursor == p {
                let prev = self.slots[cursor.idx()].prev.expect("corrupt process queue");
                let next = self.slots[cursor.idx()].next.expect("corrupt process queue");
                self.slots[prev.idx()].next = Some(next);
                self.slots[next.idx()].prev = Some(prev);
                self.slots[cursor.idx()].next = None;
                self.slots[cursor.idx()].prev = None;
                return Some(cursor);
            }
            cursor = self.slots[cursor.idx()].next.expect("corrupt process queue");
        }
        None
    }

    // ── process trees ────────────────────────────────────────

    pub fn has_children(&self, p: Pid) -> bool {
        self.slots[p.idx()].child.is_some()
    }

    /// Make `p` the newest child of `parent`. The child handle always
    /// points at the newest sibling.
    pub fn insert_child(&mut self, parent: Pid, p: Pid) {
        match self.slots[parent.idx()].child {
            None => self.slots[p.idx()].prev_sib = None,
            Some(newest) => {
                self.slots[newest.idx()].next_sib = Some(p);
                self.slots[p.idx()].prev_sib = Some(newest);
            }
        }
        self.slots[p.idx()].next_sib = None;
        self.slots[parent.idx()].child = Some(p);
        self.slots[p.idx()].parent = Some(parent);
    }

    /// Detach and return the newest child of `parent`.
    pub fn remove_child(&mut self, parent: Pid) -> Option<Pid> {
        let newest = self.slots[parent.idx()].child?;
        match self.slots[newest.idx()].prev_sib {
            None => {
                self.slots[newest.idx()].parent = None;
                self.slots[parent.idx()].child = None;
            }
            Some(older) => {
                self.slots[parent.idx()].child = Some(older);
                self.slots[older.idx()].next_sib = None;
                self.slots[newest.idx()].prev_sib = None;
                self.slots[newest.idx()].parent = None;
            }
        }
        Some(newest)
    }

    /// Detach `p` from its parent and siblings, wherever it sits in the
    /// sibling chain. Returns `None` if `p` has no parent.
    pub fn detach(&mut self, p: Pid) -> Option<Pid> {
        let parent = self.slots[p.idx()].parent?;
        if self.slots[parent.idx()].child == Some(p) {
            return self.remove_child(parent);
        }
        let next = self.slots[p.idx()].next_sib.expect("corrupt sibling chain");
        match self.slots[p.idx()].prev_sib {
            None => self.slots[next.idx()].prev_sib = None,
            Some(prev) => {
                self.slots[next.idx()].prev_sib = Some(prev);
                self.slots[prev.idx()].next_sib = Some(next);
                self.slots[p.idx()].prev_sib = None;
            }
        }
        self.slots[p.idx()].next_sib = None;
        self.slots[p.idx()].parent = None;
        Some(p)
    }

    pub fn parent_of(&self, p: Pid) -> Option<Pid> {
        self.slots[p.idx()].parent
    }
}

impl Index<Pid> for PcbPool {
    type Output = Pcb;

    fn index(&self, p: Pid) -> &Pcb {
        &self.slots[p.idx()]
    }
}

impl IndexMut<Pid> for PcbPool {
    fn index_mut(&mut self, p: Pid) -> &mut Pcb {
        &mut self.slots[p.idx()]
    }
}
