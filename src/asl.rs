//! The Active Semaphore List.
//!
//! A semaphore descriptor exists exactly while some PCB waits on its
//! address. Descriptors come from a fixed arena of `MAX_PROC + 1` slots
//! (one is permanently the dummy list head with address 0) and the active
//! list is singly linked, sorted by ascending semaphore address, with no
//! duplicate addresses. Each descriptor owns a FIFO queue of waiting PCBs.

use crate::pcb::{PcbPool, Pid, MAX_PROC};

const MAX_SEMD: usize = MAX_PROC + 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct SemIdx(u16);

impl SemIdx {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy)]
struct Semd {
    next: Option<SemIdx>,
    addr: usize,
    /// Tail of this descriptor's wait queue.
    queue: Option<Pid>,
}

impl Semd {
    const EMPTY: Semd = Semd {
        next: None,
        addr: 0,
        queue: None,
    };
}

pub struct Asl {
    table: [Semd; MAX_SEMD],
    /// Head of the free-descriptor stack.
    free: Option<SemIdx>,
    /// The dummy descriptor fronting the sorted active list.
    head: SemIdx,
}

impl Asl {
    pub fn new() -> Asl {
        let mut asl = Asl {
            table: [Semd::EMPTY; MAX_SEMD],
            free: None,
            head: SemIdx(0),
        };
        for i in 0..MAX_SEMD {
            asl.release(SemIdx(i as u16));
        }
        let dummy = asl.take().expect("fresh descriptor pool cannot be empty");
        asl.table[dummy.idx()].addr = 0;
        asl.table[dummy.idx()].next = None;
        asl.head = dummy;
        asl
    }

    fn release(&mut self, s: SemIdx) {
        self.table[s.idx()].next = self.free;
        self.free = Some(s);
    }

    fn take(&mut self) -> Option<SemIdx> {
        let s = self.free?;
        self.free = self.table[s.idx()].next;
        self.table[s.idx()] = Semd::EMPTY;
        Some(s)
    }

    /// Descriptor whose successor is either the one for `addr` or the
    /// first with a greater address.
    fn prev_of(&self, addr: usize) -> SemIdx {
        let mut cursor = self.head;
        while let Some(next) = self.table[cursor.idx()].next {
            if self.table[next.idx()].addr >= addr {
                break;
            }
            cursor = next;
        }
        cursor
    }

    /// Block `p` on the semaphore at `addr`, creating the descriptor in
    /// sorted position if it is not active yet. Returns false if the
    /// descriptor pool is exhausted.
    pub fn insert_blocked(&mut self, pcbs: &mut PcbPool, addr: usize, p: Pid) -> bool {
        let prev = self.prev_of(addr);
        let next = self.table[prev.idx()].next;
        let descriptor = match next {
            Some(d) if self.table[d.idx()].addr == addr => d,
            _ => {
                let Some(d) = self.take() else {
                    return false;
                };
                self.table[d.idx()].addr = addr;
                self.table[d.idx()].queue = None;
                self.table[d.idx()].next = next;
                self.table[prev.idx()].next = Some(d);
                d
            }
        };
        pcbs[p].sem_addr = Some(addr);
        let mut queue = self.table[descriptor.idx()].queue;
        pcbs.insert(&mut queue, p);
        self.table[descriptor.idx()].queue = queue;
        true
    }

    /// Pop the head waiter of `addr`; an emptied descriptor goes back to
    /// the free pool.
    pub fn remove_blocked(&mut self, pcbs: &mut PcbPool, addr: usize) -> Option<Pid> {
        let prev = self.prev_of(addr);
        let d = self.table[prev.idx()].next?;
        if self.table[d.idx()].addr != addr {
            return None;
        }
        let mut queue = self.table[d.idx()].queue;
        let p = pcbs.remove(&mut queue);
        self.table[d.idx()].queue = queue;
        if queue.is_none() {
            self.table[prev.idx()].next = self.table[d.idx()].next;
            self.release(d);
        }
        p
    }

    /// Remove a specific PCB from whatever wait queue it is on, collapsing
    /// an emptied descriptor the same way `remove_blocked` does.
    pub fn out_blocked(&mut self, pcbs: &mut PcbPool, p: Pid) -> Option<Pid> {
        let addr = pcbs[p].sem_addr?;
        let prev = self.prev_of(addr);
        let d = self.table[prev.idx()].next?;
        if self.table[d.idx()].addr != addr {
            return None;
        }
        let mut queue = self.table[d.idx()].queue;
        let removed = pcbs.unlink(&mut queue, p);
        self.table[d.idx()].queue = queue;
        removed?;
        if queue.is_none() {
            self.table[prev.idx()].next = self.table[d.idx()].next;
            self.release(d);
        }
        removed
    }

    /// Peek at the head waiter of `addr`.
    pub fn head_blocked(&self, pcbs: &PcbPool, addr: usize) -> Option<Pid> {
        let prev = self.prev_of(addr);
        let d = self.table[prev.idx()].next?;
        if self.table[d.idx()].addr != addr {
            return None;
        }
        pcbs.head(self.table[d.idx()].queue)
    }

    /// Active semaphore addresses in list order (sorted, no duplicates).
    #[cfg(test)]
    fn active_addrs(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = self.table[self.head.idx()].next;
        while let Some(d) = cursor {
            out.push(self.table[d.idx()].addr);
            cursor = self.table[d.idx()].next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Asl, PcbPool) {
        (Asl::new(), PcbPool::new())
    }

    #[test]
    fn descriptors_appear_sorted_and_unique() {
        let (mut asl, mut pcbs) = setup();
        let a = pcbs.alloc().unwrap();
        let b = pcbs.alloc().unwrap();
        let c = pcbs.alloc().unwrap();

        assert!(asl.insert_blocked(&mut pcbs, 0x300, a));
        assert!(asl.insert_blocked(&mut pcbs, 0x100, b));
        assert!(asl.insert_blocked(&mut pcbs, 0x300, c));

        assert_eq!(asl.active_addrs(), vec![0x100, 0x300]);
        assert_eq!(asl.head_blocked(&pcbs, 0x300), Some(a));
        assert_eq!(pcbs[c].sem_addr, Some(0x300));
    }

    #[test]
    fn waiters_wake_in_fifo_order_and_empty_descriptors_collapse() {
        let (mut asl, mut pcbs) = setup();
        let a = pcbs.alloc().unwrap();
        let b = pcbs.alloc().unwrap();

        asl.insert_blocked(&mut pcbs, 0x40, a);
        asl.insert_blocked(&mut pcbs, 0x40, b);

        assert_eq!(asl.remove_blocked(&mut pcbs, 0x40), Some(a));
        assert_eq!(asl.active_addrs(), vec![0x40]);
        assert_eq!(asl.remove_blocked(&mut pcbs, 0x40), Some(b));
        assert!(asl.active_addrs().is_empty());
        assert_eq!(asl.remove_blocked(&mut pcbs, 0x40), None);
    }

    #[test]
    fn out_blocked_round_trips_the_list_state() {
        let (mut asl, mut pcbs) = setup();
        let a = pcbs.alloc().unwrap();
        let b = pcbs.alloc().unwrap();

        asl.insert_blocked(&mut pcbs, 0x80, a);
        let before = asl.active_addrs();

        asl.insert_blocked(&mut pcbs, 0x200, b);
        assert_eq!(asl.out_blocked(&mut pcbs, b), Some(b));
        assert_eq!(asl.active_addrs(), before);

        // b is no longer findable through its stale sem_addr field
        assert_eq!(asl.head_blocked(&pcbs, 0x200), None);
    }

    #[test]
    fn out_blocked_of_an_unblocked_pcb_is_a_no_op() {
        let (mut asl, mut pcbs) = setup();
        let a = pcbs.alloc().unwrap();
        assert_eq!(asl.out_blocked(&mut pcbs, a), None);
    }

    #[test]
    fn every_pcb_can_block_on_its_own_address() {
        let (mut asl, mut pcbs) = setup();
        for i in 0..MAX_PROC {
            let p = pcbs.alloc().unwrap();
            assert!(asl.insert_blocked(&mut pcbs, 0x1000 + i * 4, p));
        }
        assert_eq!(asl.active_addrs().len(), MAX_PROC);
        let sorted = asl.active_addrs();
        let mut expected = sorted.clone();
        expected.sort_unstable();
        assert_eq!(sorted, expected);
    }
}
