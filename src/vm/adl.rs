//! The Active Delay List.
//!
//! Sleeping user processes wait here as (wake time, ASID) pairs on a
//! singly-linked list kept sorted by ascending wake time. The delay daemon
//! pops the head as long as its wake time has passed. Nodes come from a
//! fixed arena with one slot per user process plus one spare.

use super::MAX_USER_PROC;

const MAX_DELAYD: usize = MAX_USER_PROC + 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct DelayIdx(u16);

impl DelayIdx {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy)]
struct Delayd {
    next: Option<DelayIdx>,
    wake_time: i64,
    asid: i32,
}

impl Delayd {
    const EMPTY: Delayd = Delayd {
        next: None,
        wake_time: -1,
        asid: -1,
    };
}

pub struct Adl {
    table: [Delayd; MAX_DELAYD],
    free: Option<DelayIdx>,
    head: Option<DelayIdx>,
}

impl Adl {
    pub const fn new() -> Adl {
        // the free stack is threaded lazily: slot i points at slot i + 1
        let mut table = [Delayd::EMPTY; MAX_DELAYD];
        let mut i = 0;
        while i + 1 < MAX_DELAYD {
            table[i].next = Some(DelayIdx((i + 1) as u16));
            i += 1;
        }
        Adl {
            table,
            free: Some(DelayIdx(0)),
            head: None,
        }
    }

    fn release(&mut self, d: DelayIdx) {
        self.table[d.idx()].next = self.free;
        self.free = Some(d);
    }

    fn take(&mut self) -> Option<DelayIdx> {
        let d = self.free?;
        self.free = self.table[d.idx()].next;
        self.table[d.idx()] = Delayd::EMPTY;
        Some(d)
    }

    /// Node after which a wake time of `wake_time` belongs; `None` means
    /// it goes in front. Equal wake times keep arrival order.
    fn prev_of(&self, wake_time: i64) -> Option<DelayIdx> {
        let mut cursor = self.head?;
        if self.table[cursor.idx()].wake_time > wake_time {
            return None;
        }
        while let Some(next) = self.table[cursor.idx()].next {
            if self.table[next.idx()].wake_time > wake_time {
                break;
            }
            cursor = next;
        }
        Some(cursor)
    }

    /// Wake time of the earliest sleeper.
    pub fn head_wake_time(&self) -> Option<i64> {
        self.head.map(|h| self.table[h.idx()].wake_time)
    }

    /// Park `asid` until `wake_time`. Returns false if the node arena is
    /// exhausted.
    pub fn insert_delay(&mut self, wake_time: i64, asid: i32) -> bool {
        let Some(node) = self.take() else {
            return false;
        };
        self.table[node.idx()].wake_time = wake_time;
        self.table[node.idx()].asid = asid;

        match self.prev_of(wake_time) {
            None => {
                self.table[node.idx()].next = self.head;
                self.head = Some(node);
            }
            Some(prev) => {
                self.table[node.idx()].next = self.table[prev.idx()].next;
                self.table[prev.idx()].next = Some(node);
            }
        }
        true
    }

    /// Pop the earliest sleeper and return its ASID.
    pub fn remove_delay(&mut self) -> Option<i32> {
        let h = self.head?;
        self.head = self.table[h.idx()].next;
        let asid = self.table[h.idx()].asid;
        self.release(h);
        Some(asid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleepers_come_out_in_wake_order() {
        let mut adl = Adl::new();
        assert!(adl.insert_delay(300, 1));
        assert!(adl.insert_delay(100, 2));

        assert_eq!(adl.head_wake_time(), Some(100));
        assert_eq!(adl.remove_delay(), Some(2));
        assert_eq!(adl.head_wake_time(), Some(300));
        assert_eq!(adl.remove_delay(), Some(1));
        assert_eq!(adl.remove_delay(), None);
        assert_eq!(adl.head_wake_time(), None);
    }

    #[test]
    fn arena_holds_one_node_per_user_process_plus_a_spare() {
        let mut adl = Adl::new();
        for i in 0..MAX_DELAYD {
            assert!(adl.insert_delay(i as i64, i as i32));
        }
        assert!(!adl.insert_delay(999, 99));
        assert_eq!(adl.remove_delay(), Some(0));
        assert!(adl.insert_delay(999, 99));
    }

    #[test]
    fn equal_wake_times_keep_arrival_order() {
        let mut adl = Adl::new();
        assert!(adl.insert_delay(50, 1));
        assert!(adl.insert_delay(50, 2));
        assert_eq!(adl.remove_delay(), Some(1));
        assert_eq!(adl.remove_delay(), Some(2));
    }
}
