//! Dispatch queues.
//!
//! Every DSQ keeps an insertion-ordered list. Priority DSQs additionally
//! keep a tree keyed by `(vtime, tiebreak)` holding the same members; the
//! tree decides pick order and the list only records arrival. Both
//! structures are `BTreeMap`s so that removing an arbitrary member (host
//! dequeue, exit, move) is logarithmic like the pick.
//!
//! A DSQ is only mutated through a [`DsqGuard`], and a task's record is
//! only linked or unlinked while its own lock is held inside the guard.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::task::{TaskState, Tsr};
use crate::types::{DsqId, DsqOrder, EnqFlags, PriorityTiebreak, TaskId, Vtime};

/// Position in the priority tree.
///
/// `class` sorts HEAD inserts ahead of regular inserts sharing a vtime.
/// `tiebreak` is the arrival ordinal, negated where later arrivals must
/// sort first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TreeKey {
    vtime: Vtime,
    class: u8,
    tiebreak: i64,
}

/// Membership anchor stored in the TSR while it is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DsqNode {
    list_pos: i64,
    tree_key: Option<TreeKey>,
}

#[derive(Debug)]
pub(crate) struct DsqInner {
    seq_gen: u32,
    ordinal: i64,
    list: BTreeMap<i64, TaskId>,
    tree: BTreeMap<TreeKey, TaskId>,
    destroyed: bool,
}

#[derive(Debug)]
pub(crate) struct Dsq {
    pub id: DsqId,
    pub order: DsqOrder,
    tiebreak: PriorityTiebreak,
    nr: AtomicU32,
    inner: Mutex<DsqInner>,
}

impl Dsq {
    pub fn new(id: DsqId, order: DsqOrder, tiebreak: PriorityTiebreak) -> Self {
        Dsq {
            id,
            order,
            tiebreak,
            nr: AtomicU32::new(0),
            inner: Mutex::new(DsqInner {
                seq_gen: 0,
                ordinal: 0,
                list: BTreeMap::new(),
                tree: BTreeMap::new(),
                destroyed: false,
            }),
        }
    }

    /// Lock-free member count. Exact only under the lock.
    pub fn nr(&self) -> u32 {
        self.nr.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> DsqGuard<'_> {
        DsqGuard {
            dsq: self,
            inner: self.inner.lock(),
        }
    }

    /// Stable address used to order lock acquisition across DSQs.
    pub fn lock_addr(&self) -> usize {
        self as *const Dsq as usize
    }
}

pub(crate) struct DsqGuard<'a> {
    dsq: &'a Dsq,
    inner: MutexGuard<'a, DsqInner>,
}

impl DsqGuard<'_> {
    pub fn id(&self) -> DsqId {
        self.dsq.id
    }

    pub fn order(&self) -> DsqOrder {
        self.dsq.order
    }

    /// A destroyed DSQ has been unpublished from the table; whoever still
    /// holds it must look the id up again.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed
    }

    pub fn mark_destroyed(&mut self) {
        self.inner.destroyed = true;
    }

    pub fn len(&self) -> usize {
        self.inner.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.list.is_empty()
    }

    pub fn seq_gen(&self) -> u32 {
        self.inner.seq_gen
    }

    fn next_ordinal(&mut self) -> i64 {
        self.inner.ordinal += 1;
        self.inner.ordinal
    }

    /// Link `tsr` into this DSQ and mark it `Queued`.
    ///
    /// The caller has validated the task's state and the key against the
    /// DSQ order. For a Priority DSQ `key` is the vtime to queue at; it is
    /// ignored for FIFO DSQs.
    pub fn link(&mut self, tsr: &mut Tsr, key: Option<Vtime>, enq_flags: EnqFlags) -> u32 {
        let head = enq_flags.contains(EnqFlags::HEAD);
        let ord = self.next_ordinal();
        let list_pos = if head { -ord } else { ord };

        let tree_key = match self.dsq.order {
            DsqOrder::Fifo => None,
            DsqOrder::Priority => {
                let vtime = key.unwrap_or(tsr.vtime);
                let tk = if head {
                    let vtime = match self.inner.tree.keys().next() {
                        Some(first) if first.vtime < vtime => first.vtime,
                        _ => vtime,
                    };
                    TreeKey {
                        vtime,
                        class: 0,
                        tiebreak: -ord,
                    }
                } else {
                    let tiebreak = match self.dsq.tiebreak {
                        PriorityTiebreak::FifoOnEqual => ord,
                        PriorityTiebreak::LifoOnEqual => -ord,
                    };
                    TreeKey {
                        vtime,
                        class: 1,
                        tiebreak,
                    }
                };
                self.inner.tree.insert(tk, tsr.id);
                tsr.vtime = tk.vtime;
                Some(tk)
            }
        };

        self.inner.list.insert(list_pos, tsr.id);
        let seq = self.inner.seq_gen;
        self.inner.seq_gen = seq.wrapping_add(1);

        tsr.seq = seq;
        tsr.dsq_ref = Some(self.dsq.id);
        tsr.node = Some(DsqNode {
            list_pos,
            tree_key,
        });
        tsr.state = TaskState::Queued;
        self.dsq.nr.store(self.inner.list.len() as u32, Ordering::Release);
        seq
    }

    /// Unlink `tsr` from this DSQ. The caller decides the next state.
    pub fn unlink(&mut self, tsr: &mut Tsr) -> bool {
        let Some(node) = tsr.node.take() else {
            return false;
        };
        let removed = self.inner.list.remove(&node.list_pos).is_some();
        if let Some(tk) = node.tree_key {
            self.inner.tree.remove(&tk);
        }
        tsr.dsq_ref = None;
        self.dsq.nr.store(self.inner.list.len() as u32, Ordering::Release);
        removed
    }

    /// The task a pick would return.
    pub fn first(&self) -> Option<TaskId> {
        match self.dsq.order {
            DsqOrder::Fifo => self.inner.list.values().next().copied(),
            DsqOrder::Priority => self.inner.tree.values().next().copied(),
        }
    }

    /// Members in pick order.
    pub fn members(&self) -> Vec<TaskId> {
        match self.dsq.order {
            DsqOrder::Fifo => self.inner.list.values().copied().collect(),
            DsqOrder::Priority => self.inner.tree.values().copied().collect(),
        }
    }

    /// Structural self-check: `nr`, list and tree sizes agree.
    pub fn check_counts(&self) -> Result<(), String> {
        let nr = self.dsq.nr();
        let list = self.inner.list.len();
        if nr as usize != list {
            return Err(format!("dsq {}: nr {} != list {}", self.dsq.id, nr, list));
        }
        match self.dsq.order {
            DsqOrder::Fifo if !self.inner.tree.is_empty() => Err(format!(
                "dsq {}: FIFO DSQ has {} tree members",
                self.dsq.id,
                self.inner.tree.len()
            )),
            DsqOrder::Priority if self.inner.tree.len() != list => Err(format!(
                "dsq {}: tree {} != list {}",
                self.dsq.id,
                self.inner.tree.len(),
                list
            )),
            _ => Ok(()),
        }
    }

    pub fn snapshot(&self) -> DsqSnapshot {
        DsqSnapshot {
            id: self.dsq.id,
            order: self.dsq.order,
            nr: self.len() as u32,
            seq_gen: self.seq_gen(),
            tasks: self.members(),
        }
    }
}

/// Point-in-time view of a DSQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsqSnapshot {
    pub id: DsqId,
    pub order: DsqOrder,
    pub nr: u32,
    pub seq_gen: u32,
    pub tasks: Vec<TaskId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpumask::Cpumask;

    fn tsr(id: u64) -> Tsr {
        let mut t = Tsr::new(TaskId(id), Cpumask::full(4), 100);
        t.state = TaskState::Runnable;
        t
    }

    fn link_all(dsq: &Dsq, tasks: &mut [Tsr], keys: &[u64]) {
        let mut g = dsq.lock();
        for (t, &k) in tasks.iter_mut().zip(keys) {
            g.link(t, Some(Vtime(k)), EnqFlags::empty());
        }
    }

    #[test]
    fn test_fifo_order_and_unlink() {
        let dsq = Dsq::new(DsqId(1), DsqOrder::Fifo, PriorityTiebreak::FifoOnEqual);
        let mut tasks: Vec<Tsr> = (1..=3).map(tsr).collect();
        link_all(&dsq, &mut tasks, &[0, 0, 0]);
        assert_eq!(dsq.nr(), 3);

        let mut g = dsq.lock();
        assert_eq!(g.members(), vec![TaskId(1), TaskId(2), TaskId(3)]);
        assert_eq!(tasks[1].seq, 1);
        assert_eq!(tasks[1].dsq_ref, Some(DsqId(1)));

        assert!(g.unlink(&mut tasks[1]));
        assert!(!g.unlink(&mut tasks[1]));
        assert_eq!(tasks[1].dsq_ref, None);
        assert_eq!(g.members(), vec![TaskId(1), TaskId(3)]);
        assert_eq!(dsq.nr(), 2);
        g.check_counts().unwrap();
    }

    #[test]
    fn test_fifo_head_insert() {
        let dsq = Dsq::new(DsqId(1), DsqOrder::Fifo, PriorityTiebreak::FifoOnEqual);
        let mut tasks: Vec<Tsr> = (1..=3).map(tsr).collect();
        let mut g = dsq.lock();
        g.link(&mut tasks[0], None, EnqFlags::empty());
        g.link(&mut tasks[1], None, EnqFlags::HEAD);
        g.link(&mut tasks[2], None, EnqFlags::HEAD);
        assert_eq!(g.members(), vec![TaskId(3), TaskId(2), TaskId(1)]);
    }

    #[test]
    fn test_priority_fifo_on_equal() {
        let dsq = Dsq::new(DsqId(1), DsqOrder::Priority, PriorityTiebreak::FifoOnEqual);
        let mut tasks: Vec<Tsr> = (1..=3).map(tsr).collect();
        link_all(&dsq, &mut tasks, &[100, 50, 100]);
        let g = dsq.lock();
        assert_eq!(g.members(), vec![TaskId(2), TaskId(1), TaskId(3)]);
        assert_eq!(g.first(), Some(TaskId(2)));
        g.check_counts().unwrap();
    }

    #[test]
    fn test_priority_lifo_on_equal() {
        let dsq = Dsq::new(DsqId(1), DsqOrder::Priority, PriorityTiebreak::LifoOnEqual);
        let mut tasks: Vec<Tsr> = (1..=3).map(tsr).collect();
        link_all(&dsq, &mut tasks, &[100, 50, 100]);
        assert_eq!(dsq.lock().members(), vec![TaskId(2), TaskId(3), TaskId(1)]);
    }

    #[test]
    fn test_priority_head_takes_min_key() {
        let dsq = Dsq::new(DsqId(1), DsqOrder::Priority, PriorityTiebreak::FifoOnEqual);
        let mut tasks: Vec<Tsr> = (1..=3).map(tsr).collect();
        let mut g = dsq.lock();
        g.link(&mut tasks[0], Some(Vtime(10)), EnqFlags::empty());
        g.link(&mut tasks[1], Some(Vtime(20)), EnqFlags::empty());
        g.link(&mut tasks[2], Some(Vtime(500)), EnqFlags::HEAD);
        assert_eq!(g.first(), Some(TaskId(3)));
        assert_eq!(tasks[2].vtime, Vtime(10));
        assert_eq!(g.members(), vec![TaskId(3), TaskId(1), TaskId(2)]);

        // Unlinking the head restores plain vtime order.
        g.unlink(&mut tasks[2]);
        assert_eq!(g.first(), Some(TaskId(1)));
        g.check_counts().unwrap();
    }

    #[test]
    fn test_seq_gen_advances_per_insert() {
        let dsq = Dsq::new(DsqId(1), DsqOrder::Fifo, PriorityTiebreak::FifoOnEqual);
        let mut t = tsr(1);
        let mut g = dsq.lock();
        let s0 = g.link(&mut t, None, EnqFlags::empty());
        g.unlink(&mut t);
        let s1 = g.link(&mut t, None, EnqFlags::empty());
        assert_eq!(s1, s0 + 1);
        assert_eq!(g.seq_gen(), 2);
    }
}
