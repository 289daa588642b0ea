//! Per-punit priority queue with FIFO-per-LPA ordering.
//!
//! Each parallel unit owns an insertion-ordered list of pending requests.
//! A separate tag index assigns every LPA a monotonically increasing pair
//! of counters: `max` advances on enqueue, `cur` advances when the oldest
//! item for that LPA is removed. An item is eligible for dequeue only when
//! its tag equals `cur` for its LPA, so operations against one logical
//! address are served strictly in arrival order even when they sit in
//! different punit lists (the read and write phases of an RMW usually do).
//!
//! Dequeue looks at the head only: it skips in-flight (locked) items and
//! stops at the first unlocked one, returning it if eligible and nothing
//! otherwise. An eligible item buried behind a head-of-line item with an
//! older tag therefore stalls until that predecessor is removed; scanning
//! further would trade that stall for apparent reordering within a punit.
//!
//! All operations serialize through one queue-wide lock. Enqueue and
//! dequeue rates are bounded by device throughput, not CPU, so the coarse
//! lock is not a contention concern.

use crate::req::LlmReq;
use nftl_error::{FtlError, Result};
use nftl_types::Lpa;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

/// Stable identity of an enqueued item, monotonically assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId(pub u64);

#[derive(Debug)]
struct TagRecord {
    cur: u64,
    max: u64,
}

#[derive(Debug)]
struct Item {
    qid: usize,
    tag: u64,
    lpa: Lpa,
    /// Set while the payload is out with the scheduler/device.
    locked: bool,
    req: Option<LlmReq>,
}

#[derive(Debug)]
struct Inner {
    lists: Vec<VecDeque<ItemId>>,
    items: HashMap<ItemId, Item>,
    tags: HashMap<Lpa, TagRecord>,
    next_id: u64,
    /// Global outstanding-item counter; always equals the number of items
    /// reachable by traversing every per-punit list.
    nr_items: usize,
    max_size: Option<usize>,
}

/// The per-punit priority queue.
#[derive(Debug)]
pub struct PrioQueue {
    inner: Mutex<Inner>,
}

impl PrioQueue {
    /// Create a queue with `nr_queues` per-punit lists. `max_size: None`
    /// disables the capacity bound.
    pub fn new(nr_queues: usize, max_size: Option<usize>) -> Result<Self> {
        if nr_queues == 0 {
            return Err(FtlError::InvalidGeometry(
                "priority queue needs at least one punit list".into(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                lists: (0..nr_queues).map(|_| VecDeque::new()).collect(),
                items: HashMap::new(),
                tags: HashMap::new(),
                next_id: 0,
                nr_items: 0,
                max_size,
            }),
        })
    }

    #[must_use]
    pub fn nr_queues(&self) -> usize {
        self.inner.lock().lists.len()
    }

    /// Append a request to punit list `qid`, ordered under `lpa`.
    pub fn enqueue(&self, qid: usize, lpa: Lpa, req: LlmReq) -> Result<ItemId> {
        let mut inner = self.inner.lock();
        if qid >= inner.lists.len() {
            return Err(FtlError::InvalidQueue(qid));
        }
        if let Some(max) = inner.max_size {
            if inner.nr_items >= max {
                return Err(FtlError::QueueFull);
            }
        }
        let tag = match inner.tags.entry(lpa) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.max += 1;
                record.max
            }
            Entry::Vacant(entry) => {
                entry.insert(TagRecord { cur: 0, max: 0 });
                0
            }
        };
        let id = ItemId(inner.next_id);
        inner.next_id += 1;
        inner.items.insert(
            id,
            Item {
                qid,
                tag,
                lpa,
                locked: false,
                req: Some(req),
            },
        );
        inner.lists[qid].push_back(id);
        inner.nr_items += 1;
        Ok(id)
    }

    /// Take the highest-priority ready item for punit `qid`, marking it
    /// in-flight. Returns `None` when nothing is eligible (head-only
    /// policy, see the module docs).
    pub fn dequeue(&self, qid: usize) -> Result<Option<(ItemId, LlmReq)>> {
        let mut inner = self.inner.lock();
        if qid >= inner.lists.len() {
            return Err(FtlError::InvalidQueue(qid));
        }
        let mut chosen = None;
        for id in inner.lists[qid].iter().copied() {
            let Some(item) = inner.items.get(&id) else {
                continue;
            };
            if item.locked {
                continue;
            }
            let eligible = inner
                .tags
                .get(&item.lpa)
                .is_some_and(|record| record.cur == item.tag);
            if eligible {
                chosen = Some(id);
            }
            // First unlocked item decides; never scan past it.
            break;
        }
        let Some(id) = chosen else {
            return Ok(None);
        };
        let Some(item) = inner.items.get_mut(&id) else {
            return Ok(None);
        };
        item.locked = true;
        match item.req.take() {
            Some(req) => Ok(Some((id, req))),
            None => Err(FtlError::UnknownQueueItem(id.0)),
        }
    }

    /// Unlink a finished item, promoting the next enqueued item for its
    /// LPA to eligibility (or dropping the tag record when this was the
    /// last outstanding reference).
    pub fn remove(&self, id: ItemId) -> Result<()> {
        let mut inner = self.inner.lock();
        let item = inner
            .items
            .remove(&id)
            .ok_or(FtlError::UnknownQueueItem(id.0))?;
        if let Some(pos) = inner.lists[item.qid].iter().position(|entry| *entry == id) {
            inner.lists[item.qid].remove(pos);
        }
        if let Entry::Occupied(mut entry) = inner.tags.entry(item.lpa) {
            let record = entry.get_mut();
            if record.cur == record.max {
                entry.remove();
            } else {
                record.cur += 1;
            }
        }
        inner.nr_items -= 1;
        Ok(())
    }

    /// Relocate an in-flight item to another punit list without touching
    /// its priority-tag state, unlocking it so it becomes eligible again
    /// under the new punit. Used for the RMW read-to-write transition.
    pub fn move_item(&self, id: ItemId, new_qid: usize, req: LlmReq) -> Result<()> {
        let mut inner = self.inner.lock();
        if new_qid >= inner.lists.len() {
            return Err(FtlError::InvalidQueue(new_qid));
        }
        let old_qid = {
            let item = inner
                .items
                .get_mut(&id)
                .ok_or(FtlError::UnknownQueueItem(id.0))?;
            let old_qid = item.qid;
            item.qid = new_qid;
            item.locked = false;
            item.req = Some(req);
            old_qid
        };
        if let Some(pos) = inner.lists[old_qid].iter().position(|entry| *entry == id) {
            inner.lists[old_qid].remove(pos);
        }
        inner.lists[new_qid].push_back(id);
        Ok(())
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .max_size
            .is_some_and(|max| inner.nr_items >= max)
    }

    pub fn is_empty(&self, qid: usize) -> Result<bool> {
        let inner = self.inner.lock();
        if qid >= inner.lists.len() {
            return Err(FtlError::InvalidQueue(qid));
        }
        Ok(inner.lists[qid].is_empty())
    }

    #[must_use]
    pub fn is_all_empty(&self) -> bool {
        self.inner.lock().nr_items == 0
    }

    /// Global outstanding-item count.
    #[must_use]
    pub fn nr_items(&self) -> usize {
        self.inner.lock().nr_items
    }

    /// Item count found by traversing every per-punit list; equals
    /// [`PrioQueue::nr_items`] by construction, exposed so tests can check
    /// the accounting invariant.
    #[must_use]
    pub fn traverse_count(&self) -> usize {
        self.inner.lock().lists.iter().map(VecDeque::len).sum()
    }
}
