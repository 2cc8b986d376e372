use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;

use crate::priority::Priority;

// Pass increment per dispatch is STRIDE / weight, so bands advance at a rate
// inversely proportional to their weight.
const STRIDE: u64 = 1 << 20;

struct Band<T> {
    tasks: VecDeque<T>,
    pass: u64,
    stride: u64,
}

/// Ready tasks, one FIFO band per priority.
///
/// Bands are served by stride scheduling: each dispatch picks the non-empty
/// band with the lowest pass value, so over time a band receives dispatches
/// in proportion to its priority weight. Ties go to the higher priority.
pub(crate) struct ReadyQueue<T> {
    bands: Vec<Band<T>>,
    // Pass value of the last dispatch; idle bands rejoin here.
    clock: u64,
    len: usize,
}

impl<T> ReadyQueue<T> {
    pub(crate) fn new() -> Self {
        let bands = Priority::ALL
            .iter()
            .map(|p| Band {
                tasks: VecDeque::new(),
                pass: 0,
                stride: STRIDE / u64::from(p.value()),
            })
            .collect();
        Self {
            bands,
            clock: 0,
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, priority: Priority, task: T) {
        let band = &mut self.bands[priority.index()];
        if band.tasks.is_empty() {
            // An idle band must not bank dispatches while it had nothing queued.
            band.pass = band.pass.max(self.clock);
        }
        band.tasks.push_back(task);
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        let index = self
            .bands
            .iter()
            .enumerate()
            .filter(|(_, band)| !band.tasks.is_empty())
            .min_by(|(ia, a), (ib, b)| a.pass.cmp(&b.pass).then(ib.cmp(ia)))
            .map(|(i, _)| i)?;
        let band = &mut self.bands[index];
        let task = band.tasks.pop_front()?;
        self.clock = band.pass;
        band.pass += band.stride;
        self.len -= 1;
        Some(task)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.len;
        for band in &mut self.bands {
            band.tasks.clear();
        }
        self.len = 0;
        dropped
    }
}

struct Delayed<T> {
    due: Instant,
    seq: u64,
    task: T,
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Delayed<T> {
    // Reversed: the heap yields the earliest due task first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Tasks waiting for their start time, earliest first.
pub(crate) struct DelayQueue<T> {
    heap: BinaryHeap<Delayed<T>>,
    seq: u64,
}

impl<T> DelayQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub(crate) fn push(&mut self, due: Instant, task: T) {
        self.seq += 1;
        self.heap.push(Delayed {
            due,
            seq: self.seq,
            task,
        });
    }

    /// Removes the next task if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<T> {
        if self.heap.peek()?.due <= now {
            self.heap.pop().map(|d| d.task)
        } else {
            None
        }
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|d| d.due)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.heap.len();
        self.heap.clear();
        dropped
    }
}
