//! Bounded per-variable buffer queues

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::types::ParsedBuffer;

/// A ring buffer of decoded buffers.
///
/// Once full, every push evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct BufferQueue {
    capacity: usize,
    items: VecDeque<Arc<ParsedBuffer>>,
}

impl BufferQueue {
    /// A queue holding at most `capacity` buffers (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, items: VecDeque::with_capacity(capacity.min(4096)) }
    }

    pub fn push(&mut self, buffer: Arc<ParsedBuffer>) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(buffer);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn last(&self) -> Option<&Arc<ParsedBuffer>> {
        self.items.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ParsedBuffer>> {
        self.items.iter()
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<ParsedBuffer>> {
        self.items.iter().cloned().collect()
    }
}

/// One queue per variable.
#[derive(Debug, Clone, Default)]
pub struct QueueSet {
    queues: BTreeMap<String, BufferQueue>,
}

/// Point-in-time copy of every queue, keyed by variable name.
pub type QueueSnapshot = BTreeMap<String, Vec<Arc<ParsedBuffer>>>;

impl QueueSet {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>, capacity: usize) -> Self {
        let queues =
            names.into_iter().map(|name| (name.to_string(), BufferQueue::new(capacity))).collect();
        Self { queues }
    }

    /// Replace one variable's queue with an empty one of `capacity`.
    pub fn resize(&mut self, name: &str, capacity: usize) {
        self.queues.insert(name.to_string(), BufferQueue::new(capacity));
    }

    /// Push into `name`'s queue. Returns false if the variable has no queue.
    pub fn push(&mut self, name: &str, buffer: Arc<ParsedBuffer>) -> bool {
        match self.queues.get_mut(name) {
            Some(queue) => {
                queue.push(buffer);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&BufferQueue> {
        self.queues.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BufferQueue)> {
        self.queues.iter()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queues.iter().map(|(name, queue)| (name.clone(), queue.snapshot())).collect()
    }
}

/// Values of one variable with their absolute timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimestampedValues {
    pub timestamps: Vec<u64>,
    pub values: Vec<f64>,
}

impl TimestampedValues {
    pub fn from_buffer(buffer: &ParsedBuffer) -> Self {
        Self { timestamps: buffer.absolute_timestamps(), values: buffer.values_f64() }
    }

    pub fn extend_from_buffer(&mut self, buffer: &ParsedBuffer) {
        self.timestamps.extend(buffer.absolute_timestamps());
        self.values.extend(buffer.values_f64());
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MonitorSample, Value};
    use proptest::prelude::*;

    fn sample(timestamp: u64) -> Arc<ParsedBuffer> {
        let value = Value::Int(timestamp as i32);
        Arc::new(ParsedBuffer::Monitor(MonitorSample { timestamp, value }))
    }

    #[test]
    fn queue_sets_ignore_unknown_variables() {
        let mut set = QueueSet::new(["a", "b"], 2);
        assert!(set.push("a", sample(1)));
        assert!(!set.push("zzz", sample(2)));
        set.resize("b", 5);
        assert_eq!(set.get("b").unwrap().capacity(), 5);
        assert_eq!(set.snapshot().keys().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn zero_capacity_still_keeps_the_newest() {
        let mut queue = BufferQueue::new(0);
        queue.push(sample(1));
        queue.push(sample(2));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.last().unwrap().ref_timestamp(), 2);
    }

    proptest! {
        #[test]
        fn ring_keeps_the_last_c_items_in_order(capacity in 1usize..64, inserts in 0usize..256) {
            let mut queue = BufferQueue::new(capacity);
            for t in 0..inserts {
                queue.push(sample(t as u64));
            }
            let kept: Vec<u64> = queue.iter().map(|b| b.ref_timestamp()).collect();
            let expected: Vec<u64> =
                (inserts.saturating_sub(capacity)..inserts).map(|t| t as u64).collect();
            prop_assert_eq!(kept, expected);
            prop_assert_eq!(queue.is_full(), inserts >= capacity);
        }
    }
}
