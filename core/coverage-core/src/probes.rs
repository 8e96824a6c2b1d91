//! Probe aggregation.
//!
//! Instrumented code flushes partial probe arrays, so the same class id shows
//! up many times per run. The aggregator ORs them together. Records are keyed
//! by `(id, test name)` so per-test attribution survives the merge; the flag
//! count is pinned per id at first submission.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use coverage_daemon_protocol::ProbeRecord;
use tracing::warn;

use crate::bitmap::ProbeBitmap;
use crate::error::ProbeError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeKey {
    pub id: u64,
    pub test_name: Option<String>,
}

/// Merged execution data for one class id and one test (or none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionData {
    pub id: u64,
    pub class_name: String,
    pub probes: ProbeBitmap,
    pub test_name: Option<String>,
}

impl From<ProbeRecord> for ExecutionData {
    fn from(record: ProbeRecord) -> Self {
        Self {
            id: record.id,
            class_name: record.class_name,
            probes: ProbeBitmap::from_bools(&record.probes),
            test_name: record.test_name,
        }
    }
}

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<ProbeKey, ExecutionData>,
    lengths: HashMap<u64, usize>,
}

/// Concurrent, capacity-bounded probe index for one session generation.
#[derive(Debug)]
pub struct ProbeAggregator {
    shards: Box<[Mutex<Shard>]>,
    capacity: usize,
    len: AtomicUsize,
}

impl ProbeAggregator {
    pub fn new(shards: usize, capacity: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        Self {
            shards,
            capacity,
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of distinct `(id, test)` entries currently buffered.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges one record. Only the shard owning `record.id` is locked, and the
    /// length check plus OR happen under that one lock.
    pub fn submit(&self, record: ProbeRecord) -> Result<(), ProbeError> {
        let data = ExecutionData::from(record);
        let mut shard = self.shard_for(data.id);

        let actual = data.probes.len();
        if let Some(&expected) = shard.lengths.get(&data.id) {
            if expected != actual {
                return Err(ProbeError::LengthMismatch {
                    id: data.id,
                    expected,
                    actual,
                });
            }
        }

        let key = ProbeKey {
            id: data.id,
            test_name: data.test_name.clone(),
        };
        if let Some(existing) = shard.entries.get_mut(&key) {
            existing.probes.union_with(&data.probes);
            return Ok(());
        }

        if self.len.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(ProbeError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        shard.lengths.entry(data.id).or_insert(actual);
        shard.entries.insert(key, data);
        Ok(())
    }

    /// Takes every merged entry, leaving the aggregator empty. Output is
    /// ordered by class name, id, then test name.
    pub fn drain(&self) -> Vec<ExecutionData> {
        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            let entries = std::mem::take(&mut shard.entries);
            shard.lengths.clear();
            self.len.fetch_sub(entries.len(), Ordering::AcqRel);
            drained.extend(entries.into_values());
        }
        drained.sort_by(|a, b| {
            (&a.class_name, a.id, &a.test_name).cmp(&(&b.class_name, b.id, &b.test_name))
        });
        drained
    }

    /// Discards everything buffered. Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        self.drain().len()
    }

    fn shard_for(&self, id: u64) -> MutexGuard<'_, Shard> {
        let index = (id % self.shards.len() as u64) as usize;
        lock(&self.shards[index])
    }
}

fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Probe flags merged per class name, the shape structural analysis consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionIndex {
    by_class: BTreeMap<String, ProbeBitmap>,
}

impl ExecutionIndex {
    pub fn from_data<'a>(data: impl IntoIterator<Item = &'a ExecutionData>) -> Self {
        let mut index = Self::default();
        index.extend(data);
        index
    }

    /// ORs more execution data into the index.
    pub fn extend<'a>(&mut self, data: impl IntoIterator<Item = &'a ExecutionData>) {
        for entry in data {
            self.insert(entry);
        }
    }

    pub fn single(data: &ExecutionData) -> Self {
        Self::from_data(std::iter::once(data))
    }

    fn insert(&mut self, data: &ExecutionData) {
        match self.by_class.get_mut(&data.class_name) {
            Some(existing) => {
                if !existing.union_with(&data.probes) {
                    warn!(
                        class = %data.class_name,
                        id = data.id,
                        expected = existing.len(),
                        actual = data.probes.len(),
                        "Ignoring execution data with a conflicting probe count"
                    );
                }
            }
            None => {
                self.by_class
                    .insert(data.class_name.clone(), data.probes.clone());
            }
        }
    }

    pub fn get(&self, class_name: &str) -> Option<&ProbeBitmap> {
        self.by_class.get(class_name)
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.by_class.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_class.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn record(id: u64, class: &str, probes: &[bool], test: Option<&str>) -> ProbeRecord {
        ProbeRecord {
            id,
            class_name: class.to_string(),
            probes: probes.to_vec(),
            test_name: test.map(str::to_string),
        }
    }

    #[test]
    fn merges_duplicate_submissions() {
        let aggregator = ProbeAggregator::new(4, 16);
        aggregator
            .submit(record(1, "A", &[true, false, true], None))
            .expect("first");
        aggregator
            .submit(record(1, "A", &[false, true, true], None))
            .expect("second");

        let drained = aggregator.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].probes.to_bools(), vec![true, true, true]);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn rejects_length_mismatch_and_keeps_going() {
        let aggregator = ProbeAggregator::new(4, 16);
        aggregator
            .submit(record(1, "A", &[true, false], None))
            .expect("first");
        let err = aggregator
            .submit(record(1, "A", &[true, false, true], Some("t1")))
            .unwrap_err();
        assert_eq!(
            err,
            ProbeError::LengthMismatch {
                id: 1,
                expected: 2,
                actual: 3
            }
        );
        aggregator
            .submit(record(2, "B", &[true], None))
            .expect("unrelated id");
        assert_eq!(aggregator.len(), 2);
    }

    #[test]
    fn keeps_tests_apart() {
        let aggregator = ProbeAggregator::new(1, 16);
        aggregator
            .submit(record(1, "A", &[true, false], Some("t1")))
            .expect("t1");
        aggregator
            .submit(record(1, "A", &[false, true], Some("t2")))
            .expect("t2");
        let drained = aggregator.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].test_name.as_deref(), Some("t1"));
        assert_eq!(drained[1].test_name.as_deref(), Some("t2"));
    }

    #[test]
    fn enforces_capacity() {
        let aggregator = ProbeAggregator::new(2, 2);
        aggregator.submit(record(1, "A", &[true], None)).expect("1");
        aggregator.submit(record(2, "B", &[true], None)).expect("2");
        // merging into an existing entry needs no new slot
        aggregator.submit(record(2, "B", &[true], None)).expect("merge");
        let err = aggregator.submit(record(3, "C", &[true], None)).unwrap_err();
        assert_eq!(err, ProbeError::CapacityExceeded { capacity: 2 });
        assert_eq!(aggregator.clear(), 2);
        aggregator
            .submit(record(3, "C", &[true], None))
            .expect("room after clear");
    }

    #[test]
    fn concurrent_submissions_merge_atomically() {
        let aggregator = Arc::new(ProbeAggregator::new(8, 1_024));
        let width = 64;
        let handles: Vec<_> = (0..width)
            .map(|bit| {
                let aggregator = Arc::clone(&aggregator);
                thread::spawn(move || {
                    let mut flags = vec![false; width];
                    flags[bit] = true;
                    aggregator
                        .submit(record(7, "Hot", &flags, None))
                        .expect("submit");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let drained = aggregator.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].probes.count_ones(), width);
    }

    #[test]
    fn index_merges_by_class_name() {
        let first = ExecutionData::from(record(1, "A", &[true, false], Some("t1")));
        let second = ExecutionData::from(record(1, "A", &[false, true], Some("t2")));
        let index = ExecutionIndex::from_data([&first, &second]);
        assert_eq!(
            index.get("A").map(ProbeBitmap::to_bools),
            Some(vec![true, true])
        );
        assert_eq!(index.class_names().collect::<Vec<_>>(), vec!["A"]);
    }
}
