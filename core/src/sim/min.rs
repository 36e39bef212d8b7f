//! Belady's MIN replacement simulator.
//!
//! Every demand miss appends a column with count 1 to a capacity vector;
//! every hit extends the key's current reservation to the latest column and
//! increments each spanned column. A column reaching the cache size moves
//! the *barrier* there: everything wholly left of the barrier is decided.
//! [`SimMin::evictions`] trims decided history and reports which keys a
//! clairvoyant cache would have kept or evicted.

use super::MinTime;
use crate::utils::TimeSpec;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

/// One contiguous residency of a key, inclusive on both ends, in both
/// column (MIN) time and capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    first_col: MinTime,
    last_col: MinTime,
    first_ts: TimeSpec,
    last_ts: TimeSpec,
    /// Hits folded into this reservation.
    pub hits: u64,
}

impl Reservation {
    pub fn new(ts: TimeSpec, col: MinTime) -> Self {
        Reservation {
            first_col: col,
            last_col: col,
            first_ts: ts,
            last_ts: ts,
            hits: 0,
        }
    }

    #[inline]
    pub fn first_col(&self) -> MinTime {
        self.first_col
    }

    #[inline]
    pub fn last_col(&self) -> MinTime {
        self.last_col
    }

    #[inline]
    pub fn first_ts(&self) -> TimeSpec {
        self.first_ts
    }

    #[inline]
    pub fn last_ts(&self) -> TimeSpec {
        self.last_ts
    }

    /// Still undecided at `col`: the reservation reaches it.
    #[inline]
    pub fn covers(&self, col: MinTime) -> bool {
        col <= self.last_col
    }

    /// Spans `col` entirely: `first <= col <= last`.
    #[inline]
    pub fn strictly_covers(&self, col: MinTime) -> bool {
        self.first_col <= col && col <= self.last_col
    }

    pub fn extend(&mut self, ts: TimeSpec, col: MinTime) {
        self.last_col = col;
        self.last_ts = ts;
    }

    /// Columns survived by this reservation.
    #[inline]
    pub fn duration_cols(&self) -> MinTime {
        self.last_col - self.first_col
    }

    #[inline]
    pub fn duration_time(&self) -> TimeSpec {
        self.last_ts - self.first_ts
    }
}

pub type History = Vec<Reservation>;

pub struct SimMin<K> {
    entries: usize,
    /// Latest column where the capacity vector reached `entries`. Absolute
    /// indexing; never retreats.
    barrier: MinTime,
    /// Columns already trimmed off the front of `capacity`.
    trim_offset: MinTime,
    reserved: HashMap<K, History>,
    capacity: Vec<u32>,

    hits: u64,
    capacity_miss: u64,
    compulsory_miss: u64,

    /// Peak number of keys tracked between trims.
    max_rows: usize,
}

impl<K> SimMin<K>
where
    K: Eq + Hash + Ord + Clone,
{
    pub fn new(entries: usize) -> Self {
        assert!(entries > 0, "MIN simulator needs a non-zero cache size");
        SimMin {
            entries,
            barrier: 0,
            trim_offset: 0,
            reserved: HashMap::with_capacity(entries * 2),
            capacity: Vec::new(),
            hits: 0,
            capacity_miss: 0,
            compulsory_miss: 0,
            max_rows: 0,
        }
    }

    #[inline]
    fn next_column(&self) -> MinTime {
        self.compulsory_miss + self.capacity_miss
    }

    /// First occurrence of `k`: a compulsory miss.
    pub fn insert(&mut self, k: K, ts: TimeSpec) {
        let column = self.next_column();
        self.compulsory_miss += 1;
        self.reserved
            .entry(k)
            .or_default()
            .push(Reservation::new(ts, column));
        self.capacity.push(1);
        debug_assert_eq!(
            self.capacity.len() as u64,
            self.compulsory_miss + self.capacity_miss - self.trim_offset
        );
    }

    /// Re-access of `k`. Extends the live reservation (hit) or opens a new
    /// one (capacity miss). Returns whether MIN scores it as a hit.
    pub fn update(&mut self, k: K, ts: TimeSpec) -> bool {
        let column_now = self.compulsory_miss + self.capacity_miss;
        let barrier = self.barrier;
        let hist = self.reserved.entry(k).or_default();

        let live = hist.last().map(|r| r.covers(barrier)).unwrap_or(false);
        if live {
            let res = hist.last_mut().expect("live reservation");
            res.hits += 1;
            self.hits += 1;

            let column_begin = res.last_col();
            let column = column_now - 1;
            res.extend(ts, column);

            // Raise the spanned columns and note how far capacity demand
            // reached.
            let mut last = self.barrier;
            for i in column_begin + 1..=column {
                let idx = (i - self.trim_offset) as usize;
                self.capacity[idx] += 1;
                if self.capacity[idx] >= self.entries as u32 {
                    last = i;
                }
            }
            if last < self.barrier {
                log::error!("MIN column index rolled over; barrier would retreat");
                return true;
            }
            self.barrier = last;
            true
        } else {
            let column = column_now;
            self.capacity_miss += 1;
            hist.push(Reservation::new(ts, column));
            self.capacity.push(1);
            debug_assert_eq!(
                self.capacity.len() as u64,
                self.compulsory_miss + self.capacity_miss - self.trim_offset
            );
            false
        }
    }

    /// Trims decided history and returns `(evict_set, keep_set)`: keys whose
    /// every reservation ended before the barrier, and keys holding a
    /// reservation spanning it.
    pub fn evictions(&mut self) -> (BTreeSet<K>, BTreeSet<K>) {
        let (spans, keep) = self.eviction_spans();
        (spans.into_keys().collect(), keep)
    }

    /// Like [`evictions`](Self::evictions), but hands back the full
    /// reservation history of each evicted key.
    pub fn eviction_spans(&mut self) -> (BTreeMap<K, History>, BTreeSet<K>) {
        let mut keep_set = BTreeSet::new();
        let mut spans = BTreeMap::new();

        let advance = self.barrier - self.trim_offset;
        if advance == 0 {
            return (spans, keep_set);
        }

        self.max_rows = self.max_rows.max(self.reserved.len());

        let barrier = self.barrier;
        let mut evicted = Vec::new();
        for (key, hist) in self.reserved.iter_mut() {
            let mut cut = 0;
            for (i, res) in hist.iter().enumerate() {
                if res.strictly_covers(barrier) {
                    // Confirmed cacheable under perfect knowledge.
                    keep_set.insert(key.clone());
                } else if barrier > res.last_col() {
                    // Dormant: decided, reclaimable.
                    cut = i + 1;
                }
            }
            if cut == hist.len() {
                evicted.push(key.clone());
            } else if cut > 0 {
                hist.drain(..cut);
            }
        }
        for key in evicted {
            if let Some(hist) = self.reserved.remove(&key) {
                spans.insert(key, hist);
            }
        }

        // Keep the barrier column at index 0 so absolute indexing holds.
        self.capacity.drain(..advance as usize);
        self.trim_offset += advance;
        log::debug!(
            "MIN barrier at {}, advanced {} demands",
            self.trim_offset,
            advance
        );

        (spans, keep_set)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.entries
    }

    #[inline]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[inline]
    pub fn capacity_miss(&self) -> u64 {
        self.capacity_miss
    }

    #[inline]
    pub fn compulsory_miss(&self) -> u64 {
        self.compulsory_miss
    }

    #[inline]
    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    #[inline]
    pub fn barrier(&self) -> MinTime {
        self.barrier
    }

    #[inline]
    pub fn trim_offset(&self) -> MinTime {
        self.trim_offset
    }

    #[cfg(test)]
    pub(crate) fn capacity_cells(&self) -> &[u32] {
        &self.capacity
    }

    pub fn print_stats(&self) -> String {
        format!(
            "SimMIN cache size: {}\n - hits: {}\n - miss (compulsory): {}\n - miss (capacity): {}\n - max elements between barriers: {}",
            self.entries, self.hits, self.compulsory_miss, self.capacity_miss, self.max_rows
        )
    }
}
