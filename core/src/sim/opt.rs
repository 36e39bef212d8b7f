//! Bypass-aware variant of the MIN simulator.
//!
//! MIN reserves a cache slot on every demand. OPT withholds the reservation
//! until a key's re-reference window shows `bypass_threshold` accesses, so
//! one-hit wonders never occupy a column when the threshold is raised above
//! 1. At the default threshold of 1 the two simulators agree.

use super::MinTime;
use crate::utils::TimeSpec;

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

/// Whether a decided span ever earned a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptAction {
    Bypass,
    Reserve,
}

/// One confirmed residency span in OPT time.
#[derive(Debug, Clone)]
pub struct ReservationOpt {
    first: MinTime,
    last: MinTime,
    refs: usize,
    action: OptAction,
}

impl ReservationOpt {
    fn new(first: MinTime, last: MinTime, refs: usize) -> Self {
        ReservationOpt {
            first,
            last,
            refs,
            action: OptAction::Reserve,
        }
    }

    #[inline]
    pub fn first(&self) -> MinTime {
        self.first
    }

    #[inline]
    pub fn last(&self) -> MinTime {
        self.last
    }

    #[inline]
    pub fn refs(&self) -> usize {
        self.refs
    }

    #[inline]
    pub fn reserved(&self) -> bool {
        self.action == OptAction::Reserve
    }

    /// Extends the span to `t`, returning the previous end: the column from
    /// which the capacity vector needs marking.
    fn extend(&mut self, t: MinTime) -> MinTime {
        let prev = self.last;
        self.last = t;
        self.refs += 1;
        prev
    }
}

/// Reuse window and reservation history for one key.
#[derive(Debug)]
struct OptHistory {
    /// Most recent access columns, at most `threshold` of them.
    references: Vec<MinTime>,
    threshold: usize,
    reservations: Vec<ReservationOpt>,
}

impl OptHistory {
    fn new(threshold: usize, t: MinTime) -> Self {
        let mut h = OptHistory {
            references: Vec::with_capacity(threshold),
            threshold,
            reservations: Vec::new(),
        };
        h.note(t);
        if threshold == 1 {
            h.extend(t);
        }
        h
    }

    /// Records an access, overwriting the oldest once the window is full.
    fn note(&mut self, t: MinTime) {
        if self.references.len() < self.threshold {
            self.references.push(t);
        } else if let Some(min) = self.references.iter_mut().min() {
            *min = t;
        }
    }

    fn oldest_reference(&self) -> Option<MinTime> {
        self.references.iter().min().copied()
    }

    /// Reservable: the window is full and entirely at or past the barrier.
    fn eligible(&self, barrier: MinTime) -> bool {
        self.references.len() == self.threshold
            && self.oldest_reference().map(|m| m >= barrier).unwrap_or(false)
    }

    /// Creates or extends the live reservation, returning the first column
    /// to mark.
    fn extend(&mut self, t: MinTime) -> MinTime {
        match self.reservations.last_mut() {
            Some(res) if res.reserved() => res.extend(t),
            _ => {
                let first = self.oldest_reference().unwrap_or(t);
                self.reservations
                    .push(ReservationOpt::new(first, t, self.references.len()));
                first
            }
        }
    }

    /// Records an access; if eligible, extends the reservation and returns
    /// the column to start marking from.
    fn update(&mut self, t: MinTime, barrier: MinTime) -> Option<MinTime> {
        self.note(t);
        if self.eligible(barrier) {
            Some(self.extend(t))
        } else {
            None
        }
    }

    /// Extracts decided reservations. A live final reservation stays behind.
    fn check_expired(&mut self, barrier: MinTime) -> Vec<ReservationOpt> {
        let alive = self.oldest_reference().map(|m| m >= barrier).unwrap_or(false);
        if self.reservations.is_empty() || !alive {
            std::mem::take(&mut self.reservations)
        } else {
            let keep = self.reservations.split_off(self.reservations.len() - 1);
            std::mem::replace(&mut self.reservations, keep)
        }
    }

    fn decided(&self, barrier: MinTime) -> bool {
        self.reservations.is_empty()
            && self.oldest_reference().map(|m| m < barrier).unwrap_or(true)
    }
}

pub struct SimOpt<K> {
    entries: usize,
    bypass_threshold: usize,
    barrier: MinTime,
    trim_offset: MinTime,
    reserved: HashMap<K, OptHistory>,
    capacity: Vec<u32>,

    hits: u64,
    capacity_miss: u64,
    compulsory_miss: u64,
    max_elements: usize,
}

impl<K> SimOpt<K>
where
    K: Eq + Hash + Ord + Clone,
{
    pub fn new(entries: usize) -> Self {
        Self::with_threshold(entries, 1)
    }

    /// `bypass_threshold` accesses must land inside the re-reference window
    /// before a key earns a reservation. Threshold 1 matches MIN.
    pub fn with_threshold(entries: usize, bypass_threshold: usize) -> Self {
        assert!(entries > 0, "OPT simulator needs a non-zero cache size");
        assert!(bypass_threshold >= 1, "bypass threshold must be >= 1");
        SimOpt {
            entries,
            bypass_threshold,
            barrier: 0,
            trim_offset: 0,
            reserved: HashMap::with_capacity(entries * 16),
            capacity: Vec::new(),
            hits: 0,
            capacity_miss: 0,
            compulsory_miss: 0,
            max_elements: 0,
        }
    }

    fn internal_insert(&mut self, k: K) {
        let column = self.compulsory_miss + self.capacity_miss - 1;
        self.reserved
            .insert(k, OptHistory::new(self.bypass_threshold, column));
        // A threshold-1 history reserves its own demand column immediately.
        let reserved = if self.bypass_threshold == 1 { 1 } else { 0 };
        self.capacity.push(reserved);
        debug_assert_eq!(
            self.capacity.len() as u64,
            self.compulsory_miss + self.capacity_miss - self.trim_offset
        );
    }

    /// First occurrence of `k`.
    pub fn insert(&mut self, k: K, _ts: TimeSpec) {
        self.compulsory_miss += 1;
        self.internal_insert(k);
    }

    /// Re-access of `k`. Returns whether OPT scores a confirmed hit.
    pub fn update(&mut self, k: K, _ts: TimeSpec) -> bool {
        let column = self.compulsory_miss + self.capacity_miss;
        let barrier = self.barrier;
        if let Some(hist) = self.reserved.get_mut(&k) {
            if let Some(first) = hist.update(column, barrier) {
                self.hits += 1;
                let mut moved = self.barrier;
                for i in first..column {
                    let idx = (i - self.trim_offset) as usize;
                    self.capacity[idx] += 1;
                    if self.capacity[idx] >= self.entries as u32 {
                        if i < self.barrier {
                            log::error!("OPT column index rolled over; barrier would retreat");
                        }
                        moved = i;
                    }
                }
                self.barrier = moved;
                return true;
            }
            // Window not yet eligible; neither a confirmed hit nor a slot.
            return false;
        }
        self.capacity_miss += 1;
        self.internal_insert(k);
        false
    }

    /// Trims decided history, returning `(evict_set, bypass_set)`.
    ///
    /// The bypass set only carries keys whose decided span never met the
    /// reuse threshold; with `bypass_threshold > 1` keys whose final window
    /// never confirmed are dropped without being reported, so the set can
    /// under-count bypasses.
    pub fn evictions(&mut self) -> (BTreeSet<K>, BTreeSet<K>) {
        let mut evict_set = BTreeSet::new();
        let mut bypass_set = BTreeSet::new();

        let advance = self.barrier - self.trim_offset;
        if advance == 0 {
            return (evict_set, bypass_set);
        }
        self.max_elements = self.max_elements.max(self.reserved.len());

        let barrier = self.barrier;
        let mut dead = Vec::new();
        for (key, hist) in self.reserved.iter_mut() {
            for res in hist.check_expired(barrier) {
                if res.reserved() {
                    evict_set.insert(key.clone());
                } else {
                    bypass_set.insert(key.clone());
                }
            }
            if hist.decided(barrier) {
                dead.push(key.clone());
            }
        }
        for key in dead {
            self.reserved.remove(&key);
        }

        self.capacity.drain(..advance as usize);
        self.trim_offset += advance;
        log::debug!(
            "OPT barrier at {}, advanced {} demands",
            self.trim_offset,
            advance
        );
        (evict_set, bypass_set)
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
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    pub fn print_stats(&self) -> String {
        format!(
            "SimOPT cache size: {}\n - hits: {}\n - miss (compulsory): {}\n - miss (capacity): {}\n - max elements between barriers: {}",
            self.entries, self.hits, self.compulsory_miss, self.capacity_miss, self.max_elements
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMin;

    fn ts(sec: i64) -> TimeSpec {
        TimeSpec::new(sec, 0)
    }

    fn run_opt(sim: &mut SimOpt<u64>, stream: &[u64]) {
        let mut seen = std::collections::BTreeSet::new();
        for (i, &k) in stream.iter().enumerate() {
            if seen.insert(k) {
                sim.insert(k, ts(i as i64));
            } else {
                sim.update(k, ts(i as i64));
            }
        }
    }

    #[test]
    fn core_opt_threshold_one_matches_min() {
        let stream: Vec<u64> = vec![0, 1, 2, 0, 1, 2, 3, 0, 3];
        let mut opt = SimOpt::new(2);
        let mut min = SimMin::new(2);
        run_opt(&mut opt, &stream);
        let mut seen = std::collections::BTreeSet::new();
        for (i, &k) in stream.iter().enumerate() {
            if seen.insert(k) {
                min.insert(k, ts(i as i64));
            } else {
                min.update(k, ts(i as i64));
            }
        }
        assert_eq!(opt.compulsory_miss(), min.compulsory_miss());
        assert_eq!(
            opt.hits() + opt.capacity_miss() + opt.compulsory_miss(),
            stream.len() as u64
        );
    }

    #[test]
    fn core_opt_accounting_identity() {
        let mut opt = SimOpt::new(4);
        let stream: Vec<u64> = (0..8).chain(0..8).collect();
        run_opt(&mut opt, &stream);
        assert_eq!(
            opt.hits() + opt.capacity_miss() + opt.compulsory_miss(),
            stream.len() as u64
        );
    }

    #[test]
    fn core_opt_threshold_two_ignores_one_hit_wonders() {
        // With threshold 2 a key needs two accesses inside the window to
        // occupy a slot; singletons never pressure the capacity vector.
        let mut opt = SimOpt::with_threshold(2, 2);
        // Hot pair reused heavily, cold keys seen once each.
        let stream: Vec<u64> = vec![0, 1, 0, 1, 100, 0, 1, 101, 0, 1, 102, 0, 1];
        run_opt(&mut opt, &stream);
        // Cold keys contribute compulsory misses only; the hot pair keeps
        // hitting once its window fills.
        assert_eq!(opt.compulsory_miss(), 5);
        assert!(opt.hits() >= 4);
    }

    #[test]
    fn core_opt_evictions_after_pressure() {
        let mut opt = SimOpt::new(2);
        // The first working set dies once the barrier passes its spans.
        run_opt(&mut opt, &[0, 1, 2, 0, 1, 2, 5, 6, 5, 6, 5, 6]);
        let (evict, bypass) = opt.evictions();
        assert!(bypass.is_empty());
        assert!(evict.contains(&0));
        assert!(evict.contains(&1));
        assert!(evict.contains(&2));
        // The live working set is still undecided.
        assert!(!evict.contains(&5));
        assert!(!evict.contains(&6));
    }
}
