//! The simulated flow-state cache.
//!
//! [`CacheSim`] owns a vector of equally sized associative sets plus a
//! fully-associative reference set of the same total capacity. Every access
//! is mirrored into the reference so conflict misses can be separated from
//! capacity misses:
//!
//! - both hit: true hit
//! - reference hit, set miss: conflict miss
//! - both miss: capacity miss
//! - reference miss, set hit: conflict hit (bookkeeping only)

pub mod policy;
pub mod set;
pub mod trainer;

pub use policy::{InsertionPolicy, PolicyUnknown, ReplacementPolicy};
pub use set::{AssociativeSet, Eviction, Insertion, SetStats, TrainerOptions};
pub use trainer::{PredictionDump, SharedPredictionDump};

use crate::features::Features;
use crate::flowtable::FlowId;
use crate::perceptron::{HashedPerceptron, PerceptronSettings};
use crate::utils::TimeSpec;

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use anyhow::{bail, Result};
use rand::rngs::StdRng;

/// Compulsory/capacity/conflict miss decomposition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Misses {
    pub compulsory: i64,
    pub capacity: i64,
    pub conflict: i64,
}

impl Misses {
    pub fn total(&self) -> i64 {
        self.compulsory + self.capacity + self.conflict
    }
}

pub struct CacheSim {
    entries: usize,
    hp: Rc<RefCell<HashedPerceptron>>,
    rng: Rc<RefCell<StdRng>>,

    /// Conflict reference: fully associative, default policies.
    fa_ref: AssociativeSet,
    /// The set-associative cache proper. Empty means fully associative only.
    sets: Vec<AssociativeSet>,

    // Cross-classification counters.
    capacity_miss: i64,
    conflict_miss: i64,
    conflict_hit: i64,
}

impl CacheSim {
    /// `ways == 0` selects the fully-associative reference alone.
    pub fn new(
        entries: usize,
        ways: usize,
        hp_settings: &PerceptronSettings,
        trainers: TrainerOptions,
        mut rng: StdRng,
    ) -> Result<Self> {
        if entries == 0 {
            bail!("cache needs a non-zero entry count");
        }
        if ways > 0 && entries % ways != 0 {
            bail!(
                "cache associativity {} does not divide entry count {}",
                ways,
                entries
            );
        }

        let hp = Rc::new(RefCell::new(HashedPerceptron::new(hp_settings, &mut rng)));
        let rng = Rc::new(RefCell::new(rng));

        let fa_ref = AssociativeSet::new(
            entries,
            hp.clone(),
            rng.clone(),
            InsertionPolicy::Mru,
            ReplacementPolicy::Lru,
            trainers.clone(),
        );
        let sets = if ways > 0 {
            (0..entries / ways)
                .map(|_| {
                    AssociativeSet::new(
                        ways,
                        hp.clone(),
                        rng.clone(),
                        InsertionPolicy::Mru,
                        ReplacementPolicy::Lru,
                        trainers.clone(),
                    )
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(CacheSim {
            entries,
            hp,
            rng,
            fa_ref,
            sets,
            capacity_miss: 0,
            conflict_miss: 0,
            conflict_hit: 0,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.entries
    }

    #[inline]
    pub fn num_sets(&self) -> usize {
        if self.sets.is_empty() {
            1
        } else {
            self.sets.len()
        }
    }

    #[inline]
    pub fn associativity(&self) -> usize {
        self.entries / self.num_sets()
    }

    pub fn hp_handle(&self) -> Rc<RefCell<HashedPerceptron>> {
        self.hp.clone()
    }

    pub fn rng_handle(&self) -> Rc<RefCell<StdRng>> {
        self.rng.clone()
    }

    pub fn set(&self, i: usize) -> &AssociativeSet {
        &self.sets[i]
    }

    pub fn fa_ref(&self) -> &AssociativeSet {
        &self.fa_ref
    }

    /// Applies `p` to every way-group. The reference keeps its defaults.
    pub fn set_insert_policy(&mut self, p: InsertionPolicy) {
        for s in &mut self.sets {
            s.set_insert_policy(p);
        }
    }

    pub fn set_replacement_policy(&mut self, p: ReplacementPolicy) {
        for s in &mut self.sets {
            s.set_replacement_policy(p);
        }
    }

    /// Attaches a shared prediction/training CSV dump to every set,
    /// reference included.
    pub fn set_prediction_dump(&mut self, dump: Option<SharedPredictionDump>) {
        self.fa_ref.set_prediction_dump(dump.clone());
        for s in &mut self.sets {
            s.set_prediction_dump(dump.clone());
        }
    }

    fn set_index(&self, k: FlowId) -> usize {
        let mut h = DefaultHasher::new();
        k.hash(&mut h);
        (h.finish() % self.sets.len() as u64) as usize
    }

    /// First-ever occurrence of `k`.
    pub fn insert(&mut self, k: FlowId, t: TimeSpec, f: Features) -> Insertion {
        let ref_out = self.fa_ref.insert(k, t, f.clone());
        if self.sets.is_empty() {
            return ref_out;
        }
        let idx = self.set_index(k);
        self.sets[idx].insert(k, t, f)
    }

    /// Subsequent access of `k`. Returns the way-group verdict.
    pub fn update(&mut self, k: FlowId, t: TimeSpec, f: Features) -> (bool, Insertion) {
        let (ref_hit, ref_out) = self.fa_ref.update(k, t, f.clone());
        if self.sets.is_empty() {
            return (ref_hit, ref_out);
        }
        let idx = self.set_index(k);
        let (way_hit, way_out) = self.sets[idx].update(k, t, f);

        match (ref_hit, way_hit) {
            (true, false) => self.conflict_miss += 1,
            (false, false) => self.capacity_miss += 1,
            (false, true) => self.conflict_hit += 1,
            (true, true) => {}
        }
        (way_hit, way_out)
    }

    /// Invalidates `k` everywhere without involving the replacement policy.
    pub fn flush(&mut self, k: &FlowId) -> Option<set::StackEntry> {
        let ref_entry = self.fa_ref.flush(k);
        if self.sets.is_empty() {
            return ref_entry;
        }
        let idx = self.set_index(*k);
        self.sets[idx].flush(k)
    }

    /// Invalidates everything, returning the drained way-group entries.
    pub fn flush_all(&mut self) -> Vec<(FlowId, set::StackEntry)> {
        let fa = self.fa_ref.flush_all();
        if self.sets.is_empty() {
            return fa;
        }
        let mut out = Vec::new();
        for s in &mut self.sets {
            out.extend(s.flush_all());
        }
        out
    }

    pub fn hits(&self) -> i64 {
        if self.sets.is_empty() {
            return self.fa_ref.stats().hits;
        }
        self.sets.iter().map(|s| s.stats().hits).sum()
    }

    pub fn fa_hits(&self) -> i64 {
        self.fa_ref.stats().hits
    }

    pub fn fa_capacity_miss(&self) -> i64 {
        self.fa_ref.stats().capacity_miss
    }

    pub fn compulsory_miss(&self) -> i64 {
        self.fa_ref.stats().compulsory_miss
    }

    /// Miss decomposition. Conflict misses are the set-level capacity misses
    /// the fully-associative reference would have hit.
    pub fn misses(&self) -> Misses {
        if self.sets.is_empty() {
            return Misses {
                compulsory: self.fa_ref.stats().compulsory_miss,
                capacity: self.fa_ref.stats().capacity_miss,
                conflict: 0,
            };
        }
        let compulsory: i64 = self.sets.iter().map(|s| s.stats().compulsory_miss).sum();
        let set_capacity: i64 = self.sets.iter().map(|s| s.stats().capacity_miss).sum();
        let conflict = set_capacity - self.fa_ref.stats().capacity_miss;
        debug_assert_eq!(compulsory, self.fa_ref.stats().compulsory_miss);
        Misses {
            compulsory,
            capacity: set_capacity - conflict,
            conflict,
        }
    }

    pub fn pure_capacity_miss(&self) -> i64 {
        self.capacity_miss
    }

    pub fn pure_conflict_miss(&self) -> i64 {
        self.conflict_miss
    }

    pub fn pure_conflict_hits(&self) -> i64 {
        self.conflict_hit
    }

    fn sum_stats<F: Fn(&SetStats) -> i64>(&self, f: F) -> i64 {
        if self.sets.is_empty() {
            return f(self.fa_ref.stats());
        }
        self.sets.iter().map(|s| f(s.stats())).sum()
    }

    pub fn replacements_lru(&self) -> i64 {
        self.sum_stats(|s| s.replacement_lru)
    }

    pub fn replacements_early(&self) -> i64 {
        self.sum_stats(|s| s.replacement_early)
    }

    pub fn prediction_bc(&self) -> i64 {
        self.sum_stats(|s| s.prediction_bc)
    }

    pub fn prediction_rc(&self) -> i64 {
        self.sum_stats(|s| s.prediction_rc)
    }

    pub fn replacements_eager(&self) -> i64 {
        self.sum_stats(|s| s.eager_early_replacement)
    }

    pub fn insert_predict_distant(&self) -> i64 {
        self.sum_stats(|s| s.insert_predict_distant)
    }

    /// `(bypass, evict)` perceptron prediction counts.
    pub fn predictions_hp(&self) -> (i64, i64) {
        (
            self.sum_stats(|s| s.prediction_hp_bypass),
            self.sum_stats(|s| s.prediction_hp_evict),
        )
    }

    pub fn replacement_recency(&self) -> f64 {
        let sum = self.sum_stats(|s| s.replacement_recency);
        let misses = self.sum_stats(|s| s.compulsory_miss + s.capacity_miss);
        if misses == 0 {
            return 0.0;
        }
        sum as f64 / misses as f64
    }

    pub fn print_stats(&self) -> String {
        let m = self.misses();
        let (hp_bypass, hp_evict) = self.predictions_hp();
        let mut s = format!(
            "SimCache size: {}\n - associativity: {}-way\n - sets: {}\n - hits: {}\n - miss (compulsory): {}\n - miss (capacity): {}\n - miss (conflict): {}\n - hits FA: {}\n - miss FA (capacity): {}\n - pure conflict hits: {}\n - pure conflict misses: {}\n - replacements LRU: {}\n - replacements early: {}\n - confident burst count: {}\n - confident ref count: {}\n - eager replace caught: {}\n - insert predict distant: {}\n - replacement recency: {:.3}\n - predictions (bypass, evict): ({}, {})\n",
            self.entries,
            self.associativity(),
            self.num_sets(),
            self.hits(),
            m.compulsory,
            m.capacity,
            m.conflict,
            self.fa_hits(),
            self.fa_capacity_miss(),
            self.pure_conflict_hits(),
            self.pure_conflict_miss(),
            self.replacements_lru(),
            self.replacements_early(),
            self.prediction_bc(),
            self.prediction_rc(),
            self.replacements_eager(),
            self.insert_predict_distant(),
            self.replacement_recency(),
            hp_bypass,
            hp_evict,
        );
        s.push_str(&self.hp.borrow().print_stats());
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowtable::record::FlowRecord;
    use crate::protocols::{Fields, FlowKey, IP_PROTO_TCP, PROTO_IPV4, PROTO_TCP};
    use rand::SeedableRng;

    fn feats(id: FlowId) -> Features {
        let port = (id % 60000) as u16;
        let fields = Rc::new(Fields {
            proto_flags: PROTO_IPV4 | PROTO_TCP,
            ipv4_src: id as u32,
            ipv4_dst: 2,
            src_port: port,
            dst_port: 80,
            ip_proto: IP_PROTO_TCP,
            ..Default::default()
        });
        let key = FlowKey::new(id as u32, 2, port, 80, IP_PROTO_TCP);
        let record = Rc::new(RefCell::new(FlowRecord::new(
            id,
            key,
            TimeSpec::default(),
            false,
        )));
        record
            .borrow_mut()
            .update(&fields, 60, 0, TimeSpec::default());
        Features::new(fields, record)
    }

    fn make_cache(entries: usize, ways: usize) -> CacheSim {
        let settings = PerceptronSettings {
            randomize: false,
            dynamic_threshold: false,
            ..Default::default()
        };
        CacheSim::new(
            entries,
            ways,
            &settings,
            TrainerOptions::default(),
            StdRng::seed_from_u64(3),
        )
        .unwrap()
    }

    fn t(s: i64) -> TimeSpec {
        TimeSpec::new(s, 0)
    }

    fn drive(cache: &mut CacheSim, stream: &[FlowId]) {
        let mut seen = std::collections::BTreeSet::new();
        for (i, &k) in stream.iter().enumerate() {
            if seen.insert(k) {
                cache.insert(k, t(i as i64), feats(k));
            } else {
                cache.update(k, t(i as i64), feats(k));
            }
        }
    }

    #[test]
    fn core_cache_invalid_geometry_rejected() {
        let settings = PerceptronSettings::default();
        assert!(CacheSim::new(
            10,
            4,
            &settings,
            TrainerOptions::default(),
            StdRng::seed_from_u64(0)
        )
        .is_err());
        assert!(CacheSim::new(
            0,
            0,
            &settings,
            TrainerOptions::default(),
            StdRng::seed_from_u64(0)
        )
        .is_err());
    }

    #[test]
    fn core_cache_miss_decomposition_identity() {
        let mut cache = make_cache(8, 2);
        let stream: Vec<FlowId> = (0..20).chain(0..20).chain(5..15).collect();
        drive(&mut cache, &stream);

        let m = cache.misses();
        assert_eq!(
            cache.hits() + m.total(),
            stream.len() as i64,
            "hits + misses must cover every access"
        );
        // Compulsory misses equal distinct flows in the FA reference.
        assert_eq!(m.compulsory, 20);
        assert!(m.conflict >= 0);
    }

    #[test]
    fn core_cache_fa_only_mode() {
        let mut cache = make_cache(4, 0);
        assert_eq!(cache.num_sets(), 1);
        assert_eq!(cache.associativity(), 4);
        let stream: Vec<FlowId> = vec![1, 2, 3, 1, 2, 3, 9, 1];
        drive(&mut cache, &stream);
        let m = cache.misses();
        assert_eq!(m.conflict, 0);
        assert_eq!(cache.hits() + m.total(), stream.len() as i64);
    }

    #[test]
    fn core_cache_cross_classification_identities() {
        let mut cache = make_cache(8, 2);
        let stream: Vec<FlowId> = (0..12).chain((0..12).rev()).chain(0..12).collect();
        drive(&mut cache, &stream);
        let m = cache.misses();
        // The decomposition agrees with the per-access classification.
        assert_eq!(m.conflict, cache.pure_conflict_miss() - cache.pure_conflict_hits());
        assert_eq!(m.capacity, cache.pure_capacity_miss() + cache.pure_conflict_hits());
        assert_eq!(cache.hits() + m.total(), stream.len() as i64);
    }

    #[test]
    fn core_cache_policy_applies_to_sets_not_reference() {
        let mut cache = make_cache(4, 2);
        cache.set_replacement_policy(ReplacementPolicy::Srrip);
        cache.set_insert_policy(InsertionPolicy::Ship);
        let stream: Vec<FlowId> = vec![1, 2, 3, 4, 5, 1, 2, 3];
        drive(&mut cache, &stream);
        // The reference still classifies with plain LRU; the identity holds.
        assert_eq!(cache.hits() + cache.misses().total(), stream.len() as i64);
    }

    #[test]
    fn core_cache_flush_clears_everywhere() {
        let mut cache = make_cache(4, 2);
        drive(&mut cache, &[1, 2, 3]);
        assert!(cache.flush(&1).is_some());
        let (hit, _) = cache.update(1, t(10), feats(1));
        assert!(!hit);

        let drained = cache.flush_all();
        assert!(!drained.is_empty());
        let (hit, _) = cache.update(2, t(11), feats(2));
        assert!(!hit);
    }
}
