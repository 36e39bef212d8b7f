//! One cache way-group: a recency-ordered stack with policy hooks.
//!
//! Entries live in an `IndexMap` whose index order is the recency order,
//! front (index 0) = MRU. A hit at MRU extends the entry's current burst;
//! a hit elsewhere opens a new burst and splices the entry to the front,
//! demoting the previous MRU. Demotion and eviction are the points where
//! the pattern table and the predictors take their notes.

use super::policy::{InsertionPolicy, ReplacementPolicy};
use super::trainer::{
    BeladyTrainer, HistoryTrainer, Prediction, SharedPredictionDump, TrainerStats,
};
use crate::features::{Features, SharedBurstStats};
use crate::flowtable::FlowId;
use crate::perceptron::HashedPerceptron;
use crate::sim::Reservation;
use crate::utils::{Clamped, TimeSpec};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::Rng;

/// Tolerable count delta before a saved pattern is penalized. Zero demands
/// an exact match.
pub const CONFIDENCE_DELTA: i64 = 0;

pub type SharedPerceptron = Rc<RefCell<HashedPerceptron>>;
pub type SharedRng = Rc<RefCell<StdRng>>;

/// One resident cache entry.
#[derive(Debug)]
pub struct StackEntry {
    /// Residency span in capture time and miss columns.
    pub res: Reservation,
    /// Hits since installation, this residency.
    pub ref_count: u32,
    /// Predicted end-of-life; candidates for early replacement.
    pub eol: bool,
    /// RRIP re-reference distance; minimum means most distant.
    pub rr_distance: Clamped<2>,
    /// Hit counts per MRU burst, shared with the blessed feature vector.
    pub hits: SharedBurstStats,
    /// Feature vector blessed to this entry.
    pub features: Features,
}

impl StackEntry {
    fn new(res: Reservation, mut features: Features) -> Self {
        let hits: SharedBurstStats = Rc::new(RefCell::new(vec![1]));
        features.set_burst_stats(&hits);
        features.bless();
        StackEntry {
            res,
            ref_count: 1,
            eol: false,
            rr_distance: Clamped::max_value(),
            hits,
            features,
        }
    }
}

/// Prediction-table entry. Persists across evictions of its flow.
#[derive(Debug)]
pub struct PtEntry {
    /// Saved burst count; -1 marks the first residency.
    pub bc_saved: i64,
    /// Saved reference count.
    pub rc_saved: i64,
    pub bc_confidence: Clamped<5>,
    pub rc_confidence: Clamped<5>,
    /// SHiP-style reuse counter; minimum predicts distant reuse.
    pub ship_reuse: Clamped<2>,
}

impl Default for PtEntry {
    fn default() -> Self {
        PtEntry {
            bc_saved: -1,
            rc_saved: -1,
            bc_confidence: Clamped::new(-1),
            rc_confidence: Clamped::new(-1),
            ship_reuse: Clamped::max_value(),
        }
    }
}

/// A victim surrendered by the set, with its residency record.
#[derive(Debug)]
pub struct Eviction {
    pub key: FlowId,
    pub res: Reservation,
    pub hits: SharedBurstStats,
}

/// Outcome of an installation attempt.
#[derive(Debug)]
pub enum Insertion {
    /// Entry installed; a victim may have been displaced.
    Installed(Option<Eviction>),
    /// The bypass predictor rejected the installation.
    Bypassed,
}

impl Insertion {
    pub fn eviction(self) -> Option<Eviction> {
        match self {
            Insertion::Installed(e) => e,
            Insertion::Bypassed => None,
        }
    }

    pub fn bypassed(&self) -> bool {
        matches!(self, Insertion::Bypassed)
    }
}

/// Training-path switches, threaded in from configuration.
#[derive(Debug, Clone)]
pub struct TrainerOptions {
    /// Delayed prediction-versus-reality feedback loop.
    pub history_training: bool,
    /// Train toward keep when a dead-marked entry gets promoted.
    pub eol_hit_correction: bool,
    /// Oracle-driven negative reinforcement from the per-set MIN instance.
    pub belady_evict_training: bool,
    /// Oracle-driven positive reinforcement.
    pub belady_keep_training: bool,
    /// Run the dead-block inference on MRU demotion instead of on touch.
    pub dbp_on_demotion: bool,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        TrainerOptions {
            history_training: true,
            eol_hit_correction: true,
            belady_evict_training: false,
            belady_keep_training: false,
            dbp_on_demotion: false,
        }
    }
}

/// Per-set counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetStats {
    pub hits: i64,
    pub compulsory_miss: i64,
    pub capacity_miss: i64,

    pub replacement_lru: i64,
    pub replacement_early: i64,
    pub prediction_bc: i64,
    pub prediction_rc: i64,
    pub prediction_hp_evict: i64,
    pub prediction_hp_bypass: i64,
    pub eager_early_replacement: i64,
    pub insert_predict_distant: i64,
    /// Sum of victim distances from MRU under RRIP selection.
    pub replacement_recency: i64,
    /// Hits where the Belady oracle agreed.
    pub perfect_hits: i64,
}

pub struct AssociativeSet {
    ways: usize,
    insert_policy: InsertionPolicy,
    replace_policy: ReplacementPolicy,

    /// Recency stack; index 0 = MRU, last index = LRU.
    stack: IndexMap<FlowId, StackEntry>,
    /// Pattern metadata independent of residency.
    pt: HashMap<FlowId, PtEntry>,

    hp: SharedPerceptron,
    rng: SharedRng,
    history: HistoryTrainer,
    belady: Option<BeladyTrainer>,
    opts: TrainerOptions,
    dump: Option<SharedPredictionDump>,

    stats: SetStats,
}

impl AssociativeSet {
    pub fn new(
        ways: usize,
        hp: SharedPerceptron,
        rng: SharedRng,
        insert_policy: InsertionPolicy,
        replace_policy: ReplacementPolicy,
        opts: TrainerOptions,
    ) -> Self {
        let belady = if opts.belady_evict_training || opts.belady_keep_training {
            Some(BeladyTrainer::new(
                ways,
                opts.belady_evict_training,
                opts.belady_keep_training,
            ))
        } else {
            None
        };
        AssociativeSet {
            ways,
            insert_policy,
            replace_policy,
            stack: IndexMap::with_capacity(ways + 1),
            pt: HashMap::new(),
            hp,
            rng,
            history: HistoryTrainer::new(ways, ways),
            belady,
            opts,
            dump: None,
            stats: SetStats::default(),
        }
    }

    /// Attaches the shared prediction/training CSV dump.
    pub fn set_prediction_dump(&mut self, dump: Option<SharedPredictionDump>) {
        self.history.set_dump(dump.clone());
        if let Some(b) = &mut self.belady {
            b.set_dump(dump.clone());
        }
        self.dump = dump;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    #[inline]
    pub fn ways(&self) -> usize {
        self.ways
    }

    #[inline]
    pub fn contains(&self, k: &FlowId) -> bool {
        self.stack.contains_key(k)
    }

    /// Keys in recency order, MRU first.
    pub fn recency_keys(&self) -> Vec<FlowId> {
        self.stack.keys().copied().collect()
    }

    #[inline]
    pub fn stats(&self) -> &SetStats {
        &self.stats
    }

    #[inline]
    pub fn trainer_stats(&self) -> TrainerStats {
        self.history.stats()
    }

    pub fn pattern_entry(&self, k: &FlowId) -> Option<&PtEntry> {
        self.pt.get(k)
    }

    pub fn set_insert_policy(&mut self, p: InsertionPolicy) {
        self.insert_policy = p;
    }

    pub fn set_replacement_policy(&mut self, p: ReplacementPolicy) {
        self.replace_policy = p;
    }

    /// First-ever occurrence of `k`: a compulsory miss.
    pub fn insert(&mut self, k: FlowId, t: TimeSpec, features: Features) -> Insertion {
        let hp_rc = self.hp.clone();
        let rng_rc = self.rng.clone();
        let mut hp_guard = hp_rc.borrow_mut();
        let mut rng_guard = rng_rc.borrow_mut();
        let hp = &mut *hp_guard;
        let rng = &mut *rng_guard;

        self.stats.compulsory_miss += 1;

        if let Some(b) = &mut self.belady {
            b.insert(k, &features, t);
        }

        if self.insert_policy == InsertionPolicy::HpBypass
            && !self.bypass_check(k, &features, hp, rng)
        {
            return Insertion::Bypassed;
        }

        Insertion::Installed(self.install(k, t, features, rng))
    }

    /// Any subsequent access of `k`: hit, re-install, or bypass.
    pub fn update(&mut self, k: FlowId, t: TimeSpec, features: Features) -> (bool, Insertion) {
        let hp_rc = self.hp.clone();
        let rng_rc = self.rng.clone();
        let mut hp_guard = hp_rc.borrow_mut();
        let mut rng_guard = rng_rc.borrow_mut();
        let hp = &mut *hp_guard;
        let rng = &mut *rng_guard;

        let mut belady_hit = false;
        if let Some(b) = &mut self.belady {
            belady_hit = b.touch(k, &features, t, hp, rng);
        }

        if self.opts.history_training
            && (self.insert_policy == InsertionPolicy::HpBypass
                || self.replace_policy == ReplacementPolicy::HpLru)
        {
            self.history.touch(k, hp, rng);
        }

        let column = (self.stats.compulsory_miss + self.stats.capacity_miss) as u64;
        if let Some(idx) = self.stack.get_index_of(&k) {
            self.stats.hits += 1;
            {
                let (_, entry) = self.stack.get_index_mut(idx).expect("hit index");
                entry.ref_count += 1;
                entry.res.extend(t, column);
            }

            if idx == 0 {
                {
                    let (_, entry) = self.stack.get_index_mut(0).expect("mru");
                    let mut h = entry.hits.borrow_mut();
                    if let Some(last) = h.last_mut() {
                        // Burst continues at MRU.
                        *last += 1;
                    }
                }
                self.event_mru_hit();
            } else {
                {
                    let (_, entry) = self.stack.get_index_mut(idx).expect("hit index");
                    // New burst opens on promotion.
                    entry.hits.borrow_mut().push(1);
                }
                self.stack.move_index(idx, 0);
                self.event_mru_demotion(hp, rng);
            }

            if belady_hit {
                self.stats.perfect_hits += 1;
            }

            {
                let (_, entry) = self.stack.get_index_mut(0).expect("mru");
                if let Err(e) = entry.features.merge(&features) {
                    log::error!("feature merge on hit failed: {}", e);
                }
            }

            if !self.opts.dbp_on_demotion && self.replace_policy == ReplacementPolicy::HpLru {
                self.predict_dead(0, hp, rng);
            }

            (true, Insertion::Installed(None))
        } else {
            self.stats.capacity_miss += 1;
            if self.insert_policy == InsertionPolicy::HpBypass
                && !self.bypass_check(k, &features, hp, rng)
            {
                return (false, Insertion::Bypassed);
            }
            (false, Insertion::Installed(self.install(k, t, features, rng)))
        }
    }

    /// Invalidates one entry without consulting the replacement policy.
    pub fn flush(&mut self, k: &FlowId) -> Option<StackEntry> {
        self.stack.shift_remove(k)
    }

    /// Invalidates everything.
    pub fn flush_all(&mut self) -> Vec<(FlowId, StackEntry)> {
        self.stack.drain(..).collect()
    }

    /// Consults the bypass predictor; returns whether to install. Records
    /// the prediction for delayed confirmation.
    fn bypass_check(
        &mut self,
        k: FlowId,
        features: &Features,
        hp: &mut HashedPerceptron,
        rng: &mut StdRng,
    ) -> bool {
        match features.gather(rng, true) {
            Ok(fk) => {
                let inf = hp.inference(&fk, true);
                if self.opts.history_training {
                    self.history.record(
                        k,
                        Prediction {
                            features: features.clone(),
                            keep: inf.keep,
                            demand: true,
                        },
                        hp,
                        rng,
                    );
                }
                if !inf.keep {
                    self.stats.prediction_hp_bypass += 1;
                    if let Some(d) = &self.dump {
                        d.borrow_mut().log_bypass(k, &inf.weights, &fk);
                    }
                }
                inf.keep
            }
            Err(e) => {
                log::error!("bypass inference skipped: {}", e);
                true
            }
        }
    }

    /// Dead-block inference on the entry at `idx`; a negative verdict marks
    /// it end-of-life.
    fn predict_dead(&mut self, idx: usize, hp: &mut HashedPerceptron, rng: &mut StdRng) {
        let (key, features) = {
            let (k, e) = self.stack.get_index(idx).expect("entry index");
            (*k, e.features.clone())
        };
        match features.gather(rng, false) {
            Ok(fk) => {
                let inf = hp.inference(&fk, true);
                if !inf.keep {
                    self.stats.prediction_hp_evict += 1;
                    self.stack.get_index_mut(idx).expect("entry index").1.eol = true;
                    if let Some(d) = &self.dump {
                        d.borrow_mut().log_evict(key, &inf.weights, &fk);
                    }
                }
                if self.opts.history_training {
                    self.history.record(
                        key,
                        Prediction {
                            features,
                            keep: inf.keep,
                            demand: true,
                        },
                        hp,
                        rng,
                    );
                }
            }
            Err(e) => log::error!("dead-block inference skipped: {}", e),
        }
    }

    /// Installs `k`, evicting a victim first if the set is full.
    fn install(
        &mut self,
        k: FlowId,
        t: TimeSpec,
        features: Features,
        rng: &mut StdRng,
    ) -> Option<Eviction> {
        let column = (self.stats.compulsory_miss + self.stats.capacity_miss) as u64;
        let entry = StackEntry::new(Reservation::new(t, column), features);

        let mut eviction = None;
        if self.stack.len() >= self.ways {
            let vidx = self.find_victim(rng);
            // Pattern notes are taken while the victim is still in place.
            self.note_eviction(vidx);
            let (vk, ventry) = self.stack.shift_remove_index(vidx).expect("victim index");
            eviction = Some(Eviction {
                key: vk,
                res: ventry.res,
                hits: ventry.hits,
            });
        }

        let pos = self.find_insert_pos(k, rng);
        self.stack.insert(k, entry);
        let last = self.stack.len() - 1;
        if pos < last {
            self.stack.move_index(last, pos);
        }
        eviction
    }

    /// Insertion position in recency order, `0..=len`.
    fn find_insert_pos(&mut self, k: FlowId, rng: &mut StdRng) -> usize {
        let len = self.stack.len();
        match self.insert_policy {
            // HP_BYPASS installs at MRU once it decides to install at all.
            InsertionPolicy::Mru | InsertionPolicy::HpBypass => 0,
            InsertionPolicy::Lru => len,
            InsertionPolicy::Random => rng.gen_range(0..=len),
            InsertionPolicy::Ship => {
                let pte = self.pt.entry(k).or_default();
                if pte.ship_reuse.at_min() {
                    self.stats.insert_predict_distant += 1;
                    len
                } else {
                    0
                }
            }
            InsertionPolicy::Bypass => {
                if !self.pt.contains_key(&k) {
                    // Never resident before: predicted distant reuse.
                    self.stats.insert_predict_distant += 1;
                    len
                } else {
                    0
                }
            }
        }
    }

    /// Victim index under the replacement policy.
    fn find_victim(&mut self, rng: &mut StdRng) -> usize {
        let len = self.stack.len();
        match self.replace_policy {
            ReplacementPolicy::Lru => {
                self.stats.replacement_lru += 1;
                len - 1
            }
            ReplacementPolicy::Mru => 0,
            ReplacementPolicy::Random => rng.gen_range(0..len),
            ReplacementPolicy::BurstLru | ReplacementPolicy::HpLru => {
                match self.find_expired() {
                    Some(idx) => {
                        self.stats.replacement_early += 1;
                        idx
                    }
                    None => {
                        self.stats.replacement_lru += 1;
                        len - 1
                    }
                }
            }
            ReplacementPolicy::Srrip | ReplacementPolicy::SrripCb => self.find_rrip_distant(),
        }
    }

    /// Oldest entry marked end-of-life, if any.
    fn find_expired(&self) -> Option<usize> {
        (0..self.stack.len())
            .rev()
            .find(|&i| self.stack.get_index(i).map(|(_, e)| e.eol).unwrap_or(false))
    }

    /// Oldest entry at minimum RR distance; ages the whole set until one
    /// exists. Aging at saturation is a no-op, so the loop terminates.
    fn find_rrip_distant(&mut self) -> usize {
        loop {
            for idx in (0..self.stack.len()).rev() {
                let (_, e) = self.stack.get_index(idx).expect("index in range");
                if e.rr_distance.at_min() {
                    self.stats.replacement_recency += idx as i64;
                    return idx;
                }
            }
            for e in self.stack.values_mut() {
                e.rr_distance.decr();
            }
        }
    }

    /// Notes pattern metadata for the entry at `vidx` before it is evicted.
    fn note_eviction(&mut self, vidx: usize) {
        let (key, burst_count, ref_count) = {
            let (k, e) = self.stack.get_index(vidx).expect("victim index");
            (*k, e.hits.borrow().len() as i64, e.ref_count as i64)
        };
        let pte = self.pt.entry(key).or_default();

        let bc_delta = pte.bc_saved - burst_count;
        if bc_delta == 0 {
            pte.bc_confidence.incr();
        } else if bc_delta.abs() > CONFIDENCE_DELTA {
            pte.bc_confidence.decr();
            pte.bc_saved = burst_count;
        } else {
            pte.bc_saved = pte.bc_saved.min(burst_count);
        }

        let rc_delta = pte.rc_saved - ref_count;
        if rc_delta == 0 {
            pte.rc_confidence.incr();
        } else if rc_delta.abs() > CONFIDENCE_DELTA {
            pte.rc_confidence.decr();
            pte.rc_saved = ref_count;
        } else {
            pte.rc_saved = pte.rc_saved.min(ref_count);
        }

        if ref_count == 1 {
            // Not re-referenced before eviction.
            pte.ship_reuse.decr();
        } else {
            pte.ship_reuse.incr();
        }
    }

    /// Bookkeeping for a hit at MRU.
    fn event_mru_hit(&mut self) {
        if self.replace_policy == ReplacementPolicy::Srrip {
            let (_, e) = self.stack.get_index_mut(0).expect("mru");
            e.rr_distance.incr();
        }
    }

    /// Bookkeeping after a splice to MRU: the demoted entry sits at index 1,
    /// the promoted one at index 0.
    fn event_mru_demotion(&mut self, hp: &mut HashedPerceptron, rng: &mut StdRng) {
        if self.stack.len() > 1 {
            if self.replace_policy == ReplacementPolicy::BurstLru {
                let (key, burst_count, ref_count) = {
                    let (k, e) = self.stack.get_index(1).expect("demoted");
                    (*k, e.hits.borrow().len() as i64, e.ref_count as i64)
                };
                let (bc_hit, rc_hit) = {
                    let pte = self.pt.entry(key).or_default();
                    (
                        pte.bc_confidence.get() >= 0 && burst_count >= pte.bc_saved,
                        pte.rc_confidence.get() >= 0 && ref_count >= pte.rc_saved,
                    )
                };
                if bc_hit {
                    self.stats.prediction_bc += 1;
                }
                if rc_hit {
                    self.stats.prediction_rc += 1;
                }
                if bc_hit || rc_hit {
                    self.stack.get_index_mut(1).expect("demoted").1.eol = true;
                }
            }

            if self.opts.dbp_on_demotion && self.replace_policy == ReplacementPolicy::HpLru {
                self.predict_dead(1, hp, rng);
            }
        }

        // The freshly promoted entry is evidently alive; clear a stale mark
        // and optionally train against it.
        let was_marked = {
            let (_, e) = self.stack.get_index_mut(0).expect("mru");
            let marked = e.eol;
            e.eol = false;
            marked
        };
        if was_marked {
            self.stats.eager_early_replacement += 1;
            if self.opts.eol_hit_correction {
                let features = self.stack.get_index(0).expect("mru").1.features.clone();
                match features.gather(rng, false) {
                    Ok(fk) => {
                        hp.reinforce(&fk, true);
                    }
                    Err(e) => log::error!("eol correction skipped: {}", e),
                }
            }
        }

        if self.replace_policy == ReplacementPolicy::SrripCb {
            let (_, e) = self.stack.get_index_mut(0).expect("mru");
            if e.ref_count > 1 {
                // Re-referenced within a burst.
                e.rr_distance.incr();
            }
        }
    }
}
