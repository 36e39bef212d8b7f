//! Training event generators for the hashed perceptron.
//!
//! [`HistoryTrainer`] closes the delayed feedback loop: keep/evict
//! predictions are parked in bounded rings and resolved when the flow is
//! touched again (keep confirmed, evict contradicted) or when the ring
//! overflows (the oldest prediction is scored as "never touched").
//!
//! [`BeladyTrainer`] replaces the feedback loop with an oracle: a private
//! MIN simulator runs alongside the set, and every barrier advance turns the
//! oracle's evict set (and optionally its keep set) into reinforcement.

use crate::features::{FeatureKey, Features};
use crate::flowtable::FlowId;
use crate::perceptron::{HashedPerceptron, Weights};
use crate::sim::SimMin;
use crate::utils::TimeSpec;

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;
use rand::rngs::StdRng;

/// CSV sinks for individual predictions and training events. One dump is
/// shared by every set; unopened sinks swallow their rows.
pub struct PredictionDump {
    bypass: Option<csv::Writer<File>>,
    evict: Option<csv::Writer<File>>,
    training: Option<csv::Writer<File>>,
}

pub type SharedPredictionDump = Rc<RefCell<PredictionDump>>;

impl PredictionDump {
    /// Opens all three sinks in `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        Ok(PredictionDump {
            bypass: Some(csv::Writer::from_path(dir.join("bypassPred.csv"))?),
            evict: Some(csv::Writer::from_path(dir.join("evictPred.csv"))?),
            training: Some(csv::Writer::from_path(dir.join("trainingEvents.csv"))?),
        })
    }

    fn row(k: FlowId, weights: &Weights, features: &FeatureKey) -> Vec<String> {
        let mut row = Vec::with_capacity(1 + weights.len() + features.len());
        row.push(k.to_string());
        row.extend(weights.iter().map(|w| w.to_string()));
        row.extend(features.iter().map(|f| f.to_string()));
        row
    }

    /// A negative insertion inference: the flow was predicted uncacheable.
    pub fn log_bypass(&mut self, k: FlowId, weights: &Weights, features: &FeatureKey) {
        if let Some(w) = &mut self.bypass {
            let _ = w.write_record(Self::row(k, weights, features));
        }
    }

    /// A negative dead-block inference: the entry was marked end-of-life.
    pub fn log_evict(&mut self, k: FlowId, weights: &Weights, features: &FeatureKey) {
        if let Some(w) = &mut self.evict {
            let _ = w.write_record(Self::row(k, weights, features));
        }
    }

    /// One applied training event, signed by direction.
    pub fn log_training(&mut self, keep: bool, k: FlowId, weights: &Weights, features: &FeatureKey) {
        if let Some(w) = &mut self.training {
            let mut row = vec![if keep { "+" } else { "-" }.to_string()];
            row.extend(Self::row(k, weights, features));
            let _ = w.write_record(row);
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        for w in [&mut self.bypass, &mut self.evict, &mut self.training]
            .into_iter()
            .flatten()
        {
            w.flush()?;
        }
        Ok(())
    }
}

/// A prediction awaiting confirmation.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub features: Features,
    /// `true`: predicted keep; `false`: predicted evict/bypass.
    pub keep: bool,
    /// Demand prediction, as opposed to a sampling probe.
    pub demand: bool,
}

/// Counters over resolved predictions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrainerStats {
    /// Keep predictions confirmed by a touch.
    pub keep_correct: u64,
    /// Evict predictions contradicted by a touch.
    pub evict_wrong: u64,
    /// Keep predictions expired untouched (trained as evict).
    pub keep_wrong: u64,
    /// Evict predictions expired untouched (reinforced as evict).
    pub evict_correct: u64,
}

pub struct HistoryTrainer {
    keep_depth: usize,
    evict_depth: usize,
    /// Front = newest. Overflow pops the back.
    keep_hist: VecDeque<(FlowId, Prediction)>,
    evict_hist: VecDeque<(FlowId, Prediction)>,
    stats: TrainerStats,
    dump: Option<SharedPredictionDump>,
}

impl HistoryTrainer {
    pub fn new(evict_depth: usize, keep_depth: usize) -> Self {
        HistoryTrainer {
            keep_depth: keep_depth.max(1),
            evict_depth: evict_depth.max(1),
            keep_hist: VecDeque::with_capacity(keep_depth),
            evict_hist: VecDeque::with_capacity(evict_depth),
            stats: TrainerStats::default(),
            dump: None,
        }
    }

    pub fn set_dump(&mut self, dump: Option<SharedPredictionDump>) {
        self.dump = dump;
    }

    #[inline]
    pub fn stats(&self) -> TrainerStats {
        self.stats
    }

    /// Resolves any outstanding prediction for a flow that was just touched.
    pub fn touch(&mut self, k: FlowId, hp: &mut HashedPerceptron, rng: &mut StdRng) {
        if let Some(pos) = self.keep_hist.iter().position(|(key, _)| *key == k) {
            // Keep prediction confirmed.
            let (_, p) = self.keep_hist.remove(pos).expect("position valid");
            self.stats.keep_correct += 1;
            reinforce(hp, rng, k, &p, true, &self.dump);
        }
        if let Some(pos) = self.evict_hist.iter().position(|(key, _)| *key == k) {
            // Evict prediction contradicted; train toward keep.
            let (_, p) = self.evict_hist.remove(pos).expect("position valid");
            self.stats.evict_wrong += 1;
            reinforce(hp, rng, k, &p, true, &self.dump);
        }
    }

    /// Parks a new prediction, scoring the oldest one if the ring is full.
    pub fn record(
        &mut self,
        k: FlowId,
        p: Prediction,
        hp: &mut HashedPerceptron,
        rng: &mut StdRng,
    ) {
        if p.keep {
            if self.keep_hist.len() >= self.keep_depth {
                if let Some((old_k, old)) = self.keep_hist.pop_back() {
                    // Never touched: the keep prediction was wrong.
                    self.stats.keep_wrong += 1;
                    reinforce(hp, rng, old_k, &old, false, &self.dump);
                }
            }
            self.keep_hist.push_front((k, p));
        } else {
            if self.evict_hist.len() >= self.evict_depth {
                if let Some((old_k, old)) = self.evict_hist.pop_back() {
                    // Never touched: the evict prediction held.
                    self.stats.evict_correct += 1;
                    reinforce(hp, rng, old_k, &old, false, &self.dump);
                }
            }
            self.evict_hist.push_front((k, p));
        }
    }
}

/// Applies one resolved prediction to the predictor.
fn reinforce(
    hp: &mut HashedPerceptron,
    rng: &mut StdRng,
    k: FlowId,
    p: &Prediction,
    touched: bool,
    dump: &Option<SharedPredictionDump>,
) {
    match p.features.gather(rng, true) {
        Ok(key) => {
            let r = hp.reinforce(&key, touched);
            if r.updated {
                if let Some(d) = dump {
                    d.borrow_mut().log_training(touched, k, &r.weights, &key);
                }
            }
        }
        Err(e) => log::error!("dropping training event: {}", e),
    }
}

pub struct BeladyTrainer {
    oracle: SimMin<FlowId>,
    /// Latest features per tracked flow, for oracle-driven reinforcement.
    fmap: HashMap<FlowId, Features>,
    evict_training: bool,
    keep_training: bool,
    dump: Option<SharedPredictionDump>,
}

impl BeladyTrainer {
    pub fn new(entries: usize, evict_training: bool, keep_training: bool) -> Self {
        BeladyTrainer {
            oracle: SimMin::new(entries),
            fmap: HashMap::new(),
            evict_training,
            keep_training,
            dump: None,
        }
    }

    pub fn set_dump(&mut self, dump: Option<SharedPredictionDump>) {
        self.dump = dump;
    }

    /// First occurrence of a flow.
    pub fn insert(&mut self, k: FlowId, f: &Features, t: TimeSpec) {
        self.oracle.insert(k, t);
        self.fmap.insert(k, f.clone());
    }

    /// Re-access. Runs the oracle and converts any newly decided spans into
    /// training events. Returns the oracle's hit verdict.
    pub fn touch(
        &mut self,
        k: FlowId,
        f: &Features,
        t: TimeSpec,
        hp: &mut HashedPerceptron,
        rng: &mut StdRng,
    ) -> bool {
        let hit = self.oracle.update(k, t);
        if hit {
            let (evict_set, keep_set) = self.oracle.evictions();
            if self.evict_training {
                for v in &evict_set {
                    if let Some(ef) = self.fmap.get(v) {
                        match ef.gather(rng, true) {
                            Ok(key) => {
                                let r = hp.reinforce(&key, false);
                                if r.updated {
                                    if let Some(d) = &self.dump {
                                        d.borrow_mut().log_training(false, *v, &r.weights, &key);
                                    }
                                }
                            }
                            Err(e) => log::error!("dropping oracle evict event: {}", e),
                        }
                    }
                }
            }
            if self.keep_training {
                for v in &keep_set {
                    if let Some(kf) = self.fmap.get(v) {
                        match kf.gather(rng, true) {
                            Ok(key) => {
                                let r = hp.reinforce(&key, true);
                                if r.updated {
                                    if let Some(d) = &self.dump {
                                        d.borrow_mut().log_training(true, *v, &r.weights, &key);
                                    }
                                }
                            }
                            Err(e) => log::error!("dropping oracle keep event: {}", e),
                        }
                    }
                }
            }
            // Decided flows need no more features.
            for v in &evict_set {
                self.fmap.remove(v);
            }
        }

        match self.fmap.get_mut(&k) {
            Some(existing) => {
                if existing.merge(f).is_err() {
                    *existing = f.clone();
                }
            }
            None => {
                self.fmap.insert(k, f.clone());
            }
        }
        hit
    }
}
