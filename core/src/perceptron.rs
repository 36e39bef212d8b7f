//! Hashed-perceptron predictor.
//!
//! One 64 Ki-row table of 5-bit saturating weights per feature. Inference
//! sums one weight per table (the control feature's table is excluded from
//! the sum but still trained) and compares against the decision threshold
//! `T`. Training updates every table when the prediction was wrong, or when
//! it was right but the sum sits inside the training band `{T-, T+}`.
//!
//! The training band is derived from a ratio in `[0, 1]`: `T- = T - (T -
//! SUM_MIN) * ratio`, `T+ = T + (SUM_MAX - T) * ratio`. With the dynamic
//! threshold enabled, an 8-bit pressure counter tracks the correction/
//! reinforcement balance and nudges the ratio by `RATIO_STEP` whenever it
//! saturates, widening the band while predictions are mostly right and
//! narrowing it when corrections dominate.

use crate::features::{FeatureKey, NUM_FEATURES};
use crate::utils::Clamped;

use std::path::Path;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::Rng;

/// Rows per feature table; indices are the raw 16-bit feature values.
pub const TABLE_ENTRIES: usize = 64 * 1024;

/// Ratio nudge applied when the pressure counter saturates.
pub const RATIO_STEP: f64 = 0.001;

/// Tables contributing to the inference sum (all but the control feature).
const SUM_TABLES: i64 = (NUM_FEATURES - 1) as i64;

/// Extremes of the inference sum.
pub const SUM_MAX: i64 = SUM_TABLES * Clamped::<5>::MAX as i64;
pub const SUM_MIN: i64 = SUM_TABLES * Clamped::<5>::MIN as i64;
pub const SUM_RANGE: i64 = SUM_TABLES * Clamped::<5>::RANGE as i64;

pub type Weights = [i16; NUM_FEATURES];

/// One weight table plus per-row usage counts.
pub struct PerceptronTable {
    table: Vec<Clamped<5>>,
    touch_inference: Vec<i64>,
    touch_train: Vec<i64>,
}

impl PerceptronTable {
    pub fn new(entries: usize) -> Self {
        PerceptronTable {
            table: vec![Clamped::default(); entries],
            touch_inference: vec![0; entries],
            touch_train: vec![0; entries],
        }
    }

    /// Seeds every weight uniformly across the full counter range.
    pub fn randomize(&mut self, rng: &mut StdRng) {
        for w in &mut self.table {
            w.set(rng.gen_range(Clamped::<5>::MIN..=Clamped::<5>::MAX));
        }
    }

    /// Reads one weight, counting the access.
    #[inline]
    pub fn inference(&mut self, idx: u16) -> i32 {
        self.touch_inference[idx as usize] += 1;
        self.table[idx as usize].get()
    }

    /// Reads one weight without touching the usage stats.
    #[inline]
    pub fn inference_quiet(&self, idx: u16) -> i32 {
        self.table[idx as usize].get()
    }

    /// Saturating increment (positive correlation) or decrement.
    #[inline]
    pub fn train(&mut self, idx: u16, positive: bool) {
        self.touch_train[idx as usize] += 1;
        if positive {
            self.table[idx as usize].incr();
        } else {
            self.table[idx as usize].decr();
        }
    }

    /// Ratio of training events over total accesses for one row.
    pub fn recall_demand(&self, idx: u16) -> f64 {
        let t = self.touch_train[idx as usize] as f64;
        let i = self.touch_inference[idx as usize] as f64;
        if t + i == 0.0 {
            return 0.0;
        }
        t / (t + i)
    }

    pub fn weights(&self) -> &[Clamped<5>] {
        &self.table
    }

    pub fn clear_stats(&mut self) {
        self.touch_inference.fill(0);
        self.touch_train.fill(0);
    }
}

/// Result of one inference pass.
#[derive(Debug, Clone, Copy)]
pub struct Inference {
    /// `sum >= T`.
    pub keep: bool,
    pub sum: i64,
    pub weights: Weights,
}

/// Result of one training pass.
#[derive(Debug, Clone, Copy)]
pub struct Reinforcement {
    /// Whether any table was updated.
    pub updated: bool,
    /// Whether the prior prediction disagreed with the target.
    pub corrected: bool,
    pub weights: Weights,
}

/// Construction options. Threaded in from the configuration surface; there
/// is no global predictor state.
#[derive(Debug, Clone)]
pub struct PerceptronSettings {
    /// Decision threshold `T`.
    pub decision_threshold: i64,
    /// Initial training ratio in `[0, 1]`.
    pub training_ratio: f64,
    /// Adjust the training ratio from prediction pressure.
    pub dynamic_threshold: bool,
    /// Seed tables uniformly at random rather than zeroed.
    pub randomize: bool,
}

impl Default for PerceptronSettings {
    fn default() -> Self {
        PerceptronSettings {
            decision_threshold: 0,
            training_ratio: 0.25,
            dynamic_threshold: true,
            randomize: true,
        }
    }
}

pub struct HashedPerceptron {
    tables: Vec<PerceptronTable>,
    decision_threshold: i64,
    training_ratio: f64,
    training_threshold: [i64; 2],
    pressure: Clamped<8>,
    dynamic_threshold: bool,
    force_update: bool,

    // Training stats.
    pub train_corrections: i64,
    pub train_reinforcements: i64,

    // Feature statistics across inference and training events.
    correlation: [[i64; NUM_FEATURES]; NUM_FEATURES],
    feature_s1: [i64; NUM_FEATURES],
    feature_n: i64,
    feature_delta: [i64; NUM_FEATURES],
    feature_d: i64,
}

impl HashedPerceptron {
    pub fn new(settings: &PerceptronSettings, rng: &mut StdRng) -> Self {
        let mut tables: Vec<PerceptronTable> = (0..NUM_FEATURES)
            .map(|_| PerceptronTable::new(TABLE_ENTRIES))
            .collect();
        if settings.randomize {
            for t in &mut tables {
                t.randomize(rng);
            }
        }

        let mut hp = HashedPerceptron {
            tables,
            decision_threshold: settings.decision_threshold,
            training_ratio: 0.0,
            training_threshold: [0; 2],
            pressure: Clamped::default(),
            dynamic_threshold: settings.dynamic_threshold,
            force_update: false,
            train_corrections: 0,
            train_reinforcements: 0,
            correlation: [[0; NUM_FEATURES]; NUM_FEATURES],
            feature_s1: [0; NUM_FEATURES],
            feature_n: 0,
            feature_delta: [0; NUM_FEATURES],
            feature_d: 0,
        };
        hp.calc_threshold(settings.training_ratio.clamp(0.0, 1.0), true);
        log::info!(
            "training ratio {} ({}, {})",
            hp.training_ratio,
            hp.training_threshold[0],
            hp.training_threshold[1]
        );
        hp
    }

    /// Trains on every event, ignoring the training band. Ablation mode.
    pub fn force_updates(&mut self, force: bool) {
        self.force_update = force;
    }

    #[inline]
    pub fn decision_threshold(&self) -> i64 {
        self.decision_threshold
    }

    /// Current `{T-, T+}` band.
    #[inline]
    pub fn training_threshold(&self) -> [i64; 2] {
        self.training_threshold
    }

    #[inline]
    pub fn training_ratio(&self) -> f64 {
        self.training_ratio
    }

    /// Computes the band for `ratio`; with `set`, installs it.
    pub fn calc_threshold(&mut self, ratio: f64, set: bool) -> [i64; 2] {
        let t = self.decision_threshold;
        let band = [
            t - ((t - SUM_MIN) as f64 * ratio) as i64,
            t + ((SUM_MAX - t) as f64 * ratio) as i64,
        ];
        if set {
            self.training_ratio = ratio;
            self.training_threshold = band;
        }
        band
    }

    fn weights_tracked(&mut self, key: &FeatureKey) -> Weights {
        let mut w = [0i16; NUM_FEATURES];
        for (i, t) in self.tables.iter_mut().enumerate() {
            w[i] = t.inference(key[i]) as i16;
        }
        self.inference_event(&w);
        w
    }

    fn weights_quiet(&self, key: &FeatureKey) -> Weights {
        let mut w = [0i16; NUM_FEATURES];
        for (i, t) in self.tables.iter().enumerate() {
            w[i] = t.inference_quiet(key[i]) as i16;
        }
        w
    }

    /// Sum over the non-control tables and the resulting prediction.
    fn predict(&self, w: &Weights) -> (bool, i64) {
        let sum: i64 = w[1..].iter().map(|&x| x as i64).sum();
        (sum >= self.decision_threshold, sum)
    }

    /// Runs inference on a gathered feature key. With `tracked`, per-row
    /// usage counts and the correlation statistics are updated.
    pub fn inference(&mut self, key: &FeatureKey, tracked: bool) -> Inference {
        let weights = if tracked {
            self.weights_tracked(key)
        } else {
            self.weights_quiet(key)
        };
        let (keep, sum) = self.predict(&weights);
        Inference { keep, sum, weights }
    }

    /// Inference sum scaled to `[0, 1]`.
    pub fn quantize(&mut self, key: &FeatureKey, tracked: bool) -> f64 {
        let inf = self.inference(key, tracked);
        (inf.sum - SUM_MIN) as f64 / SUM_RANGE as f64
    }

    /// Applies one training event toward `target`.
    pub fn reinforce(&mut self, key: &FeatureKey, target: bool) -> Reinforcement {
        let weights = self.weights_quiet(key);
        let (prediction, sum) = self.predict(&weights);
        let incorrect = prediction != target;
        let in_band = if target {
            sum < self.training_threshold[1]
        } else {
            sum > self.training_threshold[0]
        };
        let update = incorrect || in_band;

        self.training_event(&weights, target);

        if update || self.force_update {
            for (i, t) in self.tables.iter_mut().enumerate() {
                t.train(key[i], target);
            }
        }

        if update {
            if incorrect {
                self.train_corrections += 1;
                if self.dynamic_threshold {
                    self.pressure.incr();
                    if self.pressure.at_max() {
                        let ratio = (self.training_ratio + RATIO_STEP).min(1.0);
                        let band = self.calc_threshold(ratio, true);
                        self.pressure.set(0);
                        log::debug!("training ratio {} ({}, {})", ratio, band[0], band[1]);
                    }
                }
            } else {
                self.train_reinforcements += 1;
                if self.dynamic_threshold {
                    self.pressure.decr();
                    if self.pressure.at_min() {
                        let ratio = (self.training_ratio - RATIO_STEP).max(0.0);
                        let band = self.calc_threshold(ratio, true);
                        self.pressure.set(0);
                        log::debug!("training ratio {} ({}, {})", ratio, band[0], band[1]);
                    }
                }
            }
        }

        Reinforcement {
            updated: update || self.force_update,
            corrected: incorrect,
            weights,
        }
    }

    /// Per-table recall demand for one feature key.
    pub fn recall_demand(&self, key: &FeatureKey) -> [f64; NUM_FEATURES] {
        let mut out = [0.0; NUM_FEATURES];
        for (i, t) in self.tables.iter().enumerate() {
            out[i] = t.recall_demand(key[i]);
        }
        out
    }

    pub fn tables(&self) -> &[PerceptronTable] {
        &self.tables
    }

    fn inference_event(&mut self, w: &Weights) {
        for i in 0..NUM_FEATURES {
            for j in 0..NUM_FEATURES {
                self.correlation[i][j] += w[i] as i64 * w[j] as i64;
            }
            self.feature_s1[i] += w[i] as i64;
        }
        self.feature_n += 1;
    }

    fn training_event(&mut self, w: &Weights, target: bool) {
        let sign = if target { 1 } else { -1 };
        for i in 0..NUM_FEATURES {
            self.feature_delta[i] += w[i] as i64 * sign;
        }
        self.feature_d += 1;
    }

    pub fn clear_stats(&mut self) {
        self.correlation = [[0; NUM_FEATURES]; NUM_FEATURES];
        self.feature_s1 = [0; NUM_FEATURES];
        self.feature_n = 0;
        self.feature_delta = [0; NUM_FEATURES];
        self.feature_d = 0;
        self.train_corrections = 0;
        self.train_reinforcements = 0;
    }

    /// One-line settings summary.
    pub fn settings_string(&self) -> String {
        let limit = if self.decision_threshold >= 0 {
            SUM_MAX
        } else {
            SUM_MIN
        };
        if self.force_update {
            format!(
                "inference threshold: {}/{}; training ratio: {}; training threshold: disabled",
                self.decision_threshold, limit, self.training_ratio
            )
        } else {
            format!(
                "inference threshold: {}/{}; training ratio: {}; training threshold: {{{}, {}}}",
                self.decision_threshold,
                limit,
                self.training_ratio,
                self.training_threshold[0],
                self.training_threshold[1]
            )
        }
    }

    pub fn print_stats(&self) -> String {
        format!(
            "{}\n - train corrections: {}\n - train reinforcements: {}",
            self.settings_string(),
            self.train_corrections,
            self.train_reinforcements
        )
    }

    /// Dumps the weight tables, one CSV per feature.
    pub fn dump_tables(&self, dir: &Path) -> Result<()> {
        for (i, t) in self.tables.iter().enumerate() {
            let mut w = csv::Writer::from_path(dir.join(format!("feature_table_{}.csv", i)))?;
            w.write_record(t.weights().iter().map(|c| c.get().to_string()))?;
            w.flush()?;
        }
        Ok(())
    }

    /// Dumps per-row inference and training counts, one CSV per feature.
    pub fn dump_table_stats(&self, dir: &Path) -> Result<()> {
        for (i, t) in self.tables.iter().enumerate() {
            let mut w = csv::Writer::from_path(dir.join(format!("stats_table_{}.csv", i)))?;
            w.write_record(t.touch_inference.iter().map(|c| c.to_string()))?;
            w.write_record(t.touch_train.iter().map(|c| c.to_string()))?;
            w.flush()?;
        }
        Ok(())
    }

    /// Dumps the inference/training correlation statistics.
    pub fn dump_correlation(&self, dir: &Path) -> Result<()> {
        let mut w = csv::Writer::from_path(dir.join("feature-correlation.csv"))?;
        for row in &self.correlation {
            w.write_record(row.iter().map(|c| c.to_string()))?;
        }
        w.flush()?;

        let mut w = csv::Writer::from_path(dir.join("feature-s1.csv"))?;
        w.write_record(self.feature_s1.iter().map(|c| c.to_string()))?;
        w.flush()?;

        let mut w = csv::Writer::from_path(dir.join("feature-n.csv"))?;
        w.write_record([self.feature_n.to_string()])?;
        w.flush()?;

        let mut w = csv::Writer::from_path(dir.join("feature-delta.csv"))?;
        w.write_record(self.feature_delta.iter().map(|c| c.to_string()))?;
        w.flush()?;

        let mut w = csv::Writer::from_path(dir.join("feature-d.csv"))?;
        w.write_record([self.feature_d.to_string()])?;
        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn zeroed() -> HashedPerceptron {
        let settings = PerceptronSettings {
            randomize: false,
            dynamic_threshold: false,
            ..Default::default()
        };
        HashedPerceptron::new(&settings, &mut StdRng::seed_from_u64(1))
    }

    fn key(base: u16) -> FeatureKey {
        let mut k = [0u16; NUM_FEATURES];
        for (i, f) in k.iter_mut().enumerate() {
            *f = base.wrapping_add(i as u16);
        }
        k
    }

    #[test]
    fn core_hp_sum_excludes_control_table() {
        let mut hp = zeroed();
        let k = key(100);
        hp.reinforce(&k, true);
        let inf = hp.inference(&k, false);
        // All 14 tables trained by one event; only 13 contribute.
        assert_eq!(inf.sum, 13);
        assert_eq!(inf.weights[0], 1);
    }

    #[test]
    fn core_hp_reinforce_drives_sum_to_band() {
        let settings = PerceptronSettings {
            dynamic_threshold: false,
            ..Default::default()
        };
        let mut hp = HashedPerceptron::new(&settings, &mut StdRng::seed_from_u64(42));
        let k = key(7);
        let t_plus = hp.training_threshold()[1];

        let mut last = hp.inference(&k, false).sum;
        loop {
            let r = hp.reinforce(&k, true);
            let sum = hp.inference(&k, false).sum;
            if !r.updated {
                break;
            }
            assert!(sum > last, "sum must rise strictly while updating");
            last = sum;
        }
        assert!(hp.inference(&k, false).sum >= t_plus);

        // Idempotent at saturation.
        let before = hp.inference(&k, false).sum;
        hp.reinforce(&k, true);
        assert_eq!(hp.inference(&k, false).sum, before);
    }

    #[test]
    fn core_hp_weights_stay_clamped() {
        let mut hp = zeroed();
        let k = key(0);
        for _ in 0..100 {
            hp.force_updates(true);
            hp.reinforce(&k, true);
        }
        let inf = hp.inference(&k, false);
        assert!(inf.weights.iter().all(|&w| (-16..=15).contains(&w)));
        assert_eq!(inf.sum, 13 * 15);
    }

    #[test]
    fn core_hp_training_band_formula() {
        let settings = PerceptronSettings {
            decision_threshold: 0,
            training_ratio: 0.5,
            dynamic_threshold: false,
            randomize: false,
        };
        let hp = HashedPerceptron::new(&settings, &mut StdRng::seed_from_u64(1));
        assert_eq!(hp.training_threshold(), [SUM_MIN / 2, SUM_MAX / 2]);
    }

    #[test]
    fn core_hp_dynamic_ratio_moves_under_corrections() {
        let settings = PerceptronSettings {
            training_ratio: 0.25,
            dynamic_threshold: true,
            randomize: false,
            ..Default::default()
        };
        let mut hp = HashedPerceptron::new(&settings, &mut StdRng::seed_from_u64(1));
        let k = key(50);
        // Alternating targets around threshold 0 keep predictions wrong, so
        // every event is a correction and pressure saturates repeatedly.
        for i in 0..2000 {
            hp.reinforce(&k, i % 2 == 1);
        }
        assert!(hp.training_ratio() > 0.25);
        assert!(hp.training_ratio() <= 1.0);
        assert!(hp.train_corrections > 0);
    }

    #[test]
    fn core_hp_ratio_clamped_to_unit_interval() {
        let mut hp = zeroed();
        let band = hp.calc_threshold(1.0, true);
        assert_eq!(band, [SUM_MIN, SUM_MAX]);
        assert!(hp.training_ratio() <= 1.0);
        let band = hp.calc_threshold(0.0, true);
        assert_eq!(band, [0, 0]);
    }

    #[test]
    fn core_hp_quantize_bounds() {
        let mut hp = zeroed();
        let k = key(3);
        let q = hp.quantize(&k, false);
        assert!((0.0..=1.0).contains(&q));
        // Zeroed tables sit exactly mid-range.
        assert!((q - (0 - SUM_MIN) as f64 / SUM_RANGE as f64).abs() < 1e-9);
    }

    #[test]
    fn core_hp_recall_demand_tracks_usage() {
        let mut hp = zeroed();
        let k = key(9);
        hp.inference(&k, true);
        hp.reinforce(&k, true);
        let demand = hp.recall_demand(&k);
        // One tracked inference + one training event per row.
        assert!(demand.iter().all(|&d| (d - 0.5).abs() < 1e-9));
    }
}
