//! Configuration options.
//!
//! The simulator is configured from a TOML file naming the MIN oracle size,
//! the cache geometry and policies, the perceptron knobs, and the output
//! streams. The path to the file is typically a command line argument of
//! the embedding driver.
//!
//! ```toml
//! timeseries = false
//! start_layer = "ethernet"
//!
//! [min]
//!     enabled = true
//!     entries = 1024
//!
//! [cache]
//!     enabled = true
//!     entries = 1024
//!     associativity = 8
//!     rp = "HP_LRU"
//!     ip = "HP_BYPASS"
//!
//! [cache.hp]
//!     threshold = 0
//!     dbp = false
//!     bp = false
//!
//! [output]
//!     directory = "runs"
//!     flow_stats = "stats-flows.log"
//!     trace_tcp = "flows-tcp.trace"
//! ```

use crate::cache::{InsertionPolicy, ReplacementPolicy, TrainerOptions};
use crate::perceptron::PerceptronSettings;
use crate::protocols::extract::StartLayer;

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> SimConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: File read failed");
    let config: SimConfig = toml::from_str(&config_str).expect("Invalid config file");
    if let Err(e) = config.validate() {
        log::error!("Invalid configuration: {:#}", e);
        panic!("Invalid configuration");
    }
    config
}

/// Returns a default configuration: 1024-entry MIN oracle and an 8-way
/// 1024-entry cache under LRU/MRU. For demonstration, not tuned.
pub fn default_config() -> SimConfig {
    SimConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Top-level simulator configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SimConfig {
    /// Record per-packet arrival-delta series in flow records. Defaults to
    /// `false`.
    #[serde(default)]
    pub timeseries: bool,

    /// First protocol layer present in the capture: `"ethernet"` or `"ip"`.
    /// Link-stripped trace formats start at `"ip"`. Defaults to
    /// `"ethernet"`.
    #[serde(default = "default_start_layer")]
    pub start_layer: String,

    /// Seed for the simulation RNG. Unset draws from the OS. Set it for
    /// reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,

    /// MIN oracle settings.
    #[serde(default)]
    pub min: MinConfig,

    /// Cache simulation settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Output file settings.
    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            timeseries: false,
            start_layer: default_start_layer(),
            seed: None,
            min: MinConfig::default(),
            cache: CacheConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl SimConfig {
    /// Checks everything that is fatal at setup: unknown policy or layer
    /// names and an indivisible cache geometry.
    pub fn validate(&self) -> Result<()> {
        self.parse_start_layer()?;
        self.cache.replacement_policy()?;
        self.cache.insertion_policy()?;
        if self.cache.associativity > 0 && self.cache.entries % self.cache.associativity != 0 {
            bail!(
                "cache associativity {} does not divide entries {}",
                self.cache.associativity,
                self.cache.entries
            );
        }
        Ok(())
    }

    fn parse_start_layer(&self) -> Result<StartLayer> {
        match self.start_layer.as_str() {
            "ethernet" => Ok(StartLayer::Ethernet),
            "ip" => Ok(StartLayer::Ip),
            other => bail!("unknown start layer: {}", other),
        }
    }

    /// The validated start layer.
    pub fn start_layer(&self) -> StartLayer {
        self.parse_start_layer().expect("validated at setup")
    }
}

fn default_start_layer() -> String {
    "ethernet".to_string()
}

/* --------------------------------------------------------------------------------- */

/// MIN oracle options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MinConfig {
    /// Run the Belady reference simulator alongside the cache. Defaults to
    /// `true`.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Target cache size for the oracle. Defaults to `1024`.
    #[serde(default = "default_entries")]
    pub entries: usize,
}

impl Default for MinConfig {
    fn default() -> Self {
        MinConfig {
            enabled: true,
            entries: default_entries(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Cache simulation options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CacheConfig {
    /// Run the cache simulator. Defaults to `true`.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Total cache entries. Defaults to `1024`.
    #[serde(default = "default_entries")]
    pub entries: usize,

    /// Ways per set; `0` selects the fully-associative reference alone.
    /// Defaults to `8`.
    #[serde(default = "default_associativity")]
    pub associativity: usize,

    /// Replacement policy: `LRU`, `MRU`, `RANDOM`, `BURST_LRU`, `SRRIP`,
    /// `SRRIP_CB`, or `HP_LRU`. Defaults to `LRU`.
    #[serde(default = "default_rp")]
    pub rp: String,

    /// Insertion policy: `MRU`, `LRU`, `RANDOM`, `SHIP`, `BYPASS`, or
    /// `HP_BYPASS`. Defaults to `MRU`.
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Hashed-perceptron options.
    #[serde(default)]
    pub hp: HpConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            entries: default_entries(),
            associativity: default_associativity(),
            rp: default_rp(),
            ip: default_ip(),
            hp: HpConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Effective replacement policy. The dead-block predictor switch
    /// overrides the named policy with `HP_LRU`.
    pub fn replacement_policy(&self) -> Result<ReplacementPolicy> {
        if self.hp.dbp {
            return Ok(ReplacementPolicy::HpLru);
        }
        self.rp
            .parse()
            .with_context(|| format!("replacement policy {:?}", self.rp))
    }

    /// Effective insertion policy. The bypass predictor switch overrides
    /// the named policy with `HP_BYPASS`.
    pub fn insertion_policy(&self) -> Result<InsertionPolicy> {
        if self.hp.bp {
            return Ok(InsertionPolicy::HpBypass);
        }
        self.ip
            .parse()
            .with_context(|| format!("insertion policy {:?}", self.ip))
    }

    pub fn perceptron_settings(&self) -> PerceptronSettings {
        PerceptronSettings {
            decision_threshold: self.hp.threshold,
            training_ratio: self.hp.training_ratio,
            dynamic_threshold: self.hp.dynamic_threshold,
            randomize: self.hp.randomize,
        }
    }

    pub fn trainer_options(&self) -> TrainerOptions {
        TrainerOptions {
            history_training: self.hp.history_training,
            eol_hit_correction: self.hp.eol_hit_correction,
            belady_evict_training: self.hp.belady_evict,
            belady_keep_training: self.hp.belady_keep,
            dbp_on_demotion: self.hp.dbp_on_demotion,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_entries() -> usize {
    1024
}

fn default_associativity() -> usize {
    8
}

fn default_rp() -> String {
    "LRU".to_string()
}

fn default_ip() -> String {
    "MRU".to_string()
}

/* --------------------------------------------------------------------------------- */

/// Hashed-perceptron options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HpConfig {
    /// Decision threshold `T`. Defaults to `0`.
    #[serde(default)]
    pub threshold: i64,

    /// Enable the dead-block predictor path (forces `HP_LRU` replacement).
    /// Defaults to `false`.
    #[serde(default)]
    pub dbp: bool,

    /// Enable the bypass predictor path (forces `HP_BYPASS` insertion).
    /// Defaults to `false`.
    #[serde(default)]
    pub bp: bool,

    /// Run the dead-block inference on MRU demotion instead of on touch.
    /// Defaults to `false`.
    #[serde(default)]
    pub dbp_on_demotion: bool,

    /// Initial training ratio in `[0, 1]`. Defaults to `0.25`.
    #[serde(default = "default_training_ratio")]
    pub training_ratio: f64,

    /// Adapt the training ratio from prediction pressure. Defaults to
    /// `true`.
    #[serde(default = "default_enabled")]
    pub dynamic_threshold: bool,

    /// Seed weight tables uniformly at random. Defaults to `true`.
    #[serde(default = "default_enabled")]
    pub randomize: bool,

    /// Delayed prediction-feedback training loop. Defaults to `true`.
    #[serde(default = "default_enabled")]
    pub history_training: bool,

    /// Train toward keep when a dead-marked entry is promoted. Defaults to
    /// `true`.
    #[serde(default = "default_enabled")]
    pub eol_hit_correction: bool,

    /// Train from the per-set Belady oracle's evict sets. Defaults to
    /// `false`.
    #[serde(default)]
    pub belady_evict: bool,

    /// Train from the per-set Belady oracle's keep sets. Defaults to
    /// `false`.
    #[serde(default)]
    pub belady_keep: bool,
}

impl Default for HpConfig {
    fn default() -> Self {
        HpConfig {
            threshold: 0,
            dbp: false,
            bp: false,
            dbp_on_demotion: false,
            training_ratio: default_training_ratio(),
            dynamic_threshold: true,
            randomize: true,
            history_training: true,
            eol_hit_correction: true,
            belady_evict: false,
            belady_keep: false,
        }
    }
}

fn default_training_ratio() -> f64 {
    0.25
}

/* --------------------------------------------------------------------------------- */

/// Output stream options. Every stream is optional; unset streams are not
/// written. Trace files are gzip-wrapped and get a `.gz` suffix if the
/// configured name lacks one.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct OutputConfig {
    /// Parent directory for this run's output files. A timestamped
    /// subdirectory is created beneath it. Unset writes nothing.
    #[serde(default)]
    pub directory: Option<String>,

    /// Flow-stats stream: one record per retired flow.
    #[serde(default)]
    pub flow_stats: Option<String>,

    /// All-protocols packet trace.
    #[serde(default)]
    pub trace: Option<String>,

    /// TCP-only packet trace, with flag bitsets.
    #[serde(default)]
    pub trace_tcp: Option<String>,

    /// UDP-only packet trace.
    #[serde(default)]
    pub trace_udp: Option<String>,

    /// Trace of packets that are neither TCP nor UDP.
    #[serde(default)]
    pub trace_other: Option<String>,

    /// Trace of suspected scans (blacklisted flows), with flag bitsets.
    #[serde(default)]
    pub trace_scans: Option<String>,

    /// Eviction lifetime CSV.
    #[serde(default)]
    pub evictions: Option<String>,

    /// Dump perceptron weight tables and statistics CSVs at shutdown.
    #[serde(default)]
    pub hp_dumps: bool,

    /// Log every bypass/evict prediction and training event to CSV.
    #[serde(default)]
    pub hp_predictions: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_config_defaults() {
        let cfg = default_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.cache.entries, 1024);
        assert_eq!(cfg.cache.associativity, 8);
        assert_eq!(cfg.min.entries, 1024);
        assert_eq!(cfg.start_layer(), StartLayer::Ethernet);
        assert_eq!(
            cfg.cache.replacement_policy().unwrap(),
            ReplacementPolicy::Lru
        );
        assert_eq!(cfg.cache.insertion_policy().unwrap(), InsertionPolicy::Mru);
    }

    #[test]
    fn core_config_parse_toml() {
        let cfg: SimConfig = toml::from_str(
            r#"
            timeseries = true
            start_layer = "ip"
            seed = 7

            [min]
                entries = 256

            [cache]
                entries = 64
                associativity = 4
                rp = "SRRIP_CB"
                ip = "SHIP"

            [cache.hp]
                threshold = -62
                dbp = true
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_ok());
        assert!(cfg.timeseries);
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.min.entries, 256);
        assert_eq!(cfg.cache.hp.threshold, -62);
        // dbp forces the perceptron replacement path.
        assert_eq!(
            cfg.cache.replacement_policy().unwrap(),
            ReplacementPolicy::HpLru
        );
        assert_eq!(cfg.cache.insertion_policy().unwrap(), InsertionPolicy::Ship);
    }

    #[test]
    fn core_config_unknown_policy_fatal() {
        let cfg: SimConfig = toml::from_str(
            r#"
            [cache]
                rp = "PLRU"
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn core_config_bad_geometry_fatal() {
        let cfg: SimConfig = toml::from_str(
            r#"
            [cache]
                entries = 10
                associativity = 4
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
