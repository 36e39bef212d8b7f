//! Insertion and replacement policy selectors.
//!
//! Policies are flat enums dispatched by `match`; the per-policy state they
//! need (pattern table, RRIP distances, perceptron) lives on the set itself.
//! Unknown policy names fail configuration parsing and are fatal at setup.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown policy name: {0}")]
pub struct PolicyUnknown(pub String);

/// Where a newly installed entry lands in the recency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertionPolicy {
    #[default]
    Mru,
    Lru,
    Random,
    /// SHiP-style: predicted-distant keys insert at LRU.
    Ship,
    /// First-ever keys insert at LRU.
    Bypass,
    /// Perceptron-gated: negative inference skips installation entirely.
    HpBypass,
}

impl FromStr for InsertionPolicy {
    type Err = PolicyUnknown;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MRU" => Ok(InsertionPolicy::Mru),
            "LRU" => Ok(InsertionPolicy::Lru),
            "RANDOM" => Ok(InsertionPolicy::Random),
            "SHIP" => Ok(InsertionPolicy::Ship),
            "BYPASS" => Ok(InsertionPolicy::Bypass),
            "HP_BYPASS" => Ok(InsertionPolicy::HpBypass),
            other => Err(PolicyUnknown(other.to_string())),
        }
    }
}

impl fmt::Display for InsertionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InsertionPolicy::Mru => "MRU",
            InsertionPolicy::Lru => "LRU",
            InsertionPolicy::Random => "RANDOM",
            InsertionPolicy::Ship => "SHIP",
            InsertionPolicy::Bypass => "BYPASS",
            InsertionPolicy::HpBypass => "HP_BYPASS",
        };
        f.write_str(s)
    }
}

/// How a victim is chosen when the set is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacementPolicy {
    #[default]
    Lru,
    Mru,
    Random,
    /// Prefer entries whose burst/reference pattern marked them dead.
    BurstLru,
    /// Static RRIP with aging.
    Srrip,
    /// RRIP credited only on bursts (MRU demotion with reuse).
    SrripCb,
    /// Like `BurstLru` but the dead mark comes from the perceptron.
    HpLru,
}

impl ReplacementPolicy {
    /// Whether this policy consults the end-of-life mark.
    pub fn uses_eol(&self) -> bool {
        matches!(self, ReplacementPolicy::BurstLru | ReplacementPolicy::HpLru)
    }
}

impl FromStr for ReplacementPolicy {
    type Err = PolicyUnknown;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LRU" => Ok(ReplacementPolicy::Lru),
            "MRU" => Ok(ReplacementPolicy::Mru),
            "RANDOM" => Ok(ReplacementPolicy::Random),
            "BURST_LRU" => Ok(ReplacementPolicy::BurstLru),
            "SRRIP" => Ok(ReplacementPolicy::Srrip),
            "SRRIP_CB" => Ok(ReplacementPolicy::SrripCb),
            "HP_LRU" => Ok(ReplacementPolicy::HpLru),
            other => Err(PolicyUnknown(other.to_string())),
        }
    }
}

impl fmt::Display for ReplacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplacementPolicy::Lru => "LRU",
            ReplacementPolicy::Mru => "MRU",
            ReplacementPolicy::Random => "RANDOM",
            ReplacementPolicy::BurstLru => "BURST_LRU",
            ReplacementPolicy::Srrip => "SRRIP",
            ReplacementPolicy::SrripCb => "SRRIP_CB",
            ReplacementPolicy::HpLru => "HP_LRU",
        };
        f.write_str(s)
    }
}
