//! Per-flow feature vectors for the hashed perceptron.
//!
//! A [`Features`] handle is cheap to build: it captures shared references to
//! the packet fields, the flow record, and (once attached to a cache entry)
//! the entry's burst-hit stats, and defers the actual mixing to
//! [`gather`](Features::gather). Gathering is only legal on a *blessed*
//! vector, one that has been attached to a cache entry, unless `force` is
//! set; insertion-time predictions force-gather before any entry exists.
//!
//! Feature `[0]` is a uniformly random control value used for bias analysis.
//! It is excluded from the perceptron sum by construction.

use crate::flowtable::record::FlowRecord;
use crate::protocols::Fields;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::Rng;

/// Number of features, and therefore perceptron tables.
pub const NUM_FEATURES: usize = 14;

/// A gathered feature vector: the perceptron's table indices.
pub type FeatureKey = [u16; NUM_FEATURES];

/// Hit counts per MRU burst. One element per burst; the last element is the
/// burst in progress.
pub type BurstStats = Vec<u32>;
pub type SharedBurstStats = Rc<RefCell<BurstStats>>;

/// Lazily gathered feature sources for one flow.
#[derive(Debug, Clone, Default)]
pub struct Features {
    fields: Option<Rc<Fields>>,
    record: Option<Rc<RefCell<FlowRecord>>>,
    /// Burst stats owned by the cache entry; weak because the entry's
    /// lifetime bounds ours.
    hits: Option<Weak<RefCell<BurstStats>>>,
    blessed: bool,
}

impl Features {
    pub fn new(fields: Rc<Fields>, record: Rc<RefCell<FlowRecord>>) -> Self {
        Features {
            fields: Some(fields),
            record: Some(record),
            hits: None,
            blessed: false,
        }
    }

    /// Attaches the burst-stats vector of the owning cache entry.
    pub fn set_burst_stats(&mut self, hits: &SharedBurstStats) {
        self.hits = Some(Rc::downgrade(hits));
    }

    /// Marks the vector as attached to a cache entry. Gathering without
    /// `force` requires this.
    pub fn bless(&mut self) {
        self.blessed = true;
    }

    #[inline]
    pub fn is_blessed(&self) -> bool {
        self.blessed
    }

    /// Folds a newer packet's view of the same flow into this vector. The
    /// flow record must match; fields are replaced, burst stats and the
    /// blessed mark are kept.
    pub fn merge(&mut self, other: &Features) -> Result<()> {
        match (&self.record, &other.record) {
            (Some(a), Some(b)) if Rc::ptr_eq(a, b) => {}
            _ => bail!("feature merge across different flow records"),
        }
        if let Some(f) = &other.fields {
            self.fields = Some(f.clone());
        }
        if other.hits.is_some() {
            log::warn!("burst stats replaced on feature merge; entry lifetime suspect");
            self.hits = other.hits.clone();
        }
        Ok(())
    }

    /// Mixes the sources into the 14 table indices. Fails if the vector was
    /// never initialized, or if it is unblessed and `force` is not set.
    pub fn gather(&self, rng: &mut StdRng, force: bool) -> Result<FeatureKey> {
        let (Some(fields), Some(record)) = (&self.fields, &self.record) else {
            bail!("feature gather before initialization");
        };
        if !force && !self.blessed {
            bail!("feature gather before bless");
        }
        let hits = self.hits.as_ref().and_then(|w| w.upgrade());
        if !force && hits.is_none() {
            bail!("feature gather without burst stats");
        }

        let k = fields;
        let r = record.borrow();
        let low_port = k.src_port.min(k.dst_port);

        let mut f = [0u16; NUM_FEATURES];
        // Control feature; never part of the inference sum.
        f[0] = rng.gen();

        // Stateless packet features.
        f[1] = ((k.ip_proto as u16) << 8) ^ low_port;
        f[2] = ((k.ipv4_dst >> 16) as u16) ^ k.dst_port;
        f[3] = ((k.ipv4_src >> 16) as u16) ^ k.src_port;
        f[4] = k.flags_bitset();
        f[5] = k.src_port ^ k.dst_port;
        f[6] = (k.ip_proto as u16) ^ (k.tcp_flags << 7) ^ low_port;

        // Host-pair subnet association.
        f[7] = ((k.ipv4_dst >> 16) ^ (k.ipv4_src >> 16)) as u16;
        f[8] = ((k.ipv4_dst >> 8) ^ (k.ipv4_src >> 8)) as u16;
        f[9] = (k.ipv4_dst ^ k.ipv4_src) as u16;

        // Stateful flow features.
        f[10] = r.tcp_state() as u16;
        f[11] = r.packets().min(u16::MAX as u64) as u16;

        // Cache metadata.
        if let Some(hits) = hits {
            let h = hits.borrow();
            let refs: u32 = h.iter().sum();
            f[12] = refs.min(u16::MAX as u32) as u16;
            f[13] = h.last().copied().unwrap_or(0).min(u16::MAX as u32) as u16;
        }

        Ok(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{FlowKey, IP_PROTO_TCP, PROTO_IPV4, PROTO_TCP, TCP_ACK};
    use crate::utils::TimeSpec;
    use rand::SeedableRng;

    fn setup() -> (Rc<Fields>, Rc<RefCell<FlowRecord>>) {
        let fields = Rc::new(Fields {
            proto_flags: PROTO_IPV4 | PROTO_TCP,
            tcp_flags: TCP_ACK,
            ipv4_src: 0x0a00_0001,
            ipv4_dst: 0xc0a8_0a02,
            src_port: 49152,
            dst_port: 443,
            ip_proto: IP_PROTO_TCP,
            ..Default::default()
        });
        let key = FlowKey::new(0x0a00_0001, 0xc0a8_0a02, 49152, 443, IP_PROTO_TCP);
        let record = Rc::new(RefCell::new(FlowRecord::new(
            1,
            key,
            TimeSpec::default(),
            false,
        )));
        record.borrow_mut().update(&fields, 60, 0, TimeSpec::default());
        (fields, record)
    }

    #[test]
    fn core_features_deterministic_except_control() {
        let (fields, record) = setup();
        let feats = Features::new(fields, record);
        let mut rng = StdRng::seed_from_u64(7);
        let a = feats.gather(&mut rng, true).unwrap();
        let b = feats.gather(&mut rng, true).unwrap();
        assert_eq!(a[1..], b[1..]);
    }

    #[test]
    fn core_features_formulas() {
        let (fields, record) = setup();
        let feats = Features::new(fields.clone(), record);
        let mut rng = StdRng::seed_from_u64(7);
        let f = feats.gather(&mut rng, true).unwrap();

        assert_eq!(f[1], ((6u16) << 8) ^ 443);
        assert_eq!(f[2], ((0xc0a8_0a02u32 >> 16) as u16) ^ 443);
        assert_eq!(f[3], ((0x0a00_0001u32 >> 16) as u16) ^ 49152);
        assert_eq!(f[5], 49152 ^ 443);
        assert_eq!(f[9], (0xc0a8_0a02u32 ^ 0x0a00_0001) as u16);
        assert_eq!(f[10], 0b0001); // TCP, no SYN/FIN/RST yet
        assert_eq!(f[11], 1);
        // No burst stats attached: cache metadata zeroed.
        assert_eq!(f[12], 0);
        assert_eq!(f[13], 0);
    }

    #[test]
    fn core_features_burst_stats() {
        let (fields, record) = setup();
        let mut feats = Features::new(fields, record);
        let hits: SharedBurstStats = Rc::new(RefCell::new(vec![3, 2, 4]));
        feats.set_burst_stats(&hits);
        feats.bless();

        let mut rng = StdRng::seed_from_u64(7);
        let f = feats.gather(&mut rng, false).unwrap();
        assert_eq!(f[12], 9); // total references
        assert_eq!(f[13], 4); // current burst
    }

    #[test]
    fn core_features_unblessed_gather_fails() {
        let (fields, record) = setup();
        let feats = Features::new(fields, record);
        let mut rng = StdRng::seed_from_u64(7);
        assert!(feats.gather(&mut rng, false).is_err());
        assert!(feats.gather(&mut rng, true).is_ok());
    }

    #[test]
    fn core_features_merge_requires_same_record() {
        let (fields, record) = setup();
        let mut a = Features::new(fields.clone(), record.clone());
        let b = Features::new(fields.clone(), record);
        assert!(a.merge(&b).is_ok());

        let (other_fields, other_record) = setup();
        let c = Features::new(other_fields, other_record);
        assert!(a.merge(&c).is_err());
    }
}
