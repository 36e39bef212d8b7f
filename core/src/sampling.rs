//! Sampling access to retired flows for an interactive analytics consumer.
//!
//! Retired records that behaved "unfriendly" toward the simulated cache
//! (more simulator misses than oracle misses) are kept together with their
//! miss series; everything else is dropped at retirement. One mutex guards
//! the retired map and both miss maps; the accessors mirror the remote
//! query surface (`num_flows`, `get_flow_ids`, `get_flow_ts`, ...), leaving
//! the actual transport to the embedding driver.

use crate::flowtable::FlowId;
use crate::protocols::FlowKey;

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Snapshot of a retired flow. The record itself is dead; the snapshot is
/// immutable.
#[derive(Debug, Clone)]
pub struct RetiredSample {
    pub id: FlowId,
    pub key: FlowKey,
    pub packets: u64,
    pub bytes: u64,
    /// Session-state nibble at retirement.
    pub flags: u8,
    /// Arrival offsets from the flow start, nanoseconds.
    pub arrival_ns: Vec<u64>,
}

#[derive(Default)]
struct HubInner {
    retired: BTreeMap<FlowId, RetiredSample>,
    misses_min: BTreeMap<FlowId, Vec<u64>>,
    misses_sim: BTreeMap<FlowId, Vec<u64>>,
}

/// Mutex-guarded store of retired flows and their miss series.
#[derive(Default)]
pub struct SampleHub {
    inner: Mutex<HubInner>,
}

impl SampleHub {
    pub fn new() -> Self {
        SampleHub::default()
    }

    /// Notes an oracle miss at arrival offset `ns` for `id`.
    pub fn record_min_miss(&self, id: FlowId, ns: u64) {
        let mut inner = self.inner.lock().expect("hub mutex");
        inner.misses_min.entry(id).or_default().push(ns);
    }

    /// Notes a simulated-cache miss at arrival offset `ns` for `id`.
    pub fn record_sim_miss(&self, id: FlowId, ns: u64) {
        let mut inner = self.inner.lock().expect("hub mutex");
        inner.misses_sim.entry(id).or_default().push(ns);
    }

    /// Offers a retired flow. Kept only when the cache missed it more often
    /// than the oracle did; otherwise its metadata is reclaimed. Returns
    /// whether the sample was kept.
    pub fn offer(&self, sample: RetiredSample) -> bool {
        let mut inner = self.inner.lock().expect("hub mutex");
        let sim = inner
            .misses_sim
            .get(&sample.id)
            .map(|v| v.len() as i64)
            .unwrap_or(0);
        let min = inner
            .misses_min
            .get(&sample.id)
            .map(|v| v.len() as i64)
            .unwrap_or(0);
        if sim - min > 0 {
            log::info!(
                "+ flow {}: packets={}, oracle misses={}, unfriendly={}; {}",
                sample.id,
                sample.packets,
                min,
                sim - min,
                sample.key
            );
            inner.retired.insert(sample.id, sample);
            true
        } else {
            inner.misses_min.remove(&sample.id);
            inner.misses_sim.remove(&sample.id);
            false
        }
    }

    pub fn num_flows(&self) -> i64 {
        self.inner.lock().expect("hub mutex").retired.len() as i64
    }

    pub fn flow_ids(&self) -> Vec<i64> {
        self.inner
            .lock()
            .expect("hub mutex")
            .retired
            .keys()
            .map(|&k| k as i64)
            .collect()
    }

    /// Packet arrival offsets for one retired flow, nanoseconds.
    pub fn flow_ts(&self, id: FlowId) -> Vec<i64> {
        self.inner
            .lock()
            .expect("hub mutex")
            .retired
            .get(&id)
            .map(|s| s.arrival_ns.iter().map(|&n| n as i64).collect())
            .unwrap_or_default()
    }

    /// Adjacent arrival differences, negated at positions where the oracle
    /// missed.
    pub fn flow_delta(&self, id: FlowId) -> Vec<i64> {
        let inner = self.inner.lock().expect("hub mutex");
        let Some(sample) = inner.retired.get(&id) else {
            return Vec::new();
        };
        let ts = &sample.arrival_ns;
        let mut deltas: Vec<i64> = Vec::with_capacity(ts.len());
        let mut prev = 0u64;
        for (i, &t) in ts.iter().enumerate() {
            deltas.push(if i == 0 { t as i64 } else { t as i64 - prev as i64 });
            prev = t;
        }
        if let Some(misses) = inner.misses_min.get(&id) {
            for &miss in misses {
                if let Some(pos) = ts.iter().position(|&t| t == miss) {
                    deltas[pos] = -deltas[pos];
                }
            }
        }
        deltas
    }

    pub fn flow_miss_min(&self, id: FlowId) -> Vec<i64> {
        self.inner
            .lock()
            .expect("hub mutex")
            .misses_min
            .get(&id)
            .map(|v| v.iter().map(|&n| n as i64).collect())
            .unwrap_or_default()
    }

    pub fn flow_miss_sim(&self, id: FlowId) -> Vec<i64> {
        self.inner
            .lock()
            .expect("hub mutex")
            .misses_sim
            .get(&id)
            .map(|v| v.iter().map(|&n| n as i64).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::IP_PROTO_UDP;

    fn sample(id: FlowId, arrivals: &[u64]) -> RetiredSample {
        RetiredSample {
            id,
            key: FlowKey::new(1, 2, 3, 4, IP_PROTO_UDP),
            packets: arrivals.len() as u64,
            bytes: 100,
            flags: 0,
            arrival_ns: arrivals.to_vec(),
        }
    }

    #[test]
    fn core_hub_keeps_unfriendly_flows() {
        let hub = SampleHub::new();
        hub.record_sim_miss(1, 0);
        hub.record_sim_miss(1, 500);
        hub.record_min_miss(1, 0);
        assert!(hub.offer(sample(1, &[0, 500, 900])));
        assert_eq!(hub.num_flows(), 1);
        assert_eq!(hub.flow_ids(), vec![1]);
        assert_eq!(hub.flow_miss_sim(1), vec![0, 500]);
    }

    #[test]
    fn core_hub_drops_friendly_flows() {
        let hub = SampleHub::new();
        hub.record_sim_miss(2, 0);
        hub.record_min_miss(2, 0);
        assert!(!hub.offer(sample(2, &[0, 100])));
        assert_eq!(hub.num_flows(), 0);
        // Metadata reclaimed with the rejection.
        assert!(hub.flow_miss_sim(2).is_empty());
        assert!(hub.flow_miss_min(2).is_empty());
    }

    #[test]
    fn core_hub_deltas_mark_oracle_misses() {
        let hub = SampleHub::new();
        hub.record_sim_miss(3, 0);
        hub.record_sim_miss(3, 700);
        hub.record_min_miss(3, 700);
        // sim(2) - min(1) > 0: kept.
        assert!(hub.offer(sample(3, &[0, 300, 700])));

        let deltas = hub.flow_delta(3);
        // adjacent differences: [0, 300, 400]; the miss at t=700 negates
        // that position.
        assert_eq!(deltas, vec![0, 300, -400]);
        assert_eq!(hub.flow_ts(3), vec![0, 300, 700]);
    }

    #[test]
    fn core_hub_unknown_flow_is_empty() {
        let hub = SampleHub::new();
        assert!(hub.flow_ts(99).is_empty());
        assert!(hub.flow_delta(99).is_empty());
    }
}
