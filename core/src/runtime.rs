//! The packet-processing pipeline.
//!
//! One [`Pipeline`] consumes timestamped packet buffers from a capture
//! source, in capture order, and drives the extractor, flow table, feature
//! builder, cache simulator, and MIN oracle. Processing is sequential and
//! never suspends; shutdown is cooperative: the driver stops feeding
//! packets and calls [`finish`](Pipeline::finish), which drains the flow
//! table, trims the oracle, and closes the output streams.

use crate::cache::{CacheSim, PredictionDump, SharedPredictionDump};
use crate::config::SimConfig;
use crate::features::Features;
use crate::flowtable::record::RetireReason;
use crate::flowtable::{FlowId, FlowTable, Ingest, RetiredFlow};
use crate::output::OutputSink;
use crate::protocols::extract::{extract, StartLayer};
use crate::protocols::view::View;
use crate::protocols::Fields;
use crate::sampling::{RetiredSample, SampleHub};
use crate::sim::SimMin;
use crate::utils::TimeSpec;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// One packet as delivered by the capture source.
#[derive(Debug, Clone, Copy)]
pub struct PacketRef<'a> {
    /// Capture input port tag.
    pub port: u32,
    pub ts: TimeSpec,
    /// Captured bytes; may be shorter than the original frame.
    pub data: &'a [u8],
    pub captured_len: usize,
    /// Bytes on the wire.
    pub wire_len: usize,
}

/// Global packet counters, printed at shutdown.
#[derive(Debug, Clone, Copy)]
pub struct PacketStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub max_packet_size: u16,
    pub min_packet_size: u16,
    pub malformed_packets: u64,
}

impl Default for PacketStats {
    fn default() -> Self {
        PacketStats {
            total_packets: 0,
            total_bytes: 0,
            max_packet_size: 0,
            min_packet_size: u16::MAX,
            malformed_packets: 0,
        }
    }
}

fn reason_slot(reason: RetireReason) -> usize {
    match reason {
        RetireReason::SynReuse => 0,
        RetireReason::RstIdle => 1,
        RetireReason::FinIdle => 2,
        RetireReason::TcpIdle => 3,
        RetireReason::UdpIdle => 4,
    }
}

pub struct Pipeline {
    config: SimConfig,
    start_layer: StartLayer,
    table: FlowTable,
    cache: Option<CacheSim>,
    min: Option<SimMin<FlowId>>,
    hub: Arc<SampleHub>,
    output: OutputSink,

    stats: PacketStats,
    retire_counts: [u64; 5],
    prediction_dump: Option<SharedPredictionDump>,
    stopped: bool,
    last_ts: Option<TimeSpec>,
    first_ts: Option<TimeSpec>,
    last_sweeps: u64,
}

impl Pipeline {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let min = config.min.enabled.then(|| SimMin::new(config.min.entries));
        let output = OutputSink::new(&config.output)?;

        let prediction_dump = if config.output.hp_predictions {
            match output.run_dir() {
                Some(dir) => Some(Rc::new(RefCell::new(PredictionDump::create(dir)?))),
                None => {
                    log::warn!("prediction dumps configured without an output directory");
                    None
                }
            }
        } else {
            None
        };

        let cache = if config.cache.enabled {
            let mut cache = CacheSim::new(
                config.cache.entries,
                config.cache.associativity,
                &config.cache.perceptron_settings(),
                config.cache.trainer_options(),
                rng,
            )?;
            cache.set_insert_policy(config.cache.insertion_policy()?);
            cache.set_replacement_policy(config.cache.replacement_policy()?);
            cache.set_prediction_dump(prediction_dump.clone());
            Some(cache)
        } else {
            None
        };

        Ok(Pipeline {
            start_layer: config.start_layer(),
            table: FlowTable::new(config.timeseries),
            cache,
            min,
            hub: Arc::new(SampleHub::new()),
            output,
            stats: PacketStats::default(),
            retire_counts: [0; 5],
            prediction_dump,
            stopped: false,
            last_ts: None,
            first_ts: None,
            last_sweeps: 0,
            config,
        })
    }

    pub fn hub(&self) -> Arc<SampleHub> {
        self.hub.clone()
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    pub fn cache(&self) -> Option<&CacheSim> {
        self.cache.as_ref()
    }

    pub fn min_sim(&self) -> Option<&SimMin<FlowId>> {
        self.min.as_ref()
    }

    pub fn stats(&self) -> &PacketStats {
        &self.stats
    }

    pub fn retired_by_reason(&self, reason: RetireReason) -> u64 {
        self.retire_counts[reason_slot(reason)]
    }

    /// Asks the pipeline to stop consuming. Later packets are dropped.
    pub fn request_stop(&mut self) {
        self.stopped = true;
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Processes one packet. Malformed packets are counted and processed at
    /// whatever layer depth extraction reached; nothing terminates the run.
    pub fn process(&mut self, pkt: &PacketRef) {
        if self.stopped {
            return;
        }

        if let Some(last) = self.last_ts {
            if pkt.ts < last {
                log::warn!(
                    "packet timestamps regressed: {} after {} (port {})",
                    pkt.ts,
                    last,
                    pkt.port
                );
            }
        }
        self.last_ts = Some(pkt.ts);
        self.first_ts.get_or_insert(pkt.ts);

        // Decode headers.
        let captured = pkt.captured_len.min(pkt.data.len());
        let mut view = View::with_wire_len(&pkt.data[..captured], pkt.wire_len);
        let mut fields = Fields::default();
        let extracted = extract(&mut view, &mut fields, self.start_layer);
        if extracted.malformed {
            self.stats.malformed_packets += 1;
        }

        // Global packet stats.
        let wire_bytes = pkt.wire_len.min(u16::MAX as usize) as u16;
        self.stats.total_packets += 1;
        self.stats.total_bytes += pkt.wire_len as u64;
        self.stats.max_packet_size = self.stats.max_packet_size.max(wire_bytes);
        self.stats.min_packet_size = self.stats.min_packet_size.min(wire_bytes);

        // Per-protocol trace output.
        let key = fields.flow_key();
        let flags = fields.flags_bitset();
        self.output
            .trace_packet(&key, flags, fields.is_tcp(), fields.is_udp());

        let payload_bytes = pkt.wire_len as i64 - extracted.committed as i64;
        let fields = Rc::new(fields);

        match self.table.ingest(&fields, pkt.ts, wire_bytes, payload_bytes) {
            Ingest::New { id, record } => {
                let features = Features::new(fields.clone(), record);
                if let Some(min) = &mut self.min {
                    min.insert(id, pkt.ts);
                }
                if let Some(cache) = &mut self.cache {
                    let outcome = cache.insert(id, pkt.ts, features);
                    if let Some(ev) = outcome.eviction() {
                        let hits: i64 = ev.hits.borrow().iter().map(|&h| h as i64).sum();
                        self.output.write_eviction(ev.key, hits, &ev.res);
                    }
                }
            }
            Ingest::Seen { id, record } => {
                let (ns, _) = record.borrow().last();
                let features = Features::new(fields.clone(), record);
                if let Some(min) = &mut self.min {
                    if !min.update(id, pkt.ts) {
                        self.hub.record_min_miss(id, ns);
                    }
                }
                if let Some(cache) = &mut self.cache {
                    let (hit, outcome) = cache.update(id, pkt.ts, features);
                    if !hit {
                        self.hub.record_sim_miss(id, ns);
                    }
                    if let Some(ev) = outcome.eviction() {
                        let hits: i64 = ev.hits.borrow().iter().map(|&h| h as i64).sum();
                        self.output.write_eviction(ev.key, hits, &ev.res);
                    }
                }
            }
            Ingest::Blacklisted { .. } => {
                self.output.trace_scan(&key, flags);
            }
            Ingest::Untracked { .. } => {}
        }

        self.drain_retired();
        self.report_epoch(pkt.ts);
    }

    /// Runs an idle sweep against the latest packet clock. The table also
    /// sweeps itself periodically on flow allocation.
    pub fn sweep(&mut self) {
        if let Some(now) = self.last_ts {
            self.table.sweep(now);
            self.drain_retired();
            self.report_epoch(now);
        }
    }

    fn drain_retired(&mut self) {
        for RetiredFlow { record, reason } in self.table.take_retired() {
            let r = record.borrow();
            self.retire_counts[reason_slot(reason)] += 1;
            self.output.write_flow_stats(&r, reason);
            self.hub.offer(RetiredSample {
                id: r.flow_id(),
                key: r.key(),
                packets: r.packets(),
                bytes: r.bytes(),
                flags: r.tcp_state(),
                arrival_ns: r.arrival_series().to_vec(),
            });
        }
    }

    fn report_epoch(&mut self, now: TimeSpec) {
        if self.table.sweeps() == self.last_sweeps {
            return;
        }
        self.last_sweeps = self.table.sweeps();

        if let Some(report) = self.table.last_sweep() {
            let span = self
                .first_ts
                .map(|f| now.secs_since(&f))
                .unwrap_or_default();
            log::info!(
                "epoch ({}s): {}/{} flows touched, {} expired",
                span,
                report.touched,
                report.tracked,
                report.expired
            );
        }
        if let Some(cache) = &self.cache {
            let m = cache.misses();
            let total = cache.hits() + m.total();
            if total > 0 {
                log::info!(
                    "hit rate: {:.2}%; {}",
                    cache.hits() as f64 / total as f64 * 100.0,
                    cache.hp_handle().borrow().settings_string()
                );
            }
        }
    }

    /// Drains all remaining state and returns the final statistics report.
    pub fn finish(&mut self) -> String {
        self.stopped = true;

        self.table.drain();
        self.drain_retired();

        if let Some(min) = &mut self.min {
            let (evict, keep) = min.evictions();
            log::debug!(
                "final oracle trim: {} evictable, {} keepable",
                evict.len(),
                keep.len()
            );
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = self.output.dump_hp(&cache.hp_handle().borrow()) {
                log::error!("perceptron dump failed: {:#}", e);
            }
        }
        if let Some(dump) = &self.prediction_dump {
            if let Err(e) = dump.borrow_mut().flush() {
                log::error!("prediction dump flush failed: {:#}", e);
            }
        }
        if let Err(e) = self.output.finish() {
            log::error!("closing output streams failed: {:#}", e);
        }

        let mut report = format!(
            "Max packet size: {}\nMin packet size: {}\nTotal bytes: {}\nTotal packets: {}\nTotal flows: {}\nBlacklisted flows: {}\nBlacklisted packets: {}\nTimeout packets: {}\nMalformed packets: {}\nFlow port reuse: {}\n",
            self.stats.max_packet_size,
            if self.stats.min_packet_size == u16::MAX {
                0
            } else {
                self.stats.min_packet_size
            },
            self.stats.total_bytes,
            self.stats.total_packets,
            self.table.total_flows(),
            self.table.blacklist_flows(),
            self.table.blacklist_packets(),
            self.table.timeout_packets(),
            self.stats.malformed_packets,
            self.table.port_reuse(),
        );
        if let Some(min) = &self.min {
            report.push_str(&min.print_stats());
            report.push('\n');
        }
        if let Some(cache) = &self.cache {
            report.push_str(&cache.print_stats());
            report.push('\n');
        }
        log::info!("{}", report);
        report
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::testutil::{tcp_packet, udp_packet, PacketSpec};
    use crate::protocols::{TCP_ACK, TCP_SYN};

    fn packet<'a>(data: &'a [u8], ts: TimeSpec) -> PacketRef<'a> {
        PacketRef {
            port: 0,
            ts,
            data,
            captured_len: data.len(),
            wire_len: data.len(),
        }
    }

    fn quiet_config() -> SimConfig {
        let mut cfg = default_config();
        cfg.seed = Some(1);
        cfg.cache.hp.randomize = false;
        cfg.cache.hp.dynamic_threshold = false;
        cfg
    }

    #[test]
    fn core_pipeline_single_syn() {
        // Size-1 cache, MRU/LRU, one TCP SYN.
        let mut cfg = quiet_config();
        cfg.cache.entries = 1;
        cfg.cache.associativity = 0;
        cfg.min.entries = 1;
        let mut pipe = Pipeline::new(cfg).unwrap();

        let pkt = tcp_packet(&PacketSpec {
            src_ip: 0x0a00_0001,
            dst_ip: 0x0a00_0002,
            src_port: 40000,
            dst_port: 22,
            seq: 1000,
            flags: TCP_SYN,
            payload: 0,
        });
        pipe.process(&packet(&pkt, TimeSpec::new(0, 0)));

        assert_eq!(pipe.stats().total_packets, 1);
        let cache = pipe.cache().unwrap();
        assert_eq!(cache.hits(), 0);
        let m = cache.misses();
        assert_eq!(m.compulsory, 1);
        assert_eq!(m.capacity, 0);
        assert_eq!(pipe.table().size(), 1);
        assert_eq!(pipe.min_sim().unwrap().compulsory_miss(), 1);
    }

    #[test]
    fn core_pipeline_port_reuse() {
        let mut cfg = quiet_config();
        cfg.cache.entries = 4;
        cfg.cache.associativity = 0;
        let mut pipe = Pipeline::new(cfg).unwrap();

        let spec = |seq| PacketSpec {
            src_ip: 0x0a00_0001,
            dst_ip: 0x0a00_0002,
            src_port: 40000,
            dst_port: 80,
            seq,
            flags: TCP_SYN,
            payload: 0,
        };
        let p1 = tcp_packet(&spec(1000));
        let p2 = tcp_packet(&spec(2000));
        pipe.process(&packet(&p1, TimeSpec::new(0, 0)));
        pipe.process(&packet(&p2, TimeSpec::new(1, 0)));

        // Two incarnations: the first retired for port reuse.
        assert_eq!(pipe.table().port_reuse(), 1);
        assert_eq!(pipe.retired_by_reason(RetireReason::SynReuse), 1);
        assert_eq!(pipe.table().size(), 1);
        assert_eq!(pipe.cache().unwrap().compulsory_miss(), 2);
    }

    #[test]
    fn core_pipeline_hp_bypass_rejects_cold_flows() {
        let mut cfg = default_config();
        cfg.seed = Some(42);
        cfg.cache.entries = 4;
        cfg.cache.associativity = 4;
        cfg.cache.hp.bp = true;
        cfg.min.enabled = false;
        let mut pipe = Pipeline::new(cfg).unwrap();

        let hot = tcp_packet(&PacketSpec {
            src_ip: 0x0a00_0001,
            dst_ip: 0x0a00_0002,
            src_port: 50000,
            dst_port: 443,
            seq: 0,
            flags: TCP_ACK,
            payload: 64,
        });
        for i in 0u32..1000 {
            pipe.process(&packet(&hot, TimeSpec::new(i as i64, 0)));
            let cold = tcp_packet(&PacketSpec {
                src_ip: 0xc0a8_0000 + i,
                dst_ip: 0x0a00_0002,
                src_port: 20000 + (i % 30000) as u16,
                dst_port: 443,
                seq: 0,
                flags: TCP_ACK,
                payload: 0,
            });
            pipe.process(&packet(&cold, TimeSpec::new(i as i64, 500)));
        }

        let cache = pipe.cache().unwrap();
        let (bypasses, _) = cache.predictions_hp();
        assert!(bypasses > 0, "cold flows must see some bypasses");
        // Bypassed flows never occupied a way: installed cold entries are
        // strictly fewer than under unconditional MRU insertion.
        assert!(bypasses < 2000);
        // At least one evict prediction expired untouched and was
        // reinforced as correct.
        assert!(cache.set(0).trainer_stats().evict_correct >= 1);
    }

    #[test]
    fn core_pipeline_idle_sweep_retires_udp() {
        let mut cfg = quiet_config();
        cfg.cache.entries = 16;
        cfg.cache.associativity = 0;
        let mut pipe = Pipeline::new(cfg).unwrap();

        for p in 0..5u16 {
            let pkt = udp_packet(0x0a00_0001, 0x0a00_0002, 9000 + p, 53, 32);
            pipe.process(&packet(&pkt, TimeSpec::new(0, p as i64)));
        }
        assert_eq!(pipe.table().size(), 5);
        // Close the creation epoch while the flows are still fresh.
        pipe.sweep();
        assert_eq!(pipe.table().size(), 5);

        // 125 seconds of silence, then one more packet and a sweep.
        let late = udp_packet(0x0a00_0009, 0x0a00_0002, 1111, 53, 32);
        pipe.process(&packet(&late, TimeSpec::new(125, 0)));
        pipe.sweep();

        assert_eq!(pipe.retired_by_reason(RetireReason::UdpIdle), 5);
        assert_eq!(pipe.table().size(), 1);
    }

    #[test]
    fn core_pipeline_malformed_packet_counted_not_fatal() {
        let mut cfg = quiet_config();
        cfg.cache.associativity = 0;
        cfg.cache.entries = 4;
        let mut pipe = Pipeline::new(cfg).unwrap();

        let pkt = tcp_packet(&PacketSpec {
            src_ip: 1,
            dst_ip: 2,
            src_port: 3,
            dst_port: 4,
            seq: 0,
            flags: TCP_ACK,
            payload: 0,
        });
        // Slice into the TCP header.
        let cut = &pkt[..40];
        pipe.process(&PacketRef {
            port: 0,
            ts: TimeSpec::new(0, 0),
            data: cut,
            captured_len: cut.len(),
            wire_len: pkt.len(),
        });

        assert_eq!(pipe.stats().malformed_packets, 1);
        assert_eq!(pipe.stats().total_packets, 1);
        // L3 succeeded, so the flow is tracked at layer granularity.
        assert_eq!(pipe.table().size(), 1);
    }

    #[test]
    fn core_pipeline_finish_reports() {
        let mut cfg = quiet_config();
        cfg.cache.entries = 4;
        cfg.cache.associativity = 2;
        let mut pipe = Pipeline::new(cfg).unwrap();

        for i in 0..8u16 {
            let pkt = udp_packet(0x0a00_0001, 0x0a00_0002, 7000 + i, 53, 0);
            pipe.process(&packet(&pkt, TimeSpec::new(i as i64, 0)));
        }
        let report = pipe.finish();
        assert!(report.contains("Total packets: 8"));
        assert!(report.contains("SimMIN"));
        assert!(report.contains("SimCache"));
        // Everything was drained at shutdown.
        assert_eq!(pipe.table().size(), 0);

        // Stopped pipelines drop further input.
        let pkt = udp_packet(1, 2, 3, 4, 0);
        pipe.process(&packet(&pkt, TimeSpec::new(100, 0)));
        assert_eq!(pipe.stats().total_packets, 8);
    }
}
