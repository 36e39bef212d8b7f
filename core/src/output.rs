//! Persisted output streams.
//!
//! A run writes into a timestamped directory beneath the configured output
//! root: a flow-stats stream (one line per retired flow), gzip-wrapped
//! binary packet traces split by protocol class, an eviction-lifetime CSV,
//! and optional perceptron table dumps. Every stream is individually
//! optional; an unconfigured sink swallows its writes.

use crate::config::OutputConfig;
use crate::flowtable::record::{FlowRecord, RetireReason};
use crate::perceptron::HashedPerceptron;
use crate::protocols::FlowKey;
use crate::sim::Reservation;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;

type GzFile = GzEncoder<BufWriter<File>>;

pub struct OutputSink {
    dir: Option<PathBuf>,
    flow_stats: Option<GzFile>,
    trace: Option<GzFile>,
    trace_tcp: Option<GzFile>,
    trace_udp: Option<GzFile>,
    trace_other: Option<GzFile>,
    trace_scans: Option<GzFile>,
    evictions: Option<csv::Writer<File>>,
    hp_dumps: bool,
}

/// Appends `.gz` unless the name already carries it.
fn gz_name(name: &str) -> String {
    if name.ends_with(".gz") {
        name.to_string()
    } else {
        format!("{}.gz", name)
    }
}

fn open_gz(dir: &Path, name: &Option<String>) -> Result<Option<GzFile>> {
    let Some(name) = name else {
        return Ok(None);
    };
    let path = dir.join(gz_name(name));
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    Ok(Some(GzEncoder::new(
        BufWriter::new(file),
        Compression::default(),
    )))
}

impl OutputSink {
    /// Opens the configured streams beneath a fresh run directory. With no
    /// output root configured, every sink is disabled.
    pub fn new(cfg: &OutputConfig) -> Result<Self> {
        let Some(root) = &cfg.directory else {
            if cfg.flow_stats.is_some() || cfg.trace.is_some() || cfg.trace_tcp.is_some() {
                log::warn!("output streams configured without an output directory; disabled");
            }
            return Ok(OutputSink::disabled());
        };

        let dir = PathBuf::from(root).join(Local::now().format("%F_%H-%M-%S").to_string());
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        log::info!("writing run output to {}", dir.display());

        let evictions = match &cfg.evictions {
            Some(name) => Some(
                csv::Writer::from_path(dir.join(name))
                    .with_context(|| format!("creating {}", name))?,
            ),
            None => None,
        };

        Ok(OutputSink {
            flow_stats: open_gz(&dir, &cfg.flow_stats)?,
            trace: open_gz(&dir, &cfg.trace)?,
            trace_tcp: open_gz(&dir, &cfg.trace_tcp)?,
            trace_udp: open_gz(&dir, &cfg.trace_udp)?,
            trace_other: open_gz(&dir, &cfg.trace_other)?,
            trace_scans: open_gz(&dir, &cfg.trace_scans)?,
            evictions,
            hp_dumps: cfg.hp_dumps,
            dir: Some(dir),
        })
    }

    pub fn disabled() -> Self {
        OutputSink {
            dir: None,
            flow_stats: None,
            trace: None,
            trace_tcp: None,
            trace_udp: None,
            trace_other: None,
            trace_scans: None,
            evictions: None,
            hp_dumps: false,
        }
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Appends the packed key (and, for TCP, the flags bitset) to the
    /// per-protocol traces.
    pub fn trace_packet(&mut self, key: &FlowKey, flags: u16, is_tcp: bool, is_udp: bool) {
        if let Some(w) = &mut self.trace {
            let _ = w.write_all(key.as_bytes());
        }
        if is_tcp {
            if let Some(w) = &mut self.trace_tcp {
                let _ = w.write_all(key.as_bytes());
                let _ = w.write_all(&flags.to_be_bytes());
            }
        } else if is_udp {
            if let Some(w) = &mut self.trace_udp {
                let _ = w.write_all(key.as_bytes());
            }
        } else if let Some(w) = &mut self.trace_other {
            let _ = w.write_all(key.as_bytes());
        }
    }

    /// Appends a suspected-scan packet to the scans trace.
    pub fn trace_scan(&mut self, key: &FlowKey, flags: u16) {
        if let Some(w) = &mut self.trace_scans {
            let _ = w.write_all(key.as_bytes());
            let _ = w.write_all(&flags.to_be_bytes());
        }
    }

    /// One line per retired flow.
    pub fn write_flow_stats(&mut self, record: &FlowRecord, reason: RetireReason) {
        let Some(w) = &mut self.flow_stats else {
            return;
        };
        let pkts = record.packets().max(1);
        let line = format!(
            "FlowID={}, key={}, packets={}, bytes={}, ppBytes={}, flags={}{}{}, reason={}\n",
            record.flow_id(),
            record.key(),
            record.packets(),
            record.bytes(),
            record.bytes() / pkts,
            if record.saw_syn() { "SYN" } else { "" },
            if record.saw_fin() { "|FIN" } else { "" },
            if record.saw_rst() { "|RST" } else { "" },
            reason,
        );
        let _ = w.write_all(line.as_bytes());
    }

    /// One CSV row per eviction: id, total hits, column span, wall span.
    pub fn write_eviction(&mut self, id: u64, hits: i64, res: &Reservation) {
        let Some(w) = &mut self.evictions else {
            return;
        };
        let _ = w.write_record([
            id.to_string(),
            hits.to_string(),
            res.duration_cols().to_string(),
            res.duration_time().as_nanos().to_string(),
        ]);
    }

    /// Writes the perceptron CSV dumps into the run directory.
    pub fn dump_hp(&self, hp: &HashedPerceptron) -> Result<()> {
        if !self.hp_dumps {
            return Ok(());
        }
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        hp.dump_tables(dir)?;
        hp.dump_table_stats(dir)?;
        hp.dump_correlation(dir)?;
        Ok(())
    }

    /// Flushes and closes every stream.
    pub fn finish(&mut self) -> Result<()> {
        for w in [
            &mut self.flow_stats,
            &mut self.trace,
            &mut self.trace_tcp,
            &mut self.trace_udp,
            &mut self.trace_other,
            &mut self.trace_scans,
        ]
        .into_iter()
        .flatten()
        {
            w.try_finish().context("closing gzip stream")?;
        }
        if let Some(w) = &mut self.evictions {
            w.flush().context("flushing eviction csv")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{IP_PROTO_TCP, TCP_ACK, TCP_SYN};
    use crate::utils::TimeSpec;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flowsim-output-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn core_output_trace_key_roundtrip() {
        let root = scratch_dir("trace");
        let cfg = OutputConfig {
            directory: Some(root.to_string_lossy().into_owned()),
            trace_tcp: Some("flows-tcp.trace".to_string()),
            ..Default::default()
        };
        let mut sink = OutputSink::new(&cfg).unwrap();
        let run_dir = sink.run_dir().unwrap().to_path_buf();

        let key = FlowKey::new(0xc0a8_0001, 0x0a00_0002, 40001, 443, IP_PROTO_TCP);
        let flags = TCP_SYN | TCP_ACK;
        sink.trace_packet(&key, flags, true, false);
        sink.finish().unwrap();

        let mut raw = Vec::new();
        GzDecoder::new(File::open(run_dir.join("flows-tcp.trace.gz")).unwrap())
            .read_to_end(&mut raw)
            .unwrap();
        assert_eq!(raw.len(), FlowKey::SIZE + 2);
        let restored = FlowKey::from_bytes(raw[..FlowKey::SIZE].try_into().unwrap());
        assert_eq!(restored, key);
        assert_eq!(
            u16::from_be_bytes(raw[FlowKey::SIZE..].try_into().unwrap()),
            flags
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn core_output_flow_stats_lines() {
        let root = scratch_dir("stats");
        let cfg = OutputConfig {
            directory: Some(root.to_string_lossy().into_owned()),
            flow_stats: Some("stats-flows.log".to_string()),
            ..Default::default()
        };
        let mut sink = OutputSink::new(&cfg).unwrap();
        let run_dir = sink.run_dir().unwrap().to_path_buf();

        let key = FlowKey::new(1, 2, 3, 4, IP_PROTO_TCP);
        let record = FlowRecord::new(7, key, TimeSpec::default(), false);
        sink.write_flow_stats(&record, RetireReason::SynReuse);
        sink.finish().unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(run_dir.join("stats-flows.log.gz")).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.contains("FlowID=7"));
        assert!(text.contains("reason=SYN_REUSE"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn core_output_disabled_sink_is_silent() {
        let mut sink = OutputSink::disabled();
        let key = FlowKey::new(1, 2, 3, 4, IP_PROTO_TCP);
        sink.trace_packet(&key, 0, false, true);
        sink.trace_scan(&key, 0);
        let record = FlowRecord::new(1, key, TimeSpec::default(), false);
        sink.write_flow_stats(&record, RetireReason::UdpIdle);
        assert!(sink.finish().is_ok());
        assert!(sink.run_dir().is_none());
    }
}
