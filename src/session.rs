//! One pass over a capture: read, decode, analyze, rewrite, write.
//!
//! Records are handled strictly one at a time in capture order. Sanitizing
//! and analyzing consume the same decoded packet but keep separate state.

use std::io::{self, Read, Write};

use tracing::{debug, info, warn};

use crate::anonymize::AnonymizationMap;
use crate::codec::{CaptureReader, CaptureWriter, PacketRecord};
use crate::config::{AnalyzeOptions, SanitizeOptions};
use crate::decode::{decode, DecodeOutcome, LayerFault};
use crate::error::{PacketDecodeWarning, Result, TriageError, WarningCause};
use crate::report::{AnalysisReport, ExportedReport};
use crate::rewrite::{Rewriter, SanitizationStats};
use crate::tracker::Tracker;

const PROGRESS_EVERY: u64 = 100_000;

/// What a run produced, complete or not.
#[derive(Debug)]
pub struct RunOutcome {
    pub sanitization: Option<SanitizationStats>,
    /// Built from original values; see [`RunOutcome::export`].
    pub analysis:     Option<AnalysisReport>,
    /// False when the run stopped before the end of the capture. Output
    /// written by such a run is not a faithful copy of the input.
    pub complete:     bool,
    pub records:      u64,
    map:              Option<AnonymizationMap>,
}

impl RunOutcome {
    /// The analysis in exportable form, translated through this run's map
    /// when the run also sanitized.
    pub fn export(&self) -> Option<ExportedReport> {
        self.analysis.as_ref().map(|a| a.export(self.map.as_ref()))
    }
}

struct Sanitizer<W: Write> {
    writer:   CaptureWriter<W>,
    rewriter: Rewriter,
    map:      AnonymizationMap,
}

pub struct Session<R: Read, W: Write> {
    reader:    CaptureReader<R>,
    sanitizer: Option<Sanitizer<W>>,
    tracker:   Option<Tracker>,
    budget:    u64,
    malformed: u64,
}

impl<R: Read> Session<R, io::Sink> {
    pub fn analyze(input: R, options: &AnalyzeOptions) -> Result<Self> {
        Self::build(input, None, Some(options))
    }
}

impl<R: Read, W: Write> Session<R, W> {
    pub fn sanitize(input: R, output: W, options: &SanitizeOptions) -> Result<Self> {
        Self::build(input, Some((output, options)), None)
    }

    pub fn sanitize_and_analyze(input: R, output: W, sanitize: &SanitizeOptions, analyze: &AnalyzeOptions) -> Result<Self> {
        Self::build(input, Some((output, sanitize)), Some(analyze))
    }

    fn build(input: R, output: Option<(W, &SanitizeOptions)>, analyze: Option<&AnalyzeOptions>) -> Result<Self> {
        let reader = CaptureReader::open(input)?;
        let header = reader.header().clone();
        info!(
            link_type = header.link_type, snaplen = header.snaplen,
            resolution = ?header.resolution, byte_order = ?header.byte_order,
            "capture opened"
        );

        let mut budget = u64::MAX;
        let sanitizer = match output {
            Some((out, options)) => {
                budget = budget.min(options.max_malformed);
                Some(Sanitizer {
                    writer:   CaptureWriter::open(out, &header)?,
                    rewriter: Rewriter::new(options)?,
                    map:      AnonymizationMap::new(options.preserve_private, options.salt.as_deref()),
                })
            }
            None => None,
        };
        let tracker = analyze.map(|options| {
            budget = budget.min(options.max_malformed);
            Tracker::new(options)
        });
        Ok(Self { reader, sanitizer, tracker, budget, malformed: 0 })
    }

    /// Records consumed so far.
    pub fn records(&self) -> u64 {
        self.reader.records_read()
    }

    /// Handle the next record. `Ok(false)` at a clean end of capture.
    ///
    /// A malformed record still has its decoded layers rewritten; only the
    /// undecodable tail is copied unchanged.
    pub fn step(&mut self) -> Result<bool> {
        let Some(mut record) = self.reader.next_record()? else { return Ok(false) };
        let (link_type, resolution) = {
            let header = self.reader.header();
            (header.link_type, header.resolution)
        };
        let ts = record.timestamp(resolution);
        let DecodeOutcome { packet, warning } = decode(&record.data, link_type);

        if let Some(warning) = packet_warning(&record, warning) {
            self.malformed += 1;
            warn!("{warning}");
            if let Some(s) = &mut self.sanitizer {
                s.rewriter.stats_mut().note_warning(&warning);
            }
            if let Some(t) = &mut self.tracker {
                t.note_warning(&warning);
            }
            if self.malformed > self.budget {
                return Err(TriageError::TooManyMalformedPackets { count: self.malformed, limit: self.budget });
            }
        }

        if let Some(t) = &mut self.tracker {
            t.observe(&packet, record.index, ts, record.orig_len, record.is_snapped());
        }
        if let Some(s) = &mut self.sanitizer {
            if s.rewriter.rewrite(&packet, &mut record.data, &mut s.map) {
                debug!(index = record.index, "rewritten");
            }
            s.writer.write_record(&record)?;
        }

        let n = self.reader.records_read();
        if n % PROGRESS_EVERY == 0 {
            info!(records = n, "progress");
        }
        Ok(true)
    }

    /// Process every remaining record. A capture that ends inside a record
    /// still fails, carrying what the complete records produced.
    pub fn run(mut self) -> Result<RunOutcome> {
        loop {
            match self.step() {
                Ok(true) => {}
                Ok(false) => break,
                Err(TriageError::TruncatedCapture { records, .. }) => {
                    warn!(records, "capture ends inside a record; keeping complete records");
                    let partial = self.finish(false)?;
                    return Err(TriageError::TruncatedCapture { records, partial: Some(Box::new(partial)) });
                }
                Err(e) => return Err(e),
            }
        }
        self.finish(true)
    }

    /// Stop at the current record boundary. The outcome is marked incomplete.
    pub fn abort(self) -> Result<RunOutcome> {
        warn!(records = self.records(), "run aborted");
        self.finish(false)
    }

    fn finish(self, complete: bool) -> Result<RunOutcome> {
        let records = self.reader.records_read();
        let (sanitization, map) = match self.sanitizer {
            Some(Sanitizer { writer, rewriter, map }) => {
                writer.finish()?;
                let mut stats = rewriter.into_stats();
                stats.absorb_map(&map);
                info!(
                    packets = stats.total_packets, modified = stats.packets_modified,
                    warnings = stats.decode_warnings, "sanitize finished"
                );
                (Some(stats), Some(map))
            }
            None => (None, None),
        };
        let analysis = self.tracker.map(Tracker::finish);
        if let Some(report) = &analysis {
            info!(
                packets = report.summary.total_packets, flows = report.summary.total_flows,
                events = report.events.len(), "analysis finished"
            );
        }
        Ok(RunOutcome { sanitization, analysis, complete, records, map })
    }
}

/// The warning a record deserves, if any. A layer cut short by the
/// capture's snap length is expected and not reported.
fn packet_warning(record: &PacketRecord, fault: Option<LayerFault>) -> Option<PacketDecodeWarning> {
    if record.caplen() > record.orig_len {
        return Some(PacketDecodeWarning {
            packet_index: record.index,
            layer:        "record",
            cause:        WarningCause::Malformed,
            reason:       format!("captured length {} exceeds original length {}", record.caplen(), record.orig_len),
        });
    }
    let fault = fault?;
    if fault.cause == WarningCause::Truncated && record.is_snapped() {
        return None;
    }
    Some(PacketDecodeWarning { packet_index: record.index, layer: fault.layer, cause: fault.cause, reason: fault.reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{capture_bytes, eth_ipv4_tcp, eth_ipv4_udp, PacketSpec};

    fn garbage_ipv4() -> Vec<u8> {
        let mut pkt = eth_ipv4_udp(&PacketSpec::default(), b"hello");
        // IHL of 2 words is below the minimum header
        pkt[14] = 0x42;
        pkt
    }

    #[test]
    fn step_walks_records_then_stops() {
        let bytes = capture_bytes(&[eth_ipv4_tcp(&PacketSpec::default(), b"a"), eth_ipv4_tcp(&PacketSpec::default(), b"b")]);
        let mut session = Session::analyze(bytes.as_slice(), &AnalyzeOptions::default()).unwrap();
        assert!(session.step().unwrap());
        assert!(session.step().unwrap());
        assert!(!session.step().unwrap());
        assert_eq!(session.records(), 2);
    }

    #[test]
    fn abort_marks_the_outcome_incomplete() {
        let bytes = capture_bytes(&[eth_ipv4_tcp(&PacketSpec::default(), b"a"), eth_ipv4_tcp(&PacketSpec::default(), b"b")]);
        let mut out = Vec::new();
        let mut session = Session::sanitize(bytes.as_slice(), &mut out, &SanitizeOptions::default()).unwrap();
        session.step().unwrap();
        let outcome = session.abort().unwrap();
        assert!(!outcome.complete);
        assert_eq!(outcome.records, 1);
        assert_eq!(outcome.sanitization.unwrap().total_packets, 1);
        assert_eq!(out.len(), 24 + 16 + eth_ipv4_tcp(&PacketSpec::default(), b"a").len());
    }

    #[test]
    fn truncated_capture_carries_partial_outcome() {
        let mut bytes = capture_bytes(&[eth_ipv4_tcp(&PacketSpec::default(), b"abc"), eth_ipv4_tcp(&PacketSpec::default(), b"def")]);
        bytes.truncate(bytes.len() - 5);
        let err = Session::analyze(bytes.as_slice(), &AnalyzeOptions::default()).unwrap().run().unwrap_err();
        match err {
            TriageError::TruncatedCapture { records, partial: Some(partial) } => {
                assert_eq!(records, 1);
                assert!(!partial.complete);
                assert_eq!(partial.analysis.unwrap().summary.total_packets, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_budget_stops_the_run() {
        let packets: Vec<Vec<u8>> = (0..4).map(|_| garbage_ipv4()).collect();
        let options = AnalyzeOptions { max_malformed: 2, ..AnalyzeOptions::default() };
        let err = Session::analyze(capture_bytes(&packets).as_slice(), &options).unwrap().run().unwrap_err();
        assert!(matches!(err, TriageError::TooManyMalformedPackets { count: 3, limit: 2 }));
    }

    #[test]
    fn warnings_within_budget_are_counted() {
        let packets = vec![garbage_ipv4(), eth_ipv4_tcp(&PacketSpec::default(), b"ok")];
        let outcome = Session::analyze(capture_bytes(&packets).as_slice(), &AnalyzeOptions::default()).unwrap().run().unwrap();
        let report = outcome.analysis.unwrap();
        assert!(outcome.complete);
        assert_eq!(report.summary.info.decode_warnings, 1);
        assert_eq!(report.summary.warning_samples[0].packet_index, 0);
        assert_eq!(report.summary.total_packets, 2);
    }

    #[test]
    fn malformed_record_rewrites_decoded_layers_only() {
        let mut pkt = eth_ipv4_udp(&PacketSpec::default(), b"hello");
        // UDP length below its own header
        pkt[34 + 4] = 0;
        pkt[34 + 5] = 4;
        let mut out = Vec::new();
        let outcome = Session::sanitize(capture_bytes(&[pkt.clone()]).as_slice(), &mut out, &SanitizeOptions::default())
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(outcome.sanitization.unwrap().decode_warnings, 1);
        let record = &out[24 + 16..];
        assert_eq!(record.len(), pkt.len());
        assert_ne!(record[30..34], pkt[30..34]);
        assert_eq!(record[34..], pkt[34..]);
    }

    #[test]
    fn snap_length_truncation_is_not_a_warning() {
        let record = PacketRecord { index: 3, ts_sec: 0, ts_frac: 0, orig_len: 1500, data: vec![0; 64] };
        assert!(packet_warning(&record, Some(LayerFault::truncated("TCP", "header cut"))).is_none());
        let full = PacketRecord { orig_len: 64, ..record.clone() };
        assert!(packet_warning(&full, Some(LayerFault::truncated("TCP", "header cut"))).is_some());
        let bogus = PacketRecord { orig_len: 10, ..record };
        assert_eq!(packet_warning(&bogus, None).unwrap().layer, "record");
    }
}
