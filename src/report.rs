//! Error events, capture-wide counters and the exported report.
//!
//! The report is built from original values. `export` is the only way out
//! and translates every address and name through the run's map when one is
//! given.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::net::IpAddr;

use serde::Serialize;

use crate::anonymize::AnonymizationMap;
use crate::decode::{DecodedPacket, Layer};
use crate::error::PacketDecodeWarning;
use crate::flow::{ConnState, Endpoint, FlowKey, FlowVolume};
use crate::rewrite::WARNING_SAMPLES;

/// Top-N length for address and port rankings.
const TOP_ADDRESSES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TcpReset,
    Retransmission,
    ConnectionFailure,
    DnsFailure,
    HttpError,
    IcmpUnreachable,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::TcpReset, ErrorKind::Retransmission, ErrorKind::ConnectionFailure,
        ErrorKind::DnsFailure, ErrorKind::HttpError, ErrorKind::IcmpUnreachable,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::TcpReset          => "tcp_reset",
            ErrorKind::Retransmission    => "retransmission",
            ErrorKind::ConnectionFailure => "connection_failure",
            ErrorKind::DnsFailure        => "dns_failure",
            ErrorKind::HttpError         => "http_error",
            ErrorKind::IcmpUnreachable   => "icmp_unreachable",
        }
    }
}

/// One detected fault. `detail` never carries addresses or names; those live
/// in the typed fields so export can translate them.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub kind:          ErrorKind,
    pub packet_index:  u64,
    /// The request, query or SYN this event answers.
    pub related_index: Option<u64>,
    pub timestamp:     f64,
    pub flow:          FlowKey,
    pub sender:        Endpoint,
    pub receiver:      Endpoint,
    pub detail:        String,
    /// Queried DNS name, for DNS failures.
    pub subject:       Option<String>,
}

// ─── Summary ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InfoCounts {
    pub unanswered_dns_queries: u64,
    pub orphaned_dns_responses: u64,
    pub unanswered_http:        u64,
    pub refused_connections:    u64,
    pub completed_handshakes:   u64,
    pub out_of_order_segments:  u64,
    pub large_packets:          u64,
    pub snapped_packets:        u64,
    pub non_ip_packets:         u64,
    pub decode_warnings:        u64,
    pub flows_evicted_idle:     u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub total_packets:        u64,
    pub total_bytes:          u64,
    pub first_timestamp:      Option<f64>,
    pub last_timestamp:       Option<f64>,
    pub total_flows:          u64,
    pub error_counts:         BTreeMap<ErrorKind, u64>,
    pub protocols:            BTreeMap<&'static str, u64>,
    pub tcp_flags:            BTreeMap<String, u64>,
    pub top_flows_by_packets: Vec<FlowVolume>,
    pub top_flows_by_bytes:   Vec<FlowVolume>,
    pub top_sources:          Vec<(IpAddr, u64)>,
    pub top_destinations:     Vec<(IpAddr, u64)>,
    pub top_src_ports:        Vec<(u16, u64)>,
    pub top_dst_ports:        Vec<(u16, u64)>,
    pub top_dns_queries:      Vec<(String, u64)>,
    pub info:                 InfoCounts,
    pub warning_samples:      Vec<PacketDecodeWarning>,
}

impl Summary {
    pub fn duration_secs(&self) -> f64 {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(a), Some(b)) => (b - a).max(0.0),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisReport {
    pub summary: Summary,
    /// Ordered by packet index.
    pub events:  Vec<ErrorEvent>,
}

impl AnalysisReport {
    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.summary.error_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn events_of(&self, kind: ErrorKind) -> impl Iterator<Item = &ErrorEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    /// Serializable form. With a map, every address and DNS name is replaced
    /// the way the sanitized capture replaced it.
    pub fn export(&self, map: Option<&AnonymizationMap>) -> ExportedReport {
        let tx = Translator { map };
        let s = &self.summary;
        let summary = ExportedSummary {
            total_packets:        s.total_packets,
            total_bytes:          s.total_bytes,
            first_timestamp:      s.first_timestamp,
            last_timestamp:       s.last_timestamp,
            duration_secs:        s.duration_secs(),
            total_flows:          s.total_flows,
            error_counts:         ErrorKind::ALL.iter()
                .map(|&k| (k.name().to_string(), s.error_counts.get(&k).copied().unwrap_or(0)))
                .collect(),
            protocols:            s.protocols.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            tcp_flags:            s.tcp_flags.clone(),
            top_flows_by_packets: s.top_flows_by_packets.iter().map(|f| tx.flow(f)).collect(),
            top_flows_by_bytes:   s.top_flows_by_bytes.iter().map(|f| tx.flow(f)).collect(),
            top_sources:          s.top_sources.iter().map(|&(ip, n)| Ranked::new(tx.ip(ip), n)).collect(),
            top_destinations:     s.top_destinations.iter().map(|&(ip, n)| Ranked::new(tx.ip(ip), n)).collect(),
            top_src_ports:        s.top_src_ports.iter().map(|&(p, n)| Ranked::new(p.to_string(), n)).collect(),
            top_dst_ports:        s.top_dst_ports.iter().map(|&(p, n)| Ranked::new(p.to_string(), n)).collect(),
            top_dns_queries:      s.top_dns_queries.iter().map(|(q, n)| Ranked::new(tx.name(q), *n)).collect(),
            info:                 s.info.clone(),
            warning_samples:      s.warning_samples.clone(),
        };
        ExportedReport { summary, events: self.events.iter().map(|e| tx.event(e)).collect() }
    }
}

// ─── Export ───────────────────────────────────────────────────────────────────

struct Translator<'a> {
    map: Option<&'a AnonymizationMap>,
}

impl Translator<'_> {
    fn ip(&self, ip: IpAddr) -> String {
        self.map.map_or(ip, |m| m.lookup_ip(ip)).to_string()
    }

    fn endpoint(&self, ep: Endpoint) -> String {
        let addr = self.map.map_or(ep.addr, |m| m.lookup_ip(ep.addr));
        Endpoint { addr, port: ep.port }.to_string()
    }

    fn name(&self, name: &str) -> String {
        self.map.and_then(|m| m.lookup_domain(name)).unwrap_or(name).to_string()
    }

    fn conversation(&self, key: &FlowKey) -> String {
        format!("{} <-> {}", self.endpoint(key.a), self.endpoint(key.b))
    }

    fn flow(&self, f: &FlowVolume) -> ExportedFlow {
        ExportedFlow {
            conversation:    self.conversation(&f.key),
            protocol:        f.key.protocol_name(),
            packets:         f.packets,
            bytes:           f.bytes,
            first_seen:      f.first_seen,
            last_seen:       f.last_seen,
            duration_secs:   (f.last_seen - f.first_seen).max(0.0),
            final_state:     f.final_state,
            retransmissions: f.retransmissions,
            flags:           f.flags.clone(),
        }
    }

    fn event(&self, e: &ErrorEvent) -> ExportedEvent {
        ExportedEvent {
            kind:          e.kind,
            packet_index:  e.packet_index,
            related_index: e.related_index,
            timestamp:     e.timestamp,
            protocol:      e.flow.protocol_name(),
            sender:        self.endpoint(e.sender),
            receiver:      self.endpoint(e.receiver),
            detail:        e.detail.clone(),
            subject:       e.subject.as_deref().map(|s| self.name(s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranked {
    pub value: String,
    pub count: u64,
}

impl Ranked {
    fn new(value: String, count: u64) -> Self {
        Self { value, count }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedFlow {
    pub conversation:    String,
    pub protocol:        &'static str,
    pub packets:         u64,
    pub bytes:           u64,
    pub first_seen:      f64,
    pub last_seen:       f64,
    pub duration_secs:   f64,
    pub final_state:     ConnState,
    pub retransmissions: u64,
    pub flags:           BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedEvent {
    pub kind:          ErrorKind,
    pub packet_index:  u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_index: Option<u64>,
    pub timestamp:     f64,
    pub protocol:      &'static str,
    pub sender:        String,
    pub receiver:      String,
    pub detail:        String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject:       Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedSummary {
    pub total_packets:        u64,
    pub total_bytes:          u64,
    pub first_timestamp:      Option<f64>,
    pub last_timestamp:       Option<f64>,
    pub duration_secs:        f64,
    pub total_flows:          u64,
    pub error_counts:         BTreeMap<String, u64>,
    pub protocols:            BTreeMap<String, u64>,
    pub tcp_flags:            BTreeMap<String, u64>,
    pub top_flows_by_packets: Vec<ExportedFlow>,
    pub top_flows_by_bytes:   Vec<ExportedFlow>,
    pub top_sources:          Vec<Ranked>,
    pub top_destinations:     Vec<Ranked>,
    pub top_src_ports:        Vec<Ranked>,
    pub top_dst_ports:        Vec<Ranked>,
    pub top_dns_queries:      Vec<Ranked>,
    pub info:                 InfoCounts,
    pub warning_samples:      Vec<PacketDecodeWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedReport {
    pub summary: ExportedSummary,
    pub events:  Vec<ExportedEvent>,
}

impl ExportedReport {
    /// Events grouped by kind, at most `limit` of each.
    pub fn errors_by_kind(&self, limit: usize) -> BTreeMap<&'static str, Vec<&ExportedEvent>> {
        let mut out: BTreeMap<&'static str, Vec<&ExportedEvent>> = BTreeMap::new();
        for e in &self.events {
            let bucket = out.entry(e.kind.name()).or_default();
            if bucket.len() < limit {
                bucket.push(e);
            }
        }
        out
    }
}

// ─── Aggregator ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Measure {
    Packets,
    Bytes,
}

impl Measure {
    fn of(self, flow: &FlowVolume) -> u64 {
        match self { Measure::Packets => flow.packets, Measure::Bytes => flow.bytes }
    }
}

/// The `n` largest flows seen so far, by one measure.
#[derive(Debug)]
struct TopFlows {
    n:       usize,
    measure: Measure,
    flows:   Vec<FlowVolume>,
}

impl TopFlows {
    fn new(n: usize, measure: Measure) -> Self {
        Self { n, measure, flows: Vec::with_capacity(n) }
    }

    fn offer(&mut self, flow: &FlowVolume) {
        if self.n == 0 {
            return;
        }
        if self.flows.len() < self.n {
            self.flows.push(flow.clone());
            return;
        }
        let m = self.measure;
        let smallest = self.flows.iter().enumerate().min_by_key(|(_, f)| m.of(f)).map(|(i, f)| (i, m.of(f)));
        if let Some((idx, least)) = smallest {
            if m.of(flow) > least {
                self.flows[idx] = flow.clone();
            }
        }
    }

    fn into_sorted(mut self) -> Vec<FlowVolume> {
        let m = self.measure;
        self.flows.sort_by(|a, b| m.of(b).cmp(&m.of(a)).then(a.first_seen.total_cmp(&b.first_seen)));
        self.flows
    }
}

fn top<K: Ord + Clone + Hash>(counts: &HashMap<K, u64>, n: usize) -> Vec<(K, u64)> {
    let mut all: Vec<(K, u64)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    all.truncate(n);
    all
}

/// Capture-wide counters, fed per packet, per event and per finished flow.
#[derive(Debug)]
pub struct Aggregator {
    top_n:              usize,
    large_packet_bytes: u32,

    total_packets: u64,
    total_bytes:   u64,
    first_ts:      Option<f64>,
    last_ts:       Option<f64>,
    total_flows:   u64,

    protocols:   BTreeMap<&'static str, u64>,
    tcp_flags:   BTreeMap<String, u64>,
    sources:     HashMap<IpAddr, u64>,
    dests:       HashMap<IpAddr, u64>,
    src_ports:   HashMap<u16, u64>,
    dst_ports:   HashMap<u16, u64>,
    dns_queries: HashMap<String, u64>,
    by_packets:  TopFlows,
    by_bytes:    TopFlows,

    events:          Vec<ErrorEvent>,
    counts:          BTreeMap<ErrorKind, u64>,
    info:            InfoCounts,
    warning_samples: Vec<PacketDecodeWarning>,
}

impl Aggregator {
    pub fn new(top_n: usize, large_packet_bytes: u32) -> Self {
        Self {
            top_n,
            large_packet_bytes,
            total_packets: 0,
            total_bytes: 0,
            first_ts: None,
            last_ts: None,
            total_flows: 0,
            protocols: BTreeMap::new(),
            tcp_flags: BTreeMap::new(),
            sources: HashMap::new(),
            dests: HashMap::new(),
            src_ports: HashMap::new(),
            dst_ports: HashMap::new(),
            dns_queries: HashMap::new(),
            by_packets: TopFlows::new(top_n, Measure::Packets),
            by_bytes: TopFlows::new(top_n, Measure::Bytes),
            events: Vec::new(),
            counts: BTreeMap::new(),
            info: InfoCounts::default(),
            warning_samples: Vec::new(),
        }
    }

    pub fn record(&mut self, event: ErrorEvent) {
        *self.counts.entry(event.kind).or_insert(0) += 1;
        self.events.push(event);
    }

    pub fn record_packet(&mut self, packet: &DecodedPacket, wire_len: u32, ts: f64, snapped: bool) {
        self.total_packets += 1;
        self.total_bytes += u64::from(wire_len);
        self.first_ts = Some(self.first_ts.map_or(ts, |t| t.min(ts)));
        self.last_ts = Some(self.last_ts.map_or(ts, |t| t.max(ts)));
        if wire_len > self.large_packet_bytes {
            self.info.large_packets += 1;
        }
        if snapped {
            self.info.snapped_packets += 1;
        }

        for layer in &packet.layers {
            if !matches!(layer, Layer::Unknown(_)) {
                *self.protocols.entry(layer.name()).or_insert(0) += 1;
            }
        }
        match packet.ip_pair() {
            Some((src, dst)) => {
                *self.sources.entry(src).or_insert(0) += 1;
                *self.dests.entry(dst).or_insert(0) += 1;
            }
            None => self.info.non_ip_packets += 1,
        }

        let ports = if let Some(tcp) = packet.tcp() {
            *self.tcp_flags.entry(tcp.flags.to_string()).or_insert(0) += 1;
            Some((tcp.src_port, tcp.dst_port))
        } else {
            packet.udp().map(|udp| (udp.src_port, udp.dst_port))
        };
        if let Some((sp, dp)) = ports {
            *self.src_ports.entry(sp).or_insert(0) += 1;
            *self.dst_ports.entry(dp).or_insert(0) += 1;
        }

        if let Some(dns) = packet.dns().filter(|d| !d.is_response) {
            if let Some(q) = dns.query_name() {
                *self.dns_queries.entry(q.to_ascii_lowercase()).or_insert(0) += 1;
            }
        }
    }

    pub fn record_flow(&mut self, flow: &FlowVolume) {
        self.total_flows += 1;
        self.by_packets.offer(flow);
        self.by_bytes.offer(flow);
    }

    pub fn record_warning(&mut self, warning: &PacketDecodeWarning) {
        self.info.decode_warnings += 1;
        if self.warning_samples.len() < WARNING_SAMPLES {
            self.warning_samples.push(warning.clone());
        }
    }

    pub fn info_mut(&mut self) -> &mut InfoCounts {
        &mut self.info
    }

    pub fn finalize(mut self) -> AnalysisReport {
        self.events.sort_by_key(|e| e.packet_index);
        let addr_n = TOP_ADDRESSES.min(self.top_n);
        let summary = Summary {
            total_packets:        self.total_packets,
            total_bytes:          self.total_bytes,
            first_timestamp:      self.first_ts,
            last_timestamp:       self.last_ts,
            total_flows:          self.total_flows,
            error_counts:         self.counts,
            protocols:            self.protocols,
            tcp_flags:            self.tcp_flags,
            top_flows_by_packets: self.by_packets.into_sorted(),
            top_flows_by_bytes:   self.by_bytes.into_sorted(),
            top_sources:          top(&self.sources, addr_n),
            top_destinations:     top(&self.dests, addr_n),
            top_src_ports:        top(&self.src_ports, addr_n),
            top_dst_ports:        top(&self.dst_ports, addr_n),
            top_dns_queries:      top(&self.dns_queries, self.top_n),
            info:                 self.info,
            warning_samples:      self.warning_samples,
        };
        AnalysisReport { summary, events: self.events }
    }
}
