//! Per-flow fault classification over the packet stream, in capture order.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

use crate::config::AnalyzeOptions;
use crate::decode::{
    rcode_name, DecodedPacket, DnsLayer, HttpLayer, HttpStart, IcmpLayer, QuotedAddrs, IPPROTO_ICMP,
    IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP,
};
use crate::error::PacketDecodeWarning;
use crate::flow::{ConnState, Endpoint, FlowKey, FlowState, TcpVerdict};
use crate::report::{Aggregator, AnalysisReport, ErrorEvent, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    Idle,
    Reset,
    EndOfCapture,
}

/// Where the current packet sits, for building events.
struct Site {
    index:    u64,
    ts:       f64,
    key:      FlowKey,
    sender:   Endpoint,
    receiver: Endpoint,
}

impl Site {
    fn event(&self, kind: ErrorKind, detail: String) -> ErrorEvent {
        ErrorEvent {
            kind,
            packet_index:  self.index,
            related_index: None,
            timestamp:     self.ts,
            flow:          self.key,
            sender:        self.sender,
            receiver:      self.receiver,
            detail,
            subject:       None,
        }
    }
}

pub struct Tracker {
    options:     AnalyzeOptions,
    flows:       HashMap<FlowKey, FlowState>,
    aggregator:  Aggregator,
    since_sweep: u64,
    /// Resets already reported, by flow and sequence number, with their time.
    resets:      HashMap<(FlowKey, u32), f64>,
}

impl Tracker {
    pub fn new(options: &AnalyzeOptions) -> Self {
        Self {
            options:     options.clone(),
            flows:       HashMap::new(),
            aggregator:  Aggregator::new(options.top_n, options.large_packet_bytes),
            since_sweep: 0,
            resets:      HashMap::new(),
        }
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn note_warning(&mut self, warning: &PacketDecodeWarning) {
        self.aggregator.record_warning(warning);
    }

    /// Feed one decoded packet. `wire_len` is the original length.
    pub fn observe(&mut self, packet: &DecodedPacket, index: u64, ts: f64, wire_len: u32, snapped: bool) {
        self.aggregator.record_packet(packet, wire_len, ts, snapped);

        self.since_sweep += 1;
        if self.since_sweep >= self.options.sweep_interval.max(1) {
            self.since_sweep = 0;
            self.sweep(ts);
        }

        let Some((src, dst)) = packet.ip_pair() else { return };
        let (protocol, sport, dport) = if let Some(tcp) = packet.tcp() {
            (IPPROTO_TCP, tcp.src_port, tcp.dst_port)
        } else if let Some(udp) = packet.udp() {
            (IPPROTO_UDP, udp.src_port, udp.dst_port)
        } else if let Some(icmp) = packet.icmp() {
            (if icmp.v6 { IPPROTO_ICMPV6 } else { IPPROTO_ICMP }, 0, 0)
        } else {
            return;
        };
        let (key, dir) = FlowKey::new(protocol, Endpoint { addr: src, port: sport }, Endpoint { addr: dst, port: dport });

        if let Some(tcp) = packet.tcp().filter(|t| t.flags.rst()) {
            let repeat = self.resets.get(&(key, tcp.seq))
                .map_or(false, |&at| ts - at <= self.options.idle_timeout_secs);
            if repeat && !self.flows.contains_key(&key) {
                debug!(flow = %key, index, "repeated reset");
                return;
            }
        }

        let stale = self.flows.get(&key).map_or(false, |f| f.idle_for(ts) > self.options.idle_timeout_secs);
        if stale {
            self.evict(&key, Eviction::Idle);
        }

        let window = self.options.retransmit_window;
        let flow = self.flows.entry(key).or_insert_with(|| {
            debug!(flow = %key, index, "new flow");
            FlowState::new(key, ts, window)
        });
        flow.touch(ts, wire_len);

        let (sender, receiver) = key.endpoints(dir);
        let site = Site { index, ts, key, sender, receiver };
        let mut events = Vec::new();
        let mut reset = false;
        let mut resent = false;
        let mut orphaned = 0;

        if let Some(tcp) = packet.tcp() {
            match flow.on_tcp(dir, tcp, index, ts) {
                TcpVerdict::Normal => {}
                TcpVerdict::Retransmission => {
                    resent = true;
                    events.push(site.event(
                        ErrorKind::Retransmission,
                        format!("seq {} len {} ({})", tcp.seq, tcp.segment_len(), tcp.flags),
                    ));
                }
                TcpVerdict::Reset { in_handshake } => {
                    reset = true;
                    self.resets.insert((key, tcp.seq), ts);
                    let detail = if in_handshake { "connection refused: RST during handshake" } else { "connection reset" };
                    if in_handshake {
                        self.aggregator.info_mut().refused_connections += 1;
                    }
                    let mut event = site.event(ErrorKind::TcpReset, detail.to_string());
                    event.related_index = flow.syn.filter(|_| in_handshake).map(|syn| syn.index);
                    events.push(event);
                }
            }
        }
        // a resent segment carries a message already accounted for
        if let Some(dns) = packet.dns().filter(|_| !resent) {
            if let Some(event) = classify_dns(flow, dns, &site, &mut orphaned) {
                events.push(event);
            }
        }
        if let Some(http) = packet.http().filter(|_| !resent) {
            if let Some(event) = classify_http(flow, http, &site) {
                events.push(event);
            }
        }
        if let Some(icmp) = packet.icmp().filter(|i| i.is_unreachable()) {
            events.push(classify_unreachable(icmp, &site));
        }

        self.aggregator.info_mut().orphaned_dns_responses += orphaned;
        for event in events {
            self.aggregator.record(event);
        }
        if reset {
            self.evict(&key, Eviction::Reset);
        }
    }

    /// Evict flows idle longer than the timeout as of `now`.
    fn sweep(&mut self, now: f64) {
        let timeout = self.options.idle_timeout_secs;
        let idle: Vec<FlowKey> = self.flows.values()
            .filter(|f| f.idle_for(now) > timeout)
            .map(|f| f.key)
            .collect();
        if !idle.is_empty() {
            debug!(count = idle.len(), active = self.flows.len(), "idle sweep");
        }
        for key in idle {
            self.evict(&key, Eviction::Idle);
        }
        self.resets.retain(|_, at| now - *at <= timeout);
    }

    fn evict(&mut self, key: &FlowKey, why: Eviction) {
        let Some(flow) = self.flows.remove(key) else { return };
        debug!(flow = %key, state = flow.state.name(), reason = ?why, "evict");

        if why == Eviction::Idle {
            self.aggregator.info_mut().flows_evicted_idle += 1;
        }
        if flow.state == ConnState::HandshakePending && !flow.reset_seen {
            if let Some(syn) = flow.syn {
                let (sender, receiver) = key.endpoints(syn.dir);
                let detail = match why {
                    Eviction::EndOfCapture => "handshake not completed before end of capture",
                    _ => "handshake not completed before idle timeout",
                };
                self.aggregator.record(ErrorEvent {
                    kind:          ErrorKind::ConnectionFailure,
                    packet_index:  syn.index,
                    related_index: None,
                    timestamp:     syn.ts,
                    flow:          *key,
                    sender,
                    receiver,
                    detail:        detail.to_string(),
                    subject:       None,
                });
            }
        }

        let info = self.aggregator.info_mut();
        if flow.handshake_complete {
            info.completed_handshakes += 1;
        }
        info.unanswered_dns_queries += flow.pending_dns.len() as u64;
        info.unanswered_http += flow.pending_http.len() as u64 + flow.http_overflow;
        info.out_of_order_segments += flow.out_of_order;
        self.aggregator.record_flow(&flow.volume());
    }

    /// Evict every remaining flow and produce the report.
    pub fn finish(mut self) -> AnalysisReport {
        let mut keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        keys.sort();
        for key in keys {
            self.evict(&key, Eviction::EndOfCapture);
        }
        self.aggregator.finalize()
    }
}

// ─── Classifiers ──────────────────────────────────────────────────────────────

fn classify_dns(flow: &mut FlowState, dns: &DnsLayer, site: &Site, orphaned: &mut u64) -> Option<ErrorEvent> {
    if !dns.is_response {
        if let Some(name) = dns.query_name() {
            flow.dns_query(dns.id, name, site.index, site.ts);
        }
        return None;
    }
    let query = flow.dns_response(dns.id);
    if query.is_none() {
        *orphaned += 1;
    }
    if dns.rcode == 0 {
        return None;
    }
    let mut event = site.event(ErrorKind::DnsFailure, format!("{} (rcode {})", rcode_name(dns.rcode), dns.rcode));
    event.related_index = query.as_ref().map(|q| q.index);
    event.subject = query.map(|q| q.name).or_else(|| dns.query_name().map(str::to_string));
    Some(event)
}

fn classify_http(flow: &mut FlowState, http: &HttpLayer, site: &Site) -> Option<ErrorEvent> {
    match &http.start {
        HttpStart::Request { method, .. } => {
            flow.http_request(method, site.index, site.ts);
            None
        }
        // interim responses leave the request outstanding
        HttpStart::Response { status, .. } if *status < 200 => None,
        HttpStart::Response { status, .. } => {
            let request = flow.http_response();
            if *status < 400 {
                return None;
            }
            let detail = match &request {
                Some(req) => format!("{} -> HTTP {status}", req.method),
                None => format!("HTTP {status} without a matching request"),
            };
            let mut event = site.event(ErrorKind::HttpError, detail);
            event.related_index = request.map(|r| r.index);
            Some(event)
        }
    }
}

fn unreachable_reason(v6: bool, code: u8) -> &'static str {
    match (v6, code) {
        (false, 0) => "network unreachable",
        (false, 1) => "host unreachable",
        (false, 2) => "protocol unreachable",
        (false, 3) => "port unreachable",
        (false, 4) => "fragmentation needed",
        (false, 9 | 10 | 13) => "administratively prohibited",
        (true, 0) => "no route to destination",
        (true, 1) => "administratively prohibited",
        (true, 2) => "beyond scope of source address",
        (true, 3) => "address unreachable",
        (true, 4) => "port unreachable",
        (true, 5) => "source address failed policy",
        (true, 6) => "reject route",
        _ => "unreachable",
    }
}

/// Attributed to the flow quoted inside the message when it can be read.
fn classify_unreachable(icmp: &IcmpLayer, site: &Site) -> ErrorEvent {
    let reason = unreachable_reason(icmp.v6, icmp.code);
    let mut event = site.event(ErrorKind::IcmpUnreachable, format!("{reason} (type {} code {})", icmp.icmp_type, icmp.code));
    if let Some(quoted) = &icmp.quoted {
        let (qsrc, qdst) = match quoted.addrs {
            QuotedAddrs::V4(s, d) => (IpAddr::V4(s.addr), IpAddr::V4(d.addr)),
            QuotedAddrs::V6(s, d) => (IpAddr::V6(s.addr), IpAddr::V6(d.addr)),
        };
        let (sport, dport) = quoted.ports.unwrap_or((0, 0));
        let (key, _) = FlowKey::new(
            quoted.protocol,
            Endpoint { addr: qsrc, port: sport },
            Endpoint { addr: qdst, port: dport },
        );
        event.flow = key;
    }
    event
}
