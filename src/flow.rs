//! Flow identity and the per-flow TCP state machine.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;

use serde::Serialize;
use tracing::debug;

use crate::decode::{TcpLayer, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

/// Requests queued per flow before the oldest is given up as unanswered.
const MAX_PENDING_HTTP: usize = 256;
/// Outstanding DNS transactions per flow.
const MAX_PENDING_DNS: usize = 1024;

// ─── Identity ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{a}:{}", self.port),
            IpAddr::V6(a) => write!(f, "[{a}]:{}", self.port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the lower endpoint to the higher one.
    AtoB,
    BtoA,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self { Direction::AtoB => Direction::BtoA, Direction::BtoA => Direction::AtoB }
    }

    fn idx(self) -> usize {
        match self { Direction::AtoB => 0, Direction::BtoA => 1 }
    }
}

/// Unordered transport 5-tuple, stored with `a <= b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowKey {
    pub protocol: u8,
    pub a:        Endpoint,
    pub b:        Endpoint,
}

impl FlowKey {
    /// Canonical key and the direction `src -> dst` travels in it.
    pub fn new(protocol: u8, src: Endpoint, dst: Endpoint) -> (Self, Direction) {
        if src <= dst {
            (Self { protocol, a: src, b: dst }, Direction::AtoB)
        } else {
            (Self { protocol, a: dst, b: src }, Direction::BtoA)
        }
    }

    /// (sender, receiver) for a packet travelling in `dir`.
    pub fn endpoints(&self, dir: Direction) -> (Endpoint, Endpoint) {
        match dir { Direction::AtoB => (self.a, self.b), Direction::BtoA => (self.b, self.a) }
    }

    pub fn protocol_name(&self) -> &'static str {
        match self.protocol {
            IPPROTO_TCP    => "TCP",
            IPPROTO_UDP    => "UDP",
            IPPROTO_ICMP   => "ICMP",
            IPPROTO_ICMPV6 => "ICMPv6",
            _              => "IP",
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.protocol_name(), self.a, self.b)
    }
}

// ─── Sequence arithmetic ──────────────────────────────────────────────────────

/// `a` precedes `b` in 32-bit sequence space.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_max(a: u32, b: u32) -> u32 {
    if seq_lt(a, b) { b } else { a }
}

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    New,
    HandshakePending,
    Established,
    Closing,
}

impl ConnState {
    pub fn name(self) -> &'static str {
        match self {
            ConnState::New              => "new",
            ConnState::HandshakePending => "handshake_pending",
            ConnState::Established      => "established",
            ConnState::Closing          => "closing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynSeen {
    pub index: u64,
    pub ts:    f64,
    pub isn:   u32,
    pub dir:   Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingDns {
    pub name:  String,
    pub index: u64,
    pub ts:    f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub index:  u64,
    pub method: String,
    pub ts:     f64,
}

/// What a TCP segment means for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpVerdict {
    Normal,
    Retransmission,
    /// The flow is over; `in_handshake` marks a refused connection.
    Reset { in_handshake: bool },
}

#[derive(Debug)]
pub struct FlowState {
    pub key:        FlowKey,
    pub state:      ConnState,
    pub first_seen: f64,
    pub last_seen:  f64,
    pub packets:    u64,
    pub bytes:      u64,

    /// Next expected sequence number, per direction.
    next_seq:    [Option<u32>; 2],
    /// Highest acknowledgment sent, per direction.
    highest_ack: [Option<u32>; 2],
    /// Recent (direction, seq, segment length) triples.
    window:      VecDeque<(Direction, u32, u32)>,
    window_cap:  usize,

    pub retransmissions:    u64,
    pub out_of_order:       u64,
    pub handshake_complete: bool,
    pub reset_seen:         bool,
    pub syn:                Option<SynSeen>,
    pub flags:              BTreeMap<String, u64>,

    pub pending_dns:  HashMap<u16, PendingDns>,
    pub pending_http: VecDeque<PendingRequest>,
    /// Requests dropped from a full queue.
    pub http_overflow: u64,
}

impl FlowState {
    pub fn new(key: FlowKey, ts: f64, window_cap: usize) -> Self {
        Self {
            key,
            state: ConnState::New,
            first_seen: ts,
            last_seen: ts,
            packets: 0,
            bytes: 0,
            next_seq: [None; 2],
            highest_ack: [None; 2],
            window: VecDeque::with_capacity(window_cap.min(64)),
            window_cap: window_cap.max(1),
            retransmissions: 0,
            out_of_order: 0,
            handshake_complete: false,
            reset_seen: false,
            syn: None,
            flags: BTreeMap::new(),
            pending_dns: HashMap::new(),
            pending_http: VecDeque::new(),
            http_overflow: 0,
        }
    }

    pub fn touch(&mut self, ts: f64, wire_len: u32) {
        self.packets += 1;
        self.bytes += u64::from(wire_len);
        if ts > self.last_seen {
            self.last_seen = ts;
        }
    }

    pub fn idle_for(&self, now: f64) -> f64 {
        (now - self.last_seen).max(0.0)
    }

    pub fn on_tcp(&mut self, dir: Direction, tcp: &TcpLayer, index: u64, ts: f64) -> TcpVerdict {
        let flags = tcp.flags;
        *self.flags.entry(flags.to_string()).or_insert(0) += 1;

        if flags.rst() {
            self.reset_seen = true;
            let in_handshake = self.state == ConnState::HandshakePending;
            debug!(flow = %self.key, index, in_handshake, "reset");
            return TcpVerdict::Reset { in_handshake };
        }

        self.advance(dir, tcp, index, ts);

        let seg_len = tcp.segment_len();
        let retransmission = seg_len > 0 && (self.below_peer_ack(dir, tcp.seq) || self.in_window(dir, tcp.seq, seg_len));

        if flags.ack() {
            let slot = &mut self.highest_ack[dir.idx()];
            *slot = Some(slot.map_or(tcp.ack, |prev| seq_max(prev, tcp.ack)));
        }

        if retransmission {
            self.retransmissions += 1;
            return TcpVerdict::Retransmission;
        }
        if seg_len > 0 {
            let end = tcp.seq.wrapping_add(seg_len);
            let next = &mut self.next_seq[dir.idx()];
            match *next {
                Some(expected) if seq_lt(tcp.seq, expected) => self.out_of_order += 1,
                _ => {}
            }
            *next = Some(next.map_or(end, |prev| seq_max(prev, end)));
            if self.window.len() == self.window_cap {
                self.window.pop_front();
            }
            self.window.push_back((dir, tcp.seq, seg_len));
        }
        TcpVerdict::Normal
    }

    fn advance(&mut self, dir: Direction, tcp: &TcpLayer, index: u64, ts: f64) {
        let flags = tcp.flags;
        let before = self.state;
        match self.state {
            ConnState::New if flags.syn() && !flags.ack() => {
                self.state = ConnState::HandshakePending;
                self.syn = Some(SynSeen { index, ts, isn: tcp.seq, dir });
            }
            // Capture started after the handshake.
            ConnState::New => self.state = ConnState::Established,
            ConnState::HandshakePending if flags.syn() && flags.ack() => {
                if let Some(syn) = self.syn {
                    if dir == syn.dir.reverse() && tcp.ack == syn.isn.wrapping_add(1) {
                        self.state = ConnState::Established;
                        self.handshake_complete = true;
                    }
                }
            }
            ConnState::Established if flags.fin() => self.state = ConnState::Closing,
            _ => {}
        }
        if self.state != before {
            debug!(flow = %self.key, index, from = before.name(), to = self.state.name(), "tcp state");
        }
    }

    /// Data the peer has already acknowledged.
    fn below_peer_ack(&self, dir: Direction, seq: u32) -> bool {
        self.highest_ack[dir.reverse().idx()].map_or(false, |ack| seq_lt(seq, ack))
    }

    fn in_window(&self, dir: Direction, seq: u32, len: u32) -> bool {
        self.window.iter().any(|&(d, s, l)| d == dir && s == seq && l == len)
    }

    pub fn dns_query(&mut self, id: u16, name: &str, index: u64, ts: f64) {
        if self.pending_dns.len() >= MAX_PENDING_DNS && !self.pending_dns.contains_key(&id) {
            return;
        }
        self.pending_dns.entry(id).or_insert_with(|| PendingDns { name: name.to_string(), index, ts });
    }

    pub fn dns_response(&mut self, id: u16) -> Option<PendingDns> {
        self.pending_dns.remove(&id)
    }

    pub fn http_request(&mut self, method: &str, index: u64, ts: f64) {
        if self.pending_http.len() >= MAX_PENDING_HTTP {
            self.pending_http.pop_front();
            self.http_overflow += 1;
        }
        self.pending_http.push_back(PendingRequest { index, method: method.to_string(), ts });
    }

    pub fn http_response(&mut self) -> Option<PendingRequest> {
        self.pending_http.pop_front()
    }

    /// Volume snapshot handed to the aggregator when the flow ends.
    pub fn volume(&self) -> FlowVolume {
        FlowVolume {
            key:             self.key,
            packets:         self.packets,
            bytes:           self.bytes,
            first_seen:      self.first_seen,
            last_seen:       self.last_seen,
            final_state:     self.state,
            retransmissions: self.retransmissions,
            flags:           self.flags.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowVolume {
    pub key:             FlowKey,
    pub packets:         u64,
    pub bytes:           u64,
    pub first_seen:      f64,
    pub last_seen:       f64,
    pub final_state:     ConnState,
    pub retransmissions: u64,
    pub flags:           BTreeMap<String, u64>,
}
