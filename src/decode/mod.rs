//! Layered packet decoding.
//!
//! Layers are parsed outward-in. Every decoded field keeps the absolute
//! offset it was read from so the rewriter can patch it in place. A layer
//! that cannot be decoded ends the walk: the layers above it are kept and
//! the remaining bytes become an [`UnknownLayer`].

mod app;
mod net;

use std::net::IpAddr;

pub use app::{
    DnsLabel, DnsLayer, DnsName, DnsQuestion, DnsRdata, DnsRecord, HttpHeader, HttpLayer,
    HttpStart, SniName, TlsLayer, DNS_PORTS, rcode_name,
};
pub use net::{
    AddrField, ArpLayer, EthernetLayer, IcmpLayer, Ipv4Layer, Ipv6Layer, QuotedAddrs,
    QuotedHeader, TcpFlags, TcpLayer, UdpLayer, Ipv4Field, Ipv6Field, MacField,
};

use crate::error::WarningCause;

pub const LINKTYPE_ETHERNET:  u32 = 1;
pub const LINKTYPE_RAW:       u32 = 101;
pub const LINKTYPE_LINUX_SLL: u32 = 113;
pub const LINKTYPE_IPV4:      u32 = 228;
pub const LINKTYPE_IPV6:      u32 = 229;

pub const IPPROTO_ICMP:   u8 = 1;
pub const IPPROTO_TCP:    u8 = 6;
pub const IPPROTO_UDP:    u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

// ─── Layers ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Ethernet(EthernetLayer),
    Arp(ArpLayer),
    Ipv4(Ipv4Layer),
    Ipv6(Ipv6Layer),
    Tcp(TcpLayer),
    Udp(UdpLayer),
    Icmp(IcmpLayer),
    Dns(DnsLayer),
    Http(HttpLayer),
    Tls(TlsLayer),
    Unknown(UnknownLayer),
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Ethernet(_) => "Ethernet",
            Layer::Arp(_)      => "ARP",
            Layer::Ipv4(_)     => "IPv4",
            Layer::Ipv6(_)     => "IPv6",
            Layer::Tcp(_)      => "TCP",
            Layer::Udp(_)      => "UDP",
            Layer::Icmp(i)     => if i.v6 { "ICMPv6" } else { "ICMP" },
            Layer::Dns(_)      => "DNS",
            Layer::Http(_)     => "HTTP",
            Layer::Tls(_)      => "TLS",
            Layer::Unknown(_)  => "Unknown",
        }
    }
}

/// Bytes left undecoded, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLayer {
    pub offset: usize,
    pub len:    usize,
    /// What the bytes were expected to be, e.g. "ethertype 0x88cc".
    pub hint:   String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPacket {
    pub layers: Vec<Layer>,
}

macro_rules! layer_accessor {
    ($fn:ident, $variant:ident, $ty:ty) => {
        pub fn $fn(&self) -> Option<&$ty> {
            self.layers.iter().find_map(|l| match l { Layer::$variant(v) => Some(v), _ => None })
        }
    };
}

impl DecodedPacket {
    layer_accessor!(ethernet, Ethernet, EthernetLayer);
    layer_accessor!(arp,      Arp,      ArpLayer);
    layer_accessor!(ipv4,     Ipv4,     Ipv4Layer);
    layer_accessor!(ipv6,     Ipv6,     Ipv6Layer);
    layer_accessor!(tcp,      Tcp,      TcpLayer);
    layer_accessor!(udp,      Udp,      UdpLayer);
    layer_accessor!(icmp,     Icmp,     IcmpLayer);
    layer_accessor!(dns,      Dns,      DnsLayer);
    layer_accessor!(http,     Http,     HttpLayer);
    layer_accessor!(tls,      Tls,      TlsLayer);
    layer_accessor!(unknown,  Unknown,  UnknownLayer);

    /// Network-layer source and destination.
    pub fn ip_pair(&self) -> Option<(IpAddr, IpAddr)> {
        if let Some(ip) = self.ipv4() {
            return Some((IpAddr::V4(ip.src.addr), IpAddr::V4(ip.dst.addr)));
        }
        self.ipv6().map(|ip| (IpAddr::V6(ip.src.addr), IpAddr::V6(ip.dst.addr)))
    }

    /// Name of the deepest recognized layer.
    pub fn top_protocol(&self) -> &'static str {
        self.layers.iter().rev()
            .find(|l| !matches!(l, Layer::Unknown(_)))
            .map(Layer::name)
            .unwrap_or("Unknown")
    }
}

/// Why a recognized layer stopped decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFault {
    pub layer:  &'static str,
    pub cause:  WarningCause,
    pub reason: String,
}

impl LayerFault {
    pub(crate) fn truncated(layer: &'static str, reason: impl Into<String>) -> Self {
        Self { layer, cause: WarningCause::Truncated, reason: reason.into() }
    }
    pub(crate) fn malformed(layer: &'static str, reason: impl Into<String>) -> Self {
        Self { layer, cause: WarningCause::Malformed, reason: reason.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOutcome {
    pub packet:  DecodedPacket,
    pub warning: Option<LayerFault>,
}

// ─── Entry point ──────────────────────────────────────────────────────────────

/// Decode as many layers as the bytes allow. Never fails.
pub fn decode(raw: &[u8], link_type: u32) -> DecodeOutcome {
    let mut walk = Walk { raw, layers: Vec::new(), warning: None };
    match link_type {
        LINKTYPE_ETHERNET  => walk.ethernet(),
        LINKTYPE_LINUX_SLL => walk.linux_sll(),
        LINKTYPE_RAW       => walk.raw_ip(0),
        LINKTYPE_IPV4      => walk.ipv4(0),
        LINKTYPE_IPV6      => walk.ipv6(0),
        other => walk.unknown(0, format!("link type {other}")),
    }
    DecodeOutcome { packet: DecodedPacket { layers: walk.layers }, warning: walk.warning }
}

/// Decoding state for one packet; the per-layer steps live in `net` and `app`.
pub(crate) struct Walk<'a> {
    pub(crate) raw:     &'a [u8],
    pub(crate) layers:  Vec<Layer>,
    pub(crate) warning: Option<LayerFault>,
}

impl<'a> Walk<'a> {
    pub(crate) fn unknown(&mut self, offset: usize, hint: impl Into<String>) {
        if offset < self.raw.len() {
            self.layers.push(Layer::Unknown(UnknownLayer {
                offset, len: self.raw.len() - offset, hint: hint.into(),
            }));
        }
    }

    /// Record a fault and keep the remaining bytes opaque.
    pub(crate) fn fail(&mut self, offset: usize, fault: LayerFault) {
        let hint = format!("undecodable {}", fault.layer);
        self.warning.get_or_insert(fault);
        self.unknown(offset, hint);
    }
}

// ─── Byte helpers ─────────────────────────────────────────────────────────────

pub(crate) fn be16(data: &[u8], off: usize) -> Option<u16> {
    data.get(off..off + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn be32(data: &[u8], off: usize) -> Option<u32> {
    data.get(off..off + 4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn fmt_mac(b: &[u8; 6]) -> String {
    format!("{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
}

// ─── Tests ────────────────────────────────────────────────────────────────────
