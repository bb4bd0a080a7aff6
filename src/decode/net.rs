//! Link, network and transport layers.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::{
    be16, be32, Layer, LayerFault, Walk, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP,
};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_ARP:  u16 = 0x0806;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const MAX_VLAN_TAGS:    usize = 2;
const MAX_IPV6_EXT_HDRS: usize = 8;

// ─── Field ────────────────────────────────────────────────────────────────────

/// A decoded address and where it sits in the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrField<T> {
    pub offset: usize,
    pub addr:   T,
}

pub type Ipv4Field = AddrField<Ipv4Addr>;
pub type Ipv6Field = AddrField<Ipv6Addr>;
pub type MacField  = AddrField<[u8; 6]>;

fn mac_at(data: &[u8], off: usize) -> Option<MacField> {
    let b = data.get(off..off + 6)?;
    Some(MacField { offset: off, addr: [b[0], b[1], b[2], b[3], b[4], b[5]] })
}

fn ipv4_at(data: &[u8], off: usize) -> Option<Ipv4Field> {
    let b = data.get(off..off + 4)?;
    Some(Ipv4Field { offset: off, addr: Ipv4Addr::new(b[0], b[1], b[2], b[3]) })
}

fn ipv6_at(data: &[u8], off: usize) -> Option<Ipv6Field> {
    let b: [u8; 16] = data.get(off..off + 16)?.try_into().ok()?;
    Some(Ipv6Field { offset: off, addr: Ipv6Addr::from(b) })
}

// ─── Layer types ──────────────────────────────────────────────────────────────

/// Ethernet II frame header, or the Linux cooked-capture header (which
/// carries only the sender's address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetLayer {
    pub offset:     usize,
    pub dst:        Option<MacField>,
    pub src:        Option<MacField>,
    pub ethertype:  u16,
    /// Outermost VLAN id.
    pub vlan:       Option<u16>,
    pub header_len: usize,
}

/// Ethernet/IPv4 ARP. Other hardware or protocol types stay opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpLayer {
    pub offset:     usize,
    pub operation:  u16,
    pub sender_mac: MacField,
    pub sender_ip:  Ipv4Field,
    pub target_mac: MacField,
    pub target_ip:  Ipv4Field,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Layer {
    pub offset:          usize,
    pub header_len:      usize,
    pub total_len:       u16,
    pub ttl:             u8,
    pub protocol:        u8,
    pub src:             Ipv4Field,
    pub dst:             Ipv4Field,
    pub more_fragments:  bool,
    /// In 8-byte units.
    pub fragment_offset: u16,
}

impl Ipv4Layer {
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Layer {
    pub offset:      usize,
    pub payload_len: u16,
    /// Protocol after any extension headers.
    pub next_header: u8,
    pub hop_limit:   u8,
    pub src:         Ipv6Field,
    pub dst:         Ipv6Field,
    /// Fixed header plus extension headers.
    pub header_len:  usize,
    pub fragment:    bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn fin(self) -> bool { self.0 & Self::FIN != 0 }
    pub fn syn(self) -> bool { self.0 & Self::SYN != 0 }
    pub fn rst(self) -> bool { self.0 & Self::RST != 0 }
    pub fn psh(self) -> bool { self.0 & Self::PSH != 0 }
    pub fn ack(self) -> bool { self.0 & Self::ACK != 0 }
    pub fn urg(self) -> bool { self.0 & Self::URG != 0 }

    /// Names of the set flags, in header bit order.
    pub fn names(self) -> Vec<&'static str> {
        [
            (Self::FIN, "FIN"), (Self::SYN, "SYN"), (Self::RST, "RST"),
            (Self::PSH, "PSH"), (Self::ACK, "ACK"), (Self::URG, "URG"),
        ]
        .into_iter()
        .filter(|(bit, _)| self.0 & bit != 0)
        .map(|(_, name)| name)
        .collect()
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() { f.write_str("none") } else { f.write_str(&names.join("|")) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpLayer {
    pub offset:         usize,
    pub src_port:       u16,
    pub dst_port:       u16,
    pub seq:            u32,
    pub ack:            u32,
    pub flags:          TcpFlags,
    pub window:         u16,
    pub header_len:     usize,
    pub payload_offset: usize,
    /// Payload length on the wire, from the IP length fields.
    pub payload_len:    usize,
    /// Payload bytes actually present in the record.
    pub captured_len:   usize,
}

impl TcpLayer {
    /// Sequence space consumed: payload plus one each for SYN and FIN.
    pub fn segment_len(&self) -> u32 {
        self.payload_len as u32 + u32::from(self.flags.syn()) + u32::from(self.flags.fin())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpLayer {
    pub offset:         usize,
    pub src_port:       u16,
    pub dst_port:       u16,
    pub length:         u16,
    pub checksum:       u16,
    pub payload_offset: usize,
    pub payload_len:    usize,
    pub captured_len:   usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotedAddrs {
    V4(Ipv4Field, Ipv4Field),
    V6(Ipv6Field, Ipv6Field),
}

/// The offending datagram's header carried inside an ICMP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotedHeader {
    pub addrs:    QuotedAddrs,
    pub protocol: u8,
    /// Source and destination ports for quoted TCP/UDP.
    pub ports:    Option<(u16, u16)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpLayer {
    pub offset:    usize,
    pub v6:        bool,
    pub icmp_type: u8,
    pub code:      u8,
    /// Message length on the wire.
    pub len:       usize,
    pub quoted:    Option<QuotedHeader>,
}

impl IcmpLayer {
    pub fn is_unreachable(&self) -> bool {
        if self.v6 { self.icmp_type == 1 } else { self.icmp_type == 3 }
    }

    fn quotes_header(v6: bool, icmp_type: u8) -> bool {
        if v6 { (1..=4).contains(&icmp_type) } else { matches!(icmp_type, 3 | 4 | 5 | 11 | 12) }
    }
}

// ─── Walk steps ───────────────────────────────────────────────────────────────

impl Walk<'_> {
    pub(crate) fn ethernet(&mut self) {
        let raw = self.raw;
        let (Some(dst), Some(src), Some(mut ethertype)) = (mac_at(raw, 0), mac_at(raw, 6), be16(raw, 12))
        else {
            return self.fail(0, LayerFault::truncated("Ethernet", format!("{} bytes", raw.len())));
        };

        let mut off = 14;
        let mut vlan = None;
        let mut tags = 0;
        while matches!(ethertype, ETHERTYPE_VLAN | ETHERTYPE_QINQ) && tags < MAX_VLAN_TAGS {
            let (Some(tci), Some(inner)) = (be16(raw, off), be16(raw, off + 2)) else {
                return self.fail(off, LayerFault::truncated("Ethernet", "VLAN tag cut short"));
            };
            vlan.get_or_insert(tci & 0x0fff);
            ethertype = inner;
            off += 4;
            tags += 1;
        }

        self.layers.push(Layer::Ethernet(EthernetLayer {
            offset: 0, dst: Some(dst), src: Some(src), ethertype, vlan, header_len: off,
        }));
        if matches!(ethertype, ETHERTYPE_VLAN | ETHERTYPE_QINQ) {
            return self.fail(off, LayerFault::malformed("Ethernet", format!("more than {MAX_VLAN_TAGS} VLAN tags")));
        }
        self.network(ethertype, off);
    }

    /// Linux cooked capture (SLL v1): 16-byte pseudo header.
    pub(crate) fn linux_sll(&mut self) {
        let raw = self.raw;
        let (Some(halen), Some(ethertype)) = (be16(raw, 4), be16(raw, 14)) else {
            return self.fail(0, LayerFault::truncated("Ethernet", "cooked header cut short"));
        };
        let src = if halen == 6 { mac_at(raw, 6) } else { None };
        self.layers.push(Layer::Ethernet(EthernetLayer {
            offset: 0, dst: None, src, ethertype, vlan: None, header_len: 16,
        }));
        self.network(ethertype, 16);
    }

    pub(crate) fn raw_ip(&mut self, off: usize) {
        match self.raw.get(off).map(|b| b >> 4) {
            Some(4) => self.ipv4(off),
            Some(6) => self.ipv6(off),
            Some(v) => self.fail(off, LayerFault::malformed("IP", format!("version {v}"))),
            None    => {}
        }
    }

    fn network(&mut self, ethertype: u16, off: usize) {
        match ethertype {
            ETHERTYPE_IPV4 => self.ipv4(off),
            ETHERTYPE_IPV6 => self.ipv6(off),
            ETHERTYPE_ARP  => self.arp(off),
            other          => self.unknown(off, format!("ethertype {other:#06x}")),
        }
    }

    fn arp(&mut self, off: usize) {
        let raw = self.raw;
        let Some(hdr) = raw.get(off..off + 8) else {
            return self.fail(off, LayerFault::truncated("ARP", "header cut short"));
        };
        let htype = u16::from_be_bytes([hdr[0], hdr[1]]);
        let ptype = u16::from_be_bytes([hdr[2], hdr[3]]);
        if htype != 1 || ptype != ETHERTYPE_IPV4 || hdr[4] != 6 || hdr[5] != 4 {
            return self.unknown(off, format!("arp htype {htype} ptype {ptype:#06x}"));
        }
        let operation = u16::from_be_bytes([hdr[6], hdr[7]]);
        let fields = (
            mac_at(raw, off + 8), ipv4_at(raw, off + 14), mac_at(raw, off + 18), ipv4_at(raw, off + 24),
        );
        let (Some(sender_mac), Some(sender_ip), Some(target_mac), Some(target_ip)) = fields else {
            return self.fail(off, LayerFault::truncated("ARP", "addresses cut short"));
        };
        self.layers.push(Layer::Arp(ArpLayer {
            offset: off, operation, sender_mac, sender_ip, target_mac, target_ip,
        }));
        self.unknown(off + 28, "arp trailer");
    }

    pub(crate) fn ipv4(&mut self, off: usize) {
        let raw = self.raw;
        let Some(hdr) = raw.get(off..off + 20) else {
            let have = raw.len().saturating_sub(off);
            return self.fail(off, LayerFault::truncated("IPv4", format!("{have} of 20 header bytes")));
        };
        if hdr[0] >> 4 != 4 {
            return self.fail(off, LayerFault::malformed("IPv4", format!("version {}", hdr[0] >> 4)));
        }
        let header_len = ((hdr[0] & 0x0f) as usize) * 4;
        if header_len < 20 {
            return self.fail(off, LayerFault::malformed("IPv4", format!("header length {header_len}")));
        }
        if raw.len() < off + header_len {
            return self.fail(off, LayerFault::truncated("IPv4", "options cut short"));
        }
        let total_len = u16::from_be_bytes([hdr[2], hdr[3]]);
        if total_len != 0 && (total_len as usize) < header_len {
            return self.fail(off, LayerFault::malformed("IPv4", format!("total length {total_len}")));
        }
        let frag = u16::from_be_bytes([hdr[6], hdr[7]]);
        let layer = Ipv4Layer {
            offset: off,
            header_len,
            total_len,
            ttl: hdr[8],
            protocol: hdr[9],
            src: Ipv4Field { offset: off + 12, addr: Ipv4Addr::new(hdr[12], hdr[13], hdr[14], hdr[15]) },
            dst: Ipv4Field { offset: off + 16, addr: Ipv4Addr::new(hdr[16], hdr[17], hdr[18], hdr[19]) },
            more_fragments: frag & 0x2000 != 0,
            fragment_offset: frag & 0x1fff,
        };
        let protocol = layer.protocol;
        let later_fragment = layer.fragment_offset != 0;
        self.layers.push(Layer::Ipv4(layer));

        let start = off + header_len;
        // A zero total length shows up with TSO captures; trust the record then.
        let wire_end = if total_len == 0 { raw.len() } else { off + total_len as usize };
        if later_fragment {
            return self.unknown(start, "ipv4 fragment");
        }
        self.transport(protocol, start, wire_end);
    }

    pub(crate) fn ipv6(&mut self, off: usize) {
        let raw = self.raw;
        let Some(hdr) = raw.get(off..off + 40) else {
            let have = raw.len().saturating_sub(off);
            return self.fail(off, LayerFault::truncated("IPv6", format!("{have} of 40 header bytes")));
        };
        if hdr[0] >> 4 != 6 {
            return self.fail(off, LayerFault::malformed("IPv6", format!("version {}", hdr[0] >> 4)));
        }
        let payload_len = u16::from_be_bytes([hdr[4], hdr[5]]);
        let (Some(src), Some(dst)) = (ipv6_at(raw, off + 8), ipv6_at(raw, off + 24)) else {
            return self.fail(off, LayerFault::truncated("IPv6", "addresses cut short"));
        };

        let mut next_header = hdr[6];
        let mut pos = off + 40;
        let mut fragment = false;
        let mut later_fragment = false;
        for _ in 0..MAX_IPV6_EXT_HDRS {
            let ext_len = match next_header {
                0 | 43 | 60 => raw.get(pos + 1).map(|l| (*l as usize + 1) * 8),
                44 => {
                    fragment = true;
                    later_fragment = be16(raw, pos + 2).map_or(false, |f| f >> 3 != 0);
                    Some(8)
                }
                51 => raw.get(pos + 1).map(|l| (*l as usize + 2) * 4),
                _ => break,
            };
            let (Some(ext_len), Some(&nh)) = (ext_len, raw.get(pos)) else {
                return self.fail(off, LayerFault::truncated("IPv6", "extension header cut short"));
            };
            if raw.len() < pos + ext_len {
                return self.fail(off, LayerFault::truncated("IPv6", "extension header cut short"));
            }
            next_header = nh;
            pos += ext_len;
        }

        self.layers.push(Layer::Ipv6(Ipv6Layer {
            offset: off,
            payload_len,
            next_header,
            hop_limit: hdr[7],
            src,
            dst,
            header_len: pos - off,
            fragment,
        }));

        if is_ipv6_extension(next_header) {
            return self.fail(pos, LayerFault::malformed("IPv6", format!("more than {MAX_IPV6_EXT_HDRS} extension headers")));
        }
        let wire_end = if payload_len == 0 { raw.len() } else { off + 40 + payload_len as usize };
        if later_fragment {
            return self.unknown(pos, "ipv6 fragment");
        }
        self.transport(next_header, pos, wire_end);
    }

    /// `wire_end` is where the datagram ends on the wire; it may lie past
    /// the captured bytes.
    fn transport(&mut self, protocol: u8, start: usize, wire_end: usize) {
        match protocol {
            IPPROTO_TCP    => self.tcp(start, wire_end),
            IPPROTO_UDP    => self.udp(start, wire_end),
            IPPROTO_ICMP   => self.icmp(start, wire_end, false),
            IPPROTO_ICMPV6 => self.icmp(start, wire_end, true),
            59             => {}
            other          => self.unknown(start, format!("ip protocol {other}")),
        }
    }

    fn tcp(&mut self, off: usize, wire_end: usize) {
        let raw = self.raw;
        let Some(hdr) = raw.get(off..off + 20) else {
            let have = raw.len().saturating_sub(off);
            return self.fail(off, LayerFault::truncated("TCP", format!("{have} of 20 header bytes")));
        };
        let header_len = ((hdr[12] >> 4) as usize) * 4;
        if header_len < 20 {
            return self.fail(off, LayerFault::malformed("TCP", format!("data offset {header_len}")));
        }
        if raw.len() < off + header_len {
            return self.fail(off, LayerFault::truncated("TCP", "options cut short"));
        }
        let payload_offset = off + header_len;
        let captured_end = wire_end.min(raw.len());
        let tcp = TcpLayer {
            offset: off,
            src_port: u16::from_be_bytes([hdr[0], hdr[1]]),
            dst_port: u16::from_be_bytes([hdr[2], hdr[3]]),
            seq: be32(hdr, 4).unwrap_or_default(),
            ack: be32(hdr, 8).unwrap_or_default(),
            flags: TcpFlags(hdr[13] & 0x3f),
            window: u16::from_be_bytes([hdr[14], hdr[15]]),
            header_len,
            payload_offset,
            payload_len: wire_end.saturating_sub(payload_offset),
            captured_len: captured_end.saturating_sub(payload_offset),
        };
        self.layers.push(Layer::Tcp(tcp.clone()));
        self.tcp_payload(&tcp);
    }

    fn udp(&mut self, off: usize, wire_end: usize) {
        let raw = self.raw;
        let Some(hdr) = raw.get(off..off + 8) else {
            let have = raw.len().saturating_sub(off);
            return self.fail(off, LayerFault::truncated("UDP", format!("{have} of 8 header bytes")));
        };
        let length = u16::from_be_bytes([hdr[4], hdr[5]]);
        if length < 8 {
            return self.fail(off, LayerFault::malformed("UDP", format!("length {length}")));
        }
        let payload_offset = off + 8;
        let datagram_end = (off + length as usize).min(wire_end.max(payload_offset));
        let udp = UdpLayer {
            offset: off,
            src_port: u16::from_be_bytes([hdr[0], hdr[1]]),
            dst_port: u16::from_be_bytes([hdr[2], hdr[3]]),
            length,
            checksum: u16::from_be_bytes([hdr[6], hdr[7]]),
            payload_offset,
            payload_len: datagram_end - payload_offset,
            captured_len: datagram_end.min(raw.len()).saturating_sub(payload_offset),
        };
        self.layers.push(Layer::Udp(udp.clone()));
        self.udp_payload(&udp);
    }

    fn icmp(&mut self, off: usize, wire_end: usize, v6: bool) {
        let raw = self.raw;
        let name = if v6 { "ICMPv6" } else { "ICMP" };
        let Some(hdr) = raw.get(off..off + 4) else {
            return self.fail(off, LayerFault::truncated(name, "header cut short"));
        };
        let (icmp_type, code) = (hdr[0], hdr[1]);
        let quoted = if IcmpLayer::quotes_header(v6, icmp_type) { quoted_header(raw, off + 8) } else { None };
        self.layers.push(Layer::Icmp(IcmpLayer {
            offset: off, v6, icmp_type, code, len: wire_end.saturating_sub(off), quoted,
        }));
    }
}

/// Best effort: quoted headers are often cut short and that is not a fault.
fn is_ipv6_extension(next_header: u8) -> bool {
    matches!(next_header, 0 | 43 | 44 | 51 | 60)
}

fn quoted_header(raw: &[u8], off: usize) -> Option<QuotedHeader> {
    let version = raw.get(off)? >> 4;
    let (addrs, protocol, l4) = match version {
        4 => {
            let ihl = ((raw[off] & 0x0f) as usize) * 4;
            if ihl < 20 { return None; }
            let src = ipv4_at(raw, off + 12)?;
            let dst = ipv4_at(raw, off + 16)?;
            (QuotedAddrs::V4(src, dst), *raw.get(off + 9)?, off + ihl)
        }
        6 => {
            let src = ipv6_at(raw, off + 8)?;
            let dst = ipv6_at(raw, off + 24)?;
            (QuotedAddrs::V6(src, dst), *raw.get(off + 6)?, off + 40)
        }
        _ => return None,
    };
    let ports = match protocol {
        IPPROTO_TCP | IPPROTO_UDP => be16(raw, l4).zip(be16(raw, l4 + 2)),
        _ => None,
    };
    Some(QuotedHeader { addrs, protocol, ports })
}
