//! Hand-built packets and captures for the unit tests.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::codec::{ByteOrder, CaptureHeader};
use crate::decode::TcpFlags;

pub const BASE_TS: u32 = 1_700_000_000;

// ─── Captures ─────────────────────────────────────────────────────────────────

/// Ethernet capture, one record per second starting at [`BASE_TS`].
pub fn capture_bytes(packets: &[Vec<u8>]) -> Vec<u8> {
    capture_bytes_with(&CaptureHeader::ethernet(65535), packets)
}

pub fn capture_bytes_with(header: &CaptureHeader, packets: &[Vec<u8>]) -> Vec<u8> {
    let timed: Vec<(u32, u32, Vec<u8>)> = packets.iter().enumerate()
        .map(|(i, p)| (BASE_TS + i as u32, 0, p.clone()))
        .collect();
    encode_capture(header, &timed)
}

/// Ethernet capture with explicit timestamps in seconds from [`BASE_TS`].
pub fn timed_capture(packets: &[(f64, Vec<u8>)]) -> Vec<u8> {
    let timed: Vec<(u32, u32, Vec<u8>)> = packets.iter()
        .map(|(t, p)| (BASE_TS + t.trunc() as u32, (t.fract() * 1e6).round() as u32, p.clone()))
        .collect();
    encode_capture(&CaptureHeader::ethernet(65535), &timed)
}

fn encode_capture(header: &CaptureHeader, records: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let big = header.byte_order == ByteOrder::Big;
    let put32 = |out: &mut Vec<u8>, v: u32| {
        out.extend_from_slice(&if big { v.to_be_bytes() } else { v.to_le_bytes() })
    };
    let put16 = |out: &mut Vec<u8>, v: u16| {
        out.extend_from_slice(&if big { v.to_be_bytes() } else { v.to_le_bytes() })
    };
    let magic = match header.resolution {
        crate::codec::TsResolution::Micro => 0xa1b2_c3d4,
        crate::codec::TsResolution::Nano  => 0xa1b2_3c4d,
    };

    let mut out = Vec::new();
    put32(&mut out, magic);
    put16(&mut out, header.version_major);
    put16(&mut out, header.version_minor);
    put32(&mut out, header.thiszone as u32);
    put32(&mut out, header.sigfigs);
    put32(&mut out, header.snaplen);
    put32(&mut out, header.link_type);
    for (sec, frac, data) in records {
        put32(&mut out, *sec);
        put32(&mut out, *frac);
        put32(&mut out, data.len() as u32);
        put32(&mut out, data.len() as u32);
        out.extend_from_slice(data);
    }
    out
}

// ─── Packet builders ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PacketSpec {
    pub src_mac:  [u8; 6],
    pub dst_mac:  [u8; 6],
    pub src_ip:   Ipv4Addr,
    pub dst_ip:   Ipv4Addr,
    pub src_ip6:  Ipv6Addr,
    pub dst_ip6:  Ipv6Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq:      u32,
    pub ack:      u32,
    pub flags:    u8,
}

impl Default for PacketSpec {
    fn default() -> Self {
        Self {
            src_mac:  [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            dst_mac:  [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb],
            src_ip:   Ipv4Addr::new(10, 0, 0, 5),
            dst_ip:   Ipv4Addr::new(93, 184, 216, 34),
            src_ip6:  "2a00:1450:4001::5".parse().unwrap(),
            dst_ip6:  "2606:2800:220:1::34".parse().unwrap(),
            src_port: 40000,
            dst_port: 80,
            seq:      1000,
            ack:      0,
            flags:    TcpFlags::ACK | TcpFlags::PSH,
        }
    }
}

impl PacketSpec {
    /// The same conversation seen from the other end.
    pub fn reversed(&self) -> Self {
        Self {
            src_mac:  self.dst_mac,
            dst_mac:  self.src_mac,
            src_ip:   self.dst_ip,
            dst_ip:   self.src_ip,
            src_ip6:  self.dst_ip6,
            dst_ip6:  self.src_ip6,
            src_port: self.dst_port,
            dst_port: self.src_port,
            ..self.clone()
        }
    }

    pub fn tcp(&self, seq: u32, ack: u32, flags: u8) -> Self {
        Self { seq, ack, flags, ..self.clone() }
    }
}

/// RFC 1071 sum over `chunks`, as a complement.
pub fn checksum(chunks: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in chunks {
        for pair in chunk.chunks(2) {
            let word = if pair.len() == 2 { u16::from_be_bytes([pair[0], pair[1]]) } else { u16::from(pair[0]) << 8 };
            sum += u32::from(word);
        }
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn ethernet(spec: &PacketSpec, ethertype: u16) -> Vec<u8> {
    let mut out = spec.dst_mac.to_vec();
    out.extend_from_slice(&spec.src_mac);
    out.extend_from_slice(&ethertype.to_be_bytes());
    out
}

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) -> Vec<u8> {
    let total = (20 + payload_len) as u16;
    let mut h = vec![0x45, 0x00];
    h.extend_from_slice(&total.to_be_bytes());
    h.extend_from_slice(&[0x12, 0x34, 0x40, 0x00, 64, protocol, 0, 0]);
    h.extend_from_slice(&src.octets());
    h.extend_from_slice(&dst.octets());
    let sum = checksum(&[&h]);
    h[10..12].copy_from_slice(&sum.to_be_bytes());
    h
}

fn pseudo_v4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> Vec<u8> {
    let mut p = src.octets().to_vec();
    p.extend_from_slice(&dst.octets());
    p.extend_from_slice(&[0, protocol]);
    p.extend_from_slice(&(len as u16).to_be_bytes());
    p
}

fn pseudo_v6(src: Ipv6Addr, dst: Ipv6Addr, protocol: u8, len: usize) -> Vec<u8> {
    let mut p = src.octets().to_vec();
    p.extend_from_slice(&dst.octets());
    p.extend_from_slice(&(len as u32).to_be_bytes());
    p.extend_from_slice(&[0, 0, 0, protocol]);
    p
}

fn tcp_segment(spec: &PacketSpec, payload: &[u8], pseudo: impl Fn(usize) -> Vec<u8>) -> Vec<u8> {
    let mut t = spec.src_port.to_be_bytes().to_vec();
    t.extend_from_slice(&spec.dst_port.to_be_bytes());
    t.extend_from_slice(&spec.seq.to_be_bytes());
    t.extend_from_slice(&spec.ack.to_be_bytes());
    t.extend_from_slice(&[0x50, spec.flags, 0xff, 0xff, 0, 0, 0, 0]);
    t.extend_from_slice(payload);
    let sum = checksum(&[&pseudo(t.len()), &t]);
    t[16..18].copy_from_slice(&sum.to_be_bytes());
    t
}

fn udp_datagram(spec: &PacketSpec, payload: &[u8], pseudo: impl Fn(usize) -> Vec<u8>) -> Vec<u8> {
    let len = (8 + payload.len()) as u16;
    let mut u = spec.src_port.to_be_bytes().to_vec();
    u.extend_from_slice(&spec.dst_port.to_be_bytes());
    u.extend_from_slice(&len.to_be_bytes());
    u.extend_from_slice(&[0, 0]);
    u.extend_from_slice(payload);
    let sum = match checksum(&[&pseudo(u.len()), &u]) { 0 => 0xffff, s => s };
    u[6..8].copy_from_slice(&sum.to_be_bytes());
    u
}

pub fn eth_ipv4(spec: &PacketSpec, protocol: u8, l4: &[u8]) -> Vec<u8> {
    let mut out = ethernet(spec, 0x0800);
    out.extend_from_slice(&ipv4_header(spec.src_ip, spec.dst_ip, protocol, l4.len()));
    out.extend_from_slice(l4);
    out
}

pub fn eth_ipv4_tcp(spec: &PacketSpec, payload: &[u8]) -> Vec<u8> {
    let seg = tcp_segment(spec, payload, |len| pseudo_v4(spec.src_ip, spec.dst_ip, 6, len));
    eth_ipv4(spec, 6, &seg)
}

pub fn eth_ipv4_udp(spec: &PacketSpec, payload: &[u8]) -> Vec<u8> {
    let dgram = udp_datagram(spec, payload, |len| pseudo_v4(spec.src_ip, spec.dst_ip, 17, len));
    eth_ipv4(spec, 17, &dgram)
}

fn eth_ipv6(spec: &PacketSpec, next_header: u8, l4: &[u8]) -> Vec<u8> {
    let mut out = ethernet(spec, 0x86dd);
    out.extend_from_slice(&[0x60, 0, 0, 0]);
    out.extend_from_slice(&(l4.len() as u16).to_be_bytes());
    out.extend_from_slice(&[next_header, 64]);
    out.extend_from_slice(&spec.src_ip6.octets());
    out.extend_from_slice(&spec.dst_ip6.octets());
    out.extend_from_slice(l4);
    out
}

pub fn eth_ipv6_tcp(spec: &PacketSpec, payload: &[u8]) -> Vec<u8> {
    let seg = tcp_segment(spec, payload, |len| pseudo_v6(spec.src_ip6, spec.dst_ip6, 6, len));
    eth_ipv6(spec, 6, &seg)
}

pub fn eth_ipv6_udp(spec: &PacketSpec, payload: &[u8]) -> Vec<u8> {
    let dgram = udp_datagram(spec, payload, |len| pseudo_v6(spec.src_ip6, spec.dst_ip6, 17, len));
    eth_ipv6(spec, 17, &dgram)
}

/// Port unreachable sent by `spec.src_ip` back to `spec.dst_ip`, quoting the
/// UDP datagram that went from `spec.dst_ip` to `spec.src_ip`.
pub fn icmp_unreachable(spec: &PacketSpec) -> Vec<u8> {
    let back = spec.reversed();
    let mut quoted = ipv4_header(back.src_ip, back.dst_ip, 17, 8);
    quoted.extend_from_slice(&back.src_port.to_be_bytes());
    quoted.extend_from_slice(&back.dst_port.to_be_bytes());
    quoted.extend_from_slice(&[0, 8, 0, 0]);

    let mut icmp = vec![3, 3, 0, 0, 0, 0, 0, 0];
    icmp.extend_from_slice(&quoted);
    let sum = checksum(&[&icmp]);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());
    eth_ipv4(spec, 1, &icmp)
}

// ─── Application payloads ─────────────────────────────────────────────────────

fn encode_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

/// Standard A query with one question.
pub fn dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut m = id.to_be_bytes().to_vec();
    m.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
    encode_name(&mut m, name);
    m.extend_from_slice(&[0, 1, 0, 1]);
    m
}

/// Response echoing the question, with one A answer per address; answer
/// names are compression pointers to the question.
pub fn dns_response(id: u16, name: &str, rcode: u8, answers: &[[u8; 4]]) -> Vec<u8> {
    let mut m = id.to_be_bytes().to_vec();
    m.extend_from_slice(&[0x81, 0x80 | (rcode & 0x0f), 0, 1]);
    m.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    m.extend_from_slice(&[0, 0, 0, 0]);
    encode_name(&mut m, name);
    m.extend_from_slice(&[0, 1, 0, 1]);
    for addr in answers {
        m.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1, 0, 0, 0x0e, 0x10, 0, 4]);
        m.extend_from_slice(addr);
    }
    m
}

pub fn http_request(method: &str, target: &str, host: &str, headers: &[(&str, &str)]) -> Vec<u8> {
    let mut s = format!("{method} {target} HTTP/1.1\r\nHost: {host}\r\n");
    for (name, value) in headers {
        s.push_str(&format!("{name}: {value}\r\n"));
    }
    s.push_str("\r\n");
    s.into_bytes()
}

pub fn http_response(status: u16, reason: &str) -> Vec<u8> {
    format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\n\r\n").into_bytes()
}

/// Minimal TLS 1.2 ClientHello carrying one server name.
pub fn client_hello(sni: &str) -> Vec<u8> {
    let name = sni.as_bytes();
    let mut ext = vec![0, 0];
    ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
    ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    ext.push(0);
    ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext.extend_from_slice(name);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x5a; 32]);
    body.push(0);
    body.extend_from_slice(&[0, 2, 0x13, 0x01]);
    body.extend_from_slice(&[1, 0]);
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut hs = vec![1];
    hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    hs.extend_from_slice(&body);

    let mut rec = vec![0x16, 0x03, 0x01];
    rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    rec.extend_from_slice(&hs);
    rec
}
