//! Application layers: DNS, HTTP and the TLS ClientHello.

use std::net::{Ipv4Addr, Ipv6Addr};

use super::net::{Ipv4Field, Ipv6Field, TcpLayer, UdpLayer};
use super::{be16, Layer, LayerFault, Walk};

/// DNS, mDNS and LLMNR.
pub const DNS_PORTS: [u16; 3] = [53, 5353, 5355];

const MAX_POINTER_HOPS: usize = 16;
const MAX_NAME_LEN:     usize = 255;
const MAX_HTTP_HEADERS: usize = 128;

const HTTP_METHODS: &[&[u8]] = &[
    b"GET", b"POST", b"PUT", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH", b"CONNECT", b"TRACE",
];

// ─── DNS ──────────────────────────────────────────────────────────────────────

/// One label as it sits on the wire (after the length byte).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsLabel {
    pub offset: usize,
    /// Byte length on the wire; `text` is lossy and may differ.
    pub len:    usize,
    pub text:   String,
}

/// A name with its compression pointers resolved. Labels reached through a
/// pointer carry the offset of the pointed-to bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DnsName {
    pub text:   String,
    pub labels: Vec<DnsLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name:  DnsName,
    pub qtype: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRdata {
    A(Ipv4Field),
    Aaaa(Ipv6Field),
    /// CNAME, NS, PTR, DNAME.
    Name(DnsName),
    Mx(DnsName),
    Srv(DnsName),
    /// Primary server and responsible mailbox.
    Soa(DnsName, DnsName),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name:  DnsName,
    pub rtype: u16,
    pub rdata: DnsRdata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsLayer {
    pub offset:      usize,
    pub id:          u16,
    pub is_response: bool,
    pub opcode:      u8,
    pub rcode:       u8,
    pub over_tcp:    bool,
    pub questions:   Vec<DnsQuestion>,
    /// Answer, authority and additional sections in wire order.
    pub records:     Vec<DnsRecord>,
}

impl DnsLayer {
    pub fn query_name(&self) -> Option<&str> {
        self.questions.first().map(|q| q.name.text.as_str())
    }

    /// Every name in the message, rdata included.
    pub fn names(&self) -> impl Iterator<Item = &DnsName> {
        self.questions.iter().map(|q| &q.name).chain(self.records.iter().flat_map(|r| {
            let rdata: Vec<&DnsName> = match &r.rdata {
                DnsRdata::Name(n) | DnsRdata::Mx(n) | DnsRdata::Srv(n) => vec![n],
                DnsRdata::Soa(mname, rname) => vec![mname, rname],
                _ => Vec::new(),
            };
            std::iter::once(&r.name).chain(rdata)
        }))
    }
}

pub fn rcode_name(rcode: u8) -> &'static str {
    match rcode {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "RCODE",
    }
}

/// Read a possibly compressed name at `pos`. `msg` is the message start that
/// pointers are relative to, `end` the end of the message bytes. Returns the
/// name and the position right after it at its original location.
fn read_name(raw: &[u8], msg: usize, end: usize, pos: usize) -> Result<(DnsName, usize), LayerFault> {
    let mut labels = Vec::new();
    let mut cur = pos;
    let mut resume = None;
    let mut hops = 0;
    let mut wire_len = 1;

    loop {
        let len = match raw.get(cur) {
            Some(&b) if cur < end => b as usize,
            _ => return Err(LayerFault::truncated("DNS", "name cut short")),
        };
        match len & 0xc0 {
            0x00 if len == 0 => {
                cur += 1;
                break;
            }
            0x00 => {
                let start = cur + 1;
                if start + len > end {
                    return Err(LayerFault::truncated("DNS", "label cut short"));
                }
                wire_len += len + 1;
                if wire_len > MAX_NAME_LEN {
                    return Err(LayerFault::malformed("DNS", "name longer than 255 bytes"));
                }
                labels.push(DnsLabel {
                    offset: start,
                    len,
                    text: String::from_utf8_lossy(&raw[start..start + len]).into_owned(),
                });
                cur = start + len;
            }
            0xc0 => {
                let ptr = match be16(raw, cur) {
                    Some(p) if cur + 2 <= end => (p & 0x3fff) as usize,
                    _ => return Err(LayerFault::truncated("DNS", "pointer cut short")),
                };
                resume.get_or_insert(cur + 2);
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(LayerFault::malformed("DNS", "compression loop"));
                }
                if msg + ptr >= end {
                    return Err(LayerFault::malformed("DNS", format!("pointer {ptr} out of range")));
                }
                cur = msg + ptr;
            }
            _ => return Err(LayerFault::malformed("DNS", format!("label type {:#04x}", len & 0xc0))),
        }
    }

    let text = labels.iter().map(|l| l.text.as_str()).collect::<Vec<_>>().join(".");
    Ok((DnsName { text, labels }, resume.unwrap_or(cur)))
}

/// Parse a DNS message spanning `start..end`. A message whose header decodes
/// is returned even when a later section is cut short; the fault rides along.
fn parse_dns(
    raw: &[u8], start: usize, end: usize, over_tcp: bool,
) -> Result<(DnsLayer, Option<LayerFault>), LayerFault> {
    let hdr = raw.get(start..start + 12).filter(|_| start + 12 <= end)
        .ok_or_else(|| LayerFault::truncated("DNS", "header cut short"))?;
    let flags = u16::from_be_bytes([hdr[2], hdr[3]]);
    let count = |i: usize| u16::from_be_bytes([hdr[i], hdr[i + 1]]) as usize;
    let (qdcount, rrcount) = (count(4), count(6) + count(8) + count(10));

    let mut dns = DnsLayer {
        offset: start,
        id: u16::from_be_bytes([hdr[0], hdr[1]]),
        is_response: flags & 0x8000 != 0,
        opcode: ((flags >> 11) & 0x0f) as u8,
        rcode: (flags & 0x000f) as u8,
        over_tcp,
        questions: Vec::new(),
        records: Vec::new(),
    };

    let mut pos = start + 12;
    for _ in 0..qdcount {
        let (name, next) = match read_name(raw, start, end, pos) {
            Ok(v) => v,
            Err(fault) => return Ok((dns, Some(fault))),
        };
        let Some(qtype) = be16(raw, next).filter(|_| next + 4 <= end) else {
            return Ok((dns, Some(LayerFault::truncated("DNS", "question cut short"))));
        };
        dns.questions.push(DnsQuestion { name, qtype });
        pos = next + 4;
    }

    for _ in 0..rrcount {
        let (name, next) = match read_name(raw, start, end, pos) {
            Ok(v) => v,
            Err(fault) => return Ok((dns, Some(fault))),
        };
        let (Some(rtype), Some(rdlen)) = (be16(raw, next), be16(raw, next + 8)) else {
            return Ok((dns, Some(LayerFault::truncated("DNS", "record cut short"))));
        };
        let rdata_at = next + 10;
        let rdata_end = rdata_at + rdlen as usize;
        if rdata_end > end {
            return Ok((dns, Some(LayerFault::truncated("DNS", "record data cut short"))));
        }
        let rdata = parse_rdata(raw, start, rdata_end, rtype, rdata_at);
        dns.records.push(DnsRecord { name, rtype, rdata });
        pos = rdata_end;
    }

    Ok((dns, None))
}

fn parse_rdata(raw: &[u8], msg: usize, end: usize, rtype: u16, at: usize) -> DnsRdata {
    let name_at = |pos: usize| read_name(raw, msg, end, pos).ok();
    let len = end - at;
    match rtype {
        1 if len == 4 => {
            let b = &raw[at..end];
            DnsRdata::A(Ipv4Field { offset: at, addr: Ipv4Addr::new(b[0], b[1], b[2], b[3]) })
        }
        28 if len == 16 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(&raw[at..end]);
            DnsRdata::Aaaa(Ipv6Field { offset: at, addr: Ipv6Addr::from(b) })
        }
        2 | 5 | 12 | 39 => name_at(at).map_or(DnsRdata::Other, |(n, _)| DnsRdata::Name(n)),
        15 if len > 2 => name_at(at + 2).map_or(DnsRdata::Other, |(n, _)| DnsRdata::Mx(n)),
        33 if len > 6 => name_at(at + 6).map_or(DnsRdata::Other, |(n, _)| DnsRdata::Srv(n)),
        6 => match name_at(at) {
            Some((mname, next)) => match name_at(next) {
                Some((rname, _)) => DnsRdata::Soa(mname, rname),
                None => DnsRdata::Other,
            },
            None => DnsRdata::Other,
        },
        _ => DnsRdata::Other,
    }
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpStart {
    Request  { method: String, target: String },
    Response { status: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name:         String,
    pub value_offset: usize,
    pub value_len:    usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpLayer {
    pub offset:      usize,
    pub start:       HttpStart,
    pub version:     String,
    pub headers:     Vec<HttpHeader>,
    /// First byte after the header block, or the end of captured bytes.
    pub body_offset: usize,
    pub end:         usize,
}

impl HttpLayer {
    pub fn header<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HttpHeader> + 'a {
        self.headers.iter().filter(move |h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn status(&self) -> Option<u16> {
        match self.start {
            HttpStart::Response { status, .. } => Some(status),
            HttpStart::Request { .. } => None,
        }
    }
}

/// Split off one line ending in LF (CR stripped). Returns the line and the
/// offset after its terminator, or the whole rest when no LF follows.
fn next_line(raw: &[u8], pos: usize, end: usize) -> (&[u8], usize, bool) {
    let rest = &raw[pos..end];
    match rest.iter().position(|&b| b == b'\n') {
        Some(i) => {
            let line = &rest[..i];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            (line, pos + i + 1, true)
        }
        None => (rest, end, false),
    }
}

fn parse_start_line(line: &[u8]) -> Option<(HttpStart, String)> {
    let text = std::str::from_utf8(line).ok()?;
    let mut parts = text.splitn(3, ' ');
    let first = parts.next()?;
    let second = parts.next()?;
    let third = parts.next().unwrap_or("");

    if first.starts_with("HTTP/") {
        if second.len() != 3 || !second.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let status = second.parse().ok()?;
        return Some((HttpStart::Response { status, reason: third.to_string() }, first.to_string()));
    }
    if HTTP_METHODS.contains(&first.as_bytes()) && third.starts_with("HTTP/") {
        let start = HttpStart::Request { method: first.to_string(), target: second.to_string() };
        return Some((start, third.to_string()));
    }
    None
}

fn parse_http(raw: &[u8], start: usize, end: usize) -> Option<HttpLayer> {
    let (line, mut pos, _) = next_line(raw, start, end);
    let (start_line, version) = parse_start_line(line)?;

    let mut headers = Vec::new();
    let mut body_offset = end;
    while pos < end && headers.len() < MAX_HTTP_HEADERS {
        let line_start = pos;
        let (line, next, terminated) = next_line(raw, pos, end);
        if line.is_empty() && terminated {
            body_offset = next;
            break;
        }
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
            let value = &line[colon + 1..];
            let lead = value.iter().take_while(|b| matches!(b, b' ' | b'\t')).count();
            let trimmed = value[lead..].iter().rposition(|b| !matches!(b, b' ' | b'\t')).map_or(0, |i| i + 1);
            headers.push(HttpHeader {
                name,
                value_offset: line_start + colon + 1 + lead,
                value_len: trimmed,
            });
        }
        pos = next;
    }

    Some(HttpLayer { offset: start, start: start_line, version, headers, body_offset, end })
}

// ─── TLS ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniName {
    pub offset: usize,
    pub len:    usize,
    pub name:   String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsLayer {
    pub offset:         usize,
    pub record_version: u16,
    pub handshake_type: u8,
    /// Server names from a ClientHello; empty for other handshakes.
    pub sni:            Vec<SniName>,
}

fn parse_tls(raw: &[u8], start: usize, end: usize) -> Option<TlsLayer> {
    let d = &raw[start..end];
    if d.len() < 6 || d[0] != 0x16 || d[1] != 0x03 || d[2] > 0x04 {
        return None;
    }
    let mut tls = TlsLayer {
        offset: start,
        record_version: u16::from_be_bytes([d[1], d[2]]),
        handshake_type: d[5],
        sni: Vec::new(),
    };
    if tls.handshake_type == 1 {
        tls.sni = client_hello_sni(d).into_iter()
            .map(|(off, len, name)| SniName { offset: start + off, len, name })
            .collect();
    }
    Some(tls)
}

/// Walk a ClientHello to its server_name extension. Offsets are relative to
/// the record start. Stops quietly wherever the hello is cut short.
fn client_hello_sni(d: &[u8]) -> Vec<(usize, usize, String)> {
    let mut names = Vec::new();
    // record header, handshake header, client version, random
    let mut pos = 5 + 4 + 2 + 32;
    let Some(&sid_len) = d.get(pos) else { return names };
    pos += 1 + sid_len as usize;
    let Some(cs_len) = be16(d, pos) else { return names };
    pos += 2 + cs_len as usize;
    let Some(&cm_len) = d.get(pos) else { return names };
    pos += 1 + cm_len as usize;
    let Some(ext_total) = be16(d, pos) else { return names };
    pos += 2;
    let ext_end = (pos + ext_total as usize).min(d.len());

    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([d[pos], d[pos + 1]]);
        let ext_len = u16::from_be_bytes([d[pos + 2], d[pos + 3]]) as usize;
        pos += 4;
        if ext_type == 0x0000 {
            let list_end = (pos + ext_len).min(ext_end);
            let mut p = pos + 2;
            while p + 3 <= list_end {
                let name_type = d[p];
                let name_len = u16::from_be_bytes([d[p + 1], d[p + 2]]) as usize;
                let name_start = p + 3;
                if name_start + name_len > d.len() { break; }
                if name_type == 0 {
                    let name = String::from_utf8_lossy(&d[name_start..name_start + name_len]).into_owned();
                    names.push((name_start, name_len, name));
                }
                p = name_start + name_len;
            }
        }
        pos += ext_len;
    }
    names
}

// ─── Walk steps ───────────────────────────────────────────────────────────────

fn is_dns_port(port: u16) -> bool {
    DNS_PORTS.contains(&port)
}

impl Walk<'_> {
    pub(crate) fn tcp_payload(&mut self, tcp: &TcpLayer) {
        if tcp.captured_len == 0 {
            return;
        }
        let start = tcp.payload_offset;
        let end = start + tcp.captured_len;

        if is_dns_port(tcp.src_port) || is_dns_port(tcp.dst_port) {
            // Only segments that open a message carry the length prefix;
            // continuation segments stay opaque.
            if let Some(msg_len) = be16(self.raw, start) {
                let msg_end = (start + 2 + msg_len as usize).min(end);
                if let Ok((dns, None)) = parse_dns(self.raw, start + 2, msg_end, true) {
                    self.layers.push(Layer::Dns(dns));
                    return self.unknown(msg_end, "dns over tcp trailer");
                }
            }
            return self.unknown(start, "dns over tcp");
        }

        if let Some(http) = parse_http(self.raw, start, end) {
            self.layers.push(Layer::Http(http));
            return;
        }
        if let Some(tls) = parse_tls(self.raw, start, end) {
            self.layers.push(Layer::Tls(tls));
            return;
        }
        self.unknown(start, "tcp payload");
    }

    pub(crate) fn udp_payload(&mut self, udp: &UdpLayer) {
        if udp.captured_len == 0 {
            return;
        }
        let start = udp.payload_offset;
        let end = start + udp.captured_len;

        if is_dns_port(udp.src_port) || is_dns_port(udp.dst_port) {
            match parse_dns(self.raw, start, end, false) {
                Ok((dns, fault)) => {
                    self.layers.push(Layer::Dns(dns));
                    if let Some(fault) = fault {
                        self.warning.get_or_insert(fault);
                    }
                    self.unknown(end, "udp trailer");
                }
                Err(fault) => self.fail(start, fault),
            }
            return;
        }
        self.unknown(start, "udp payload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode, LINKTYPE_ETHERNET};
    use crate::error::WarningCause;
    use crate::testutil::{
        client_hello, dns_query, dns_response, eth_ipv4_tcp, eth_ipv4_udp, http_request, PacketSpec,
    };

    fn dns_spec() -> PacketSpec {
        PacketSpec { dst_port: 53, ..PacketSpec::default() }
    }

    #[test]
    fn compressed_answer_names_resolve() {
        let msg = dns_response(7, "www.example.com", 0, &[[93, 184, 216, 34]]);
        let pkt = eth_ipv4_udp(&dns_spec(), &msg);
        let out = decode(&pkt, LINKTYPE_ETHERNET);
        assert!(out.warning.is_none());
        let dns = out.packet.dns().unwrap();
        assert!(dns.is_response);
        assert_eq!(dns.records.len(), 1);
        let answer = &dns.records[0];
        assert_eq!(answer.name.text, "www.example.com");
        // pointer target: same label bytes as the question
        assert_eq!(answer.name.labels[0].offset, dns.questions[0].name.labels[0].offset);
        match answer.rdata {
            DnsRdata::A(f) => {
                assert_eq!(f.addr, Ipv4Addr::new(93, 184, 216, 34));
                assert_eq!(&pkt[f.offset..f.offset + 4], &[93, 184, 216, 34]);
            }
            ref other => panic!("unexpected rdata {other:?}"),
        }
        assert_eq!(dns.names().count(), 2);
    }

    #[test]
    fn pointer_loop_is_malformed() {
        let mut msg = dns_query(1, "a.b");
        // question name becomes a pointer to itself
        msg[12] = 0xc0;
        msg[13] = 12;
        let pkt = eth_ipv4_udp(&dns_spec(), &msg);
        let w = decode(&pkt, LINKTYPE_ETHERNET).warning.unwrap();
        assert_eq!((w.layer, w.cause), ("DNS", WarningCause::Malformed));
    }

    #[test]
    fn short_dns_header_is_truncated() {
        let pkt = eth_ipv4_udp(&dns_spec(), &[0x12, 0x34, 0x01]);
        let out = decode(&pkt, LINKTYPE_ETHERNET);
        assert!(out.packet.dns().is_none());
        assert_eq!(out.warning.unwrap().cause, WarningCause::Truncated);
    }

    #[test]
    fn rcode_and_names() {
        let msg = dns_response(9, "nope.invalid", 3, &[]);
        let out = decode(&eth_ipv4_udp(&dns_spec(), &msg), LINKTYPE_ETHERNET);
        let dns = out.packet.dns().unwrap();
        assert_eq!(dns.rcode, 3);
        assert_eq!(rcode_name(dns.rcode), "NXDOMAIN");
        assert_eq!(dns.query_name(), Some("nope.invalid"));
    }

    #[test]
    fn http_request_headers_have_offsets() {
        let req = http_request("GET", "/index.html", "example.com", &[("Cookie", "sid=abc123")]);
        let pkt = eth_ipv4_tcp(&PacketSpec::default(), &req);
        let out = decode(&pkt, LINKTYPE_ETHERNET);
        let http = out.packet.http().unwrap();
        assert!(matches!(&http.start, HttpStart::Request { method, .. } if method == "GET"));
        assert_eq!(http.version, "HTTP/1.1");
        let cookie = http.header("cookie").next().unwrap();
        assert_eq!(&pkt[cookie.value_offset..cookie.value_offset + cookie.value_len], b"sid=abc123");
        let host = http.header("Host").next().unwrap();
        assert_eq!(&pkt[host.value_offset..host.value_offset + host.value_len], b"example.com");
        assert_eq!(http.body_offset, http.end);
    }

    #[test]
    fn http_status_line() {
        let resp = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let spec = PacketSpec { src_port: 80, dst_port: 40000, ..PacketSpec::default() };
        let out = decode(&eth_ipv4_tcp(&spec, resp), LINKTYPE_ETHERNET);
        let http = out.packet.http().unwrap();
        assert_eq!(http.status(), Some(404));
        assert!(matches!(&http.start, HttpStart::Response { reason, .. } if reason == "Not Found"));
    }

    #[test]
    fn lookalike_payload_is_not_http() {
        let out = decode(&eth_ipv4_tcp(&PacketSpec::default(), b"GETTING STARTED\r\n"), LINKTYPE_ETHERNET);
        assert!(out.packet.http().is_none());
        assert_eq!(out.packet.unknown().unwrap().hint, "tcp payload");
    }

    #[test]
    fn client_hello_sni_offsets() {
        let hello = client_hello("secret.example.org");
        let spec = PacketSpec { dst_port: 443, ..PacketSpec::default() };
        let pkt = eth_ipv4_tcp(&spec, &hello);
        let out = decode(&pkt, LINKTYPE_ETHERNET);
        let tls = out.packet.tls().unwrap();
        assert_eq!(tls.handshake_type, 1);
        assert_eq!(tls.sni.len(), 1);
        let sni = &tls.sni[0];
        assert_eq!(sni.name, "secret.example.org");
        assert_eq!(&pkt[sni.offset..sni.offset + sni.len], b"secret.example.org");
    }

    #[test]
    fn dns_over_tcp_skips_length_prefix() {
        let msg = dns_query(0x4242, "example.net");
        let mut framed = (msg.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&msg);
        let out = decode(&eth_ipv4_tcp(&dns_spec(), &framed), LINKTYPE_ETHERNET);
        let dns = out.packet.dns().unwrap();
        assert!(dns.over_tcp);
        assert_eq!(dns.id, 0x4242);
        assert_eq!(dns.offset, 54 + 2);
    }
}
