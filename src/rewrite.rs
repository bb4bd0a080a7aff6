//! In-place substitution of sensitive fields.
//!
//! Every replacement has the byte length of what it replaces, so a record's
//! length never changes. Checksums covering rewritten bytes are recomputed or
//! zeroed afterwards, depending on [`ChecksumPolicy`].

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::ops::Range;

use regex::bytes::Regex;
use serde::Serialize;

use crate::anonymize::AnonymizationMap;
use crate::config::{ChecksumPolicy, FieldKind, SanitizeOptions};
use crate::decode::{
    DecodedPacket, DnsLayer, DnsName, DnsRdata, HttpLayer, Layer, QuotedAddrs, IPPROTO_TCP,
    IPPROTO_UDP,
};
use crate::error::{PacketDecodeWarning, Result};

/// Header values replaced wholesale by a same-length token.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization", "proxy-authorization", "cookie", "set-cookie", "user-agent",
    "x-api-key", "x-auth-token", "x-forwarded-for", "x-real-ip",
];

/// Decode warnings kept verbatim in the stats.
pub const WARNING_SAMPLES: usize = 20;

// ─── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize)]
pub struct SanitizationStats {
    pub total_packets:         u64,
    pub packets_modified:      u64,
    pub mac_addresses:         u64,
    pub arp_addresses:         u64,
    pub ip_addresses:          u64,
    pub icmp_quoted_addresses: u64,
    pub dns_names:             u64,
    pub dns_record_addresses:  u64,
    pub http_hosts:            u64,
    pub http_headers:          u64,
    pub emails:                u64,
    pub payload_secrets:       u64,
    pub tls_sni:               u64,
    pub checksums_recomputed:  u64,
    pub checksums_zeroed:      u64,
    pub decode_warnings:       u64,
    pub warning_samples:       Vec<PacketDecodeWarning>,
    /// Distinct originals replaced, per kind.
    pub distinct_values:       BTreeMap<FieldKind, usize>,
    pub pools_exhausted:       Vec<FieldKind>,
}

impl SanitizationStats {
    pub(crate) fn note_warning(&mut self, warning: &PacketDecodeWarning) {
        self.decode_warnings += 1;
        if self.warning_samples.len() < WARNING_SAMPLES {
            self.warning_samples.push(warning.clone());
        }
    }

    /// Copy the map's final shape into the stats.
    pub(crate) fn absorb_map(&mut self, map: &AnonymizationMap) {
        self.distinct_values = FieldKind::ALL.iter().map(|&k| (k, map.distinct(k))).collect();
        self.pools_exhausted = map.exhausted_kinds().collect();
    }
}

// ─── Payload patterns ─────────────────────────────────────────────────────────

struct SecretPattern {
    /// Group 1 is the secret itself.
    re: Regex,
}

struct PayloadScrubber {
    email:   Regex,
    secrets: Vec<SecretPattern>,
}

impl PayloadScrubber {
    fn new() -> Result<Self> {
        Ok(Self {
            email: Regex::new(r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b")?,
            secrets: vec![
                SecretPattern { re: Regex::new(r"(?i)\bBearer\s+([A-Za-z0-9._~+/\-]+=*)")? },
                SecretPattern { re: Regex::new(r#"(?i)\bapi[_\-]?key["']?\s*[=:]\s*["']?([A-Za-z0-9._\-]+)"#)? },
                SecretPattern { re: Regex::new(r#"(?i)\b(?:access_|refresh_|auth_)?token["']?\s*[=:]\s*["']?([A-Za-z0-9._\-]+)"#)? },
                SecretPattern { re: Regex::new(r#"(?i)\bsecret["']?\s*[=:]\s*["']?([A-Za-z0-9._\-]+)"#)? },
            ],
        })
    }
}

// ─── Rewriter ─────────────────────────────────────────────────────────────────

pub struct Rewriter {
    options:  SanitizeOptions,
    scrubber: PayloadScrubber,
    stats:    SanitizationStats,
}

/// Tracks what one packet's rewrite touched.
#[derive(Default)]
struct Patch {
    changed: bool,
    /// Byte ranges already replaced; payload patterns skip them.
    done:    Vec<Range<usize>>,
}

impl Patch {
    fn write(&mut self, data: &mut [u8], offset: usize, bytes: &[u8]) -> bool {
        match data.get_mut(offset..offset + bytes.len()) {
            Some(dst) if dst != bytes => {
                dst.copy_from_slice(bytes);
                self.changed = true;
                self.done.push(offset..offset + bytes.len());
                true
            }
            _ => false,
        }
    }

    fn overlaps(&self, r: &Range<usize>) -> bool {
        self.done.iter().any(|d| d.start < r.end && r.start < d.end)
    }
}

impl Rewriter {
    pub fn new(options: &SanitizeOptions) -> Result<Self> {
        Ok(Self { options: options.clone(), scrubber: PayloadScrubber::new()?, stats: SanitizationStats::default() })
    }

    pub fn stats(&self) -> &SanitizationStats { &self.stats }

    pub(crate) fn stats_mut(&mut self) -> &mut SanitizationStats { &mut self.stats }

    pub fn into_stats(self) -> SanitizationStats { self.stats }

    fn on(&self, kind: FieldKind) -> bool {
        self.options.enabled(kind)
    }

    /// Rewrite `data` in place. Returns whether any byte changed.
    pub fn rewrite(&mut self, packet: &DecodedPacket, data: &mut [u8], map: &mut AnonymizationMap) -> bool {
        self.stats.total_packets += 1;
        let mut patch = Patch::default();

        for layer in &packet.layers {
            match layer {
                Layer::Ethernet(eth) if self.on(FieldKind::Mac) => {
                    for field in [eth.dst, eth.src].into_iter().flatten() {
                        if patch.write(data, field.offset, &map.map_mac(field.addr)) {
                            self.stats.mac_addresses += 1;
                        }
                    }
                }
                Layer::Arp(arp) => {
                    if self.on(FieldKind::Mac) {
                        for field in [arp.sender_mac, arp.target_mac] {
                            if patch.write(data, field.offset, &map.map_mac(field.addr)) {
                                self.stats.arp_addresses += 1;
                            }
                        }
                    }
                    if self.on(FieldKind::Ipv4) {
                        for field in [arp.sender_ip, arp.target_ip] {
                            if patch.write(data, field.offset, &map.map_ipv4(field.addr).octets()) {
                                self.stats.arp_addresses += 1;
                            }
                        }
                    }
                }
                Layer::Ipv4(ip) if self.on(FieldKind::Ipv4) => {
                    for field in [ip.src, ip.dst] {
                        if patch.write(data, field.offset, &map.map_ipv4(field.addr).octets()) {
                            self.stats.ip_addresses += 1;
                        }
                    }
                }
                Layer::Ipv6(ip) if self.on(FieldKind::Ipv6) => {
                    for field in [ip.src, ip.dst] {
                        if patch.write(data, field.offset, &map.map_ipv6(field.addr).octets()) {
                            self.stats.ip_addresses += 1;
                        }
                    }
                }
                Layer::Icmp(icmp) => {
                    if let Some(quoted) = &icmp.quoted {
                        self.rewrite_quoted(quoted.addrs, data, map, &mut patch);
                    }
                }
                Layer::Dns(dns) => self.rewrite_dns(dns, data, map, &mut patch),
                Layer::Http(http) => {
                    self.rewrite_http(http, data, map, &mut patch);
                    self.scrub(http.offset..http.end, data, map, &mut patch);
                }
                Layer::Tls(tls) if self.on(FieldKind::Domain) => {
                    for sni in &tls.sni {
                        let mapped = map.map_domain(&sni.name);
                        if mapped.len() == sni.len && patch.write(data, sni.offset, mapped.as_bytes()) {
                            self.stats.tls_sni += 1;
                        }
                    }
                }
                Layer::Unknown(tail) if packet.tcp().is_some() || packet.udp().is_some() => {
                    if !matches!(packet.top_protocol(), "DNS" | "TLS") {
                        self.scrub(tail.offset..tail.offset + tail.len, data, map, &mut patch);
                    }
                }
                _ => {}
            }
        }

        if patch.changed {
            self.stats.packets_modified += 1;
            self.fix_checksums(packet, data);
        }
        patch.changed
    }

    fn rewrite_quoted(&mut self, addrs: QuotedAddrs, data: &mut [u8], map: &mut AnonymizationMap, patch: &mut Patch) {
        match addrs {
            QuotedAddrs::V4(src, dst) if self.on(FieldKind::Ipv4) => {
                let mut hit = false;
                for field in [src, dst] {
                    if patch.write(data, field.offset, &map.map_ipv4(field.addr).octets()) {
                        self.stats.icmp_quoted_addresses += 1;
                        hit = true;
                    }
                }
                // the quoted header starts 12 bytes before its source address
                if hit {
                    let start = src.offset - 12;
                    if let Some(&vihl) = data.get(start) {
                        let ihl = ((vihl & 0x0f) as usize) * 4;
                        if self.options.checksum == ChecksumPolicy::Recompute && data.len() >= start + ihl {
                            set_checksum(data, start + 10, &[], start..start + ihl);
                        }
                    }
                }
            }
            QuotedAddrs::V6(src, dst) if self.on(FieldKind::Ipv6) => {
                for field in [src, dst] {
                    if patch.write(data, field.offset, &map.map_ipv6(field.addr).octets()) {
                        self.stats.icmp_quoted_addresses += 1;
                    }
                }
            }
            _ => {}
        }
    }

    fn rewrite_dns(&mut self, dns: &DnsLayer, data: &mut [u8], map: &mut AnonymizationMap, patch: &mut Patch) {
        if self.on(FieldKind::Domain) {
            for name in dns.names() {
                if write_name(name, data, map, patch) {
                    self.stats.dns_names += 1;
                }
            }
        }
        for record in &dns.records {
            let hit = match record.rdata {
                DnsRdata::A(f) if self.on(FieldKind::Ipv4) => {
                    patch.write(data, f.offset, &map.map_ipv4(f.addr).octets())
                }
                DnsRdata::Aaaa(f) if self.on(FieldKind::Ipv6) => {
                    patch.write(data, f.offset, &map.map_ipv6(f.addr).octets())
                }
                _ => false,
            };
            if hit {
                self.stats.dns_record_addresses += 1;
            }
        }
    }

    fn rewrite_http(&mut self, http: &HttpLayer, data: &mut [u8], map: &mut AnonymizationMap, patch: &mut Patch) {
        for header in &http.headers {
            let range = header.value_offset..header.value_offset + header.value_len;
            let Some(raw) = data.get(range.clone()).map(<[u8]>::to_vec) else {
                continue;
            };
            let lower = header.name.to_ascii_lowercase();

            if lower == "host" && self.on(FieldKind::Domain) {
                let Ok(value) = std::str::from_utf8(&raw) else {
                    if patch.write(data, range.start, map.map_token_bytes(&raw).as_bytes()) {
                        self.stats.http_hosts += 1;
                    }
                    continue;
                };
                let (host, _port) = split_host_port(value);
                let mapped = if host.parse::<Ipv4Addr>().is_ok() || host.starts_with('[') {
                    map.map_token(host)
                } else {
                    map.map_domain(host)
                };
                if mapped.len() == host.len() && patch.write(data, range.start, mapped.as_bytes()) {
                    self.stats.http_hosts += 1;
                }
            } else if SENSITIVE_HEADERS.contains(&lower.as_str()) && self.on(FieldKind::Token) {
                // raw bytes: lossy text would not keep the value's length
                let mapped = map.map_token_bytes(&raw);
                if patch.write(data, range.start, mapped.as_bytes()) {
                    self.stats.http_headers += 1;
                }
            }
        }
    }

    /// E-mail addresses and credential parameters anywhere in `range`.
    fn scrub(&mut self, range: Range<usize>, data: &mut [u8], map: &mut AnonymizationMap, patch: &mut Patch) {
        let end = range.end.min(data.len());
        if range.start >= end {
            return;
        }
        let base = range.start;

        if self.on(FieldKind::Email) {
            let found: Vec<(Range<usize>, String)> = self.scrubber.email.find_iter(&data[base..end])
                .filter_map(|m| Some((base + m.start()..base + m.end(), std::str::from_utf8(m.as_bytes()).ok()?.to_string())))
                .collect();
            for (r, text) in found {
                if patch.overlaps(&r) {
                    continue;
                }
                let mapped = map.map_email(&text);
                if mapped.len() == text.len() && patch.write(data, r.start, mapped.as_bytes()) {
                    self.stats.emails += 1;
                }
            }
        }

        if self.on(FieldKind::Token) {
            for pattern in &self.scrubber.secrets {
                let found: Vec<(Range<usize>, String)> = pattern.re.captures_iter(&data[base..end])
                    .filter_map(|c| {
                        let g = c.get(1)?;
                        Some((base + g.start()..base + g.end(), std::str::from_utf8(g.as_bytes()).ok()?.to_string()))
                    })
                    .collect();
                for (r, text) in found {
                    if patch.overlaps(&r) {
                        continue;
                    }
                    if patch.write(data, r.start, map.map_token(&text).as_bytes()) {
                        self.stats.payload_secrets += 1;
                    }
                }
            }
        }
    }

    // ─── Checksums ────────────────────────────────────────────────────────────

    fn fix_checksums(&mut self, packet: &DecodedPacket, data: &mut [u8]) {
        let zero = self.options.checksum == ChecksumPolicy::Zero;
        let mut fields = 0;

        // Pseudo header for the transport checksum, built from the rewritten bytes.
        let mut pseudo: Option<(Vec<u8>, bool)> = None;
        if let Some(ip) = packet.ipv4() {
            let hdr = ip.offset..ip.offset + ip.header_len;
            if zero {
                zero_field(data, ip.offset + 10);
            } else {
                set_checksum(data, ip.offset + 10, &[], hdr);
            }
            fields += 1;
            if !ip.is_fragment() {
                let mut p = data[ip.src.offset..ip.src.offset + 4].to_vec();
                p.extend_from_slice(&data[ip.dst.offset..ip.dst.offset + 4]);
                p.extend_from_slice(&[0, ip.protocol]);
                pseudo = Some((p, true));
            }
        } else if let Some(ip) = packet.ipv6() {
            if !ip.fragment {
                let mut p = data[ip.src.offset..ip.src.offset + 16].to_vec();
                p.extend_from_slice(&data[ip.dst.offset..ip.dst.offset + 16]);
                p.extend_from_slice(&[0, 0, 0, ip.next_header]);
                pseudo = Some((p, false));
            }
        }

        let transport = packet.tcp().map(|t| (t.offset + 16, t.offset..t.payload_offset + t.payload_len, t.captured_len == t.payload_len, IPPROTO_TCP))
            .or_else(|| packet.udp().map(|u| (u.offset + 6, u.offset..u.payload_offset + u.payload_len, u.captured_len == u.payload_len, IPPROTO_UDP)))
            .or_else(|| packet.icmp().map(|i| (i.offset + 2, i.offset..i.offset + i.len, i.offset + i.len <= data.len(), if i.v6 { 58 } else { 1 })));

        if let Some((field, covered, complete, proto)) = transport {
            let udp_v4_unset = proto == IPPROTO_UDP
                && matches!(pseudo, Some((_, true)))
                && data.get(field..field + 2) == Some(&[0, 0][..]);
            if zero {
                zero_field(data, field);
                fields += 1;
            } else if complete && !udp_v4_unset && covered.end <= data.len() {
                let len = (covered.end - covered.start) as u16;
                let prefix = match (&pseudo, proto) {
                    // ICMPv4 has no pseudo header.
                    (_, 1) => Some(Vec::new()),
                    (Some((p, true)), _) => Some(pseudo_v4(p, len)),
                    (Some((p, false)), _) => Some(pseudo_v6(p, len)),
                    (None, _) => None,
                };
                if let Some(prefix) = prefix {
                    set_checksum(data, field, &prefix, covered);
                    if proto == IPPROTO_UDP && data[field..field + 2] == [0, 0] {
                        data[field..field + 2].copy_from_slice(&[0xff, 0xff]);
                    }
                    fields += 1;
                }
            }
        }

        if zero {
            self.stats.checksums_zeroed += fields;
        } else {
            self.stats.checksums_recomputed += fields;
        }
    }
}

/// Labels are written one by one at their own offsets, so compressed
/// names stay consistent.
fn write_name(name: &DnsName, data: &mut [u8], map: &mut AnonymizationMap, patch: &mut Patch) -> bool {
    let texts: Vec<&str> = name.labels.iter().map(|l| l.text.as_str()).collect();
    let mapped = map.map_labels(&texts);
    let mut hit = false;
    for (label, new) in name.labels.iter().zip(&mapped) {
        let bytes = if new.len() == label.len { new.clone().into_bytes() } else { vec![b'x'; label.len] };
        hit |= patch.write(data, label.offset, &bytes);
    }
    hit
}

/// `host` or `host:port`, with bracketed IPv6 literals kept whole.
fn split_host_port(value: &str) -> (&str, Option<&str>) {
    if value.starts_with('[') {
        return match value.find(']') {
            Some(i) => (&value[..=i], value[i + 1..].strip_prefix(':')),
            None => (value, None),
        };
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => (host, Some(port)),
        _ => (value, None),
    }
}

fn pseudo_v4(addrs_and_proto: &[u8], len: u16) -> Vec<u8> {
    let mut p = addrs_and_proto.to_vec();
    p.extend_from_slice(&len.to_be_bytes());
    p
}

fn pseudo_v6(addrs_and_proto: &[u8], len: u16) -> Vec<u8> {
    let mut p = addrs_and_proto[..32].to_vec();
    p.extend_from_slice(&u32::from(len).to_be_bytes());
    p.extend_from_slice(&addrs_and_proto[32..]);
    p
}

fn zero_field(data: &mut [u8], at: usize) {
    if let Some(f) = data.get_mut(at..at + 2) {
        f.fill(0);
    }
}

fn sum_words(data: &[u8], mut sum: u64) -> u64 {
    let mut words = data.chunks_exact(2);
    for w in &mut words {
        sum += u64::from(u16::from_be_bytes([w[0], w[1]]));
    }
    if let [last] = words.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

/// RFC 1071 checksum of `prefix` followed by `data[covered]`.
pub fn internet_checksum(prefix: &[u8], covered: &[u8]) -> u16 {
    let mut sum = sum_words(covered, sum_words(prefix, 0));
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn set_checksum(data: &mut [u8], field: usize, prefix: &[u8], covered: Range<usize>) {
    if covered.end > data.len() || field + 2 > data.len() {
        return;
    }
    data[field..field + 2].fill(0);
    let sum = internet_checksum(prefix, &data[covered]);
    data[field..field + 2].copy_from_slice(&sum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode, LINKTYPE_ETHERNET};
    use crate::testutil::{
        checksum, client_hello, dns_response, eth_ipv4_tcp, eth_ipv4_udp, eth_ipv6_tcp,
        http_request, icmp_unreachable, PacketSpec,
    };

    fn setup() -> (Rewriter, AnonymizationMap) {
        let opts = SanitizeOptions { salt: Some("rw".into()), ..SanitizeOptions::default() };
        (Rewriter::new(&opts).unwrap(), AnonymizationMap::new(opts.preserve_private, opts.salt.as_deref()))
    }

    fn run(rw: &mut Rewriter, map: &mut AnonymizationMap, pkt: &[u8]) -> Vec<u8> {
        let mut out = pkt.to_vec();
        let decoded = decode(pkt, LINKTYPE_ETHERNET).packet;
        rw.rewrite(&decoded, &mut out, map);
        assert_eq!(out.len(), pkt.len());
        out
    }

    fn tcp_checksum_ok(pkt: &[u8]) -> bool {
        let mut pseudo = pkt[26..34].to_vec();
        pseudo.extend_from_slice(&[0, 6]);
        pseudo.extend_from_slice(&((pkt.len() - 34) as u16).to_be_bytes());
        checksum(&[&pseudo, &pkt[34..]]) == 0
    }

    #[test]
    fn addresses_replaced_and_checksums_valid() {
        let (mut rw, mut map) = setup();
        let spec = PacketSpec::default();
        let pkt = eth_ipv4_tcp(&spec, b"plain data");
        let out = run(&mut rw, &mut map, &pkt);

        assert_eq!(&out[26..30], &spec.src_ip.octets(), "private source preserved");
        assert_eq!(&out[30..34], &[192, 0, 2, 1]);
        assert_eq!(&out[0..3], &[0x02, 0x00, 0x00]);
        assert_eq!(checksum(&[&out[14..34]]), 0);
        assert!(tcp_checksum_ok(&out));
        assert_eq!(rw.stats().packets_modified, 1);
        assert_eq!(rw.stats().ip_addresses, 1);
        assert_eq!(rw.stats().mac_addresses, 2);
    }

    #[test]
    fn zero_policy_clears_checksums() {
        let opts = SanitizeOptions { checksum: ChecksumPolicy::Zero, ..SanitizeOptions::default() };
        let mut rw = Rewriter::new(&opts).unwrap();
        let mut map = AnonymizationMap::new(true, Some("z"));
        let out = run(&mut rw, &mut map, &eth_ipv4_tcp(&PacketSpec::default(), b""));
        assert_eq!(&out[24..26], &[0, 0]);
        assert_eq!(&out[50..52], &[0, 0]);
        assert_eq!(rw.stats().checksums_zeroed, 2);
    }

    #[test]
    fn repeated_addresses_get_identical_replacements() {
        let (mut rw, mut map) = setup();
        let spec = PacketSpec::default();
        let a = run(&mut rw, &mut map, &eth_ipv4_tcp(&spec, b""));
        let b = run(&mut rw, &mut map, &eth_ipv4_tcp(&spec.reversed(), b""));
        assert_eq!(&a[30..34], &b[26..30]);
        assert_eq!(&a[0..6], &b[6..12]);
    }

    #[test]
    fn dns_names_and_answers_rewritten_consistently() {
        let (mut rw, mut map) = setup();
        let spec = PacketSpec { src_port: 53, dst_port: 5000, ..PacketSpec::default() };
        let pkt = eth_ipv4_udp(&spec, &dns_response(3, "www.example.com", 0, &[[93, 184, 216, 34]]));
        let out = run(&mut rw, &mut map, &pkt);

        let decoded = decode(&out, LINKTYPE_ETHERNET);
        let dns = decoded.packet.dns().unwrap();
        let q = &dns.questions[0].name.text;
        assert_ne!(q, "www.example.com");
        assert_eq!(q.len(), "www.example.com".len());
        assert!(q.ends_with(".com"));
        assert_eq!(&dns.records[0].name.text, q);
        assert_eq!(*q, map.map_domain("www.example.com"));
        match dns.records[0].rdata {
            DnsRdata::A(f) => assert_eq!(f.addr, map.map_ipv4(Ipv4Addr::new(93, 184, 216, 34))),
            ref other => panic!("unexpected rdata {other:?}"),
        }
        let udp = decoded.packet.udp().unwrap();
        let mut pseudo = out[26..34].to_vec();
        pseudo.extend_from_slice(&[0, 17]);
        pseudo.extend_from_slice(&udp.length.to_be_bytes());
        assert_eq!(checksum(&[&pseudo, &out[34..]]), 0);
    }

    #[test]
    fn http_host_and_secrets_replaced() {
        let (mut rw, mut map) = setup();
        let req = http_request("GET", "/login?api_key=ABCDEF123456&user=bob@mail.example.org", "shop.example.com:8080", &[
            ("Authorization", "Bearer eyJhbGciOi.J9"),
            ("Accept", "text/html"),
        ]);
        let pkt = eth_ipv4_tcp(&PacketSpec::default(), &req);
        let out = run(&mut rw, &mut map, &pkt);
        let text = String::from_utf8_lossy(&out[54..]).into_owned();

        assert!(!text.contains("shop.example.com"));
        assert!(text.contains(":8080\r\n"));
        assert!(!text.contains("ABCDEF123456"));
        assert!(!text.contains("bob@mail.example.org"));
        assert!(!text.contains("eyJhbGciOi"));
        assert!(text.contains("Accept: text/html"));
        assert!(text.starts_with("GET /login?api_key="));
        assert_eq!(rw.stats().http_hosts, 1);
        assert_eq!(rw.stats().http_headers, 1);
        assert_eq!(rw.stats().emails, 1);
        assert_eq!(rw.stats().payload_secrets, 1);
        assert!(tcp_checksum_ok(&out));
    }

    #[test]
    fn non_utf8_cookie_value_replaced_whole() {
        let (mut rw, mut map) = setup();
        let mut req = b"GET / HTTP/1.1\r\nHost: shop.example.com\r\nCookie: session=SECRETVALUE".to_vec();
        req.extend_from_slice(&[0xff, 0xfe]);
        req.extend_from_slice(b"42\r\nAccept: */*\r\n\r\n");
        let pkt = eth_ipv4_tcp(&PacketSpec::default(), &req);
        let out = run(&mut rw, &mut map, &pkt);

        let payload = &out[54..];
        assert!(!payload.windows(6).any(|w| w == b"SECRET"));
        assert!(!payload.windows(2).any(|w| w == [0xff, 0xfe]));
        let text = String::from_utf8_lossy(payload).into_owned();
        assert!(text.contains("Accept: */*\r\n"));
        assert_eq!(rw.stats().http_headers, 1);
        assert!(tcp_checksum_ok(&out));
    }

    #[test]
    fn tls_sni_replaced_in_place() {
        let (mut rw, mut map) = setup();
        let spec = PacketSpec { dst_port: 443, ..PacketSpec::default() };
        let out = run(&mut rw, &mut map, &eth_ipv4_tcp(&spec, &client_hello("api.example.io")));
        let tls = decode(&out, LINKTYPE_ETHERNET).packet.tls().cloned().unwrap();
        assert_eq!(tls.sni[0].name, map.map_domain("api.example.io"));
        assert_ne!(tls.sni[0].name, "api.example.io");
        assert_eq!(rw.stats().tls_sni, 1);
    }

    #[test]
    fn icmp_quote_follows_outer_mapping() {
        let (mut rw, mut map) = setup();
        let spec = PacketSpec { src_ip: Ipv4Addr::new(198, 41, 0, 4), ..PacketSpec::default() };
        let out = run(&mut rw, &mut map, &icmp_unreachable(&spec));
        let decoded = decode(&out, LINKTYPE_ETHERNET).packet;
        let outer = decoded.ipv4().unwrap();
        let quoted = decoded.icmp().unwrap().quoted.clone().unwrap();
        match quoted.addrs {
            QuotedAddrs::V4(src, dst) => {
                assert_eq!(src.addr, outer.dst.addr);
                assert_eq!(dst.addr, outer.src.addr);
            }
            QuotedAddrs::V6(..) => panic!("expected v4 quote"),
        }
        assert_eq!(checksum(&[&out[34..]]), 0, "icmp checksum");
        assert_eq!(checksum(&[&out[42..62]]), 0, "quoted header checksum");
        assert!(rw.stats().icmp_quoted_addresses >= 1);
    }

    #[test]
    fn ipv6_tcp_checksum_recomputed() {
        let (mut rw, mut map) = setup();
        let spec = PacketSpec::default();
        let out = run(&mut rw, &mut map, &eth_ipv6_tcp(&spec, b"hi"));
        assert_eq!(&out[22..26], &[0x20, 0x01, 0x0d, 0xb8]);
        let mut pseudo = out[22..54].to_vec();
        pseudo.extend_from_slice(&((out.len() - 54) as u32).to_be_bytes());
        pseudo.extend_from_slice(&[0, 0, 0, 6]);
        assert_eq!(checksum(&[&pseudo, &out[54..]]), 0);
    }

    #[test]
    fn disabled_kinds_are_left_alone() {
        let mut kinds = SanitizeOptions::default().kinds;
        kinds.remove(&FieldKind::Mac);
        let opts = SanitizeOptions { kinds, ..SanitizeOptions::default() };
        let mut rw = Rewriter::new(&opts).unwrap();
        let mut map = AnonymizationMap::new(true, Some("k"));
        let pkt = eth_ipv4_tcp(&PacketSpec::default(), b"");
        let out = run(&mut rw, &mut map, &pkt);
        assert_eq!(&out[..12], &pkt[..12]);
    }

    #[test]
    fn snapped_payload_keeps_stale_transport_checksum() {
        let (mut rw, mut map) = setup();
        let pkt = eth_ipv4_tcp(&PacketSpec::default(), &[0u8; 200]);
        let snapped = &pkt[..100];
        let out = run(&mut rw, &mut map, snapped);
        assert_eq!(&out[50..52], &snapped[50..52]);
        assert_eq!(checksum(&[&out[14..34]]), 0);
    }
}
