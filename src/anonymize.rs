//! Per-run replacement of sensitive values.
//!
//! The first sight of a value allocates its replacement from the kind's
//! reserved space; later sights return the same replacement. A replacement
//! never equals its original. Nothing here outlives the run.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::FieldKind;
use crate::decode::fmt_mac;

/// Documentation networks handed out in order: TEST-NET-1, -2, -3.
const IPV4_POOL: [[u8; 3]; 3] = [[192, 0, 2], [198, 51, 100], [203, 0, 113]];
const IPV4_HOSTS_PER_NET: u32 = 254;
/// Benchmarking network 198.18.0.0/15.
const IPV4_OVERFLOW_BASE: u32 = 0xc612_0000;
const IPV4_OVERFLOW_SIZE: u32 = 1 << 17;

/// 2001:db8::/32
const IPV6_POOL_PREFIX: u128 = 0x2001_0db8_u128 << 96;

const MAC_POOL_SIZE: usize = 1 << 24;
const MAX_ATTEMPTS:  u32 = 64;

// ─── Classification ───────────────────────────────────────────────────────────

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_link_local()
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

fn ipv4_passes(ip: Ipv4Addr, preserve_private: bool) -> bool {
    ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() || ip.is_loopback()
        || (preserve_private && is_private_ipv4(ip))
}

fn ipv6_passes(ip: Ipv6Addr, preserve_private: bool) -> bool {
    ip.is_unspecified() || ip.is_loopback() || ip.is_multicast()
        || (preserve_private && is_private_ipv6(ip))
}

fn mac_passes(mac: [u8; 6]) -> bool {
    mac == [0; 6] || mac[0] & 0x01 != 0
}

// ─── Map ──────────────────────────────────────────────────────────────────────

pub struct AnonymizationMap {
    salt:             Vec<u8>,
    preserve_private: bool,

    ipv4:       HashMap<Ipv4Addr, Ipv4Addr>,
    ipv4_used:  HashSet<Ipv4Addr>,
    ipv4_next:  u32,
    ipv6:       HashMap<Ipv6Addr, Ipv6Addr>,
    ipv6_next:  u128,
    mac:        HashMap<[u8; 6], [u8; 6]>,
    mac_used:   HashSet<[u8; 6]>,

    /// Lower-cased suffix ("example.com") to the replacement of its first label.
    labels:        HashMap<String, String>,
    suffixes_used: HashSet<String>,
    domains:       HashMap<String, String>,
    emails:        HashMap<String, String>,
    tokens:        HashMap<Vec<u8>, String>,

    exhausted: BTreeSet<FieldKind>,
}

impl AnonymizationMap {
    /// `salt` fixes the hash derivations; a random one is drawn otherwise.
    pub fn new(preserve_private: bool, salt: Option<&str>) -> Self {
        let salt = match salt {
            Some(s) => s.as_bytes().to_vec(),
            None => rand::random::<[u8; 16]>().to_vec(),
        };
        Self {
            salt,
            preserve_private,
            ipv4: HashMap::new(),
            ipv4_used: HashSet::new(),
            ipv4_next: 0,
            ipv6: HashMap::new(),
            ipv6_next: 1,
            mac: HashMap::new(),
            mac_used: HashSet::new(),
            labels: HashMap::new(),
            suffixes_used: HashSet::new(),
            domains: HashMap::new(),
            emails: HashMap::new(),
            tokens: HashMap::new(),
            exhausted: BTreeSet::new(),
        }
    }

    fn digest(&self, kind: FieldKind, input: &[u8], attempt: u32, block: u32) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.salt);
        hasher.update(kind.name().as_bytes());
        hasher.update([0u8]);
        hasher.update(input);
        hasher.update(attempt.to_be_bytes());
        hasher.update(block.to_be_bytes());
        hasher.finalize().into()
    }

    /// Lower-case hex of exactly `len` characters.
    fn hex_of_len(&self, kind: FieldKind, input: &[u8], attempt: u32, len: usize) -> String {
        let mut out = String::with_capacity(len + 64);
        let mut block = 0;
        while out.len() < len {
            out.push_str(&hex::encode(self.digest(kind, input, attempt, block)));
            block += 1;
        }
        out.truncate(len);
        out
    }

    fn note_exhausted(&mut self, kind: FieldKind) {
        if self.exhausted.insert(kind) {
            warn!(kind = kind.name(), "anonymization pool exhausted, falling back to overflow derivation");
        }
    }

    /// Kinds whose primary pool ran out during this run.
    pub fn exhausted_kinds(&self) -> impl Iterator<Item = FieldKind> + '_ {
        self.exhausted.iter().copied()
    }

    /// Distinct originals replaced so far.
    pub fn distinct(&self, kind: FieldKind) -> usize {
        match kind {
            FieldKind::Ipv4   => self.ipv4.len(),
            FieldKind::Ipv6   => self.ipv6.len(),
            FieldKind::Mac    => self.mac.len(),
            FieldKind::Domain => self.domains.len(),
            FieldKind::Email  => self.emails.len(),
            FieldKind::Token  => self.tokens.len(),
        }
    }

    // ─── Addresses ────────────────────────────────────────────────────────────

    pub fn map_ipv4(&mut self, ip: Ipv4Addr) -> Ipv4Addr {
        if ipv4_passes(ip, self.preserve_private) {
            return ip;
        }
        if let Some(&mapped) = self.ipv4.get(&ip) {
            return mapped;
        }
        let mapped = self.allocate_ipv4(ip);
        self.ipv4_used.insert(mapped);
        self.ipv4.insert(ip, mapped);
        mapped
    }

    fn allocate_ipv4(&mut self, original: Ipv4Addr) -> Ipv4Addr {
        let pool_size = IPV4_POOL.len() as u32 * IPV4_HOSTS_PER_NET;
        while self.ipv4_next < pool_size {
            let net = IPV4_POOL[(self.ipv4_next / IPV4_HOSTS_PER_NET) as usize];
            let host = (self.ipv4_next % IPV4_HOSTS_PER_NET + 1) as u8;
            self.ipv4_next += 1;
            let candidate = Ipv4Addr::new(net[0], net[1], net[2], host);
            if candidate != original && !self.ipv4_used.contains(&candidate) {
                return candidate;
            }
        }

        self.note_exhausted(FieldKind::Ipv4);
        let seed = self.digest(FieldKind::Ipv4, &original.octets(), 0, 0);
        let start = u32::from_be_bytes([seed[0], seed[1], seed[2], seed[3]]) % IPV4_OVERFLOW_SIZE;
        let mut fallback = None;
        for step in 0..IPV4_OVERFLOW_SIZE {
            let candidate = Ipv4Addr::from(IPV4_OVERFLOW_BASE + (start + step) % IPV4_OVERFLOW_SIZE);
            if candidate == original {
                continue;
            }
            if !self.ipv4_used.contains(&candidate) {
                return candidate;
            }
            fallback.get_or_insert(candidate);
        }
        // Both spaces full: reuse is tolerated.
        fallback.unwrap_or(Ipv4Addr::from(IPV4_OVERFLOW_BASE))
    }

    pub fn map_ipv6(&mut self, ip: Ipv6Addr) -> Ipv6Addr {
        if let Some(v4) = ip.to_ipv4_mapped() {
            return self.map_ipv4(v4).to_ipv6_mapped();
        }
        if ipv6_passes(ip, self.preserve_private) {
            return ip;
        }
        if let Some(&mapped) = self.ipv6.get(&ip) {
            return mapped;
        }
        let mut mapped = Ipv6Addr::from(IPV6_POOL_PREFIX | self.ipv6_next);
        self.ipv6_next += 1;
        if mapped == ip {
            mapped = Ipv6Addr::from(IPV6_POOL_PREFIX | self.ipv6_next);
            self.ipv6_next += 1;
        }
        self.ipv6.insert(ip, mapped);
        mapped
    }

    pub fn map_ip(&mut self, ip: IpAddr) -> IpAddr {
        match ip {
            IpAddr::V4(v4) => IpAddr::V4(self.map_ipv4(v4)),
            IpAddr::V6(v6) => IpAddr::V6(self.map_ipv6(v6)),
        }
    }

    pub fn map_mac(&mut self, mac: [u8; 6]) -> [u8; 6] {
        if mac_passes(mac) {
            return mac;
        }
        if let Some(&mapped) = self.mac.get(&mac) {
            return mapped;
        }
        let mapped = self.allocate_mac(mac);
        self.mac_used.insert(mapped);
        self.mac.insert(mac, mapped);
        mapped
    }

    /// Locally administered 02:00:00 space first, then the wider 06: space.
    /// Each space gets a bounded number of probes.
    fn allocate_mac(&mut self, original: [u8; 6]) -> [u8; 6] {
        if self.mac_used.len() < MAC_POOL_SIZE {
            for attempt in 0..MAX_ATTEMPTS {
                let h = self.digest(FieldKind::Mac, &original, attempt, 0);
                let candidate = [0x02, 0x00, 0x00, h[0], h[1], h[2]];
                if candidate != original && !self.mac_used.contains(&candidate) {
                    return candidate;
                }
            }
        }

        self.note_exhausted(FieldKind::Mac);
        let mut fallback = None;
        for attempt in 0..MAX_ATTEMPTS {
            let h = self.digest(FieldKind::Mac, &original, attempt, 1);
            let candidate = [0x06, h[0], h[1], h[2], h[3], h[4]];
            if candidate == original {
                continue;
            }
            if !self.mac_used.contains(&candidate) {
                return candidate;
            }
            fallback.get_or_insert(candidate);
        }
        // Reuse is tolerated once both spaces are crowded.
        fallback.unwrap_or([0x06, 0, 0, 0, 0, 1])
    }

    // ─── Names ────────────────────────────────────────────────────────────────

    /// Same label count and label lengths; the top-level label of a
    /// multi-label name is kept. A trailing root dot is preserved.
    pub fn map_domain(&mut self, name: &str) -> String {
        let (body, root) = match name.strip_suffix('.') {
            Some(body) => (body, "."),
            None => (name, ""),
        };
        if body.is_empty() {
            return name.to_string();
        }
        let labels: Vec<&str> = body.split('.').collect();
        let mut out = self.map_labels(&labels).join(".");
        out.push_str(root);
        out
    }

    /// Replace each label by one of the same byte length derived from the
    /// whole suffix it starts, so names sharing a suffix share its replacement.
    pub fn map_labels(&mut self, labels: &[&str]) -> Vec<String> {
        let n = labels.len();
        if n == 0 {
            return Vec::new();
        }
        let keep = usize::from(n > 1);
        let mut out: Vec<String> = vec![String::new(); n];
        let mut parent = String::new();
        if keep == 1 {
            out[n - 1] = labels[n - 1].to_string();
            parent = labels[n - 1].to_ascii_lowercase();
        }
        for i in (0..n - keep).rev() {
            let key = labels[i..].join(".").to_ascii_lowercase();
            let label = self.label_for(&key, &labels[i].to_ascii_lowercase(), &parent);
            parent = if parent.is_empty() { label.clone() } else { format!("{label}.{parent}") };
            out[i] = label;
        }
        self.domains.insert(labels.join(".").to_ascii_lowercase(), out.join("."));
        out
    }

    fn label_for(&mut self, suffix_key: &str, original: &str, parent: &str) -> String {
        if let Some(label) = self.labels.get(suffix_key) {
            return label.clone();
        }
        if original.is_empty() {
            return String::new();
        }
        let len = original.len();
        let joined = |label: &str| if parent.is_empty() { label.to_string() } else { format!("{label}.{parent}") };

        let mut chosen = None;
        let mut fallback = None;
        for attempt in 0..MAX_ATTEMPTS {
            let candidate = self.derive_label(suffix_key, attempt, len);
            if candidate == original {
                continue;
            }
            if !self.suffixes_used.contains(&joined(&candidate)) {
                chosen = Some(candidate);
                break;
            }
            fallback.get_or_insert(candidate);
        }
        let label = match chosen {
            Some(label) => label,
            None => {
                self.note_exhausted(FieldKind::Domain);
                fallback.unwrap_or_else(|| "x".repeat(len))
            }
        };
        self.suffixes_used.insert(joined(&label));
        self.labels.insert(suffix_key.to_string(), label.clone());
        label
    }

    fn derive_label(&self, suffix_key: &str, attempt: u32, len: usize) -> String {
        match len {
            0 => String::new(),
            1 => self.hex_of_len(FieldKind::Domain, suffix_key.as_bytes(), attempt, 1),
            _ => format!("x{}", self.hex_of_len(FieldKind::Domain, suffix_key.as_bytes(), attempt, len - 1)),
        }
    }

    /// Local part replaced by hex of the same length, domain through
    /// [`map_domain`](Self::map_domain).
    pub fn map_email(&mut self, addr: &str) -> String {
        let key = addr.to_ascii_lowercase();
        if let Some(mapped) = self.emails.get(&key) {
            return mapped.clone();
        }
        let mapped = match addr.rsplit_once('@') {
            Some((local, domain)) => {
                let local_key = local.to_ascii_lowercase();
                let mut attempt = 0;
                let new_local = loop {
                    let candidate = self.hex_of_len(FieldKind::Email, local_key.as_bytes(), attempt, local.len());
                    attempt += 1;
                    if candidate != local_key || local.is_empty() {
                        break candidate;
                    }
                };
                format!("{new_local}@{}", self.map_domain(domain))
            }
            None => self.map_token(addr),
        };
        self.emails.insert(key, mapped.clone());
        mapped
    }

    /// Hex of the same length.
    pub fn map_token(&mut self, value: &str) -> String {
        self.map_token_bytes(value.as_bytes())
    }

    /// Hex of the same byte length, for values that need not be UTF-8.
    pub fn map_token_bytes(&mut self, raw: &[u8]) -> String {
        if let Some(mapped) = self.tokens.get(raw) {
            return mapped.clone();
        }
        let mut attempt = 0;
        let mapped = loop {
            let candidate = self.hex_of_len(FieldKind::Token, raw, attempt, raw.len());
            attempt += 1;
            if candidate.as_bytes() != raw || raw.is_empty() {
                break candidate;
            }
        };
        self.tokens.insert(raw.to_vec(), mapped.clone());
        mapped
    }

    /// String form of every mapping. Unparseable addresses are treated as
    /// tokens so they never pass through.
    pub fn resolve(&mut self, kind: FieldKind, original: &str) -> String {
        match kind {
            FieldKind::Ipv4 => match original.parse::<Ipv4Addr>() {
                Ok(ip) => self.map_ipv4(ip).to_string(),
                Err(_) => self.map_token(original),
            },
            FieldKind::Ipv6 => match original.parse::<Ipv6Addr>() {
                Ok(ip) => self.map_ipv6(ip).to_string(),
                Err(_) => self.map_token(original),
            },
            FieldKind::Mac => match parse_mac(original) {
                Some(mac) => fmt_mac(&self.map_mac(mac)),
                None => self.map_token(original),
            },
            FieldKind::Domain => self.map_domain(original),
            FieldKind::Email  => self.map_email(original),
            FieldKind::Token  => self.map_token(original),
        }
    }

    // ─── Read-only lookups ────────────────────────────────────────────────────

    /// The replacement already allocated, or the address itself when it was
    /// never replaced (pass-through or kind disabled).
    pub fn lookup_ip(&self, ip: IpAddr) -> IpAddr {
        match ip {
            IpAddr::V4(v4) => IpAddr::V4(self.ipv4.get(&v4).copied().unwrap_or(v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V6(self.ipv4.get(&v4).copied().unwrap_or(v4).to_ipv6_mapped()),
                None => IpAddr::V6(self.ipv6.get(&v6).copied().unwrap_or(v6)),
            },
        }
    }

    pub fn lookup_domain(&self, name: &str) -> Option<&str> {
        let key = name.trim_end_matches('.').to_ascii_lowercase();
        self.domains.get(&key).map(String::as_str)
    }
}

// Originals must not end up in logs through `{:?}`.
impl fmt::Debug for AnonymizationMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonymizationMap")
            .field("ipv4", &self.ipv4.len())
            .field("ipv6", &self.ipv6.len())
            .field("mac", &self.mac.len())
            .field("domains", &self.domains.len())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = text.split(&[':', '-'][..]);
    for byte in out.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> AnonymizationMap {
        AnonymizationMap::new(true, Some("test-salt"))
    }

    fn in_documentation_range(ip: Ipv4Addr) -> bool {
        let o = ip.octets();
        IPV4_POOL.iter().any(|net| o[..3] == net[..])
    }

    #[test]
    fn public_ipv4_lands_in_documentation_ranges() {
        let mut m = map();
        let a = m.map_ipv4(Ipv4Addr::new(8, 8, 8, 8));
        let b = m.map_ipv4(Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(a, Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(b, Ipv4Addr::new(192, 0, 2, 2));
        assert_eq!(m.map_ipv4(Ipv4Addr::new(8, 8, 8, 8)), a);
        assert!(in_documentation_range(a) && in_documentation_range(b));
    }

    #[test]
    fn special_and_private_addresses_pass_through() {
        let mut m = map();
        for ip in ["0.0.0.0", "255.255.255.255", "224.0.0.251", "127.0.0.1", "10.1.2.3", "169.254.1.1"] {
            let ip: Ipv4Addr = ip.parse().unwrap();
            assert_eq!(m.map_ipv4(ip), ip);
        }
        let mut strict = AnonymizationMap::new(false, Some("s"));
        assert_ne!(strict.map_ipv4(Ipv4Addr::new(192, 168, 1, 10)), Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(strict.map_ipv4(Ipv4Addr::new(127, 0, 0, 1)), Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn documentation_address_never_maps_to_itself() {
        let mut m = map();
        let ip = Ipv4Addr::new(192, 0, 2, 1);
        let mapped = m.map_ipv4(ip);
        assert_ne!(mapped, ip);
        assert_eq!(mapped, Ipv4Addr::new(192, 0, 2, 2));
        // the skipped slot stays free for the next address
        assert_eq!(m.map_ipv4(Ipv4Addr::new(9, 9, 9, 9)), Ipv4Addr::new(192, 0, 2, 3));
    }

    #[test]
    fn pool_exhaustion_overflows_without_failing() {
        let mut m = map();
        let mut seen = HashSet::new();
        for i in 0..800u32 {
            let mapped = m.map_ipv4(Ipv4Addr::from(0x0b00_0000 + i));
            assert!(seen.insert(mapped), "duplicate replacement {mapped}");
        }
        assert_eq!(m.exhausted_kinds().collect::<Vec<_>>(), [FieldKind::Ipv4]);
        let o = m.map_ipv4(Ipv4Addr::from(0x0b00_0000 + 799)).octets();
        assert!(o[0] == 198 && (o[1] == 18 || o[1] == 19), "overflow outside 198.18.0.0/15");
    }

    #[test]
    fn ipv6_uses_documentation_prefix() {
        let mut m = map();
        let ip: Ipv6Addr = "2606:4700::1111".parse().unwrap();
        let mapped = m.map_ipv6(ip);
        assert_eq!(mapped.segments()[..2], [0x2001, 0x0db8]);
        assert_eq!(m.map_ipv6(ip), mapped);
        let ll: Ipv6Addr = "fe80::1".parse().unwrap();
        assert_eq!(m.map_ipv6(ll), ll);
        assert_eq!(m.map_ipv6(Ipv6Addr::LOCALHOST), Ipv6Addr::LOCALHOST);
    }

    #[test]
    fn mac_is_locally_administered_and_stable() {
        let mut m = map();
        let mac = [0x3c, 0x22, 0xfb, 0x01, 0x02, 0x03];
        let mapped = m.map_mac(mac);
        assert_eq!(mapped[..3], [0x02, 0x00, 0x00]);
        assert_eq!(m.map_mac(mac), mapped);
        assert_eq!(m.map_mac([0xff; 6]), [0xff; 6]);
        assert_eq!(m.map_mac([0x01, 0x00, 0x5e, 0, 0, 1]), [0x01, 0x00, 0x5e, 0, 0, 1]);
    }

    #[test]
    fn crowded_mac_space_falls_back_to_wider_pool() {
        let mut m = map();
        let mac = [0x3c, 0x22, 0xfb, 0x0a, 0x0b, 0x0c];
        for attempt in 0..MAX_ATTEMPTS {
            let h = m.digest(FieldKind::Mac, &mac, attempt, 0);
            m.mac_used.insert([0x02, 0x00, 0x00, h[0], h[1], h[2]]);
        }
        let mapped = m.map_mac(mac);
        assert_eq!(mapped[0], 0x06);
        assert_eq!(m.map_mac(mac), mapped);
        assert_eq!(m.exhausted_kinds().collect::<Vec<_>>(), vec![FieldKind::Mac]);
    }

    #[test]
    fn non_utf8_token_maps_to_hex_of_same_length() {
        let mut m = map();
        let raw = b"session=SECRET\xff\xfe42";
        let mapped = m.map_token_bytes(raw);
        assert_eq!(mapped.len(), raw.len());
        assert!(mapped.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(m.map_token_bytes(raw), mapped);
        assert_eq!(m.map_token("abc"), m.map_token_bytes(b"abc"));
    }

    #[test]
    fn domain_keeps_shape_and_shares_suffixes() {
        let mut m = map();
        let full = m.map_domain("www.example.com");
        let parent = m.map_domain("example.com");
        assert_eq!(full.len(), "www.example.com".len());
        assert!(full.ends_with(".com"));
        assert!(full.ends_with(&parent));
        assert_ne!(full, "www.example.com");
        let shouted = m.map_domain("WWW.Example.COM");
        assert!(shouted.ends_with(".COM"));
        assert_eq!(shouted.to_ascii_lowercase(), full);
        assert_eq!(m.map_domain("example.com."), format!("{parent}."));
        let single = m.map_domain("printer");
        assert_eq!(single.len(), 7);
        assert_ne!(single, "printer");
    }

    #[test]
    fn sibling_short_labels_do_not_collide() {
        let mut m = map();
        let names: Vec<String> = (b'a'..=b'l').map(|c| format!("{}.example.org", c as char)).collect();
        let mapped: HashSet<String> = names.iter().map(|n| m.map_domain(n)).collect();
        assert_eq!(mapped.len(), names.len());
    }

    #[test]
    fn email_and_token_keep_length() {
        let mut m = map();
        let email = m.map_email("alice.smith@corp.example.com");
        assert_eq!(email.len(), "alice.smith@corp.example.com".len());
        assert!(email.ends_with(".com"));
        assert!(email.contains('@'));
        let token = m.map_token("abc123SECRET");
        assert_eq!(token.len(), 12);
        assert_ne!(token, "abc123SECRET");
        let long = "k".repeat(300);
        assert_eq!(m.map_token(&long).len(), 300);
    }

    #[test]
    fn resolve_is_deterministic_per_kind() {
        let mut m = map();
        let a = m.resolve(FieldKind::Ipv4, "93.184.216.34");
        assert_eq!(m.resolve(FieldKind::Ipv4, "93.184.216.34"), a);
        assert_eq!(m.resolve(FieldKind::Mac, "3c:22:fb:01:02:03"), fmt_mac(&m.map_mac([0x3c, 0x22, 0xfb, 1, 2, 3])));
        assert_ne!(m.resolve(FieldKind::Ipv4, "not-an-ip"), "not-an-ip");
        assert_eq!(m.lookup_ip("93.184.216.34".parse().unwrap()).to_string(), a);
    }

    #[test]
    fn salt_changes_hash_derivations() {
        let mut a = AnonymizationMap::new(true, Some("one"));
        let mut b = AnonymizationMap::new(true, Some("two"));
        assert_ne!(a.map_domain("example.com"), b.map_domain("example.com"));
        let mut c = AnonymizationMap::new(true, Some("one"));
        assert_eq!(a.map_domain("example.com"), c.map_domain("example.com"));
    }

    #[test]
    fn remapping_a_replacement_changes_it() {
        let mut first = map();
        let mut second = AnonymizationMap::new(true, Some("test-salt"));
        let ip = first.map_ipv4(Ipv4Addr::new(8, 8, 4, 4));
        assert_ne!(second.map_ipv4(ip), ip);
        let name = first.map_domain("mail.example.net");
        assert_ne!(second.map_domain(&name), name);
    }
}
