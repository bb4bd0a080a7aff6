//! Run options. Every field has a default so a JSON options file only needs
//! the keys it changes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MALFORMED_BUDGET: u64 = 100;

/// Kinds of sensitive value the anonymizer knows how to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Ipv4,
    Ipv6,
    Mac,
    Domain,
    Email,
    Token,
}

impl FieldKind {
    pub const ALL: [FieldKind; 6] = [
        FieldKind::Ipv4, FieldKind::Ipv6, FieldKind::Mac,
        FieldKind::Domain, FieldKind::Email, FieldKind::Token,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Ipv4   => "ipv4",
            FieldKind::Ipv6   => "ipv6",
            FieldKind::Mac    => "mac",
            FieldKind::Domain => "domain",
            FieldKind::Email  => "email",
            FieldKind::Token  => "token",
        }
    }
}

/// What happens to checksums covering rewritten bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumPolicy {
    /// Recompute wherever the covered bytes are fully captured.
    #[default]
    Recompute,
    /// Zero every checksum field of a rewritten packet.
    Zero,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SanitizeOptions {
    /// Keep RFC 1918, link-local and ULA addresses as they are.
    pub preserve_private: bool,
    pub kinds:            BTreeSet<FieldKind>,
    pub checksum:         ChecksumPolicy,
    /// Fixed hashing salt for reproducible output; random when absent.
    pub salt:             Option<String>,
    pub max_malformed:    u64,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            preserve_private: true,
            kinds:            FieldKind::ALL.into_iter().collect(),
            checksum:         ChecksumPolicy::default(),
            salt:             None,
            max_malformed:    DEFAULT_MALFORMED_BUDGET,
        }
    }
}

impl SanitizeOptions {
    pub fn enabled(&self, kind: FieldKind) -> bool {
        self.kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzeOptions {
    /// Capture-time seconds without traffic before a flow is evicted.
    pub idle_timeout_secs:  f64,
    /// Segments remembered per flow for duplicate detection.
    pub retransmit_window:  usize,
    /// Length of every top-N list in the summary.
    pub top_n:              usize,
    /// Packets between idle sweeps of the flow table.
    pub sweep_interval:     u64,
    /// Wire length above which a packet counts as large.
    pub large_packet_bytes: u32,
    pub max_malformed:      u64,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            idle_timeout_secs:  120.0,
            retransmit_window:  64,
            top_n:              20,
            sweep_interval:     1024,
            large_packet_bytes: 1400,
            max_malformed:      DEFAULT_MALFORMED_BUDGET,
        }
    }
}

/// Layout of the `--config` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub sanitize: SanitizeOptions,
    pub analyze:  AnalyzeOptions,
}

impl RunConfig {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = RunConfig::from_json("{}").unwrap();
        assert_eq!(cfg, RunConfig::default());
        assert!(cfg.sanitize.enabled(FieldKind::Token));
        assert_eq!(cfg.analyze.max_malformed, 100);
    }

    #[test]
    fn partial_sections_override_only_their_keys() {
        let cfg = RunConfig::from_json(r#"{
            "sanitize": { "kinds": ["ipv4", "mac"], "checksum": "zero", "salt": "s1" },
            "analyze":  { "idle_timeout_secs": 30 }
        }"#).unwrap();
        assert!(cfg.sanitize.enabled(FieldKind::Mac));
        assert!(!cfg.sanitize.enabled(FieldKind::Domain));
        assert_eq!(cfg.sanitize.checksum, ChecksumPolicy::Zero);
        assert!(cfg.sanitize.preserve_private);
        assert_eq!(cfg.analyze.idle_timeout_secs, 30.0);
        assert_eq!(cfg.analyze.top_n, 20);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(RunConfig::from_json(r#"{ "sanitize": { "presrve_private": false } }"#).is_err());
    }
}
