//! De-identify legacy pcap captures and summarize their network faults.
//!
//! Both jobs run in one streaming pass over the capture. Sanitizing copies
//! every record, rewriting sensitive values in place so lengths, offsets and
//! (where the bytes allow) checksums stay valid. Analyzing tracks flows and
//! reports resets, retransmissions, failed handshakes, DNS and HTTP errors
//! and ICMP unreachables. When both run together the report names hosts
//! the way the sanitized capture does.

pub mod anonymize;
pub mod codec;
pub mod config;
pub mod decode;
pub mod error;
pub mod flow;
pub mod report;
pub mod rewrite;
pub mod session;
pub mod tracker;

#[cfg(test)]
mod testutil;

use std::io::{Read, Write};

pub use anonymize::AnonymizationMap;
pub use config::{AnalyzeOptions, ChecksumPolicy, FieldKind, RunConfig, SanitizeOptions};
pub use decode::{decode, DecodedPacket, Layer};
pub use error::{PacketDecodeWarning, Result, TriageError};
pub use report::{AnalysisReport, ErrorEvent, ErrorKind, ExportedReport};
pub use rewrite::SanitizationStats;
pub use session::{RunOutcome, Session};

/// Copy `input` to `output` with sensitive values replaced.
pub fn sanitize<R: Read, W: Write>(input: R, mut output: W, options: &SanitizeOptions) -> Result<(W, SanitizationStats)> {
    let outcome = Session::sanitize(input, &mut output, options)?.run()?;
    Ok((output, outcome.sanitization.unwrap_or_default()))
}

/// Summary and ordered fault events of `input`, in original values.
pub fn analyze<R: Read>(input: R, options: &AnalyzeOptions) -> Result<AnalysisReport> {
    let outcome = Session::analyze(input, options)?.run()?;
    Ok(outcome.analysis.unwrap_or_default())
}

/// Both at once. The report comes back already translated through the
/// sanitizer's replacements.
pub fn sanitize_and_analyze<R: Read, W: Write>(
    input: R,
    mut output: W,
    sanitize: &SanitizeOptions,
    analyze: &AnalyzeOptions,
) -> Result<(W, SanitizationStats, ExportedReport)> {
    let outcome = Session::sanitize_and_analyze(input, &mut output, sanitize, analyze)?.run()?;
    let report = outcome.export().unwrap_or_else(|| AnalysisReport::default().export(None));
    Ok((output, outcome.sanitization.unwrap_or_default(), report))
}
