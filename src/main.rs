use anyhow::{Context, Result};
use captriage::{AnalyzeOptions, ExportedReport, RunConfig, SanitizationStats, SanitizeOptions, Session, TriageError};
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Detailed events kept per error kind in errors_detailed.json.
const DETAILED_PER_KIND: usize = 50;

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(author, version, about = "De-identify legacy .pcap captures and report the network faults they contain.")]
struct Args {
    /// JSON file with "sanitize" and/or "analyze" option sections
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write an anonymized copy of a capture
    Sanitize {
        /// Input .pcap file
        #[arg(short, long)]
        input: PathBuf,

        /// Output (sanitized) .pcap file
        #[arg(short, long)]
        output: PathBuf,

        /// Also analyze, writing the anonymized report into this directory
        #[arg(long)]
        analysis_dir: Option<PathBuf>,

        /// Anonymize RFC 1918 / link-local / ULA addresses too
        #[arg(long, default_value_t = false)]
        all_ips: bool,

        /// Fixed salt for reproducible replacements
        #[arg(long)]
        salt: Option<String>,

        /// Print sanitization stats as JSON to stdout
        #[arg(long, default_value_t = false)]
        report: bool,
    },
    /// Summarize flows and faults of a capture
    Analyze {
        /// Input .pcap file
        #[arg(short, long)]
        input: PathBuf,

        /// Directory for summary.json, errors_detailed.json and conversations.json
        #[arg(short, long, default_value = "analysis")]
        output_dir: PathBuf,

        /// Print the summary as JSON to stdout
        #[arg(long, default_value_t = false)]
        report: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    let Some(path) = path else { return Ok(RunConfig::default()) };
    let text = fs::read_to_string(path).with_context(|| format!("Cannot read config {:?}", path))?;
    RunConfig::from_json(&text).with_context(|| format!("Invalid config {:?}", path))
}

// ─── Artifacts ────────────────────────────────────────────────────────────────

fn write_analysis_dir(report: &ExportedReport, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Cannot create {:?}", dir))?;

    let summary_path = dir.join("summary.json");
    fs::write(&summary_path, serde_json::to_string_pretty(&report.summary)?)?;
    info!("  wrote summary → {}", summary_path.display());

    let detailed = report.errors_by_kind(DETAILED_PER_KIND);
    let errors_path = dir.join("errors_detailed.json");
    fs::write(&errors_path, serde_json::to_string_pretty(&detailed)?)?;
    info!("  wrote {} events → {}", report.events.len(), errors_path.display());

    let conversations = serde_json::json!({
        "by_packets": report.summary.top_flows_by_packets,
        "by_bytes":   report.summary.top_flows_by_bytes,
    });
    let conv_path = dir.join("conversations.json");
    fs::write(&conv_path, serde_json::to_string_pretty(&conversations)?)?;
    info!("  wrote conversations → {}", conv_path.display());
    Ok(())
}

fn print_sanitize_summary(stats: &SanitizationStats) {
    println!("=== Sanitization Summary ===");
    println!("Total packets:               {}", stats.total_packets);
    println!("Packets modified:            {}", stats.packets_modified);
    println!("MAC addresses replaced:      {}", stats.mac_addresses);
    println!("ARP fields replaced:         {}", stats.arp_addresses);
    println!("IP addresses replaced:       {}", stats.ip_addresses);
    println!("ICMP quoted addresses:       {}", stats.icmp_quoted_addresses);
    println!("DNS names replaced:          {}", stats.dns_names);
    println!("DNS record addresses:        {}", stats.dns_record_addresses);
    println!("HTTP hosts replaced:         {}", stats.http_hosts);
    println!("HTTP headers replaced:       {}", stats.http_headers);
    println!("TLS SNI replaced:            {}", stats.tls_sni);
    println!("Emails replaced:             {}", stats.emails);
    println!("Payload secrets replaced:    {}", stats.payload_secrets);
    println!("Checksums recomputed:        {}", stats.checksums_recomputed);
    println!("Checksums zeroed:            {}", stats.checksums_zeroed);
    println!("─────────────────────────────────────────");
    println!("Decode warnings:             {}", stats.decode_warnings);
    for (kind, n) in &stats.distinct_values {
        println!("Distinct {:<20} {}", format!("{}:", kind.name()), n);
    }
    if !stats.pools_exhausted.is_empty() {
        let kinds: Vec<&str> = stats.pools_exhausted.iter().map(|k| k.name()).collect();
        println!("Replacement pools exhausted: {}", kinds.join(", "));
    }
}

fn print_analysis_summary(report: &ExportedReport) {
    let s = &report.summary;
    println!("=== Analysis Summary ===");
    println!("Total packets:               {}", s.total_packets);
    println!("Total bytes:                 {}", s.total_bytes);
    println!("Duration (s):                {:.3}", s.duration_secs);
    println!("Flows:                       {}", s.total_flows);
    println!("─────────────────────────────────────────");
    for (kind, n) in &s.error_counts {
        println!("{:<29}{}", format!("{kind}:"), n);
    }
    println!("─────────────────────────────────────────");
    println!("Unanswered DNS queries:      {}", s.info.unanswered_dns_queries);
    println!("Orphaned DNS responses:      {}", s.info.orphaned_dns_responses);
    println!("Unanswered HTTP requests:    {}", s.info.unanswered_http);
    println!("Large packets:               {}", s.info.large_packets);
    println!("Decode warnings:             {}", s.info.decode_warnings);
}

// ─── Commands ─────────────────────────────────────────────────────────────────

/// A truncated capture still yields what the complete records produced.
fn finish_run(result: captriage::Result<captriage::RunOutcome>, input: &Path) -> Result<captriage::RunOutcome> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(TriageError::TruncatedCapture { records, partial: Some(partial) }) => {
            warn!("{:?} is truncated; results cover the first {} records", input, records);
            Ok(*partial)
        }
        Err(e) => Err(e).with_context(|| format!("Cannot process {:?}", input)),
    }
}

fn open_input(path: &Path) -> Result<BufReader<File>> {
    info!("Opening {:?}", path);
    let file = File::open(path).with_context(|| format!("Cannot open {:?}", path))?;
    Ok(BufReader::new(file))
}

fn run_sanitize(
    input: &Path,
    output: &Path,
    analysis_dir: Option<&Path>,
    options: &SanitizeOptions,
    analyze: &AnalyzeOptions,
    report: bool,
) -> Result<()> {
    let reader = open_input(input)?;
    let out_file = File::create(output).with_context(|| format!("Cannot create {:?}", output))?;
    let writer = BufWriter::new(out_file);

    let session = match analysis_dir {
        Some(_) => Session::sanitize_and_analyze(reader, writer, options, analyze),
        None => Session::sanitize(reader, writer, options),
    }
    .with_context(|| format!("Cannot read capture header of {:?}", input))?;
    let outcome = finish_run(session.run(), input)?;
    if !outcome.complete {
        warn!("{:?} is incomplete: it holds only the first {} records", output, outcome.records);
    }

    if let (Some(dir), Some(exported)) = (analysis_dir, outcome.export()) {
        info!("Writing analysis directory → {:?}", dir);
        write_analysis_dir(&exported, dir)?;
    }

    let stats = outcome.sanitization.unwrap_or_default();
    if report {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_sanitize_summary(&stats);
    }
    Ok(())
}

fn run_analyze(input: &Path, output_dir: &Path, options: &AnalyzeOptions, report: bool) -> Result<()> {
    let reader = open_input(input)?;
    let session = Session::analyze(reader, options).with_context(|| format!("Cannot read capture header of {:?}", input))?;
    let outcome = finish_run(session.run(), input)?;
    let exported = outcome.export().unwrap_or_else(|| captriage::AnalysisReport::default().export(None));

    info!("Writing analysis directory → {:?}", output_dir);
    write_analysis_dir(&exported, output_dir)?;
    if report {
        println!("{}", serde_json::to_string_pretty(&exported.summary)?);
    } else {
        print_analysis_summary(&exported);
    }
    Ok(())
}

// ─── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(log_level).with_target(false).with_writer(std::io::stderr).init();

    let config = load_config(args.config.as_deref())?;
    match args.command {
        Command::Sanitize { input, output, analysis_dir, all_ips, salt, report } => {
            let mut options = config.sanitize;
            if all_ips {
                options.preserve_private = false;
            }
            if salt.is_some() {
                options.salt = salt;
            }
            run_sanitize(&input, &output, analysis_dir.as_deref(), &options, &config.analyze, report)
        }
        Command::Analyze { input, output_dir, report } => run_analyze(&input, &output_dir, &config.analyze, report),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
