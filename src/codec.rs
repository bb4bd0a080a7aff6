//! Legacy pcap container: streaming reader and byte-faithful writer.
//!
//! Only one record is held in memory at a time; the reader buffer is fixed
//! at [`READ_BUFFER`] bytes, which bounds the largest record accepted.

use std::cell::Cell;
use std::io::{Chain, Cursor, ErrorKind, Read, Write};
use std::rc::Rc;

use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{parse_pcap_header, LegacyPcapReader, PcapBlockOwned, PcapError, PcapHeader};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, TriageError};

/// Large enough for a record at the maximum libpcap snapshot length (262144).
pub const READ_BUFFER: usize = 1 << 20;

const MAGIC_MICRO: u32 = 0xa1b2_c3d4;
const MAGIC_NANO:  u32 = 0xa1b2_3c4d;

// ─── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder { Little, Big }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TsResolution { Micro, Nano }

impl TsResolution {
    pub fn units_per_sec(self) -> u32 {
        match self { TsResolution::Micro => 1_000_000, TsResolution::Nano => 1_000_000_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone:      i32,
    pub sigfigs:       u32,
    pub snaplen:       u32,
    pub link_type:     u32,
    pub byte_order:    ByteOrder,
    pub resolution:    TsResolution,
}

impl CaptureHeader {
    /// Ethernet, microsecond, little-endian: what most writers emit.
    pub fn ethernet(snaplen: u32) -> Self {
        Self {
            version_major: 2, version_minor: 4, thiszone: 0, sigfigs: 0, snaplen,
            link_type: crate::decode::LINKTYPE_ETHERNET,
            byte_order: ByteOrder::Little, resolution: TsResolution::Micro,
        }
    }

    fn from_pcap(hdr: &PcapHeader) -> Result<Self> {
        let resolution = match hdr.magic_number {
            MAGIC_MICRO => TsResolution::Micro,
            MAGIC_NANO  => TsResolution::Nano,
            m if m == MAGIC_MICRO.swap_bytes() => TsResolution::Micro,
            m if m == MAGIC_NANO.swap_bytes()  => TsResolution::Nano,
            m => return Err(TriageError::Format(format!("unknown magic {m:#010x}"))),
        };
        let byte_order = if hdr.is_bigendian() { ByteOrder::Big } else { ByteOrder::Little };
        if hdr.version_major != 2 {
            return Err(TriageError::Format(format!(
                "unsupported pcap version {}.{}", hdr.version_major, hdr.version_minor)));
        }
        Ok(Self {
            version_major: hdr.version_major,
            version_minor: hdr.version_minor,
            thiszone:      hdr.thiszone,
            sigfigs:       hdr.sigfigs,
            snaplen:       hdr.snaplen,
            link_type:     hdr.network.0 as u32,
            byte_order,
            resolution,
        })
    }

    fn magic(&self) -> u32 {
        match self.resolution { TsResolution::Micro => MAGIC_MICRO, TsResolution::Nano => MAGIC_NANO }
    }

    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        let e = Endian(self.byte_order);
        out[0..4].copy_from_slice(&e.u32(self.magic()));
        out[4..6].copy_from_slice(&e.u16(self.version_major));
        out[6..8].copy_from_slice(&e.u16(self.version_minor));
        out[8..12].copy_from_slice(&e.u32(self.thiszone as u32));
        out[12..16].copy_from_slice(&e.u32(self.sigfigs));
        out[16..20].copy_from_slice(&e.u32(self.snaplen));
        out[20..24].copy_from_slice(&e.u32(self.link_type));
        out
    }
}

#[derive(Clone, Copy)]
struct Endian(ByteOrder);

impl Endian {
    fn u32(self, v: u32) -> [u8; 4] {
        match self.0 { ByteOrder::Little => v.to_le_bytes(), ByteOrder::Big => v.to_be_bytes() }
    }
    fn u16(self, v: u16) -> [u8; 2] {
        match self.0 { ByteOrder::Little => v.to_le_bytes(), ByteOrder::Big => v.to_be_bytes() }
    }
}

// ─── Record ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    /// 0-based position in the input.
    pub index:    u64,
    pub ts_sec:   u32,
    /// Sub-second part in the header's resolution.
    pub ts_frac:  u32,
    pub orig_len: u32,
    pub data:     Vec<u8>,
}

impl PacketRecord {
    pub fn caplen(&self) -> u32 { self.data.len() as u32 }

    /// Captured fewer bytes than were on the wire.
    pub fn is_snapped(&self) -> bool { self.caplen() < self.orig_len }

    pub fn timestamp(&self, resolution: TsResolution) -> f64 {
        self.ts_sec as f64 + self.ts_frac as f64 / resolution.units_per_sec() as f64
    }
}

// ─── Reader ───────────────────────────────────────────────────────────────────

/// Counts bytes pulled from the source so a refill that brings nothing new
/// can be told apart from one that made progress.
struct CountingReader<R> {
    inner: R,
    total: Rc<Cell<u64>>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.total.set(self.total.get() + n as u64);
        Ok(n)
    }
}

enum Block {
    Header,
    Record { ts_sec: u32, ts_frac: u32, orig_len: u32, data: Vec<u8> },
    Skipped,
}

enum Step {
    Ready(usize, Block),
    NeedMore,
    End,
    Truncated,
    Corrupt(String),
}

type Source<R> = CountingReader<Chain<Cursor<[u8; 24]>, R>>;

pub struct CaptureReader<R: Read> {
    inner:       LegacyPcapReader<Source<R>>,
    header:      CaptureHeader,
    bytes_read:  Rc<Cell<u64>>,
    header_seen: bool,
    records:     u64,
}

impl<R: Read> CaptureReader<R> {
    /// Validates the global header. Nothing past it is read yet.
    pub fn open(mut source: R) -> Result<Self> {
        let mut head = [0u8; 24];
        let mut filled = 0;
        while filled < head.len() {
            match source.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => return Err(TriageError::EmptyCapture),
            n if n < head.len() => return Err(TriageError::TruncatedCapture { records: 0, partial: None }),
            _ => {}
        }
        let header = match parse_pcap_header(&head) {
            Ok((_, hdr)) => CaptureHeader::from_pcap(&hdr)?,
            Err(_) => return Err(TriageError::Format("not a legacy pcap file (bad magic)".into())),
        };
        debug!(?header, "capture header accepted");

        let bytes_read = Rc::new(Cell::new(0));
        let counting = CountingReader { inner: Cursor::new(head).chain(source), total: Rc::clone(&bytes_read) };
        let inner = LegacyPcapReader::new(READ_BUFFER, counting)
            .map_err(|e| TriageError::Format(format!("{e:?}")))?;
        Ok(Self { inner, header, bytes_read, header_seen: false, records: 0 })
    }

    pub fn header(&self) -> &CaptureHeader { &self.header }

    /// Records returned so far.
    pub fn records_read(&self) -> u64 { self.records }

    pub fn next_record(&mut self) -> Result<Option<PacketRecord>> {
        loop {
            match self.pull()? {
                Some(Block::Record { ts_sec, ts_frac, orig_len, data }) => {
                    let record = PacketRecord { index: self.records, ts_sec, ts_frac, orig_len, data };
                    self.records += 1;
                    return Ok(Some(record));
                }
                Some(Block::Header) if !self.header_seen => self.header_seen = true,
                Some(Block::Header) => {
                    return Err(TriageError::Format("second global header inside capture".into()))
                }
                Some(Block::Skipped) => warn!("pcapng block encountered – only legacy pcap supported"),
                None => return Ok(None),
            }
        }
    }

    fn pull(&mut self) -> Result<Option<Block>> {
        let mut stalled = false;
        loop {
            let step = match self.inner.next() {
                Ok((offset, block)) => {
                    let owned = match block {
                        PcapBlockOwned::LegacyHeader(_) => Block::Header,
                        PcapBlockOwned::Legacy(pkt) => Block::Record {
                            ts_sec:   pkt.ts_sec,
                            ts_frac:  pkt.ts_usec,
                            orig_len: pkt.origlen,
                            data:     pkt.data.to_vec(),
                        },
                        PcapBlockOwned::NG(_) => Block::Skipped,
                    };
                    Step::Ready(offset, owned)
                }
                Err(PcapError::Eof) => Step::End,
                Err(PcapError::Incomplete(_)) => Step::NeedMore,
                Err(PcapError::UnexpectedEof) => Step::Truncated,
                Err(e) => Step::Corrupt(format!("{e:?}")),
            };

            match step {
                Step::Ready(offset, block) => {
                    self.inner.consume(offset);
                    return Ok(Some(block));
                }
                Step::End => return Ok(None),
                Step::Truncated => {
                    return Err(TriageError::TruncatedCapture { records: self.records, partial: None })
                }
                Step::Corrupt(msg) => return Err(TriageError::Format(msg)),
                Step::NeedMore => {
                    let before = self.bytes_read.get();
                    self.inner.refill().map_err(|e| TriageError::Format(format!("refill error: {e:?}")))?;
                    if self.bytes_read.get() == before {
                        // One more look lets the parser report a clean end;
                        // a second stall means a partial record is stranded.
                        if stalled {
                            return Err(TriageError::TruncatedCapture { records: self.records, partial: None });
                        }
                        stalled = true;
                    } else {
                        stalled = false;
                    }
                }
            }
        }
    }
}

// ─── Writer ───────────────────────────────────────────────────────────────────

pub struct CaptureWriter<W: Write> {
    out:     W,
    header:  CaptureHeader,
    records: u64,
}

impl<W: Write> CaptureWriter<W> {
    pub fn open(mut out: W, header: &CaptureHeader) -> Result<Self> {
        out.write_all(&header.to_bytes())?;
        Ok(Self { out, header: header.clone(), records: 0 })
    }

    pub fn write_record(&mut self, record: &PacketRecord) -> Result<()> {
        let e = Endian(self.header.byte_order);
        let mut hdr = [0u8; 16];
        hdr[0..4].copy_from_slice(&e.u32(record.ts_sec));
        hdr[4..8].copy_from_slice(&e.u32(record.ts_frac));
        hdr[8..12].copy_from_slice(&e.u32(record.caplen()));
        hdr[12..16].copy_from_slice(&e.u32(record.orig_len));
        self.out.write_all(&hdr)?;
        self.out.write_all(&record.data)?;
        self.records += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 { self.records }

    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
