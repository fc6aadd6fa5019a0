//! Minimal zip writer for human-readable save archives.
//!
//! An archive holds `save.json` followed by one raw payload file per externalized array. Every
//! entry is raw-deflated through a bounded buffer, so the whole state never has to be resident
//! in memory. CRC and sizes are only known once an entry's body is written; they are backpatched
//! into the local header.

use std::io::{Seek, Write};

use crc32fast::Hasher;
use flate2::{Compress, Compression, FlushCompress, Status};
use time::OffsetDateTime;

use crate::error::{Result, SaveError};
use crate::io::{ScopedPatch, WriteLeExt};
use crate::item::{ItemKind, RegisteredItem, Resolved};
use crate::json::ExternalFiles;
use crate::memory::StateMemory;

pub const JSON_ENTRY_NAME: &str = "save.json";

pub(crate) const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub(crate) const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub(crate) const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;
pub(crate) const METHOD_DEFLATE: u16 = 8;

const VERSION_NEEDED: u16 = 0x14;
const VERSION_MADE_BY: u16 = 0x1e;
/// General purpose bits: maximum compression.
const FLAGS: u16 = 0x02;
/// Offset of the CRC/size triple inside a local header.
const LOCAL_SUMS_OFFSET: u64 = 14;

const STREAM_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveOptions {
    /// Modification time stamped on every entry; `None` uses the current time.
    pub timestamp: Option<OffsetDateTime>,
}

#[derive(Debug)]
struct DataFile<'a> {
    name: String,
    item: &'a RegisteredItem,
    /// Address of the array storage, with the item's own offset already applied.
    base: u64,
}

/// Collects the external payloads referenced by a JSON export and writes the final archive.
#[derive(Debug, Default)]
pub struct ArchiveWriter<'a> {
    options: ArchiveOptions,
    files: Vec<DataFile<'a>>,
}

impl<'a> ArchiveWriter<'a> {
    pub fn new(options: ArchiveOptions) -> Self {
        Self {
            options,
            files: Vec::new(),
        }
    }

    pub fn data_file_names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.name.as_str())
    }

    /// Writes `json` and every registered payload as a complete archive at the current position
    /// of `w`. Entry offsets are relative to that position.
    pub fn commit<M, W>(&self, json: &str, mem: &M, w: &mut W) -> Result<()>
    where
        M: StateMemory + ?Sized,
        W: Write + Seek,
    {
        let archive_start = w.stream_position()?;
        let dos = DosTimestamp::from(
            self.options
                .timestamp
                .unwrap_or_else(OffsetDateTime::now_utc),
        );

        let mut entries = Vec::with_capacity(1 + self.files.len());
        entries.push(write_entry(w, archive_start, JSON_ENTRY_NAME, dos, |out| {
            out.write(json.as_bytes())
        })?);
        for file in &self.files {
            entries.push(write_entry(w, archive_start, &file.name, dos, |out| {
                write_resolved(file.item, mem, file.base, out)
            })?);
        }

        let directory_start = w.stream_position()?;
        for entry in &entries {
            entry.write_central_record(w, dos)?;
        }
        let directory_end = w.stream_position()?;

        let count = u16::try_from(entries.len())
            .map_err(|_| SaveError::Corrupt("too many archive entries"))?;
        w.write_u32_le(END_OF_CENTRAL_DIRECTORY_SIGNATURE)?;
        w.write_u16_le(0)?;
        w.write_u16_le(0)?;
        w.write_u16_le(count)?;
        w.write_u16_le(count)?;
        w.write_u32_le(to_u32(directory_end - directory_start)?)?;
        w.write_u32_le(to_u32(directory_start - archive_start)?)?;
        w.write_u16_le(0)?;

        tracing::debug!(
            entries = entries.len(),
            bytes = directory_end + 22 - archive_start,
            "wrote save state archive"
        );
        Ok(())
    }
}

impl<'a> ExternalFiles<'a> for ArchiveWriter<'a> {
    fn add_data_file(
        &mut self,
        proposed_name: &str,
        item: &'a RegisteredItem,
        base: u64,
    ) -> String {
        let name = unique_file_name(proposed_name, |candidate| {
            self.files.iter().any(|f| f.name == candidate)
        });
        self.files.push(DataFile {
            name: name.clone(),
            item,
            base,
        });
        name
    }
}

/// Turns `proposed` into a safe archive entry name ending in `.bin` that `exists` rejects.
///
/// Only `A-Z a-z 0-9 _ - .` survive. Any other character becomes a `.`, or disappears when it
/// would lead the name or follow another `.`.
pub fn unique_file_name(proposed: &str, exists: impl Fn(&str) -> bool) -> String {
    let mut stem = String::with_capacity(proposed.len());
    for c in proposed.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
            stem.push(c);
        } else if !stem.is_empty() && !stem.ends_with('.') {
            stem.push('.');
        }
    }

    let mut candidate = format!("{stem}.bin");
    let mut n = 2u32;
    while exists(&candidate) {
        candidate = format!("{stem}.{n}.bin");
        n += 1;
    }
    candidate
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DosTimestamp {
    pub time: u16,
    pub date: u16,
}

impl From<OffsetDateTime> for DosTimestamp {
    fn from(t: OffsetDateTime) -> Self {
        // DOS dates cover 1980..=2107.
        if t.year() < 1980 {
            return Self {
                time: 0,
                date: (1 << 5) | 1,
            };
        }
        let year = (t.year() - 1980).min(127) as u16;
        Self {
            time: (u16::from(t.hour()) << 11)
                | (u16::from(t.minute()) << 5)
                | (u16::from(t.second()) / 2),
            date: (year << 9) | (u16::from(u8::from(t.month())) << 5) | u16::from(t.day()),
        }
    }
}

/// CRC and byte counts of one entry body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EntrySums {
    pub crc32: u32,
    pub compressed: u32,
    pub uncompressed: u32,
}

impl EntrySums {
    fn to_le_bytes(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.crc32.to_le_bytes());
        out[4..8].copy_from_slice(&self.compressed.to_le_bytes());
        out[8..12].copy_from_slice(&self.uncompressed.to_le_bytes());
        out
    }
}

struct CentralEntry {
    name: String,
    local_offset: u32,
    sums: EntrySums,
}

impl CentralEntry {
    fn write_central_record<W: Write>(&self, w: &mut W, dos: DosTimestamp) -> Result<()> {
        w.write_u32_le(CENTRAL_HEADER_SIGNATURE)?;
        w.write_u16_le(VERSION_MADE_BY)?;
        w.write_u16_le(VERSION_NEEDED)?;
        w.write_u16_le(FLAGS)?;
        w.write_u16_le(METHOD_DEFLATE)?;
        w.write_u16_le(dos.time)?;
        w.write_u16_le(dos.date)?;
        w.write_bytes(&self.sums.to_le_bytes())?;
        w.write_u16_le(name_len(&self.name)?)?;
        // Extra field, comment, disk number, internal and external attributes.
        w.write_u16_le(0)?;
        w.write_u16_le(0)?;
        w.write_u16_le(0)?;
        w.write_u16_le(0)?;
        w.write_u32_le(0)?;
        w.write_u32_le(self.local_offset)?;
        w.write_bytes(self.name.as_bytes())
    }
}

fn write_entry<W, F>(
    w: &mut W,
    archive_start: u64,
    name: &str,
    dos: DosTimestamp,
    body: F,
) -> Result<CentralEntry>
where
    W: Write + Seek,
    F: FnOnce(&mut DeflateStreamer<'_, W>) -> Result<()>,
{
    let header = ScopedPatch::begin(w)?;
    w.write_u32_le(LOCAL_HEADER_SIGNATURE)?;
    w.write_u16_le(VERSION_NEEDED)?;
    w.write_u16_le(FLAGS)?;
    w.write_u16_le(METHOD_DEFLATE)?;
    w.write_u16_le(dos.time)?;
    w.write_u16_le(dos.date)?;
    w.write_bytes(&EntrySums::default().to_le_bytes())?;
    w.write_u16_le(name_len(name)?)?;
    w.write_u16_le(0)?;
    w.write_bytes(name.as_bytes())?;

    let mut streamer = DeflateStreamer::new(w);
    body(&mut streamer)?;
    let sums = streamer.finish()?;
    header.patch(w, LOCAL_SUMS_OFFSET, &sums.to_le_bytes())?;

    tracing::trace!(
        name,
        uncompressed = sums.uncompressed,
        compressed = sums.compressed,
        "wrote archive entry"
    );
    Ok(CentralEntry {
        name: name.to_string(),
        local_offset: to_u32(header.start() - archive_start)?,
        sums,
    })
}

/// Raw-deflates a byte stream into `w` through a fixed-size output buffer, tracking the CRC and
/// both byte counts as it goes.
pub(crate) struct DeflateStreamer<'w, W> {
    w: &'w mut W,
    compress: Compress,
    buf: Vec<u8>,
    crc: Hasher,
    uncompressed: u64,
    compressed: u64,
}

impl<'w, W: Write> DeflateStreamer<'w, W> {
    fn new(w: &'w mut W) -> Self {
        Self {
            w,
            compress: Compress::new(Compression::best(), false),
            buf: vec![0u8; STREAM_CHUNK],
            crc: Hasher::new(),
            uncompressed: 0,
            compressed: 0,
        }
    }

    pub fn write(&mut self, mut input: &[u8]) -> Result<()> {
        self.crc.update(input);
        self.uncompressed += input.len() as u64;
        while !input.is_empty() {
            let (consumed, _) = self.step(input, FlushCompress::None)?;
            input = &input[consumed..];
        }
        Ok(())
    }

    fn finish(mut self) -> Result<EntrySums> {
        loop {
            let (_, status) = self.step(&[], FlushCompress::Finish)?;
            if status == Status::StreamEnd {
                break;
            }
        }
        Ok(EntrySums {
            crc32: self.crc.finalize(),
            compressed: to_u32(self.compressed)?,
            uncompressed: to_u32(self.uncompressed)?,
        })
    }

    fn step(&mut self, input: &[u8], flush: FlushCompress) -> Result<(usize, Status)> {
        let in_before = self.compress.total_in();
        let out_before = self.compress.total_out();
        let status = self.compress.compress(input, &mut self.buf, flush)?;
        let consumed = (self.compress.total_in() - in_before) as usize;
        let produced = (self.compress.total_out() - out_before) as usize;
        self.w.write_all(&self.buf[..produced])?;
        self.compressed += produced as u64;
        Ok((consumed, status))
    }
}

fn write_data<M, W>(
    item: &RegisteredItem,
    mem: &M,
    base: u64,
    out: &mut DeflateStreamer<'_, W>,
) -> Result<()>
where
    M: StateMemory + ?Sized,
    W: Write,
{
    match item.resolve_base(mem, base)? {
        Resolved::Forward(pointee, base) => write_data(pointee, mem, base, out),
        Resolved::Here(base) => write_resolved(item, mem, base, out),
    }
}

/// Streams the packed bytes of `item`, whose offset is already folded into `base`.
fn write_resolved<M, W>(
    item: &RegisteredItem,
    mem: &M,
    base: u64,
    out: &mut DeflateStreamer<'_, W>,
) -> Result<()>
where
    M: StateMemory + ?Sized,
    W: Write,
{
    let mut chunk = [0u8; STREAM_CHUNK];
    match item.kind() {
        ItemKind::Bool => {
            mem.read_into(base, &mut chunk[..1])?;
            out.write(&[u8::from(chunk[0] != 0)])?;
        }
        ItemKind::Int | ItemKind::Uint | ItemKind::Float => {
            let width = item.native_size() as usize;
            mem.read_into(base, &mut chunk[..width])?;
            out.write(&chunk[..width])?;
        }
        ItemKind::Container | ItemKind::Struct => {
            for child in item.items() {
                write_data(child, mem, base, out)?;
            }
        }
        ItemKind::Array { count } => {
            let Some(element) = item.element() else {
                return Ok(());
            };
            let stride = u64::from(item.native_size());
            if element.is_int_or_float()
                && element.offset() == 0
                && stride == element.binary_size()
            {
                // Densely packed scalars: copy the run in bounded chunks.
                let mut remaining = u64::from(count) * stride;
                let mut addr = base;
                while remaining > 0 {
                    let n = remaining.min(STREAM_CHUNK as u64) as usize;
                    mem.read_into(addr, &mut chunk[..n])?;
                    out.write(&chunk[..n])?;
                    addr += n as u64;
                    remaining -= n as u64;
                }
            } else {
                for rep in 0..u64::from(count) {
                    write_data(element, mem, base + rep * stride, out)?;
                }
            }
        }
        ItemKind::Indirect(_) => {}
    }
    Ok(())
}

fn name_len(name: &str) -> Result<u16> {
    u16::try_from(name.len()).map_err(|_| SaveError::Corrupt("archive entry name too long"))
}

fn to_u32(v: u64) -> Result<u32> {
    u32::try_from(v).map_err(|_| SaveError::Corrupt("archive larger than 4 GiB"))
}
