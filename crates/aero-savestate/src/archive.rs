//! Reading save archives back: zip parsing and restoring live state from `save.json`.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use flate2::read::DeflateDecoder;
use serde_json::{Map, Value};

use crate::codec;
use crate::error::{Result, SaveError};
use crate::io::ReadLeExt;
use crate::item::{ItemKind, RegisteredItem, Resolved};
use crate::memory::StateMemory;
use crate::zip::{
    CENTRAL_HEADER_SIGNATURE, END_OF_CENTRAL_DIRECTORY_SIGNATURE, JSON_ENTRY_NAME,
    LOCAL_HEADER_SIGNATURE, METHOD_DEFLATE,
};

const METHOD_STORED: u16 = 0;
const EOCD_LEN: u64 = 22;
const MAX_COMMENT_LEN: u64 = u16::MAX as u64;

/// Total uncompressed bytes [`ArchiveReader::read`] accepts.
pub const DEFAULT_INFLATE_LIMIT: u64 = 256 << 20;

/// Fully inflated contents of a zip archive.
#[derive(Debug, Default)]
pub struct ArchiveReader {
    entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveReader {
    /// Reads the archive that starts at the current position of `r` and extends to its end.
    ///
    /// Every entry is inflated and checked against its recorded CRC and size. At most
    /// [`DEFAULT_INFLATE_LIMIT`] bytes are inflated in total.
    pub fn read<R: Read + Seek>(r: &mut R) -> Result<Self> {
        Self::read_limited(r, DEFAULT_INFLATE_LIMIT)
    }

    /// Like [`ArchiveReader::read`], but rejects archives whose entries claim more than `limit`
    /// uncompressed bytes in total before inflating any of them.
    pub fn read_limited<R: Read + Seek>(r: &mut R, limit: u64) -> Result<Self> {
        let archive_start = r.stream_position()?;
        let archive_end = r.seek(SeekFrom::End(0))?;
        let archive_len = archive_end
            .checked_sub(archive_start)
            .ok_or(SaveError::Corrupt("archive start past end of stream"))?;
        if archive_len < EOCD_LEN {
            return Err(SaveError::Corrupt("archive too short"));
        }

        let tail_len = archive_len.min(EOCD_LEN + MAX_COMMENT_LEN);
        r.seek(SeekFrom::Start(archive_end - tail_len))?;
        let tail = r.read_exact_vec(tail_len as usize)?;
        let eocd_pos = (0..=tail.len() - EOCD_LEN as usize)
            .rev()
            .find(|&i| tail[i..i + 4] == END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes())
            .ok_or(SaveError::Corrupt("missing end of central directory"))?;
        let mut eocd = &tail[eocd_pos + 4..];
        let _disk = eocd.read_u16_le()?;
        let _directory_disk = eocd.read_u16_le()?;
        let _disk_entries = eocd.read_u16_le()?;
        let entry_count = eocd.read_u16_le()?;
        let directory_len = eocd.read_u32_le()?;
        let directory_offset = eocd.read_u32_le()?;

        if u64::from(directory_offset) + u64::from(directory_len) > archive_len {
            return Err(SaveError::Corrupt("central directory out of bounds"));
        }
        r.seek(SeekFrom::Start(archive_start + u64::from(directory_offset)))?;
        let directory = r.read_exact_vec(directory_len as usize)?;
        let mut cursor = directory.as_slice();

        let mut records = Vec::new();
        for _ in 0..entry_count {
            records.push(CentralRecord::parse(&mut cursor)?);
        }

        let claimed = records
            .iter()
            .map(|record| u64::from(record.uncompressed))
            .fold(0u64, u64::saturating_add);
        if claimed > limit {
            tracing::warn!(claimed, limit, "refusing to inflate oversized save state archive");
            return Err(SaveError::Corrupt("archive expands beyond the registered state"));
        }

        let mut entries = BTreeMap::new();
        for record in records {
            let data = record.inflate(r, archive_start, archive_len)?;
            if entries.insert(record.name.clone(), data).is_some() {
                return Err(SaveError::Corrupt("duplicate archive entry"));
            }
        }

        tracing::debug!(entries = entries.len(), bytes = archive_len, "read save state archive");
        Ok(Self { entries })
    }

    pub fn entry(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn json(&self) -> Result<&str> {
        let bytes = self
            .entry(JSON_ENTRY_NAME)
            .ok_or(SaveError::Corrupt("archive has no save.json"))?;
        std::str::from_utf8(bytes).map_err(|_| SaveError::Corrupt("save.json is not UTF-8"))
    }
}

struct CentralRecord {
    name: String,
    method: u16,
    crc32: u32,
    compressed: u32,
    uncompressed: u32,
    local_offset: u32,
}

impl CentralRecord {
    fn parse(cursor: &mut &[u8]) -> Result<Self> {
        if cursor.read_u32_le()? != CENTRAL_HEADER_SIGNATURE {
            return Err(SaveError::Corrupt("bad central directory signature"));
        }
        let _made_by = cursor.read_u16_le()?;
        let _needed = cursor.read_u16_le()?;
        let _flags = cursor.read_u16_le()?;
        let method = cursor.read_u16_le()?;
        let _time = cursor.read_u16_le()?;
        let _date = cursor.read_u16_le()?;
        let crc32 = cursor.read_u32_le()?;
        let compressed = cursor.read_u32_le()?;
        let uncompressed = cursor.read_u32_le()?;
        let name_len = cursor.read_u16_le()?;
        let extra_len = cursor.read_u16_le()?;
        let comment_len = cursor.read_u16_le()?;
        let _disk = cursor.read_u16_le()?;
        let _internal = cursor.read_u16_le()?;
        let _external = cursor.read_u32_le()?;
        let local_offset = cursor.read_u32_le()?;
        let name = cursor.read_exact_vec(usize::from(name_len))?;
        let _skipped = cursor.read_exact_vec(usize::from(extra_len) + usize::from(comment_len))?;

        let name = String::from_utf8(name)
            .map_err(|_| SaveError::Corrupt("archive entry name is not UTF-8"))?;
        Ok(Self {
            name,
            method,
            crc32,
            compressed,
            uncompressed,
            local_offset,
        })
    }

    fn inflate<R: Read + Seek>(
        &self,
        r: &mut R,
        archive_start: u64,
        archive_len: u64,
    ) -> Result<Vec<u8>> {
        if u64::from(self.local_offset) + 30 > archive_len {
            return Err(SaveError::Corrupt("local header out of bounds"));
        }
        r.seek(SeekFrom::Start(archive_start + u64::from(self.local_offset)))?;
        let mut header = [0u8; 30];
        r.read_exact(&mut header)?;
        let mut fields = &header[..];
        if fields.read_u32_le()? != LOCAL_HEADER_SIGNATURE {
            return Err(SaveError::Corrupt("bad local header signature"));
        }
        let name_len = u16::from_le_bytes([header[26], header[27]]);
        let extra_len = u16::from_le_bytes([header[28], header[29]]);
        let data_start =
            u64::from(self.local_offset) + 30 + u64::from(name_len) + u64::from(extra_len);
        if data_start + u64::from(self.compressed) > archive_len {
            return Err(SaveError::Corrupt("entry data out of bounds"));
        }
        r.seek(SeekFrom::Start(archive_start + data_start))?;
        let raw = r.read_exact_vec(self.compressed as usize)?;

        let data = match self.method {
            METHOD_STORED => raw,
            METHOD_DEFLATE => {
                let mut out = Vec::new();
                DeflateDecoder::new(raw.as_slice())
                    .take(u64::from(self.uncompressed) + 1)
                    .read_to_end(&mut out)
                    .map_err(|_| SaveError::Corrupt("bad deflate stream"))?;
                out
            }
            _ => return Err(SaveError::Corrupt("unsupported compression method")),
        };
        if data.len() as u64 != u64::from(self.uncompressed) {
            return Err(SaveError::Corrupt("entry size mismatch"));
        }
        if crc32fast::hash(&data) != self.crc32 {
            return Err(SaveError::Corrupt("entry checksum mismatch"));
        }
        Ok(data)
    }
}

/// Restores live state from a parsed `save.json` document, reading externalized arrays from
/// `files`.
///
/// Every field of the schema must be present. Unknown JSON members are ignored.
pub fn import_json<M: StateMemory + ?Sized>(
    root: &RegisteredItem,
    value: &Value,
    mem: &mut M,
    files: &ArchiveReader,
) -> Result<()> {
    let mut importer = Importer {
        mem,
        archive: files,
    };
    importer.import_value(root, value, "", 0)
}

struct Importer<'m, 'r, M: ?Sized> {
    mem: &'m mut M,
    archive: &'r ArchiveReader,
}

impl<M: StateMemory + ?Sized> Importer<'_, '_, M> {
    fn import_value(
        &mut self,
        item: &RegisteredItem,
        value: &Value,
        path: &str,
        base: u64,
    ) -> Result<()> {
        let base = match item.resolve_base(&*self.mem, base)? {
            Resolved::Forward(pointee, base) => {
                return self.import_value(pointee, value, path, base);
            }
            Resolved::Here(base) => base,
        };

        let size = item.native_size();
        match item.kind() {
            ItemKind::Bool => {
                let v = value
                    .as_bool()
                    .ok_or_else(|| SaveError::import(path, "expected a boolean"))?;
                self.mem.write_from(base, &[u8::from(v)])?;
            }
            ItemKind::Int => {
                let v = integer::<i64>(value)
                    .ok_or_else(|| SaveError::import(path, "expected an integer"))?;
                let bytes = signed_bytes(v, size).ok_or_else(|| too_wide(path, v, size))?;
                self.mem.write_from(base, &bytes)?;
            }
            ItemKind::Uint => {
                let v = integer::<u64>(value)
                    .ok_or_else(|| SaveError::import(path, "expected an unsigned integer"))?;
                let bytes = unsigned_bytes(v, size).ok_or_else(|| too_wide(path, v, size))?;
                self.mem.write_from(base, &bytes)?;
            }
            ItemKind::Float => {
                let v = float(value).ok_or_else(|| SaveError::import(path, "expected a number"))?;
                if size == 4 {
                    self.mem.write_from(base, &(v as f32).to_ne_bytes())?;
                } else {
                    self.mem.write_from(base, &v.to_ne_bytes())?;
                }
            }
            ItemKind::Container | ItemKind::Struct => {
                let object = value
                    .as_object()
                    .ok_or_else(|| SaveError::import(path, "expected an object"))?;
                self.import_members(item, object, path, base)?;
            }
            ItemKind::Array { count } => {
                let values = value
                    .as_array()
                    .ok_or_else(|| SaveError::import(path, "expected an array"))?;
                self.import_array(item, count, values, path, base)?;
            }
            ItemKind::Indirect(_) => {}
        }
        Ok(())
    }

    fn import_members(
        &mut self,
        item: &RegisteredItem,
        object: &Map<String, Value>,
        path: &str,
        base: u64,
    ) -> Result<()> {
        for child in item.items() {
            let name = child.name();
            let child_path = if path.is_empty() {
                name.to_string()
            } else {
                format!("{path}.{name}")
            };
            let value = object
                .get(name)
                .ok_or_else(|| SaveError::import(&child_path, "missing from save.json"))?;
            self.import_value(child, value, &child_path, base)?;
        }
        if object.len() > item.items().len() {
            tracing::trace!(path, "ignoring unknown save.json members");
        }
        Ok(())
    }

    fn import_array(
        &mut self,
        item: &RegisteredItem,
        count: u32,
        values: &[Value],
        path: &str,
        base: u64,
    ) -> Result<()> {
        let Some(element) = item.element() else {
            return Ok(());
        };

        if let [Value::Object(descriptor)] = values {
            if descriptor.contains_key("external_file") {
                return self.import_external(item, descriptor, path, base);
            }
        }

        if values.len() != count as usize {
            return Err(SaveError::import(
                path,
                format!("expected {count} items, found {}", values.len()),
            ));
        }
        let stride = u64::from(item.native_size());
        for (rep, value) in values.iter().enumerate() {
            let element_path = format!("{path}[{rep}]");
            self.import_value(element, value, &element_path, base + rep as u64 * stride)?;
        }
        Ok(())
    }

    fn import_external(
        &mut self,
        item: &RegisteredItem,
        descriptor: &Map<String, Value>,
        path: &str,
        base: u64,
    ) -> Result<()> {
        let file = descriptor
            .get("external_file")
            .and_then(Value::as_str)
            .ok_or_else(|| SaveError::import(path, "external_file must be a string"))?;
        let unit = descriptor
            .get("unit")
            .and_then(Value::as_u64)
            .ok_or_else(|| SaveError::import(path, "missing unit"))?;
        let total = descriptor
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| SaveError::import(path, "missing count"))?;
        let little_endian = descriptor
            .get("little_endian")
            .and_then(Value::as_bool)
            .ok_or_else(|| SaveError::import(path, "missing little_endian"))?;

        let mut inner = item;
        let mut expected_total = 1u64;
        while let (ItemKind::Array { count }, Some(next)) = (inner.kind(), inner.element()) {
            expected_total *= u64::from(count);
            inner = next;
        }
        if !inner.is_int_or_float()
            || unit != u64::from(inner.native_size())
            || total != expected_total
        {
            return Err(SaveError::import(
                path,
                "external payload does not match the registered array",
            ));
        }

        let data = self
            .archive
            .entry(file)
            .ok_or_else(|| SaveError::import(path, format!("archive has no entry '{file}'")))?;
        if data.len() as u64 != unit * total {
            return Err(SaveError::import(path, format!("'{file}' has the wrong size")));
        }

        let mut data = data.to_vec();
        if little_endian != cfg!(target_endian = "little") {
            for scalar in data.chunks_exact_mut(unit as usize) {
                scalar.reverse();
            }
        }

        let Some(element) = item.element() else {
            return Ok(());
        };
        let element_size = element.binary_size() as usize;
        let stride = u64::from(item.native_size());
        for (rep, chunk) in data.chunks_exact(element_size).enumerate() {
            codec::unpack(element, &mut *self.mem, chunk, base + rep as u64 * stride)?;
        }
        Ok(())
    }
}

trait FromJsonInteger: Sized + std::str::FromStr {
    fn from_number(n: &serde_json::Number) -> Option<Self>;
}

impl FromJsonInteger for i64 {
    fn from_number(n: &serde_json::Number) -> Option<Self> {
        n.as_i64()
    }
}

impl FromJsonInteger for u64 {
    fn from_number(n: &serde_json::Number) -> Option<Self> {
        n.as_u64()
    }
}

/// Integers are written bare, or quoted when a double cannot hold them.
fn integer<T: FromJsonInteger>(value: &Value) -> Option<T> {
    match value {
        Value::Number(n) => T::from_number(n),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "nan" | "-nan" => Some(f64::NAN),
            "inf" => Some(f64::INFINITY),
            "-inf" => Some(f64::NEG_INFINITY),
            other => other.parse().ok(),
        },
        _ => None,
    }
}

fn too_wide(path: &str, v: impl std::fmt::Display, size: u32) -> SaveError {
    SaveError::import(path, format!("{v} does not fit in {size} bytes"))
}

fn signed_bytes(v: i64, size: u32) -> Option<Vec<u8>> {
    Some(match size {
        1 => i8::try_from(v).ok()?.to_ne_bytes().to_vec(),
        2 => i16::try_from(v).ok()?.to_ne_bytes().to_vec(),
        4 => i32::try_from(v).ok()?.to_ne_bytes().to_vec(),
        _ => v.to_ne_bytes().to_vec(),
    })
}

fn unsigned_bytes(v: u64, size: u32) -> Option<Vec<u8>> {
    Some(match size {
        1 => u8::try_from(v).ok()?.to_ne_bytes().to_vec(),
        2 => u16::try_from(v).ok()?.to_ne_bytes().to_vec(),
        4 => u32::try_from(v).ok()?.to_ne_bytes().to_vec(),
        _ => v.to_ne_bytes().to_vec(),
    })
}
