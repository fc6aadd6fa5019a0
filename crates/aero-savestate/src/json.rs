//! Structured-text (JSON) rendering of the state tree.
//!
//! Output is meant to be diffed between runs, so it is fully deterministic: siblings appear in
//! sealed (sorted) order and the inline/multi-line layout depends only on the schema. Large numeric
//! arrays are not inlined; they are handed to an [`ExternalFiles`] sink and replaced by a small
//! descriptor naming the payload.

use crate::item::{ItemKind, RegisteredItem, Resolved};
use crate::memory::{MemoryResult, StateMemory};

/// Numeric arrays at least this many bytes long are written to their own payload file.
pub const EXTERNAL_BINARY_THRESHOLD: u64 = 4096;

/// Structures and arrays no larger than this (in packed bytes) are rendered on a single line.
pub const INLINE_SIZE_LIMIT: u64 = 16;

/// Receives arrays routed out of the JSON document.
pub trait ExternalFiles<'a> {
    /// Registers the payload for `item` at `base` and returns the file name to reference.
    fn add_data_file(&mut self, proposed_name: &str, item: &'a RegisteredItem, base: u64) -> String;
}

/// Collects external payload names without writing them anywhere.
#[derive(Debug, Default)]
pub struct ExternalNames {
    pub names: Vec<String>,
}

impl<'a> ExternalFiles<'a> for ExternalNames {
    fn add_data_file(
        &mut self,
        proposed_name: &str,
        _item: &'a RegisteredItem,
        _base: u64,
    ) -> String {
        let name = crate::zip::unique_file_name(proposed_name, |candidate| {
            self.names.iter().any(|n| n == candidate)
        });
        self.names.push(name.clone());
        name
    }
}

#[derive(Debug, Default)]
pub struct JsonWriter {
    buf: String,
}

impl JsonWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_string(self) -> String {
        self.buf
    }

    fn push(&mut self, c: char) -> &mut Self {
        self.buf.push(c);
        self
    }

    fn push_str(&mut self, s: &str) -> &mut Self {
        self.buf.push_str(s);
        self
    }

    fn indent(&mut self, depth: usize) -> &mut Self {
        for _ in 0..depth {
            self.buf.push('\t');
        }
        self
    }

    fn eol(&mut self) -> &mut Self {
        self.push('\n')
    }

    /// Emits `"name":` with JSON string escaping; empty names emit nothing.
    fn name(&mut self, name: &str) -> &mut Self {
        if name.is_empty() {
            return self;
        }
        let quoted = serde_json::Value::from(name).to_string();
        self.push_str(&quoted).push(':')
    }

    /// Integers that cannot round-trip through a double are quoted.
    fn signed(&mut self, value: i64) -> &mut Self {
        let as_double = value as f64;
        let exact = (-TWO_POW_63..TWO_POW_63).contains(&as_double) && as_double as i64 == value;
        self.number(&value.to_string(), !exact)
    }

    fn unsigned(&mut self, value: u64) -> &mut Self {
        let as_double = value as f64;
        let exact = as_double < TWO_POW_64 && as_double as u64 == value;
        self.number(&value.to_string(), !exact)
    }

    fn float(&mut self, value: f64) -> &mut Self {
        let text = format_g(value);
        // JSON has no literal for these.
        self.number(&text, !value.is_finite())
    }

    fn number(&mut self, text: &str, quote: bool) -> &mut Self {
        if quote {
            self.push('"').push_str(text).push('"')
        } else {
            self.push_str(text)
        }
    }
}

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

/// Renders `value` the way C's `%g` does: six significant digits, trailing zeros removed,
/// scientific notation for very small or large magnitudes.
pub fn format_g(value: f64) -> String {
    const PRECISION: i32 = 6;

    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // Round to the target precision first; the exponent must be taken after rounding.
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= PRECISION {
        let mantissa = strip_fraction_zeros(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = (PRECISION - 1 - exponent).max(0) as usize;
        strip_fraction_zeros(&format!("{value:.decimals$}")).to_string()
    }
}

fn strip_fraction_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

struct Exporter<'m, 'f, M: ?Sized, F> {
    json: JsonWriter,
    mem: &'m M,
    files: &'f mut F,
}

/// Renders the tree rooted at `item` against live state.
pub fn export<'a, M, F>(item: &'a RegisteredItem, mem: &M, files: &mut F) -> MemoryResult<String>
where
    M: StateMemory + ?Sized,
    F: ExternalFiles<'a>,
{
    let mut exporter = Exporter {
        json: JsonWriter::new(),
        mem,
        files,
    };
    exporter.save_json(item, "", 0, false, 0)?;
    Ok(exporter.json.into_string())
}

impl<'a, M, F> Exporter<'_, '_, M, F>
where
    M: StateMemory + ?Sized,
    F: ExternalFiles<'a>,
{
    fn save_json(
        &mut self,
        item: &'a RegisteredItem,
        prefix: &str,
        indent: usize,
        inline_form: bool,
        base: u64,
    ) -> MemoryResult<()> {
        let base = match item.resolve_base(self.mem, base)? {
            Resolved::Forward(pointee, base) => {
                return self.save_json(pointee, prefix, indent, inline_form, base);
            }
            Resolved::Here(base) => base,
        };

        let local_name = match (prefix.is_empty(), item.name().is_empty()) {
            (_, true) => prefix.to_string(),
            (true, false) => item.name().to_string(),
            (false, false) => format!("{prefix}.{}", item.name()),
        };

        self.json.name(item.name());

        match item.kind() {
            ItemKind::Bool => {
                let mut byte = [0u8; 1];
                self.mem.read_into(base, &mut byte)?;
                self.json.push_str(if byte[0] != 0 { "true" } else { "false" });
            }
            ItemKind::Int => {
                let value = read_signed(self.mem, base, item.native_size())?;
                self.json.signed(value);
            }
            ItemKind::Uint => {
                let value = read_unsigned(self.mem, base, item.native_size())?;
                self.json.unsigned(value);
            }
            ItemKind::Float => {
                let value = read_float(self.mem, base, item.native_size())?;
                self.json.float(value);
            }
            ItemKind::Container | ItemKind::Struct => {
                self.save_members(item, &local_name, indent, inline_form, base)?;
            }
            ItemKind::Array { count } => {
                self.save_array(item, count, &local_name, indent, inline_form, base)?;
            }
            ItemKind::Indirect(_) => {
                self.json.push_str("null");
            }
        }
        Ok(())
    }

    fn save_members(
        &mut self,
        item: &'a RegisteredItem,
        local_name: &str,
        indent: usize,
        inline_form: bool,
        base: u64,
    ) -> MemoryResult<()> {
        let items = item.items();
        if inline_form || item.binary_size() <= INLINE_SIZE_LIMIT {
            self.json.push('{');
            for (i, child) in items.iter().enumerate() {
                self.save_json(child, local_name, indent, true, base)?;
                if i + 1 != items.len() {
                    self.json.push(',');
                }
            }
            self.json.push('}');
        } else {
            self.json.push('{').eol();
            for (i, child) in items.iter().enumerate() {
                self.json.indent(indent + 1);
                self.save_json(child, local_name, indent + 1, false, base)?;
                if i + 1 != items.len() {
                    self.json.push(',');
                }
                self.json.eol();
            }
            self.json.indent(indent).push('}');
        }
        Ok(())
    }

    fn save_array(
        &mut self,
        item: &'a RegisteredItem,
        count: u32,
        local_name: &str,
        indent: usize,
        inline_form: bool,
        base: u64,
    ) -> MemoryResult<()> {
        let Some(element) = item.element() else {
            self.json.push_str("[]");
            return Ok(());
        };
        let stride = u64::from(item.native_size());

        let mut inner = element;
        let mut total = u64::from(count);
        while let ItemKind::Array { count } = inner.kind() {
            let Some(next) = inner.element() else { break };
            total *= u64::from(count);
            inner = next;
        }
        let unit = u64::from(inner.native_size());
        if inner.is_int_or_float() && total * unit >= EXTERNAL_BINARY_THRESHOLD {
            let file_name = self.files.add_data_file(local_name, item, base);
            self.json.push('[').push('{');
            self.json.name("external_file").push('"').push_str(&file_name).push('"').push(',');
            self.json.name("unit").unsigned(unit).push(',');
            self.json.name("count").unsigned(total).push(',');
            self.json
                .name("little_endian")
                .push_str(if cfg!(target_endian = "little") { "true" } else { "false" });
            self.json.push('}').push(']');
            return Ok(());
        }

        let item_size = element.binary_size();
        if inline_form || u64::from(count) * item_size <= INLINE_SIZE_LIMIT {
            self.json.push('[');
            for rep in 0..count {
                self.save_json(element, local_name, 0, true, base + u64::from(rep) * stride)?;
                if rep != count - 1 {
                    self.json.push(',');
                }
            }
            self.json.push(']');
            return Ok(());
        }

        let per_row = if element.is_int_or_float() {
            if item_size <= 2 {
                32
            } else {
                16
            }
        } else {
            1
        };
        self.json.push('[').eol();
        for rep in 0..count {
            if rep % per_row == 0 {
                self.json.indent(indent + 1);
            }
            self.save_json(
                element,
                local_name,
                indent + 1,
                false,
                base + u64::from(rep) * stride,
            )?;
            if rep != count - 1 {
                self.json.push(',');
            }
            if rep % per_row == per_row - 1 {
                self.json.eol();
            }
        }
        if count % per_row != 0 {
            self.json.eol();
        }
        self.json.indent(indent).push(']');
        Ok(())
    }
}

/// Upper bound on the length of the `save.json` text [`export`] can produce for `item`.
///
/// Depends on the schema only, so it caps how far an archive entry may inflate on load.
pub(crate) fn text_size_bound(item: &RegisteredItem) -> u64 {
    bound_at(item, 0, 0)
}

fn bound_at(item: &RegisteredItem, depth: u64, path_len: u64) -> u64 {
    if let (ItemKind::Indirect(_), Some(pointee)) = (item.kind(), item.element()) {
        return bound_at(pointee, depth, path_len);
    }
    let name_len = item.name().len() as u64;
    // Escaping widens a byte to at most six (`\u00XX`); quotes and colon add three.
    let name = if name_len == 0 { 0 } else { 6 * name_len + 3 };
    let path_len = path_len.saturating_add(name_len + 1);
    // A member line adds indentation, a comma and a newline.
    let line = depth + 3;

    let value = match item.kind() {
        ItemKind::Bool => 5,
        // 20 digits plus sign and quotes; `%g` output is shorter still.
        ItemKind::Int | ItemKind::Uint | ItemKind::Float => 24,
        ItemKind::Container | ItemKind::Struct => item
            .items()
            .iter()
            .map(|child| bound_at(child, depth + 1, path_len).saturating_add(line + 1))
            .fold(4 + depth, u64::saturating_add),
        ItemKind::Array { count } => {
            let inline = item.element().map_or(2, |element| {
                bound_at(element, depth + 1, path_len)
                    .saturating_add(line + 1)
                    .saturating_mul(u64::from(count))
                    .saturating_add(4 + depth)
            });
            // Descriptor text plus a payload name derived from the path.
            let external = path_len.saturating_mul(2).saturating_add(160);
            inline.max(external)
        }
        ItemKind::Indirect(_) => 4,
    };
    value.saturating_add(name)
}

fn read_bytes<M: StateMemory + ?Sized, const N: usize>(
    mem: &M,
    addr: u64,
) -> MemoryResult<[u8; N]> {
    let mut buf = [0u8; N];
    mem.read_into(addr, &mut buf)?;
    Ok(buf)
}

pub(crate) fn read_signed<M: StateMemory + ?Sized>(
    mem: &M,
    addr: u64,
    size: u32,
) -> MemoryResult<i64> {
    Ok(match size {
        1 => i64::from(i8::from_ne_bytes(read_bytes(mem, addr)?)),
        2 => i64::from(i16::from_ne_bytes(read_bytes(mem, addr)?)),
        4 => i64::from(i32::from_ne_bytes(read_bytes(mem, addr)?)),
        8 => i64::from_ne_bytes(read_bytes(mem, addr)?),
        _ => 0,
    })
}

pub(crate) fn read_unsigned<M: StateMemory + ?Sized>(
    mem: &M,
    addr: u64,
    size: u32,
) -> MemoryResult<u64> {
    Ok(match size {
        1 => u64::from(u8::from_ne_bytes(read_bytes(mem, addr)?)),
        2 => u64::from(u16::from_ne_bytes(read_bytes(mem, addr)?)),
        4 => u64::from(u32::from_ne_bytes(read_bytes(mem, addr)?)),
        8 => u64::from_ne_bytes(read_bytes(mem, addr)?),
        _ => 0,
    })
}

pub(crate) fn read_float<M: StateMemory + ?Sized>(
    mem: &M,
    addr: u64,
    size: u32,
) -> MemoryResult<f64> {
    Ok(match size {
        4 => f64::from(f32::from_ne_bytes(read_bytes(mem, addr)?)),
        8 => f64::from_ne_bytes(read_bytes(mem, addr)?),
        _ => 0.0,
    })
}
