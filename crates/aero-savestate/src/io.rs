use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Result, SaveError};

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| SaveError::Corrupt("allocation too large"))?;
        buf.resize(len, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

/// A region of a seekable output whose leading bytes are only known once the region's body has
/// been written.
///
/// `begin` records the current position; the caller writes a placeholder header and the body,
/// then `patch` seeks back to `start + offset`, overwrites the placeholder and returns to the end
/// of the written data.
pub struct ScopedPatch {
    start: u64,
}

impl ScopedPatch {
    pub fn begin<W: Seek>(w: &mut W) -> Result<Self> {
        Ok(Self {
            start: w.stream_position()?,
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn patch<W: Write + Seek>(&self, w: &mut W, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = w.stream_position()?;
        if end < self.start + offset + bytes.len() as u64 {
            return Err(SaveError::Corrupt("patch beyond written data"));
        }
        w.seek(SeekFrom::Start(self.start + offset))?;
        w.write_all(bytes)?;
        w.seek(SeekFrom::Start(end))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_exact_vec_allocation_failure_returns_error() {
        let mut cursor = Cursor::new(Vec::new());
        let err = cursor.read_exact_vec(usize::MAX).unwrap_err();
        assert!(matches!(err, SaveError::Corrupt(_)));
    }

    #[test]
    fn scoped_patch_rewrites_placeholder_and_returns_to_end() {
        let mut cursor = Cursor::new(Vec::new());
        cursor.write_bytes(b"xx").unwrap();

        let scope = ScopedPatch::begin(&mut cursor).unwrap();
        cursor.write_u32_le(0).unwrap();
        cursor.write_bytes(b"body").unwrap();
        scope.patch(&mut cursor, 0, &8u32.to_le_bytes()).unwrap();
        cursor.write_u8(b'!').unwrap();

        assert_eq!(scope.start(), 2);
        assert_eq!(cursor.into_inner(), b"xx\x08\x00\x00\x00body!".to_vec());
    }

    #[test]
    fn scoped_patch_rejects_patch_past_end() {
        let mut cursor = Cursor::new(Vec::new());
        let scope = ScopedPatch::begin(&mut cursor).unwrap();
        cursor.write_u16_le(0).unwrap();
        assert!(scope.patch(&mut cursor, 0, &[0u8; 4]).is_err());
    }
}
