//! Little-endian primitive readers for the legacy Torch7 object stream.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::{ErrorKind, Result};

pub const TYPE_NIL: i32 = 0;
pub const TYPE_NUMBER: i32 = 1;
pub const TYPE_STRING: i32 = 2;
pub const TYPE_TABLE: i32 = 3;
pub const TYPE_TORCH: i32 = 4;
pub const TYPE_BOOLEAN: i32 = 5;
pub const TYPE_FUNCTION: i32 = 6;
pub const LEGACY_TYPE_RECUR_FUNCTION: i32 = 7;
pub const TYPE_RECUR_FUNCTION: i32 = 8;

pub struct TorchStream<R> {
    inner: R,
}

impl<R: Read + Seek> TorchStream<R> {
    pub fn new(inner: R) -> TorchStream<R> {
        TorchStream { inner }
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.seek(SeekFrom::Current(0))?)
    }

    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.inner.read_i32::<LittleEndian>()?)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.inner.read_i64::<LittleEndian>()?)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(self.inner.read_f64::<LittleEndian>()?)
    }

    /// Booleans are serialized as 32-bit integers.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_i32()? != 0)
    }

    /// A 32-bit length followed by that many raw bytes.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            bail!(ErrorKind::Parse(format!("negative string length [{}]", len)));
        }
        let mut bytes = vec![0u8; len as usize];
        self.inner.read_exact(&mut bytes)?;
        Ok(String::from_utf8(bytes)?)
    }

    pub fn read_u8s(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_i8s(&mut self, n: usize) -> Result<Vec<i8>> {
        let mut buf = vec![0i8; n];
        self.inner.read_i8_into(&mut buf)?;
        Ok(buf)
    }

    pub fn read_i16s(&mut self, n: usize) -> Result<Vec<i16>> {
        let mut buf = vec![0i16; n];
        self.inner.read_i16_into::<LittleEndian>(&mut buf)?;
        Ok(buf)
    }

    pub fn read_i32s(&mut self, n: usize) -> Result<Vec<i32>> {
        let mut buf = vec![0i32; n];
        self.inner.read_i32_into::<LittleEndian>(&mut buf)?;
        Ok(buf)
    }

    pub fn read_i64s(&mut self, n: usize) -> Result<Vec<i64>> {
        let mut buf = vec![0i64; n];
        self.inner.read_i64_into::<LittleEndian>(&mut buf)?;
        Ok(buf)
    }

    pub fn read_f32s(&mut self, n: usize) -> Result<Vec<f32>> {
        let mut buf = vec![0f32; n];
        self.inner.read_f32_into::<LittleEndian>(&mut buf)?;
        Ok(buf)
    }

    pub fn read_f64s(&mut self, n: usize) -> Result<Vec<f64>> {
        let mut buf = vec![0f64; n];
        self.inner.read_f64_into::<LittleEndian>(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn primitives() {
        let mut bytes = vec![];
        bytes.extend(&1i32.to_le_bytes());
        bytes.extend(&0.5f64.to_le_bytes());
        bytes.extend(&2i32.to_le_bytes());
        bytes.extend(b"hi");
        let mut s = TorchStream::new(Cursor::new(bytes));
        assert_eq!(s.read_bool().unwrap(), true);
        assert_eq!(s.read_f64().unwrap(), 0.5);
        assert_eq!(s.read_string().unwrap(), "hi");
    }

    #[test]
    fn seek_back() {
        let mut bytes = vec![];
        bytes.extend(&7i32.to_le_bytes());
        bytes.extend(&8i32.to_le_bytes());
        let mut s = TorchStream::new(Cursor::new(bytes));
        let pos = s.position().unwrap();
        assert_eq!(s.read_i32().unwrap(), 7);
        s.seek_to(pos).unwrap();
        assert_eq!(s.read_i32().unwrap(), 7);
        assert_eq!(s.read_i32().unwrap(), 8);
    }

    #[test]
    fn negative_string_length() {
        let mut s = TorchStream::new(Cursor::new((-1i32).to_le_bytes().to_vec()));
        assert!(s.read_string().is_err());
    }
}
