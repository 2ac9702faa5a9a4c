//! Bounds-checked little-endian readers for the flat index and block layouts

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

/// Cursor over a serialized buffer that fails instead of panicking on short input
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, bytes: usize) -> Result<()> {
        if self.buf.len() < bytes {
            return Err(Error::InvalidData(format!(
                "{}: truncated, need {bytes} bytes, have {}",
                self.what,
                self.buf.len()
            )));
        }
        Ok(())
    }

    /// Validate a count read from a header against the bytes left
    pub fn count(&self, count: u64, elem_size: usize) -> Result<usize> {
        let count = usize::try_from(count)
            .map_err(|_| Error::InvalidData(format!("{}: count {count} overflows", self.what)))?;
        let bytes = count
            .checked_mul(elem_size)
            .ok_or_else(|| Error::InvalidData(format!("{}: count {count} overflows", self.what)))?;
        self.need(bytes)?;
        Ok(count)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn u32_vec(&mut self, count: usize) -> Result<Vec<u32>> {
        self.need(count * 4)?;
        Ok((0..count).map(|_| self.buf.get_u32_le()).collect())
    }

    pub fn u64_vec(&mut self, count: usize) -> Result<Vec<u64>> {
        self.need(count * 8)?;
        Ok((0..count).map(|_| self.buf.get_u64_le()).collect())
    }

    pub fn rest(self) -> &'a [u8] {
        self.buf
    }
}

pub(crate) fn put_u32s(out: &mut Vec<u8>, values: &[u32]) {
    for v in values {
        out.put_u32_le(*v);
    }
}

pub(crate) fn put_u64s(out: &mut Vec<u8>, values: &[u64]) {
    for v in values {
        out.put_u64_le(*v);
    }
}
