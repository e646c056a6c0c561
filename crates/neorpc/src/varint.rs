//! # Varint Primitives
//!
//! Unsigned LEB128: seven payload bits per byte, high bit set on every byte
//! except the last. A `u64` takes at most ten bytes.
//!
//! [`Reader`] is a bounds-checked, zero-copy view that only ever moves forward.

/// Maximum encoded length of a `u64`.
pub const MAX_LEN: usize = 10;

/// Low-level read failures. Callers wrap these into envelope errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// More than [`MAX_LEN`] bytes, or bits beyond 64.
    Overflow,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEnd => write!(f, "unexpected end of buffer"),
            Self::Overflow => write!(f, "varint overflows u64"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Appends `v` to `buf`.
pub fn write(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Number of bytes `write` would append for `v`.
pub fn encoded_len(v: u64) -> usize {
    let bits = 64 - v.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// A forward-only cursor over an input slice.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the remaining bytes in the view.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self) -> Result<u8> {
        let (&b, tail) = self.buf.split_first().ok_or(Error::UnexpectedEnd)?;
        self.buf = tail;
        Ok(b)
    }

    pub fn varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for i in 0..MAX_LEN {
            let byte = self.u8()?;
            let chunk = (byte & 0x7f) as u64;
            // The tenth byte may only contribute the single remaining bit.
            if i == MAX_LEN - 1 && chunk > 1 {
                return Err(Error::Overflow);
            }
            value |= chunk << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::Overflow)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// A varint length prefix followed by that many bytes.
    pub fn blob(&mut self) -> Result<&'a [u8]> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| Error::Overflow)?;
        self.bytes(len)
    }

    /// Everything left in the view.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}
