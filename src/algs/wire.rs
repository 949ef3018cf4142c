//! Fixed, little-endian wire words for the composite-grid protocol.
//!
//! Every protocol buffer is a flat sequence of 8-byte words: integers are
//! stored as `i64`, reals as the bit pattern of an `f64`. Producers reserve
//! the exact word count up front and [`WireWriter::finish`] checks it.

use crate::compgrid_error::CompGridError;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// One 8-byte little-endian word.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Pod, Zeroable, PartialEq, Eq)]
pub struct WireWord(u64);

const_assert_eq!(std::mem::size_of::<WireWord>(), 8);

impl WireWord {
    pub fn from_int(v: i64) -> Self {
        Self((v as u64).to_le())
    }
    pub fn from_real(v: f64) -> Self {
        Self(v.to_bits().to_le())
    }
    pub fn int(self) -> i64 {
        u64::from_le(self.0) as i64
    }
    pub fn real(self) -> f64 {
        f64::from_bits(u64::from_le(self.0))
    }
}

impl std::fmt::Debug for WireWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WireWord({:#018x})", u64::from_le(self.0))
    }
}

/// Single-word count used by every size exchange.
#[repr(C)]
#[derive(Copy, Clone, Default, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// Decode a byte payload into words; the length must be a multiple of 8.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<WireWord>, String> {
    if bytes.len() % std::mem::size_of::<WireWord>() != 0 {
        return Err(format!(
            "payload of {} bytes is not a whole number of words",
            bytes.len()
        ));
    }
    let mut words = vec![WireWord::default(); bytes.len() / std::mem::size_of::<WireWord>()];
    cast_slice_mut(&mut words).copy_from_slice(bytes);
    Ok(words)
}

/// Append-only writer over a buffer of exactly known length.
#[derive(Debug)]
pub struct WireWriter {
    words: Vec<WireWord>,
    expected: usize,
}

impl WireWriter {
    pub fn with_exact_len(expected: usize) -> Self {
        Self {
            words: Vec::with_capacity(expected),
            expected,
        }
    }

    pub fn put_int(&mut self, v: i64) {
        self.words.push(WireWord::from_int(v));
    }

    pub fn put_len(&mut self, n: usize) {
        self.put_int(n as i64);
    }

    pub fn put_real(&mut self, v: f64) {
        self.words.push(WireWord::from_real(v));
    }

    pub fn put_ints(&mut self, vs: impl IntoIterator<Item = i64>) {
        self.words.extend(vs.into_iter().map(WireWord::from_int));
    }

    pub fn put_reals(&mut self, vs: impl IntoIterator<Item = f64>) {
        self.words.extend(vs.into_iter().map(WireWord::from_real));
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Returns the buffer, or an error if fewer or more words were written than reserved.
    pub fn finish(self) -> Result<Vec<WireWord>, CompGridError> {
        if self.words.len() != self.expected {
            return Err(CompGridError::WireLengthMismatch {
                expected: self.expected,
                actual: self.words.len(),
            });
        }
        Ok(self.words)
    }
}

/// Bounds-checked cursor over a received buffer.
#[derive(Debug)]
pub struct WireReader<'a> {
    words: &'a [WireWord],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(words: &'a [WireWord]) -> Self {
        Self { words, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.words.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [WireWord], CompGridError> {
        if self.remaining() < n {
            return Err(CompGridError::WireUnderflow {
                offset: self.pos,
                needed: n,
                len: self.words.len(),
            });
        }
        let out = &self.words[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn int(&mut self) -> Result<i64, CompGridError> {
        Ok(self.take(1)?[0].int())
    }

    pub fn real(&mut self) -> Result<f64, CompGridError> {
        Ok(self.take(1)?[0].real())
    }

    /// A non-negative count or length.
    pub fn len_value(&mut self, what: &'static str) -> Result<usize, CompGridError> {
        let v = self.int()?;
        usize::try_from(v).map_err(|_| CompGridError::WireValueOutOfRange { value: v, what })
    }

    pub fn ints(&mut self, n: usize) -> Result<Vec<i64>, CompGridError> {
        Ok(self.take(n)?.iter().map(|w| w.int()).collect())
    }

    pub fn reals(&mut self, n: usize) -> Result<Vec<f64>, CompGridError> {
        Ok(self.take(n)?.iter().map(|w| w.real()).collect())
    }

    /// Look at the integer `ahead` words past the cursor without consuming anything.
    pub fn peek_int(&self, ahead: usize) -> Result<i64, CompGridError> {
        self.words
            .get(self.pos + ahead)
            .map(|w| w.int())
            .ok_or(CompGridError::WireUnderflow {
                offset: self.pos,
                needed: ahead + 1,
                len: self.words.len(),
            })
    }

    pub fn skip(&mut self, n: usize) -> Result<(), CompGridError> {
        self.take(n).map(|_| ())
    }
}
