//! Bounds-checked parcel over a caller-owned buffer.
//!
//! Every integer is written in network byte order. Strings, byte vectors and
//! `u64` vectors carry a `u32` length header and are padded so the whole field
//! (header included) spans a multiple of eight bytes. [`Parcel::eight_byte_align`]
//! advances the cursor to the next absolute 8-byte boundary.
//!
//! The first failing operation poisons the parcel: every later operation
//! returns [`CodecError::Poisoned`] without touching the buffer, so a chain of
//! writes can be checked once through [`Parcel::status`].

use crate::error::{CodecError, CodecResult};

/// Encoded size of a `u32`.
pub const U32_LEN: usize = 4;
/// Encoded size of an `i32`.
pub const I32_LEN: usize = 4;
/// Encoded size of a `u64`.
pub const U64_LEN: usize = 8;

/// Largest length any field or message may reach.
pub const MAX_ENCODED_LEN: u64 = i32::MAX as u64;

const ALIGN: u64 = 8;

/// Rounds `len` up to the next multiple of eight.
#[inline]
pub const fn align8(len: usize) -> usize {
    (len + (ALIGN as usize - 1)) & !(ALIGN as usize - 1)
}

#[inline]
const fn align8_u64(len: u64) -> u64 {
    (len + (ALIGN - 1)) & !(ALIGN - 1)
}

/// Encoded size of a length-prefixed byte vector holding `len` bytes.
#[inline]
pub const fn bytes_len(len: usize) -> usize {
    align8(U32_LEN + len)
}

/// Encoded size of a length-prefixed string.
#[inline]
pub fn string_len(value: &str) -> usize {
    bytes_len(value.len())
}

/// Encoded size of a `u64` vector holding `count` values.
#[inline]
pub const fn u64_vec_len(count: usize) -> usize {
    align8(U32_LEN + count * U64_LEN)
}

fn checked_len(len: u64) -> CodecResult<usize> {
    if len > MAX_ENCODED_LEN {
        return Err(CodecError::LengthOverflow { len });
    }
    usize::try_from(len).map_err(|_| CodecError::LengthOverflow { len })
}

/// Destination for an encoding pass.
///
/// Wire structures are written once against this trait. Running the same
/// routine against a [`LenCounter`] yields the exact size a [`Parcel`] needs.
pub trait ParcelSink {
    /// Writes a big-endian `u32`.
    fn write_u32(&mut self, value: u32) -> CodecResult<()>;

    /// Writes a big-endian `i32`.
    fn write_i32(&mut self, value: i32) -> CodecResult<()>;

    /// Writes a big-endian `u64`.
    fn write_u64(&mut self, value: u64) -> CodecResult<()>;

    /// Writes a length-prefixed, padded byte vector.
    fn write_bytes(&mut self, value: &[u8]) -> CodecResult<()>;

    /// Writes a length-prefixed, padded UTF-8 string.
    fn write_string(&mut self, value: &str) -> CodecResult<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Writes a count-prefixed, padded vector of `u64`.
    fn write_u64_vec(&mut self, values: &[u64]) -> CodecResult<()>;

    /// Advances to the next 8-byte boundary.
    fn eight_byte_align(&mut self) -> CodecResult<()>;
}

/// Counts the bytes an encoding pass would produce.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LenCounter {
    len: u64,
}

impl LenCounter {
    /// Creates a counter positioned at offset zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes counted so far.
    pub fn len(&self) -> usize {
        // Bounded by MAX_ENCODED_LEN on every step.
        self.len as usize
    }

    /// Returns true if nothing was counted.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn add(&mut self, step: u64) -> CodecResult<()> {
        let len = self.len.saturating_add(step);
        if len > MAX_ENCODED_LEN {
            return Err(CodecError::LengthOverflow { len });
        }
        self.len = len;
        Ok(())
    }
}

impl ParcelSink for LenCounter {
    fn write_u32(&mut self, _value: u32) -> CodecResult<()> {
        self.add(U32_LEN as u64)
    }

    fn write_i32(&mut self, _value: i32) -> CodecResult<()> {
        self.add(I32_LEN as u64)
    }

    fn write_u64(&mut self, _value: u64) -> CodecResult<()> {
        self.add(U64_LEN as u64)
    }

    fn write_bytes(&mut self, value: &[u8]) -> CodecResult<()> {
        let field = (U32_LEN as u64).saturating_add(value.len() as u64);
        checked_len(field)?;
        self.add(align8_u64(field))
    }

    fn write_u64_vec(&mut self, values: &[u64]) -> CodecResult<()> {
        let field = (values.len() as u64)
            .saturating_mul(U64_LEN as u64)
            .saturating_add(U32_LEN as u64);
        checked_len(field)?;
        self.add(align8_u64(field))
    }

    fn eight_byte_align(&mut self) -> CodecResult<()> {
        let aligned = align8_u64(self.len);
        self.add(aligned - self.len)
    }
}

/// A cursor over a fixed byte buffer.
#[derive(Debug)]
pub struct Parcel<B> {
    buf: B,
    pos: usize,
    error: Option<CodecError>,
}

impl<B: AsRef<[u8]>> Parcel<B> {
    /// Creates a parcel over `buf`. An empty buffer yields a poisoned parcel.
    pub fn new(buf: B) -> Self {
        let error = buf.as_ref().is_empty().then_some(CodecError::EmptyBuffer);
        Self { buf, pos: 0, error }
    }

    /// Returns true once any operation has failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The failure that poisoned this parcel, if any.
    pub fn error(&self) -> Option<&CodecError> {
        self.error.as_ref()
    }

    /// `Ok(())` while the parcel is healthy, otherwise the first failure.
    pub fn status(&self) -> CodecResult<()> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Current cursor offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Total buffer length.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().len()
    }

    /// Bytes between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.pos
    }

    /// Consumes the parcel and returns the buffer.
    pub fn into_inner(self) -> B {
        self.buf
    }

    fn guard(&self) -> CodecResult<()> {
        if self.error.is_some() {
            Err(CodecError::Poisoned)
        } else {
            Ok(())
        }
    }

    fn poison<T>(&mut self, err: CodecError) -> CodecResult<T> {
        if self.error.is_none() {
            self.error = Some(err.clone());
        }
        Err(err)
    }

    fn checked(&mut self, len: u64) -> CodecResult<usize> {
        match checked_len(len) {
            Ok(len) => Ok(len),
            Err(err) => self.poison(err),
        }
    }

    /// Claims `step` bytes for reading and returns their start offset.
    fn consume(&mut self, step: usize) -> CodecResult<usize> {
        self.guard()?;
        let remaining = self.remaining();
        if step > remaining {
            return self.poison(CodecError::UnexpectedEof {
                needed: step,
                remaining,
            });
        }
        let start = self.pos;
        self.pos += step;
        Ok(start)
    }

    fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let start = self.consume(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf.as_ref()[start..start + N]);
        Ok(out)
    }

    /// Reads a big-endian `u32`.
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        self.read_array().map(u32::from_be_bytes)
    }

    /// Reads a big-endian `i32`.
    pub fn read_i32(&mut self) -> CodecResult<i32> {
        self.read_array().map(i32::from_be_bytes)
    }

    /// Reads a big-endian `u64`.
    pub fn read_u64(&mut self) -> CodecResult<u64> {
        self.read_array().map(u64::from_be_bytes)
    }

    /// Reads a length-prefixed byte vector and skips its padding.
    pub fn read_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.read_u32()?;
        let len = self.checked(U32_LEN as u64 + u64::from(len))? - U32_LEN;
        let step = bytes_len(len) - U32_LEN;
        let start = self.consume(step)?;
        Ok(self.buf.as_ref()[start..start + len].to_vec())
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> CodecResult<String> {
        let bytes = self.read_bytes()?;
        match String::from_utf8(bytes) {
            Ok(value) => Ok(value),
            Err(_) => self.poison(CodecError::InvalidUtf8),
        }
    }

    /// Reads a count-prefixed `u64` vector.
    pub fn read_u64_vec(&mut self) -> CodecResult<Vec<u64>> {
        let count = self.read_u32()?;
        let payload = self.checked(u64::from(count) * U64_LEN as u64 + U32_LEN as u64)? - U32_LEN;
        let step = align8(U32_LEN + payload) - U32_LEN;
        let start = self.consume(step)?;
        let values = self.buf.as_ref()[start..start + payload]
            .chunks_exact(U64_LEN)
            .map(|chunk| {
                let mut raw = [0u8; U64_LEN];
                raw.copy_from_slice(chunk);
                u64::from_be_bytes(raw)
            })
            .collect();
        Ok(values)
    }

    /// Fills `out` from the buffer without a length header.
    ///
    /// The cursor advances by `min(align8(out.len()), remaining)`.
    pub fn read_blob(&mut self, out: &mut [u8]) -> CodecResult<()> {
        self.guard()?;
        let len = self.checked(out.len() as u64)?;
        let remaining = self.remaining();
        if len > remaining {
            return self.poison(CodecError::UnexpectedEof {
                needed: len,
                remaining,
            });
        }
        out.copy_from_slice(&self.buf.as_ref()[self.pos..self.pos + len]);
        self.pos += align8(len).min(remaining);
        Ok(())
    }

    /// Moves the cursor to the next absolute 8-byte boundary.
    ///
    /// The cursor stops at the end of the buffer if the boundary lies beyond it.
    pub fn eight_byte_align(&mut self) -> CodecResult<()> {
        self.guard()?;
        self.pos = align8(self.pos).min(self.capacity());
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Parcel<B> {
    /// Claims `step` bytes for writing and returns their start offset.
    fn reserve(&mut self, step: usize) -> CodecResult<usize> {
        self.guard()?;
        let remaining = self.remaining();
        if step > remaining {
            return self.poison(CodecError::OutOfSpace {
                needed: step,
                remaining,
            });
        }
        let start = self.pos;
        self.pos += step;
        Ok(start)
    }

    fn put(&mut self, raw: &[u8]) -> CodecResult<()> {
        let start = self.reserve(raw.len())?;
        self.buf.as_mut()[start..start + raw.len()].copy_from_slice(raw);
        Ok(())
    }

    /// Writes `value` without a length header, padded to eight bytes where
    /// room allows.
    pub fn write_blob(&mut self, value: &[u8]) -> CodecResult<()> {
        self.guard()?;
        let len = self.checked(value.len() as u64)?;
        let remaining = self.remaining();
        if len > remaining {
            return self.poison(CodecError::OutOfSpace {
                needed: len,
                remaining,
            });
        }
        let step = align8(len).min(remaining);
        let start = self.reserve(step)?;
        let region = &mut self.buf.as_mut()[start..start + step];
        region[..len].copy_from_slice(value);
        region[len..].fill(0);
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> ParcelSink for Parcel<B> {
    fn write_u32(&mut self, value: u32) -> CodecResult<()> {
        self.put(&value.to_be_bytes())
    }

    fn write_i32(&mut self, value: i32) -> CodecResult<()> {
        self.put(&value.to_be_bytes())
    }

    fn write_u64(&mut self, value: u64) -> CodecResult<()> {
        self.put(&value.to_be_bytes())
    }

    fn write_bytes(&mut self, value: &[u8]) -> CodecResult<()> {
        self.guard()?;
        let field = self.checked(U32_LEN as u64 + value.len() as u64)?;
        let step = align8(field);
        let start = self.reserve(step)?;
        let region = &mut self.buf.as_mut()[start..start + step];
        // field <= i32::MAX, so the length fits the header
        region[..U32_LEN].copy_from_slice(&(value.len() as u32).to_be_bytes());
        region[U32_LEN..field].copy_from_slice(value);
        region[field..].fill(0);
        Ok(())
    }

    fn write_u64_vec(&mut self, values: &[u64]) -> CodecResult<()> {
        self.guard()?;
        let field = self.checked(values.len() as u64 * U64_LEN as u64 + U32_LEN as u64)?;
        let step = align8(field);
        let start = self.reserve(step)?;
        let region = &mut self.buf.as_mut()[start..start + step];
        region[..U32_LEN].copy_from_slice(&(values.len() as u32).to_be_bytes());
        for (chunk, value) in region[U32_LEN..field]
            .chunks_exact_mut(U64_LEN)
            .zip(values)
        {
            chunk.copy_from_slice(&value.to_be_bytes());
        }
        region[field..].fill(0);
        Ok(())
    }

    fn eight_byte_align(&mut self) -> CodecResult<()> {
        self.guard()?;
        let start = self.pos;
        let end = align8(start).min(self.capacity());
        self.buf.as_mut()[start..end].fill(0);
        self.pos = end;
        Ok(())
    }
}

/// Encodes with `write` into a buffer sized by a counting pass of the same routine.
pub fn encode_exact<F>(write: F) -> CodecResult<Vec<u8>>
where
    F: Fn(&mut dyn ParcelSink) -> CodecResult<()>,
{
    let mut counter = LenCounter::new();
    write(&mut counter)?;
    let mut parcel = Parcel::new(vec![0u8; counter.len()]);
    write(&mut parcel)?;
    parcel.status()?;
    if parcel.position() != counter.len() {
        return Err(CodecError::LengthMismatch {
            expected: counter.len(),
            actual: parcel.position(),
        });
    }
    Ok(parcel.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut parcel = Parcel::new(vec![0u8; 16]);
        parcel.write_u32(0x0102_0304).unwrap();
        parcel.write_i32(-2).unwrap();
        parcel.write_u64(0x0a0b).unwrap();
        let buf = parcel.into_inner();
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert_eq!(&buf[4..8], &[0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(&buf[8..], &[0, 0, 0, 0, 0, 0, 0x0a, 0x0b]);

        let mut parcel = Parcel::new(buf);
        assert_eq!(parcel.read_u32().unwrap(), 0x0102_0304);
        assert_eq!(parcel.read_i32().unwrap(), -2);
        assert_eq!(parcel.read_u64().unwrap(), 0x0a0b);
        assert_eq!(parcel.remaining(), 0);
    }

    #[test]
    fn string_field_is_padded_to_eight() {
        let mut parcel = Parcel::new(vec![0u8; 32]);
        parcel.write_string("abcde").unwrap();
        assert_eq!(parcel.position(), 16);
        parcel.write_string("").unwrap();
        assert_eq!(parcel.position(), 24);

        let mut parcel = Parcel::new(parcel.into_inner());
        assert_eq!(parcel.read_string().unwrap(), "abcde");
        assert_eq!(parcel.position(), 16);
        assert_eq!(parcel.read_string().unwrap(), "");
        assert_eq!(parcel.position(), 24);
    }

    #[test]
    fn u64_vec_roundtrip() {
        let values = vec![7, u64::MAX, 0];
        let mut parcel = Parcel::new(vec![0u8; u64_vec_len(values.len())]);
        parcel.write_u64_vec(&values).unwrap();
        assert_eq!(parcel.remaining(), 0);

        let mut parcel = Parcel::new(parcel.into_inner());
        assert_eq!(parcel.read_u64_vec().unwrap(), values);
    }

    #[test]
    fn align_moves_to_absolute_boundary() {
        let mut parcel = Parcel::new(vec![0u8; 16]);
        parcel.write_u32(1).unwrap();
        parcel.eight_byte_align().unwrap();
        assert_eq!(parcel.position(), 8);
        parcel.eight_byte_align().unwrap();
        assert_eq!(parcel.position(), 8);
    }

    #[test]
    fn align_clamps_at_buffer_end() {
        let mut parcel = Parcel::new(vec![0u8; 6]);
        parcel.write_u32(1).unwrap();
        parcel.eight_byte_align().unwrap();
        assert_eq!(parcel.position(), 6);
        assert!(!parcel.is_error());
    }

    #[test]
    fn empty_buffer_is_poisoned() {
        let mut parcel = Parcel::new(Vec::new());
        assert!(parcel.is_error());
        assert_eq!(parcel.status(), Err(CodecError::EmptyBuffer));
        assert_eq!(parcel.read_u32(), Err(CodecError::Poisoned));
    }

    #[test]
    fn poisoned_parcel_leaves_buffer_untouched() {
        let mut parcel = Parcel::new(vec![0xA5u8; 12]);
        parcel.write_u64(1).unwrap();
        assert!(parcel.write_u64(2).is_err());
        assert!(parcel.is_error());

        assert_eq!(parcel.write_u32(3), Err(CodecError::Poisoned));
        assert_eq!(parcel.write_string("x"), Err(CodecError::Poisoned));
        assert_eq!(parcel.eight_byte_align(), Err(CodecError::Poisoned));
        assert_eq!(parcel.position(), 8);

        let buf = parcel.into_inner();
        assert_eq!(&buf[8..], &[0xA5; 4]);
    }

    #[test]
    fn read_past_end_poisons() {
        let mut parcel = Parcel::new(vec![0u8; 4]);
        assert!(matches!(
            parcel.read_u64(),
            Err(CodecError::UnexpectedEof { needed: 8, remaining: 4 })
        ));
        assert_eq!(parcel.read_u32(), Err(CodecError::Poisoned));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = vec![0u8; 16];
        buf[..4].copy_from_slice(&0x8000_0000u32.to_be_bytes());
        let mut parcel = Parcel::new(buf);
        assert!(matches!(
            parcel.read_bytes(),
            Err(CodecError::LengthOverflow { .. })
        ));
        assert!(parcel.is_error());
    }

    #[test]
    fn length_prefix_beyond_buffer_is_rejected() {
        let mut buf = vec![0u8; 16];
        buf[..4].copy_from_slice(&64u32.to_be_bytes());
        let mut parcel = Parcel::new(buf);
        assert!(matches!(
            parcel.read_bytes(),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut parcel = Parcel::new(vec![0u8; 8]);
        parcel.write_bytes(&[0xff, 0xfe]).unwrap();
        let mut parcel = Parcel::new(parcel.into_inner());
        assert_eq!(parcel.read_string(), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn blob_advances_by_padded_length() {
        let mut parcel = Parcel::new(vec![0u8; 12]);
        parcel.write_blob(&[1, 2, 3]).unwrap();
        assert_eq!(parcel.position(), 8);
        parcel.write_blob(&[4, 5, 6]).unwrap();
        assert_eq!(parcel.position(), 12);

        let mut parcel = Parcel::new(parcel.into_inner());
        let mut first = [0u8; 3];
        parcel.read_blob(&mut first).unwrap();
        assert_eq!(first, [1, 2, 3]);
        let mut second = [0u8; 2];
        parcel.read_blob(&mut second).unwrap();
        assert_eq!(second, [4, 5]);
        assert_eq!(parcel.remaining(), 0);
    }

    #[test]
    fn counter_matches_parcel() {
        let write = |sink: &mut dyn ParcelSink| {
            sink.write_u32(3)?;
            sink.write_string("device")?;
            sink.write_u64(9)?;
            sink.write_u64_vec(&[1, 2])?;
            sink.write_i32(-1)?;
            sink.eight_byte_align()
        };
        let bytes = encode_exact(write).unwrap();
        assert_eq!(bytes.len(), 4 + 16 + 8 + 24 + 4);
        assert_eq!(bytes.len() % 8, 0);
    }

    #[test]
    fn length_helpers() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(bytes_len(0), 8);
        assert_eq!(bytes_len(4), 8);
        assert_eq!(bytes_len(5), 16);
        assert_eq!(string_len("abc"), 8);
        assert_eq!(u64_vec_len(1), 16);
    }
}
