//! Append-only byte buffers with position-tracked decoding.
//!
//! A `ByteStream` is the serialization medium for everything duscan puts on
//! the wire: appenders push raw bytes, NUL-terminated strings, and fixed-width
//! integers; a `Decoder` walks the same framing back out, counting fields so a
//! malformed stream can report exactly which field failed to decode.
//!
//! Multi-byte integers are written in host order unless the stream was created
//! with `Options::LITTLE_ENDIAN`, in which case they are little-endian on the
//! wire regardless of the host.

use bytes::{Bytes, BytesMut};
use snafu::Snafu;

/// Behavior flags for a stream, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options(u8);

impl Options {
    pub const NONE: Options = Options(0);
    /// The stream never accepts appends or resizing.
    pub const IMMUTABLE: Options = Options(1 << 0);
    /// Multi-byte integers are framed little-endian instead of host order.
    pub const LITTLE_ENDIAN: Options = Options(1 << 1);

    // Callers may only request endianness; immutability is implied by the
    // constructor used.
    const USER_MASK: u8 = Options::LITTLE_ENDIAN.0;

    pub const fn contains(self, other: Options) -> bool {
        (self.0 & other.0) == other.0
    }

    const fn user(self) -> Options {
        Options(self.0 & Options::USER_MASK)
    }

    const fn with(self, other: Options) -> Options {
        Options(self.0 | other.0)
    }
}

/// Errors from operations that mutate a stream.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum StreamError {
    #[snafu(display("stream is immutable"))]
    Immutable,
}

/// Errors from `Decoder` accessors. `field` is the zero-based index of the
/// decode step that failed, counting every successful accessor call before it.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum DecodeError {
    #[snafu(display(
        "field {field} runs past the end of the stream ({needed} byte(s) needed, {remaining} left)"
    ))]
    OutOfBounds {
        field: usize,
        needed: usize,
        remaining: usize,
    },
    #[snafu(display("field {field} is a string with no terminator"))]
    MissingNul { field: usize },
}

enum Repr {
    Owned(BytesMut),
    Shared(Bytes),
}

/// A growable byte buffer with framed append and decode operations.
pub struct ByteStream {
    repr: Repr,
    options: Options,
    capacity: usize,
}

// Growth follows a fixed ladder of small sizes, then doubles.
const CAPACITY_LADDER: &[usize] = &[24, 48, 64, 128, 256, 384, 512, 768, 1024, 2048, 4096];

fn grow_capacity(current: usize, requested: usize) -> usize {
    let mut capacity = current;
    while capacity < requested {
        capacity = match CAPACITY_LADDER.iter().find(|&&step| step > capacity) {
            Some(&step) => step,
            None => capacity.checked_mul(2).unwrap_or(usize::MAX),
        };
    }
    capacity
}

impl ByteStream {
    /// An empty, growable stream with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize, options: Options) -> Self {
        ByteStream {
            repr: Repr::Owned(BytesMut::with_capacity(capacity)),
            options: options.user(),
            capacity,
        }
    }

    /// Wrap an existing buffer without copying. The stream is decode-only.
    pub fn from_bytes(bytes: Bytes, options: Options) -> Self {
        let capacity = bytes.len();
        ByteStream {
            repr: Repr::Shared(bytes),
            options: options.user().with(Options::IMMUTABLE),
            capacity,
        }
    }

    /// A growable stream seeded with a copy of `initial`.
    pub fn from_slice(capacity: usize, options: Options, initial: &[u8]) -> Self {
        let mut stream = ByteStream::with_capacity(capacity.max(initial.len()), options);
        stream
            .append(initial)
            .unwrap_or_else(|_| unreachable!("freshly constructed streams are mutable"));
        stream
    }

    pub fn options(&self) -> Options {
        self.options
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Owned(buf) => buf.len(),
            Repr::Shared(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            Repr::Owned(buf) => buf,
            Repr::Shared(bytes) => bytes,
        }
    }

    fn buf_mut(&mut self) -> Result<&mut BytesMut, StreamError> {
        if self.options.contains(Options::IMMUTABLE) {
            return Err(StreamError::Immutable);
        }
        match &mut self.repr {
            Repr::Owned(buf) => Ok(buf),
            Repr::Shared(_) => Err(StreamError::Immutable),
        }
    }

    fn reserve_for(&mut self, additional: usize) -> Result<(), StreamError> {
        if self.options.contains(Options::IMMUTABLE) {
            return Err(StreamError::Immutable);
        }
        let needed = self.len() + additional;
        if needed > self.capacity {
            self.capacity = grow_capacity(self.capacity, needed);
        }
        let capacity = self.capacity;
        let buf = self.buf_mut()?;
        buf.reserve(capacity - buf.len());
        Ok(())
    }

    /// Grow capacity to at least `capacity`; zero asks for the next ladder
    /// step. Capacity never shrinks.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), StreamError> {
        let target = if capacity == 0 {
            grow_capacity(self.capacity, self.capacity + 1)
        } else {
            capacity
        };
        if target > self.capacity {
            self.capacity = grow_capacity(self.capacity, target);
            let additional = self.capacity;
            let buf = self.buf_mut()?;
            buf.reserve(additional - buf.len());
        } else {
            // Still reject the call on an immutable stream.
            self.buf_mut()?;
        }
        Ok(())
    }

    /// Force the length. Growing fills the new tail with `fill_byte`;
    /// afterwards `len() <= capacity()` always holds.
    pub fn set_len(&mut self, length: usize, fill_byte: u8) -> Result<(), StreamError> {
        let current = self.len();
        if length > current {
            self.reserve_for(length - current)?;
            let buf = self.buf_mut()?;
            buf.resize(length, fill_byte);
        } else {
            let buf = self.buf_mut()?;
            buf.truncate(length);
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), StreamError> {
        self.set_len(0, 0)
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.reserve_for(bytes.len())?;
        self.buf_mut()?.extend_from_slice(bytes);
        Ok(())
    }

    /// Append several buffers back to back. On success all of them land in
    /// order; capacity is grown once up front.
    pub fn append_all(&mut self, buffers: &[&[u8]]) -> Result<(), StreamError> {
        let total: usize = buffers.iter().map(|b| b.len()).sum();
        self.reserve_for(total)?;
        let buf = self.buf_mut()?;
        for bytes in buffers {
            buf.extend_from_slice(bytes);
        }
        Ok(())
    }

    /// Append the bytes of `cstr` followed by a single NUL.
    pub fn append_cstring(&mut self, cstr: &[u8]) -> Result<(), StreamError> {
        self.append_all(&[cstr, &[0u8]])
    }

    pub fn append_u8(&mut self, v: u8) -> Result<(), StreamError> {
        self.append(&[v])
    }

    pub fn append_u16(&mut self, v: u16) -> Result<(), StreamError> {
        if self.options.contains(Options::LITTLE_ENDIAN) {
            self.append(&v.to_le_bytes())
        } else {
            self.append(&v.to_ne_bytes())
        }
    }

    pub fn append_u32(&mut self, v: u32) -> Result<(), StreamError> {
        if self.options.contains(Options::LITTLE_ENDIAN) {
            self.append(&v.to_le_bytes())
        } else {
            self.append(&v.to_ne_bytes())
        }
    }

    pub fn append_u64(&mut self, v: u64) -> Result<(), StreamError> {
        if self.options.contains(Options::LITTLE_ENDIAN) {
            self.append(&v.to_le_bytes())
        } else {
            self.append(&v.to_ne_bytes())
        }
    }

    pub fn append_i32(&mut self, v: i32) -> Result<(), StreamError> {
        self.append_u32(v as u32)
    }

    /// Start decoding from the front of the stream.
    pub fn decoder(&self) -> Decoder<'_> {
        Decoder {
            buf: self.as_slice(),
            little_endian: self.options.contains(Options::LITTLE_ENDIAN),
            idx: 0,
            field: 0,
        }
    }

    /// Emit a hex dump of the stream contents at debug level.
    pub fn summary(&self) {
        use std::fmt::Write as _;

        let data = self.as_slice();
        tracing::debug!(
            capacity = self.capacity,
            length = data.len(),
            options = self.options.0,
            "byte stream"
        );
        for row in data.chunks(16) {
            let mut line = String::with_capacity(80);
            let offset = (row.as_ptr() as usize) - (data.as_ptr() as usize);
            let _ = write!(line, "    {offset:08X} : ");
            for (i, byte) in row.iter().enumerate() {
                if i == 8 {
                    line.push_str("   ");
                }
                let _ = write!(line, "{byte:02X} ");
            }
            for i in row.len()..16 {
                line.push_str(if i == 8 { "      " } else { "   " });
            }
            line.push_str("   ");
            for byte in row {
                line.push(if byte.is_ascii_graphic() || *byte == b' ' {
                    *byte as char
                } else {
                    '.'
                });
            }
            tracing::debug!("{}", line);
        }
    }
}

/// Cursor over a stream's bytes. Every accessor advances the cursor on
/// success and increments the field counter; the first failure reports the
/// counter and leaves the cursor where the last success put it.
pub struct Decoder<'a> {
    buf: &'a [u8],
    little_endian: bool,
    idx: usize,
    field: usize,
}

impl<'a> Decoder<'a> {
    pub fn position(&self) -> usize {
        self.idx
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.idx
    }

    /// Index of the next field to decode.
    pub fn field(&self) -> usize {
        self.field
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < needed {
            return Err(DecodeError::OutOfBounds {
                field: self.field,
                needed,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.buf[self.idx..self.idx + needed];
        self.idx += needed;
        self.field += 1;
        Ok(bytes)
    }

    /// The next `len` raw bytes.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.take(len)
    }

    /// Bytes up to (excluding) the next NUL; the NUL itself is consumed.
    pub fn cstring(&mut self) -> Result<&'a [u8], DecodeError> {
        let rest = &self.buf[self.idx..];
        match rest.iter().position(|&b| b == 0) {
            Some(nul) => {
                self.idx += nul + 1;
                self.field += 1;
                Ok(&rest[..nul])
            }
            None => Err(DecodeError::MissingNul { field: self.field }),
        }
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let raw = self.take(2)?.try_into().expect("sized take");
        Ok(if self.little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_ne_bytes(raw)
        })
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?.try_into().expect("sized take");
        Ok(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_ne_bytes(raw)
        })
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let raw = self.take(8)?.try_into().expect("sized take");
        Ok(if self.little_endian {
            u64::from_le_bytes(raw)
        } else {
            u64::from_ne_bytes(raw)
        })
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        self.u32().map(|v| v as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip_little_endian() {
        let mut stream = ByteStream::with_capacity(8, Options::LITTLE_ENDIAN);
        stream.append_u8(0xAB).unwrap();
        stream.append_u16(0xBEEF).unwrap();
        stream.append_u32(0xDEAD_BEEF).unwrap();
        stream.append_u64(0x0123_4567_89AB_CDEF).unwrap();

        // Wire bytes are little-endian no matter the host.
        assert_eq!(&stream.as_slice()[1..3], &[0xEF, 0xBE]);

        let mut decoder = stream.decoder();
        assert_eq!(decoder.u8().unwrap(), 0xAB);
        assert_eq!(decoder.u16().unwrap(), 0xBEEF);
        assert_eq!(decoder.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(decoder.u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn integers_round_trip_host_order() {
        let mut stream = ByteStream::with_capacity(4, Options::NONE);
        stream.append_u32(0x1122_3344).unwrap();
        assert_eq!(stream.as_slice(), 0x1122_3344u32.to_ne_bytes());
        assert_eq!(stream.decoder().u32().unwrap(), 0x1122_3344);
    }

    #[test]
    fn capacity_follows_the_ladder() {
        let mut stream = ByteStream::with_capacity(4, Options::NONE);
        stream.append(&[0u8; 5]).unwrap();
        assert_eq!(stream.capacity(), 24);
        stream.append(&[0u8; 20]).unwrap();
        assert_eq!(stream.capacity(), 48);
        stream.set_len(5000, 0).unwrap();
        assert_eq!(stream.capacity(), 8192);
        assert!(stream.len() <= stream.capacity());
    }

    #[test]
    fn set_len_fills_and_truncates() {
        let mut stream = ByteStream::with_capacity(8, Options::NONE);
        stream.append(&[1, 2, 3]).unwrap();
        stream.set_len(6, 0xFF).unwrap();
        assert_eq!(stream.as_slice(), &[1, 2, 3, 0xFF, 0xFF, 0xFF]);
        stream.set_len(2, 0).unwrap();
        assert_eq!(stream.as_slice(), &[1, 2]);
        stream.reset().unwrap();
        assert!(stream.is_empty());
    }

    #[test]
    fn shared_streams_reject_mutation() {
        let mut stream = ByteStream::from_bytes(Bytes::from_static(b"abc"), Options::NONE);
        assert_eq!(stream.append(b"x"), Err(StreamError::Immutable));
        assert_eq!(stream.set_len(10, 0), Err(StreamError::Immutable));
        assert_eq!(stream.as_slice(), b"abc");
        assert!(stream.options().contains(Options::IMMUTABLE));
    }

    #[test]
    fn append_all_lands_in_order() {
        let mut stream = ByteStream::with_capacity(0, Options::NONE);
        stream.append_all(&[b"/", b"usr", b"/", b"lib"]).unwrap();
        assert_eq!(stream.as_slice(), b"/usr/lib");
    }

    #[test]
    fn cstring_round_trip_with_non_ascii() {
        let name = "caf\u{e9}-\u{2603}".as_bytes();
        let mut stream = ByteStream::with_capacity(0, Options::NONE);
        stream.append_cstring(name).unwrap();
        stream.append_u8(7).unwrap();

        let mut decoder = stream.decoder();
        assert_eq!(decoder.cstring().unwrap(), name);
        assert_eq!(decoder.u8().unwrap(), 7);
    }

    #[test]
    fn cstring_without_terminator_fails() {
        let stream = ByteStream::from_slice(0, Options::NONE, b"no nul here");
        let mut decoder = stream.decoder();
        assert_eq!(decoder.cstring(), Err(DecodeError::MissingNul { field: 0 }));
    }

    #[test]
    fn decode_failure_names_the_field() {
        let mut stream = ByteStream::with_capacity(0, Options::LITTLE_ENDIAN);
        stream.append_u32(1).unwrap();
        stream.append_u32(2).unwrap();
        stream.append_u8(3).unwrap();

        let mut decoder = stream.decoder();
        decoder.u32().unwrap();
        decoder.u32().unwrap();
        let err = decoder.u64().unwrap_err();
        assert_eq!(
            err,
            DecodeError::OutOfBounds {
                field: 2,
                needed: 8,
                remaining: 1
            }
        );
        // Nothing past the last success was consumed.
        assert_eq!(decoder.position(), 8);
    }

    #[test]
    fn short_read_does_not_consume() {
        let stream = ByteStream::from_slice(0, Options::NONE, &[1, 2]);
        let mut decoder = stream.decoder();
        assert!(decoder.u32().is_err());
        assert_eq!(decoder.position(), 0);
        assert_eq!(decoder.u16().unwrap(), u16::from_ne_bytes([1, 2]));
    }
}
