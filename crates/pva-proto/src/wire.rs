//! Byte-level primitives: cursors with negotiated byte order, the PVA
//! size encoding, strings, and alignment padding.
//!
//! Every multi-byte integer on the wire is read and written in the byte
//! order carried by the enclosing message header, so the cursor types take
//! a runtime [`ByteOrder`] instead of baking one in at compile time.

use crate::errors::{ProtocolError, Result};

/// Byte order negotiated per connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first (network order).
    Big,
}

impl ByteOrder {
    /// The byte order of the machine we are running on.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") { Self::Big } else { Self::Little }
    }

    /// The opposite order.
    pub fn flipped(self) -> Self {
        match self {
            Self::Little => Self::Big,
            Self::Big => Self::Little,
        }
    }
}

/// Marker for a null size (absent value) in the PVA size encoding.
const SIZE_NULL: u8 = 0xFF;

/// Marker for a 32-bit extended size in the PVA size encoding.
const SIZE_EXTENDED: u8 = 0xFE;

macro_rules! put_int {
    ($name:ident, $ty:ty) => {
        /// Append an integer in the cursor's byte order.
        pub fn $name(&mut self, v: $ty) {
            match self.order {
                ByteOrder::Little => self.dst.extend_from_slice(&v.to_le_bytes()),
                ByteOrder::Big => self.dst.extend_from_slice(&v.to_be_bytes()),
            }
        }
    };
}

macro_rules! get_int {
    ($name:ident, $ty:ty, $n:expr) => {
        /// Read an integer in the cursor's byte order.
        pub fn $name(&mut self) -> Result<$ty> {
            let raw: [u8; $n] = self.take($n)?.try_into().map_err(|_| {
                ProtocolError::BufferExhausted { needed: $n, remaining: 0 }
            })?;
            Ok(match self.order {
                ByteOrder::Little => <$ty>::from_le_bytes(raw),
                ByteOrder::Big => <$ty>::from_be_bytes(raw),
            })
        }
    };
}

/// Append-only write cursor over a `Vec<u8>`.
///
/// Positions are relative to where the writer was created, so alignment is
/// computed from the start of the message body regardless of any header
/// bytes already in the buffer.
pub struct Writer<'a> {
    dst: &'a mut Vec<u8>,
    start: usize,
    order: ByteOrder,
}

impl<'a> Writer<'a> {
    /// Start writing at the current end of `dst`.
    pub fn new(dst: &'a mut Vec<u8>, order: ByteOrder) -> Self {
        let start = dst.len();
        Self { dst, start, order }
    }

    /// Bytes written through this cursor so far.
    pub fn pos(&self) -> usize {
        self.dst.len() - self.start
    }

    /// Byte order this cursor writes in.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Append one raw byte.
    pub fn put_u8(&mut self, v: u8) {
        self.dst.push(v);
    }

    /// Append one signed byte.
    pub fn put_i8(&mut self, v: i8) {
        self.dst.push(v as u8);
    }

    /// Append a boolean as a single byte (0 or 1).
    pub fn put_bool(&mut self, v: bool) {
        self.dst.push(u8::from(v));
    }

    put_int!(put_u16, u16);
    put_int!(put_i16, i16);
    put_int!(put_u32, u32);
    put_int!(put_i32, i32);
    put_int!(put_u64, u64);
    put_int!(put_i64, i64);

    /// Append an IEEE-754 single in the cursor's byte order.
    pub fn put_f32(&mut self, v: f32) {
        self.put_u32(v.to_bits());
    }

    /// Append an IEEE-754 double in the cursor's byte order.
    pub fn put_f64(&mut self, v: f64) {
        self.put_u64(v.to_bits());
    }

    /// Append raw bytes verbatim.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.dst.extend_from_slice(v);
    }

    /// Pad with zero bytes until the cursor position is a multiple of
    /// `alignment`.
    pub fn align(&mut self, alignment: usize) {
        debug_assert!(alignment.is_power_of_two());
        while self.pos() % alignment != 0 {
            self.dst.push(0);
        }
    }

    /// Append a size in the compact PVA encoding: one byte below 254,
    /// otherwise `0xFE` followed by a `u32`.
    pub fn put_size(&mut self, n: usize) {
        if n < usize::from(SIZE_EXTENDED) {
            self.put_u8(n as u8);
        } else {
            self.put_u8(SIZE_EXTENDED);
            self.put_u32(n as u32);
        }
    }

    /// Append an optional size; `None` encodes as the null marker.
    pub fn put_opt_size(&mut self, n: Option<usize>) {
        match n {
            None => self.put_u8(SIZE_NULL),
            Some(n) => self.put_size(n),
        }
    }

    /// Append a size-prefixed UTF-8 string.
    pub fn put_string(&mut self, s: &str) {
        self.put_size(s.len());
        self.dst.extend_from_slice(s.as_bytes());
    }
}

/// Read cursor over a borrowed byte slice.
pub struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Reader<'a> {
    /// Read from the start of `src`.
    pub fn new(src: &'a [u8], order: ByteOrder) -> Self {
        Self { src, pos: 0, order }
    }

    /// Bytes consumed so far.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes left in the buffer.
    pub fn remaining(&self) -> usize {
        self.src.len() - self.pos
    }

    /// Byte order this cursor reads in.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::BufferExhausted {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.src[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read one raw byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read one signed byte.
    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    /// Read a boolean byte; any non-zero value is `true`.
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    get_int!(get_u16, u16, 2);
    get_int!(get_i16, i16, 2);
    get_int!(get_u32, u32, 4);
    get_int!(get_i32, i32, 4);
    get_int!(get_u64, u64, 8);
    get_int!(get_i64, i64, 8);

    /// Read an IEEE-754 single.
    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.get_u32()?))
    }

    /// Read an IEEE-754 double.
    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// Borrow `n` raw bytes from the buffer.
    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Skip padding up to the next multiple of `alignment`. Padding byte
    /// content is ignored per the protocol contract.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        debug_assert!(alignment.is_power_of_two());
        let rem = self.pos % alignment;
        if rem == 0 {
            return Ok(());
        }
        let pad = alignment - rem;
        if self.remaining() < pad {
            return Err(ProtocolError::UnalignedData { offset: self.pos, alignment });
        }
        self.pos += pad;
        Ok(())
    }

    /// Read an optional size; the `0xFF` marker decodes as `None`.
    pub fn get_opt_size(&mut self) -> Result<Option<usize>> {
        let first = self.get_u8()?;
        match first {
            SIZE_NULL => Ok(None),
            SIZE_EXTENDED => Ok(Some(self.get_u32()? as usize)),
            n => Ok(Some(usize::from(n))),
        }
    }

    /// Read a size, rejecting the null marker.
    pub fn get_size(&mut self) -> Result<usize> {
        self.get_opt_size()?
            .ok_or(ProtocolError::InvalidEncoding("null size where a value is required"))
    }

    /// Read a size-prefixed UTF-8 string.
    pub fn get_string(&mut self) -> Result<String> {
        let n = self.get_size()?;
        let raw = self.take(n)?;
        Ok(std::str::from_utf8(raw)?.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_integers_both_orders() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let mut buf = Vec::new();
            let mut w = Writer::new(&mut buf, order);
            w.put_u16(0xBEEF);
            w.put_i32(-7);
            w.put_u64(0x0123_4567_89AB_CDEF);
            w.put_f64(2.5);

            let mut r = Reader::new(&buf, order);
            assert_eq!(r.get_u16().unwrap(), 0xBEEF);
            assert_eq!(r.get_i32().unwrap(), -7);
            assert_eq!(r.get_u64().unwrap(), 0x0123_4567_89AB_CDEF);
            assert_eq!(r.get_f64().unwrap(), 2.5);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn size_encoding_boundaries() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, ByteOrder::Big);
        w.put_size(0);
        w.put_size(253);
        w.put_size(254);
        w.put_size(70_000);
        w.put_opt_size(None);

        let mut r = Reader::new(&buf, ByteOrder::Big);
        assert_eq!(r.get_size().unwrap(), 0);
        assert_eq!(r.get_size().unwrap(), 253);
        assert_eq!(r.get_size().unwrap(), 254);
        assert_eq!(r.get_size().unwrap(), 70_000);
        assert_eq!(r.get_opt_size().unwrap(), None);
    }

    #[test]
    fn string_round_trip() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, ByteOrder::Little);
        w.put_string("epics:nt/NTScalar:1.0");
        w.put_string("");

        let mut r = Reader::new(&buf, ByteOrder::Little);
        assert_eq!(r.get_string().unwrap(), "epics:nt/NTScalar:1.0");
        assert_eq!(r.get_string().unwrap(), "");
    }

    #[test]
    fn alignment_pads_with_zeros_and_skips() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, ByteOrder::Big);
        w.put_u8(1);
        w.align(4);
        w.put_u32(42);
        assert_eq!(&buf[1..4], &[0, 0, 0]);

        let mut r = Reader::new(&buf, ByteOrder::Big);
        assert_eq!(r.get_u8().unwrap(), 1);
        r.align(4).unwrap();
        assert_eq!(r.get_u32().unwrap(), 42);
    }

    #[test]
    fn truncated_read_reports_exhaustion() {
        let buf = [0u8; 3];
        let mut r = Reader::new(&buf, ByteOrder::Big);
        assert!(matches!(
            r.get_u32(),
            Err(ProtocolError::BufferExhausted { needed: 4, remaining: 3 })
        ));
    }
}
