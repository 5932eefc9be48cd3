//! Structural serializer (`spec.md` §4.5).
//!
//! A record type is described, field by field, the way `tinybuf.h`'s
//! `tb_field_t` tables describe a C struct: required fields are raw bytes,
//! optional fields are a `has` byte then the value, repeated fields are a
//! `count` byte then that many values, one-ofs are a `tag` byte then the
//! selected variant's bytes, and submessages recurse. Rather than
//! interpreting a runtime field table (tinybuf's approach, needed because C
//! has no generics), each record type here implements [`Encode`]/[`Decode`]
//! directly — the `no_std` equivalent of a derive-generated serializer
//! (`spec.md` §9 explicitly prefers codegen from a schema over hand-written
//! field descriptors; with no proc-macro in the teacher's dependency stack,
//! writing the generated code by hand is the closest fit).
//!
//! Byte order is a call-time parameter ([`Endian`]): the wire protocol is
//! big-endian, on-device storage is little-endian, and both share this one
//! set of primitives.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// A bounded writer over a caller-owned byte slice. Every `put_*` fails with
/// [`Error::NoMemory`] rather than panicking if the slice is exhausted —
/// the same "no room, surface it, don't crash" posture as the rest of this
/// crate's bounded buffers.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8]> {
        if self.remaining() < n {
            return Err(Error::NoMemory);
        }
        let start = self.pos;
        self.pos += n;
        Ok(&mut self.buf[start..self.pos])
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<()> {
        self.put_bytes(&[v])
    }

    pub fn put_i8(&mut self, v: i8) -> Result<()> {
        self.put_u8(v as u8)
    }

    pub fn put_u16(&mut self, v: u16, endian: Endian) -> Result<()> {
        let bytes = match endian {
            Endian::Big => v.to_be_bytes(),
            Endian::Little => v.to_le_bytes(),
        };
        self.put_bytes(&bytes)
    }

    pub fn put_i16(&mut self, v: i16, endian: Endian) -> Result<()> {
        self.put_u16(v as u16, endian)
    }

    pub fn put_u32(&mut self, v: u32, endian: Endian) -> Result<()> {
        let bytes = match endian {
            Endian::Big => v.to_be_bytes(),
            Endian::Little => v.to_le_bytes(),
        };
        self.put_bytes(&bytes)
    }

    pub fn put_f32(&mut self, v: f32, endian: Endian) -> Result<()> {
        self.put_u32(v.to_bits(), endian)
    }

    /// Emits an `optional` field: one `has` byte, then the value iff present.
    pub fn put_optional<T>(
        &mut self,
        value: &Option<T>,
        endian: Endian,
        put: impl FnOnce(&mut Self, &T, Endian) -> Result<()>,
    ) -> Result<()> {
        match value {
            Some(v) => {
                self.put_u8(1)?;
                put(self, v, endian)
            }
            None => self.put_u8(0),
        }
    }

    /// Emits a `repeated` field: one `count` byte (the slice's length, which
    /// the caller is responsible for having bounded to the declared max via
    /// a `heapless::Vec<_, N>`), then that many values.
    pub fn put_repeated<T>(
        &mut self,
        values: &[T],
        endian: Endian,
        mut put: impl FnMut(&mut Self, &T, Endian) -> Result<()>,
    ) -> Result<()> {
        if values.len() > u8::MAX as usize {
            return Err(Error::InvalidParameter);
        }
        self.put_u8(values.len() as u8)?;
        for v in values {
            put(self, v, endian)?;
        }
        Ok(())
    }
}

/// A bounded reader over a caller-owned byte slice. Every `get_*` fails with
/// [`Error::InvalidData`] on an out-of-buffer read, matching `spec.md` §4.5
/// ("out-of-buffer ... surface as a single decode-failed error").
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::InvalidData);
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..self.pos])
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(self.get_u8()? as i8)
    }

    pub fn get_u16(&mut self, endian: Endian) -> Result<u16> {
        let bytes = self.take(2)?;
        let arr = [bytes[0], bytes[1]];
        Ok(match endian {
            Endian::Big => u16::from_be_bytes(arr),
            Endian::Little => u16::from_le_bytes(arr),
        })
    }

    pub fn get_i16(&mut self, endian: Endian) -> Result<i16> {
        Ok(self.get_u16(endian)? as i16)
    }

    pub fn get_u32(&mut self, endian: Endian) -> Result<u32> {
        let bytes = self.take(4)?;
        let arr = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok(match endian {
            Endian::Big => u32::from_be_bytes(arr),
            Endian::Little => u32::from_le_bytes(arr),
        })
    }

    pub fn get_f32(&mut self, endian: Endian) -> Result<f32> {
        Ok(f32::from_bits(self.get_u32(endian)?))
    }

    /// Parses an `optional` field; `get` is invoked only when `has == 1`.
    pub fn get_optional<T>(
        &mut self,
        endian: Endian,
        get: impl FnOnce(&mut Self, Endian) -> Result<T>,
    ) -> Result<Option<T>> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => Ok(Some(get(self, endian)?)),
            _ => Err(Error::InvalidData),
        }
    }

    /// Parses a `repeated` field into a bounded `heapless::Vec`. A `count`
    /// exceeding `N` is `Error::InvalidData` (`spec.md` §4.5: "count >
    /// declared max").
    pub fn get_repeated<T, const N: usize>(
        &mut self,
        endian: Endian,
        mut get: impl FnMut(&mut Self, Endian) -> Result<T>,
    ) -> Result<heapless::Vec<T, N>> {
        let count = self.get_u8()? as usize;
        if count > N {
            return Err(Error::InvalidData);
        }
        let mut out = heapless::Vec::new();
        for _ in 0..count {
            let v = get(self, endian)?;
            // Capacity was checked above; this cannot fail.
            let _ = out.push(v);
        }
        Ok(out)
    }
}

/// A record type that can serialize itself onto/from a byte buffer in a
/// caller-chosen endianness.
pub trait Codec: Sized {
    fn encode(&self, w: &mut Writer, endian: Endian) -> Result<()>;
    fn decode(r: &mut Reader, endian: Endian) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip_both_endians() {
        for endian in [Endian::Big, Endian::Little] {
            let mut buf = [0u8; 16];
            let mut w = Writer::new(&mut buf);
            w.put_u8(0xAB).unwrap();
            w.put_u16(0x1234, endian).unwrap();
            w.put_u32(0xDEAD_BEEF, endian).unwrap();
            w.put_f32(1.5, endian).unwrap();
            let n = w.position();

            let mut r = Reader::new(&buf[..n]);
            assert_eq!(r.get_u8().unwrap(), 0xAB);
            assert_eq!(r.get_u16(endian).unwrap(), 0x1234);
            assert_eq!(r.get_u32(endian).unwrap(), 0xDEAD_BEEF);
            assert_eq!(r.get_f32(endian).unwrap(), 1.5);
        }
    }

    #[test]
    fn big_and_little_endian_differ_on_wire() {
        let mut be = [0u8; 2];
        Writer::new(&mut be).put_u16(0x0102, Endian::Big).unwrap();
        let mut le = [0u8; 2];
        Writer::new(&mut le).put_u16(0x0102, Endian::Little).unwrap();
        assert_eq!(be, [0x01, 0x02]);
        assert_eq!(le, [0x02, 0x01]);
    }

    #[test]
    fn optional_round_trip() {
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        w.put_optional(&Some(7u8), Endian::Big, |w, v, _| w.put_u8(*v))
            .unwrap();
        w.put_optional(&None::<u8>, Endian::Big, |w, v, _| w.put_u8(*v))
            .unwrap();
        let n = w.position();

        let mut r = Reader::new(&buf[..n]);
        let a = r.get_optional(Endian::Big, |r, _| r.get_u8()).unwrap();
        let b = r.get_optional(Endian::Big, |r, _| r.get_u8()).unwrap();
        assert_eq!(a, Some(7));
        assert_eq!(b, None);
    }

    #[test]
    fn repeated_over_capacity_is_invalid_data() {
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        w.put_u8(3).unwrap();
        w.put_u8(1).unwrap();
        w.put_u8(2).unwrap();
        w.put_u8(3).unwrap();
        let n = w.position();

        let mut r = Reader::new(&buf[..n]);
        let result = r.get_repeated::<u8, 2>(Endian::Big, |r, _| r.get_u8());
        assert_eq!(result, Err(Error::InvalidData));
    }

    #[test]
    fn out_of_buffer_read_is_invalid_data() {
        let buf = [0u8; 1];
        let mut r = Reader::new(&buf);
        assert_eq!(r.get_u32(Endian::Big), Err(Error::InvalidData));
    }

    #[test]
    fn write_past_capacity_is_no_memory() {
        let mut buf = [0u8; 1];
        let mut w = Writer::new(&mut buf);
        assert_eq!(w.put_u32(1, Endian::Big), Err(Error::NoMemory));
    }
}
