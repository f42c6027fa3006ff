//! Serialize data into the wire protocol.
//!
//! All integers are network byte order (big-endian). Strings are prefixed
//! with a `u16` length; optional strings use an `i16` length where `-1`
//! means absent. Raw byte fields carry a `u32` length.

use bytes::BufMut;

use crate::error::{Error, Result};

pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

impl ToByte for bool {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u8(*self as u8);
        Ok(())
    }
}

impl ToByte for u8 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u8(*self);
        Ok(())
    }
}

impl ToByte for u16 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u16(*self);
        Ok(())
    }
}

impl ToByte for u32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u32(*self);
        Ok(())
    }
}

impl ToByte for u64 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u64(*self);
        Ok(())
    }
}

impl ToByte for i32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(*self);
        Ok(())
    }
}

impl ToByte for i64 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i64(*self);
        Ok(())
    }
}

impl ToByte for f64 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_f64(*self);
        Ok(())
    }
}

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        if self.len() > u16::MAX as usize {
            return Err(Error::MalformedFrame);
        }
        buffer.put_u16(self.len() as u16);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

impl ToByte for [u8] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u32(self.len() as u32);
        buffer.put(self);
        Ok(())
    }
}

impl ToByte for bytes::Bytes {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_ref().encode(buffer)
    }
}

/// Encode an optional string: `i16` length, `-1` when absent.
pub fn encode_opt_string<T: BufMut>(buffer: &mut T, value: Option<&str>) -> Result<()> {
    match value {
        Some(s) => {
            if s.len() > i16::MAX as usize {
                return Err(Error::MalformedFrame);
            }
            buffer.put_i16(s.len() as i16);
            buffer.put(s.as_bytes());
        }
        None => buffer.put_i16(-1),
    }
    Ok(())
}

/// Encode an optional byte field: presence byte then `u32`-prefixed bytes.
pub fn encode_opt_bytes<T: BufMut>(buffer: &mut T, value: Option<&[u8]>) -> Result<()> {
    match value {
        Some(b) => {
            buffer.put_u8(1);
            b.encode(buffer)?;
        }
        None => buffer.put_u8(0),
    }
    Ok(())
}

/// Encode an optional fixed-width value: presence byte then the value.
pub fn encode_opt<T: BufMut, V: ToByte>(buffer: &mut T, value: Option<&V>) -> Result<()> {
    match value {
        Some(v) => {
            buffer.put_u8(1);
            v.encode(buffer)?;
        }
        None => buffer.put_u8(0),
    }
    Ok(())
}

/// Renders the length of `xs` to `buffer` as the start of a protocol array
/// and then for each element of `xs` invokes `f` assuming that function
/// will render the element to the buffer.
pub fn encode_as_array<T, F, W>(buffer: &mut W, xs: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    buffer.put_i32(xs.len() as i32);
    for x in xs {
        f(buffer, x)?;
    }
    Ok(())
}

/// Encode a slice of ToByte items as a protocol array.
pub fn encode_array<T: ToByte, W: BufMut>(buffer: &mut W, items: &[T]) -> Result<()> {
    encode_as_array(buffer, items, |buffer, item| item.encode(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_primitives_are_big_endian() {
        let mut buf = BytesMut::new();
        0x0102_0304u32.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x01, 0x02, 0x03, 0x04]);

        let mut buf = BytesMut::new();
        0x0e02u16.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x0e, 0x02]);
    }

    #[test]
    fn test_string_length_prefix() {
        let mut buf = BytesMut::new();
        "hello".encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_opt_string_absent_is_minus_one() {
        let mut buf = BytesMut::new();
        encode_opt_string(&mut buf, None).unwrap();
        assert_eq!(&buf[..], &[0xff, 0xff]);
    }

    #[test]
    fn test_opt_string_present() {
        let mut buf = BytesMut::new();
        encode_opt_string(&mut buf, Some("ab")).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x02, b'a', b'b']);
    }

    #[test]
    fn test_bytes_length_prefix_is_u32() {
        let mut buf = BytesMut::new();
        [1u8, 2, 3].as_slice().encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn test_opt_value_presence_byte() {
        let mut buf = BytesMut::new();
        encode_opt(&mut buf, Some(&7u64)).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(buf.len(), 9);

        let mut buf = BytesMut::new();
        encode_opt::<_, u64>(&mut buf, None).unwrap();
        assert_eq!(&buf[..], &[0]);
    }

    #[test]
    fn test_encode_array() {
        let mut buf = BytesMut::new();
        encode_array(&mut buf, &[1u32, 2, 3]).unwrap();
        assert_eq!(buf.len(), 4 + 12);
        assert_eq!(&buf[..4], &[0, 0, 0, 3]);
    }
}
