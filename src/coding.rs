//! OPC UA binary encoding primitives (Part 6 §5.1/§5.2).
//!
//! All integers are little-endian. `String` and `ByteString` are encoded as
//! an `Int32` length followed by that many bytes, with a length of -1
//! denoting null.

use bytes::{Buf, BufMut, Bytes};

use StatusCode;

/// Decoding ran off the end of the buffer or hit a malformed value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
#[fail(display = "malformed or truncated field")]
pub struct CodecError;

impl From<CodecError> for StatusCode {
    fn from(_: CodecError) -> StatusCode {
        StatusCode::BAD_DECODING_ERROR
    }
}

pub type Result<T> = ::std::result::Result<T, CodecError>;

pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u8> {
        if buf.remaining() < 1 {
            return Err(CodecError);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(CodecError);
        }
        Ok(buf.get_u32_le())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(*self);
    }
}

impl Codec for i32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<i32> {
        if buf.remaining() < 4 {
            return Err(CodecError);
        }
        Ok(buf.get_i32_le())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(*self);
    }
}

impl Codec for i64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<i64> {
        if buf.remaining() < 8 {
            return Err(CodecError);
        }
        Ok(buf.get_i64_le())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64_le(*self);
    }
}

pub trait BufExt: Buf + Sized {
    fn get<T: Codec>(&mut self) -> Result<T> {
        T::decode(self)
    }

    /// Read a `ByteString`; `None` is the encoded null value.
    fn get_byte_string(&mut self) -> Result<Option<Bytes>> {
        let len = self.get::<i32>()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        if self.remaining() < len {
            return Err(CodecError);
        }
        let mut data = vec![0; len];
        self.copy_to_slice(&mut data);
        Ok(Some(data.into()))
    }

    /// Read a `ByteString` whose length may not exceed `limit` bytes.
    fn get_limited_byte_string(&mut self, limit: usize) -> Result<Option<Bytes>> {
        let len = self.get::<i32>()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        if len > limit || self.remaining() < len {
            return Err(CodecError);
        }
        let mut data = vec![0; len];
        self.copy_to_slice(&mut data);
        Ok(Some(data.into()))
    }

    /// Read a UTF-8 `String` bounded to `limit` bytes; null decodes as `None`.
    fn get_string(&mut self, limit: usize) -> Result<Option<String>> {
        match self.get_limited_byte_string(limit)? {
            None => Ok(None),
            Some(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(s) => Ok(Some(s)),
                Err(_) => Err(CodecError),
            },
        }
    }
}

impl<T: Buf> BufExt for T {}

pub trait BufMutExt: BufMut + Sized {
    fn write<T: Codec>(&mut self, x: T) {
        x.encode(self);
    }

    fn write_byte_string(&mut self, x: Option<&[u8]>) {
        match x {
            None => self.write::<i32>(-1),
            Some(data) => {
                debug_assert!(data.len() <= i32::max_value() as usize);
                self.write::<i32>(data.len() as i32);
                self.put_slice(data);
            }
        }
    }

    fn write_string(&mut self, x: Option<&str>) {
        self.write_byte_string(x.map(|s| s.as_bytes()));
    }
}

impl<T: BufMut> BufMutExt for T {}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn integers_round_trip() {
        let mut buf = Vec::new();
        buf.write::<u32>(0xdead_beef);
        buf.write::<i32>(-2);
        buf.write::<u8>(0x7f);
        assert_eq!(buf, hex!("ef be ad de fe ff ff ff 7f"));
        let mut r = Cursor::new(&buf[..]);
        assert_eq!(r.get::<u32>(), Ok(0xdead_beef));
        assert_eq!(r.get::<i32>(), Ok(-2));
        assert_eq!(r.get::<u8>(), Ok(0x7f));
        assert_eq!(r.get::<u8>(), Err(CodecError));
    }

    #[test]
    fn strings_round_trip() {
        let mut buf = Vec::new();
        buf.write_string(Some("opc.tcp://localhost:4840"));
        buf.write_string(None);
        buf.write_byte_string(Some(b""));
        let mut r = Cursor::new(&buf[..]);
        assert_eq!(
            r.get_string(4096),
            Ok(Some("opc.tcp://localhost:4840".to_string()))
        );
        assert_eq!(r.get_string(4096), Ok(None));
        assert_eq!(r.get_byte_string(), Ok(Some(Bytes::new())));
    }

    #[test]
    fn string_limit_enforced() {
        let mut buf = Vec::new();
        buf.write_string(Some("excessive"));
        let mut r = Cursor::new(&buf[..]);
        assert_eq!(r.get_string(8), Err(CodecError));
    }

    #[test]
    fn truncated_byte_string() {
        let mut buf = Vec::new();
        buf.write::<i32>(12);
        buf.write::<u32>(0);
        let mut r = Cursor::new(&buf[..]);
        assert_eq!(r.get_byte_string(), Err(CodecError));
    }
}
