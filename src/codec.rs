//! 페이로드 읽기/쓰기
//!
//! 모든 정수는 little-endian, 문자열은 16비트 LE 길이 접두 UTF-8.
//! 선언된 길이를 넘는 읽기/쓰기는 에러로 처리됨.

use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, Result};

/// 페이로드 읽기 커서
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, position: 0 }
    }

    /// `len` 바이트를 읽을 수 있는지 확인 후 해당 구간 반환
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::ReadPastEnd {
                position: self.position,
                requested: len,
                length: self.buf.len(),
            });
        }
        let slice = &self.buf[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.take(2)?.get_u16_le())
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.take(2)?.get_i16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.take(4)?.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.take(4)?.get_i32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(self.take(8)?.get_u64_le())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.take(8)?.get_i64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(self.take(4)?.get_f32_le())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(self.take(8)?.get_f64_le())
    }

    /// 길이 접두 UTF-8 문자열
    pub fn read_str(&mut self) -> Result<&'a str> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.position
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_at_end(&self) -> bool {
        self.position == self.buf.len()
    }
}

/// 페이로드 쓰기 커서
///
/// `limit`은 버퍼 전체 길이 상한 (헤더 포함).
#[derive(Debug)]
pub struct PacketWriter<'a> {
    buf: &'a mut BytesMut,
    limit: usize,
}

impl<'a> PacketWriter<'a> {
    pub fn new(buf: &'a mut BytesMut, limit: usize) -> Self {
        Self { buf, limit }
    }

    fn reserve(&mut self, len: usize) -> Result<()> {
        if self.buf.len() + len > self.limit {
            return Err(Error::WritePastEnd {
                position: self.buf.len(),
                requested: len,
                limit: self.limit,
            });
        }
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?;
        self.buf.put_u8(value);
        Ok(())
    }

    pub fn write_bytes(&mut self, values: &[u8]) -> Result<()> {
        self.reserve(values.len())?;
        self.buf.extend_from_slice(values);
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.reserve(2)?;
        self.buf.put_u16_le(value);
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.reserve(2)?;
        self.buf.put_i16_le(value);
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.reserve(4)?;
        self.buf.put_u32_le(value);
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.reserve(4)?;
        self.buf.put_i32_le(value);
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.reserve(8)?;
        self.buf.put_u64_le(value);
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.reserve(8)?;
        self.buf.put_i64_le(value);
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.reserve(4)?;
        self.buf.put_f32_le(value);
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.reserve(8)?;
        self.buf.put_f64_le(value);
        Ok(())
    }

    /// 길이 접두 UTF-8 문자열 (최대 65535 바이트)
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        let len = value.len();
        if len > u16::MAX as usize {
            return Err(Error::PayloadTooLarge {
                size: len,
                max: u16::MAX as usize,
            });
        }
        self.reserve(2 + len)?;
        self.buf.put_u16_le(len as u16);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// 지금까지 쓴 바이트 수 (헤더 포함)
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// 문자열을 인코딩했을 때의 바이트 수
pub fn encoded_str_len(value: &str) -> usize {
    2 + value.len()
}
