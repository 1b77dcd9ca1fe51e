//! 와이어 패킷 정의
//!
//! - 컨트롤 패킷: 1바이트 헤더 (type)
//! - Data/Ack 패킷: 6바이트 헤더 `type | flags | channel | seq(u16 LE) | reserved`
//!
//! 디코딩은 복사하지 않음. `Packet`이 버퍼를 소유하고 헤더/페이로드는 뷰로 제공.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::codec::{encoded_str_len, PacketReader, PacketWriter};
use crate::pool::{BufferPool, PooledBuffer};
use crate::sequence::Sequence;
use crate::{Error, Result};

/// 컨트롤 패킷 헤더 크기
pub const CONTROL_HEADER_SIZE: usize = 1;

/// Data/Ack 패킷 헤더 크기
pub const DATA_HEADER_SIZE: usize = 6;

/// Ping/Pong 타임스탬프 페이로드 크기
pub const TIMESTAMP_SIZE: usize = 8;

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// 연결 요청 (핸드쉐이크 키 포함)
    ConnectRequest = 0,

    /// 연결 수락
    ConnectAccept = 1,

    /// 연결 거절
    ConnectReject = 2,

    /// 연결 종료
    Disconnect = 3,

    /// Keep-alive / RTT 측정
    Ping = 4,

    /// Ping 응답 (타임스탬프 에코)
    Pong = 5,

    /// 애플리케이션 데이터
    Data = 6,

    /// 신뢰 채널 확인 응답
    Ack = 7,
}

impl PacketType {
    /// 타입별 헤더 크기
    pub fn header_size(self) -> usize {
        match self {
            PacketType::Data | PacketType::Ack => DATA_HEADER_SIZE,
            _ => CONTROL_HEADER_SIZE,
        }
    }

    /// 채널 헤더(flags/channel/sequence)를 가지는 타입인지
    pub fn has_channel_header(self) -> bool {
        self.header_size() == DATA_HEADER_SIZE
    }
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => PacketType::ConnectRequest,
            1 => PacketType::ConnectAccept,
            2 => PacketType::ConnectReject,
            3 => PacketType::Disconnect,
            4 => PacketType::Ping,
            5 => PacketType::Pong,
            6 => PacketType::Data,
            7 => PacketType::Ack,
            other => return Err(Error::UnknownPacketType(other)),
        })
    }
}

/// 패킷 플래그 비트셋
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    pub const RELIABLE: PacketFlags = PacketFlags(1 << 0);
    /// 예약 (확장용)
    pub const ORDERED: PacketFlags = PacketFlags(1 << 1);
    /// 예약 (확장용)
    pub const SEQUENCED: PacketFlags = PacketFlags(1 << 2);

    /// 알 수 없는 비트도 그대로 보존
    pub const fn from_bits_retain(bits: u8) -> Self {
        PacketFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_reliable(self) -> bool {
        self.contains(PacketFlags::RELIABLE)
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "NONE");
        }
        let mut names = Vec::new();
        if self.contains(PacketFlags::RELIABLE) {
            names.push("RELIABLE");
        }
        if self.contains(PacketFlags::ORDERED) {
            names.push("ORDERED");
        }
        if self.contains(PacketFlags::SEQUENCED) {
            names.push("SEQUENCED");
        }
        let unknown = self.0 & !0b111;
        if unknown != 0 {
            return write!(f, "{} | {:#04x}", names.join(" | "), unknown);
        }
        write!(f, "{}", names.join(" | "))
    }
}

/// 전달 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMethod {
    /// 보내고 잊음, 큐가 넘치면 오래된 것부터 버림
    #[default]
    Unreliable,

    /// 재전송 + 순서 보장
    Reliable,
}

impl DeliveryMethod {
    pub fn flags(self) -> PacketFlags {
        match self {
            DeliveryMethod::Unreliable => PacketFlags::NONE,
            DeliveryMethod::Reliable => PacketFlags::RELIABLE,
        }
    }

    pub fn from_flags(flags: PacketFlags) -> Self {
        if flags.is_reliable() {
            DeliveryMethod::Reliable
        } else {
            DeliveryMethod::Unreliable
        }
    }
}

/// Data/Ack 헤더 필드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHeader {
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub channel_id: u8,
    pub sequence: Sequence,
}

impl ChannelHeader {
    /// 헤더를 버퍼 끝에 기록
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.channel_id);
        buf.put_u16_le(self.sequence);
        buf.put_u8(0); // reserved
    }

    /// 바이트 앞부분에서 헤더 파싱
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let first = *bytes.first().ok_or(Error::PacketTooShort {
            expected: CONTROL_HEADER_SIZE,
            actual: 0,
        })?;
        let packet_type = PacketType::try_from(first)?;
        if !packet_type.has_channel_header() {
            return Ok(Self {
                packet_type,
                flags: PacketFlags::NONE,
                channel_id: 0,
                sequence: 0,
            });
        }
        if bytes.len() < DATA_HEADER_SIZE {
            return Err(Error::PacketTooShort {
                expected: DATA_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            packet_type,
            flags: PacketFlags::from_bits_retain(bytes[1]),
            channel_id: bytes[2],
            sequence: u16::from_le_bytes([bytes[3], bytes[4]]),
        })
    }
}

/// 버퍼를 소유하는 패킷
///
/// 헤더는 생성 시 한 번 검증되므로 접근자는 실패하지 않음.
/// drop 시 버퍼가 풀로 반환됨.
pub struct Packet {
    buf: PooledBuffer,
    header: ChannelHeader,
}

impl Packet {
    /// 수신한 데이터그램 디코딩 (복사 없음)
    pub fn decode(buf: PooledBuffer) -> Result<Self> {
        let header = ChannelHeader::decode(&buf)?;
        Ok(Self { buf, header })
    }

    /// 페이로드 없는 컨트롤 패킷
    pub fn control(pool: &Arc<BufferPool>, packet_type: PacketType) -> Self {
        debug_assert!(!packet_type.has_channel_header());
        let mut buf = pool.rent(CONTROL_HEADER_SIZE);
        buf.put_u8(packet_type as u8);
        Self::from_parts(buf, packet_type)
    }

    /// 컨트롤 패킷 + 페이로드 작성
    pub fn control_with<F>(
        pool: &Arc<BufferPool>,
        packet_type: PacketType,
        max_size: usize,
        write: F,
    ) -> Result<Self>
    where
        F: FnOnce(&mut PacketWriter<'_>) -> Result<()>,
    {
        let mut buf = pool.rent(max_size);
        buf.put_u8(packet_type as u8);
        write(&mut PacketWriter::new(&mut buf, max_size))?;
        Ok(Self::from_parts(buf, packet_type))
    }

    /// 연결 요청 (핸드쉐이크 키)
    pub fn connect_request(pool: &Arc<BufferPool>, key: &str, max_size: usize) -> Result<Self> {
        let size = CONTROL_HEADER_SIZE + encoded_str_len(key);
        if size > max_size {
            return Err(Error::PayloadTooLarge {
                size,
                max: max_size,
            });
        }
        Self::control_with(pool, PacketType::ConnectRequest, size, |w| w.write_str(key))
    }

    /// 타임스탬프를 실은 Ping
    pub fn ping(pool: &Arc<BufferPool>, timestamp_us: u64) -> Self {
        let mut buf = pool.rent(CONTROL_HEADER_SIZE + TIMESTAMP_SIZE);
        buf.put_u8(PacketType::Ping as u8);
        buf.put_u64_le(timestamp_us);
        Self::from_parts(buf, PacketType::Ping)
    }

    /// Ping 페이로드를 그대로 되돌려주는 Pong
    pub fn pong(pool: &Arc<BufferPool>, echo: &[u8]) -> Self {
        let mut buf = pool.rent(CONTROL_HEADER_SIZE + echo.len());
        buf.put_u8(PacketType::Pong as u8);
        buf.extend_from_slice(echo);
        Self::from_parts(buf, PacketType::Pong)
    }

    /// 데이터 패킷 인코딩 (페이로드 복사)
    pub fn data(
        pool: &Arc<BufferPool>,
        flags: PacketFlags,
        channel_id: u8,
        sequence: Sequence,
        payload: &[u8],
        max_size: usize,
    ) -> Result<Self> {
        let size = DATA_HEADER_SIZE + payload.len();
        if size > max_size {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: max_size.saturating_sub(DATA_HEADER_SIZE),
            });
        }

        let header = ChannelHeader {
            packet_type: PacketType::Data,
            flags,
            channel_id,
            sequence,
        };
        let mut buf = pool.rent(size);
        header.encode_into(&mut buf);
        buf.extend_from_slice(payload);
        Ok(Self { buf, header })
    }

    /// 확인 응답
    pub fn ack(pool: &Arc<BufferPool>, channel_id: u8, sequence: Sequence) -> Self {
        let header = ChannelHeader {
            packet_type: PacketType::Ack,
            flags: PacketFlags::NONE,
            channel_id,
            sequence,
        };
        let mut buf = pool.rent(DATA_HEADER_SIZE);
        header.encode_into(&mut buf);
        Self { buf, header }
    }

    fn from_parts(buf: PooledBuffer, packet_type: PacketType) -> Self {
        Self {
            buf,
            header: ChannelHeader {
                packet_type,
                flags: PacketFlags::NONE,
                channel_id: 0,
                sequence: 0,
            },
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn flags(&self) -> PacketFlags {
        self.header.flags
    }

    pub fn channel_id(&self) -> u8 {
        self.header.channel_id
    }

    pub fn sequence(&self) -> Sequence {
        self.header.sequence
    }

    pub fn header(&self) -> ChannelHeader {
        self.header
    }

    /// 전체 바이트 (헤더 포함)
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// 헤더 뒤 페이로드
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header.packet_type.header_size()..]
    }

    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(self.payload())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Packet");
        s.field("type", &self.header.packet_type);
        if self.header.packet_type.has_channel_header() {
            s.field("flags", &self.header.flags)
                .field("channel_id", &self.header.channel_id)
                .field("sequence", &self.header.sequence);
        }
        s.field("payload_len", &self.payload().len()).finish()
    }
}
