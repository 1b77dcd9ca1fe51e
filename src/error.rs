//! 에러 타입 정의

use std::io;

use thiserror::Error;

/// CTP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] io::Error),

    #[error("패킷이 너무 짧음: expected {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("알 수 없는 패킷 타입: {0}")]
    UnknownPacketType(u8),

    #[error("버퍼 끝을 넘어 읽기: position={position}, requested={requested}, length={length}")]
    ReadPastEnd {
        position: usize,
        requested: usize,
        length: usize,
    },

    #[error("버퍼 한도를 넘어 쓰기: position={position}, requested={requested}, limit={limit}")]
    WritePastEnd {
        position: usize,
        requested: usize,
        limit: usize,
    },

    #[error("유효하지 않은 UTF-8 문자열")]
    InvalidUtf8,

    #[error("페이로드 크기 초과: {size} bytes (최대 {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("연결되지 않은 상태")]
    NotConnected,

    #[error("호스트가 실행 중이 아님")]
    NotRunning,

    #[error("호스트가 이미 실행 중")]
    AlreadyRunning,

    #[error("송신 큐 가득 참: channel={channel_id}, capacity={capacity}")]
    SendQueueFull { channel_id: u8, capacity: usize },

    #[error("채널 전달 방식 불일치: channel={channel_id}")]
    DeliveryMismatch { channel_id: u8 },

    #[error("핸드쉐이크 키 불일치")]
    HandshakeKeyMismatch,

    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 연결을 끊어야 하는 소켓 에러인지 여부
    ///
    /// 호스트/네트워크 도달 불가만 치명적으로 취급하고 나머지는 일시적 에러로 본다.
    pub fn is_fatal_socket_error(&self) -> bool {
        match self {
            Error::Io(e) => is_fatal_io_error(e),
            _ => false,
        }
    }

    /// 하위 OS 에러 코드
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

pub(crate) fn is_fatal_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable
    )
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
