//! 수신한 연결 요청
//!
//! 애플리케이션이 수락/거절을 결정할 때까지 요청 패킷을 보관.
//! 결정은 한 번만 반영되며 이후 호출은 무시됨.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::codec::PacketReader;
use crate::connection::Connection;
use crate::packet::Packet;
use crate::{Error, Result};

pub struct ConnectionRequest {
    connection: Arc<Connection>,
    packet: Packet,
    resolved: AtomicBool,
}

impl ConnectionRequest {
    pub(crate) fn new(connection: Arc<Connection>, packet: Packet) -> Self {
        Self {
            connection,
            packet,
            resolved: AtomicBool::new(false),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    /// 요청 페이로드 (핸드쉐이크 키 포함)
    pub fn payload(&self) -> &[u8] {
        self.packet.payload()
    }

    pub fn reader(&self) -> PacketReader<'_> {
        self.packet.reader()
    }

    /// 길이 접두 핸드쉐이크 키
    pub fn key(&self) -> Result<&str> {
        self.reader().read_str()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// 요청 수락 (이미 결정된 요청이면 false)
    pub fn accept(&self) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.connection.accept_request()
    }

    /// 요청 거절 (이미 결정된 요청이면 false)
    pub fn reject(&self) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.connection.reject_request()
    }

    /// 키가 일치하면 수락, 아니면 거절 (수락 시 true)
    pub fn accept_if_key(&self, expected: &str) -> bool {
        match self.key() {
            Ok(key) if key == expected => self.accept(),
            Ok(key) => {
                warn!("{} 핸드쉐이크 키 불일치 ({:?}), 거절", self.remote_addr(), key);
                self.reject();
                self.connection.report_error(Error::HandshakeKeyMismatch);
                false
            }
            Err(e) => {
                warn!("{} 연결 요청 파싱 실패: {}, 거절", self.remote_addr(), e);
                self.reject();
                self.connection.report_error(e);
                false
            }
        }
    }
}

impl fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("remote_addr", &self.remote_addr())
            .field("payload_len", &self.packet.payload().len())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
