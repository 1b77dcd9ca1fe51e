//! 데이터그램 송신 경계
//!
//! 연결은 소켓을 직접 알지 않고 `Transport`로만 송신함.
//! 송신은 절대 대기하지 않음 (소켓 버퍼가 가득 차면 `WouldBlock`).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::UdpSocket;

pub trait Transport: Send + Sync + 'static {
    /// 데이터그램 하나를 즉시 송신
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for UdpSocket {
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.try_send_to(data, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// 호스트 소켓 핸들
///
/// 연결들이 공유하며, 호스트가 멈추면 `close`로 소켓 참조를 끊음.
/// 이벤트 큐에 남은 연결이 있어도 소켓은 해제됨.
#[derive(Debug)]
pub(crate) struct SocketTransport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl SocketTransport {
    pub(crate) fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket: RwLock::new(Some(socket)),
        }
    }

    pub(crate) fn close(&self) {
        self.socket.write().take();
    }
}

impl Transport for SocketTransport {
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        match self.socket.read().as_deref() {
            Some(socket) => Transport::send_to(socket, data, target),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "호스트 소켓이 닫힘")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.socket.read().as_deref() {
            Some(socket) => UdpSocket::local_addr(socket),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "호스트 소켓이 닫힘")),
        }
    }
}
