//! 애플리케이션 이벤트
//!
//! 네트워크 태스크는 이벤트를 큐에 넣기만 하고,
//! 애플리케이션 스레드가 `poll_events`로 꺼내서 처리함.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::connection::{Connection, DisconnectInfo};
use crate::packet::{DeliveryMethod, Packet};
use crate::request::ConnectionRequest;
use crate::Error;

/// 네트워크 이벤트
#[derive(Debug)]
pub enum NetEvent {
    /// 원격 연결 요청 (수락/거절 대기)
    ConnectionRequested(ConnectionRequest),

    /// 연결 성립
    Connected(Arc<Connection>),

    /// 연결 종료 (연결당 한 번)
    Disconnected {
        connection: Arc<Connection>,
        info: DisconnectInfo,
    },

    /// 데이터 수신, 패킷 버퍼는 이벤트가 drop될 때 반환됨
    DataReceived {
        connection: Arc<Connection>,
        channel_id: u8,
        delivery: DeliveryMethod,
        packet: Packet,
    },

    /// RTT 갱신 (평활값)
    RttUpdated {
        connection: Arc<Connection>,
        rtt: Duration,
    },

    /// 복구 가능한 에러
    ErrorOccurred { addr: SocketAddr, error: Error },
}

/// 이벤트 처리기
///
/// 필요한 메서드만 구현. 연결 요청을 처리하지 않으면 거절됨.
#[allow(unused_variables)]
pub trait EventHandler {
    fn on_connection_request(&mut self, request: ConnectionRequest) {
        request.reject();
    }

    fn on_connected(&mut self, connection: Arc<Connection>) {}

    fn on_disconnected(&mut self, connection: Arc<Connection>, info: DisconnectInfo) {}

    fn on_data(&mut self, connection: Arc<Connection>, channel_id: u8, delivery: DeliveryMethod, packet: Packet) {}

    fn on_rtt_updated(&mut self, connection: Arc<Connection>, rtt: Duration) {}

    fn on_error(&mut self, addr: SocketAddr, error: Error) {}
}

impl NetEvent {
    /// 이벤트를 처리기로 전달
    pub fn dispatch<H: EventHandler + ?Sized>(self, handler: &mut H) {
        match self {
            NetEvent::ConnectionRequested(request) => handler.on_connection_request(request),
            NetEvent::Connected(connection) => handler.on_connected(connection),
            NetEvent::Disconnected { connection, info } => handler.on_disconnected(connection, info),
            NetEvent::DataReceived {
                connection,
                channel_id,
                delivery,
                packet,
            } => handler.on_data(connection, channel_id, delivery, packet),
            NetEvent::RttUpdated { connection, rtt } => handler.on_rtt_updated(connection, rtt),
            NetEvent::ErrorOccurred { addr, error } => handler.on_error(addr, error),
        }
    }
}

/// 네트워크 태스크 쪽 송신 핸들
pub type EventSender = Sender<NetEvent>;

/// 다중 생산자 / 단일 소비자 이벤트 큐
#[derive(Debug)]
pub struct EventQueue {
    tx: Sender<NetEvent>,
    rx: Receiver<NetEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    /// 호출 시점에 쌓여 있던 이벤트만 순서대로 처리 (블로킹 없음)
    ///
    /// 처리 중에 새로 들어온 이벤트는 다음 호출에서 처리됨.
    pub fn poll<H: EventHandler + ?Sized>(&self, handler: &mut H) -> usize {
        let pending = self.rx.len();
        let mut handled = 0;
        while handled < pending {
            match self.rx.try_recv() {
                Ok(event) => {
                    event.dispatch(handler);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    /// 이벤트 하나 꺼냄
    pub fn try_next(&self) -> Option<NetEvent> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// 남은 이벤트 폐기
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        errors: Vec<SocketAddr>,
    }

    impl EventHandler for Recorder {
        fn on_error(&mut self, addr: SocketAddr, _error: Error) {
            self.errors.push(addr);
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_poll_preserves_order() {
        let queue = EventQueue::new();
        let tx = queue.sender();
        for port in 1..=3 {
            tx.send(NetEvent::ErrorOccurred {
                addr: addr(port),
                error: Error::NotConnected,
            })
            .unwrap();
        }

        let mut recorder = Recorder::default();
        assert_eq!(queue.poll(&mut recorder), 3);
        assert_eq!(recorder.errors, vec![addr(1), addr(2), addr(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_poll_on_empty_queue_returns_immediately() {
        let queue = EventQueue::new();
        let mut recorder = Recorder::default();
        assert_eq!(queue.poll(&mut recorder), 0);
    }

    #[test]
    fn test_events_queued_during_poll_wait_for_next_call() {
        struct Requeue {
            tx: EventSender,
            seen: usize,
        }

        impl EventHandler for Requeue {
            fn on_error(&mut self, addr: SocketAddr, error: Error) {
                self.seen += 1;
                let _ = self.tx.send(NetEvent::ErrorOccurred { addr, error });
            }
        }

        let queue = EventQueue::new();
        queue
            .sender()
            .send(NetEvent::ErrorOccurred {
                addr: addr(9),
                error: Error::NotConnected,
            })
            .unwrap();

        let mut handler = Requeue {
            tx: queue.sender(),
            seen: 0,
        };
        assert_eq!(queue.poll(&mut handler), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(handler.seen, 1);
    }
}
