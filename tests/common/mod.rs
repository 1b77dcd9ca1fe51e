//! 통합 테스트 공용 도구

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ctp::{
    Config, Connection, ConnectionRequest, DeliveryMethod, DisconnectInfo, DisconnectReason,
    EventHandler, Host, Packet,
};

/// 수신한 이벤트 기록
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Requested(SocketAddr),
    Connected(SocketAddr),
    Disconnected(SocketAddr, DisconnectReason),
    Data {
        channel_id: u8,
        delivery: DeliveryMethod,
        payload: Vec<u8>,
    },
    Rtt(Duration),
    Error(SocketAddr),
}

/// 키가 맞으면 수락하는 기록용 처리기
#[derive(Debug, Default)]
pub struct Recorder {
    pub accept_key: Option<String>,
    pub events: Vec<Recorded>,
}

impl Recorder {
    pub fn accepting(key: &str) -> Self {
        Self {
            accept_key: Some(key.to_string()),
            events: Vec::new(),
        }
    }

    pub fn connected(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Recorded::Connected(_)))
            .count()
    }

    pub fn disconnect_reasons(&self) -> Vec<DisconnectReason> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Recorded::Disconnected(_, reason) => Some(*reason),
                _ => None,
            })
            .collect()
    }

    pub fn payloads(&self, channel: u8) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Recorded::Data {
                    channel_id, payload, ..
                } if *channel_id == channel => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_rtt(&self) -> bool {
        self.events.iter().any(|e| matches!(e, Recorded::Rtt(_)))
    }
}

impl EventHandler for Recorder {
    fn on_connection_request(&mut self, request: ConnectionRequest) {
        self.events.push(Recorded::Requested(request.remote_addr()));
        match &self.accept_key {
            Some(key) => {
                request.accept_if_key(key);
            }
            None => {
                request.reject();
            }
        }
    }

    fn on_connected(&mut self, connection: Arc<Connection>) {
        self.events.push(Recorded::Connected(connection.remote_addr()));
    }

    fn on_disconnected(&mut self, connection: Arc<Connection>, info: DisconnectInfo) {
        self.events
            .push(Recorded::Disconnected(connection.remote_addr(), info.reason));
    }

    fn on_data(
        &mut self,
        _connection: Arc<Connection>,
        channel_id: u8,
        delivery: DeliveryMethod,
        packet: Packet,
    ) {
        self.events.push(Recorded::Data {
            channel_id,
            delivery,
            payload: packet.payload().to_vec(),
        });
    }

    fn on_rtt_updated(&mut self, _connection: Arc<Connection>, rtt: Duration) {
        self.events.push(Recorded::Rtt(rtt));
    }

    fn on_error(&mut self, addr: SocketAddr, _error: ctp::Error) {
        self.events.push(Recorded::Error(addr));
    }
}

/// 짧은 주기 설정 (테스트 시간 단축)
pub fn fast_config() -> Config {
    Config {
        keep_alive_interval_ms: 100,
        timeout_ms: 2000,
        maintenance_interval_ms: 20,
        send_interval_ms: 2,
        initial_rto_ms: 50,
        max_rto_ms: 400,
        connect_retry_interval_ms: 100,
        ..Config::default()
    }
}

pub fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

pub async fn start_host(config: Config) -> (Host, SocketAddr) {
    let host = Host::new(config).expect("valid config");
    let addr = host.start(localhost()).await.expect("bind");
    (host, addr)
}

/// 두 호스트의 이벤트를 조건이 만족될 때까지 처리 (시간 초과 시 false)
pub async fn poll_until<F>(
    a: &Host,
    a_events: &mut Recorder,
    b: &Host,
    b_events: &mut Recorder,
    timeout: Duration,
    mut done: F,
) -> bool
where
    F: FnMut(&Recorder, &Recorder) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        a.poll_events(a_events);
        b.poll_events(b_events);
        if done(a_events, b_events) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// 한 호스트만 처리
pub async fn poll_one<F>(host: &Host, events: &mut Recorder, timeout: Duration, mut done: F) -> bool
where
    F: FnMut(&Recorder) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        host.poll_events(events);
        if done(events) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
