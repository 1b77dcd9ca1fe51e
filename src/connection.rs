//! 연결 상태 머신
//!
//! ```text
//! Connecting ──accept──> Connected ──disconnect──> Disconnecting ──> Disconnected
//!     │                      │
//!     ├──reject──> Rejected  └──timeout / 원격 종료 / 치명적 소켓 에러──> Disconnected
//!     └──재시도 초과 / 요청 만료──> Disconnected
//! ```
//!
//! 수신 태스크, 송신 태스크, 유지보수 태스크, 애플리케이션 스레드가 동시에 접근함.
//! 상태 전이는 CAS로 한 번만 일어나고, 종료 이벤트도 연결당 한 번만 발생.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelOptions};
use crate::clock;
use crate::error::is_fatal_io_error;
use crate::event::{EventSender, NetEvent};
use crate::packet::{DeliveryMethod, Packet, PacketType};
use crate::pool::BufferPool;
use crate::request::ConnectionRequest;
use crate::rtt::RttEstimator;
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::transport::Transport;
use crate::{Config, Error, Result};

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
    Rejected = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            3 => ConnectionState::Disconnected,
            _ => ConnectionState::Rejected,
        }
    }

    /// 더 이상 전이가 없는 상태
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Rejected)
    }
}

/// 연결 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// 로컬에서 disconnect 호출
    LocalClose,

    /// 상대가 Disconnect 전송
    RemoteClose,

    /// 수신 없음
    Timeout,

    /// 치명적 소켓 에러
    TransportError,

    /// 상대가 연결 요청 거절
    Rejected,

    /// 연결 요청 재시도 초과
    ConnectionFailed,
}

/// 종료 사유 + 소켓 에러 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectInfo {
    pub reason: DisconnectReason,
    pub error_kind: Option<io::ErrorKind>,
    pub os_error: Option<i32>,
}

impl DisconnectInfo {
    pub fn new(reason: DisconnectReason) -> Self {
        Self {
            reason,
            error_kind: None,
            os_error: None,
        }
    }

    pub fn transport_error(error: &io::Error) -> Self {
        Self {
            reason: DisconnectReason::TransportError,
            error_kind: Some(error.kind()),
            os_error: error.raw_os_error(),
        }
    }
}

/// 연결 생성에 필요한 호스트 공유 자원
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub config: Arc<Config>,
    pub pool: Arc<BufferPool>,
    pub transport: Arc<dyn Transport>,
    pub events: EventSender,
}

/// 소켓 버퍼가 가득 차서 미뤄둔 데이터그램 최대 수
const DEFERRED_CAPACITY: usize = 256;

#[derive(Debug)]
enum Role {
    /// 로컬에서 connect 호출, 핸드쉐이크 키 보관 (재전송용)
    Initiator { key: String },

    /// 원격 요청으로 생성
    Acceptor,
}

#[derive(Debug, Clone, Copy)]
struct Timestamps {
    created: Instant,
    last_send: Instant,
    last_receive: Instant,
    last_connect_attempt: Instant,
    connect_attempts: u32,
}

pub struct Connection {
    remote_addr: SocketAddr,
    role: Role,
    state: AtomicU8,

    channels: DashMap<u8, Channel>,
    options: ChannelOptions,

    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    events: EventSender,

    times: Mutex<Timestamps>,
    rtt: Mutex<RttEstimator>,

    /// `WouldBlock`으로 못 보낸 데이터그램, 다음 flush에서 먼저 송신
    deferred: Mutex<VecDeque<Bytes>>,

    /// 연결 요청 이벤트를 이미 올렸는지 (중복 요청 무시)
    request_pending: AtomicBool,

    stats: Arc<ConnectionStats>,
    self_ref: Weak<Connection>,
}

impl Connection {
    /// 로컬에서 시작하는 연결 (요청은 `begin_connect`에서 송신)
    pub(crate) fn outgoing(
        remote_addr: SocketAddr,
        key: &str,
        context: &ConnectionContext,
        now: Instant,
    ) -> Arc<Self> {
        Self::build(
            remote_addr,
            Role::Initiator {
                key: key.to_owned(),
            },
            context,
            now,
        )
    }

    /// 원격 요청으로 생성되는 연결
    pub(crate) fn incoming(remote_addr: SocketAddr, context: &ConnectionContext, now: Instant) -> Arc<Self> {
        Self::build(remote_addr, Role::Acceptor, context, now)
    }

    fn build(remote_addr: SocketAddr, role: Role, context: &ConnectionContext, now: Instant) -> Arc<Self> {
        let stats = Arc::new(ConnectionStats::new());
        let options = ChannelOptions::from_config(&context.config, Arc::clone(&context.pool), Arc::clone(&stats));

        Arc::new_cyclic(|self_ref| Self {
            remote_addr,
            role,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            channels: DashMap::new(),
            options,
            config: Arc::clone(&context.config),
            transport: Arc::clone(&context.transport),
            events: context.events.clone(),
            times: Mutex::new(Timestamps {
                created: now,
                last_send: now,
                last_receive: now,
                last_connect_attempt: now,
                connect_attempts: 0,
            }),
            rtt: Mutex::new(RttEstimator::new()),
            deferred: Mutex::new(VecDeque::new()),
            request_pending: AtomicBool::new(false),
            stats,
            self_ref: self_ref.clone(),
        })
    }

    // ── 조회 ────────────────────────────────────────────────

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 로컬에서 connect로 만든 연결인지
    pub fn is_initiator(&self) -> bool {
        matches!(self.role, Role::Initiator { .. })
    }

    /// 평활 RTT (샘플 없으면 0)
    pub fn rtt(&self) -> Duration {
        self.rtt.lock().smoothed()
    }

    pub fn jitter(&self) -> Duration {
        self.rtt.lock().jitter()
    }

    pub fn last_send(&self) -> Instant {
        self.times.lock().last_send
    }

    pub fn last_receive(&self) -> Instant {
        self.times.lock().last_receive
    }

    pub fn created_at(&self) -> Instant {
        self.times.lock().created
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.config.keep_alive_interval()
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// 소켓 버퍼 때문에 송신을 미룬 데이터그램 수
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    // ── 애플리케이션 API ────────────────────────────────────

    /// 채널에 페이로드 전송 (큐에 넣고 즉시 반환)
    ///
    /// 채널은 첫 사용 시 `delivery` 방식으로 생성되며 이후 다른 방식은 거부됨.
    pub fn send(&self, payload: &[u8], delivery: DeliveryMethod, channel_id: u8) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        let channel = self
            .channels
            .entry(channel_id)
            .or_insert_with(|| Channel::new(channel_id, delivery, &self.options));
        if channel.delivery() != delivery {
            return Err(Error::DeliveryMismatch { channel_id });
        }
        channel.send(payload)
    }

    /// 정상 종료 (Connected 상태에서만, 종료했으면 true)
    pub fn disconnect(&self) -> bool {
        if !self.transition(ConnectionState::Connected, ConnectionState::Disconnecting) {
            return false;
        }
        info!("{} 연결 종료 요청", self.remote_addr);
        self.transmit(&Packet::control(&self.options.pool, PacketType::Disconnect), Instant::now());
        self.close(DisconnectInfo::new(DisconnectReason::LocalClose));
        true
    }

    // ── 핸드쉐이크 ──────────────────────────────────────────

    /// 첫 연결 요청 송신 (initiator 전용)
    pub(crate) fn begin_connect(&self, now: Instant) -> Result<()> {
        let Role::Initiator { key } = &self.role else {
            return Err(Error::NotConnected);
        };
        self.send_connect_request(key, now)
    }

    fn send_connect_request(&self, key: &str, now: Instant) -> Result<()> {
        let packet = Packet::connect_request(&self.options.pool, key, self.config.max_packet_size)?;
        let attempt = {
            let mut times = self.times.lock();
            times.connect_attempts += 1;
            times.last_connect_attempt = now;
            times.connect_attempts
        };
        debug!("{} 연결 요청 송신 (시도 {})", self.remote_addr, attempt);
        self.transmit(&packet, now);
        Ok(())
    }

    /// `ConnectionRequest::accept`에서 호출
    pub(crate) fn accept_request(&self) -> bool {
        if !self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            return false;
        }
        let now = Instant::now();
        self.times.lock().last_receive = now;
        info!("{} 연결 수락", self.remote_addr);
        self.transmit(&Packet::control(&self.options.pool, PacketType::ConnectAccept), now);
        self.emit(NetEvent::Connected);
        true
    }

    /// `ConnectionRequest::reject`에서 호출
    pub(crate) fn reject_request(&self) -> bool {
        if !self.transition(ConnectionState::Connecting, ConnectionState::Rejected) {
            return false;
        }
        info!("{} 연결 거절", self.remote_addr);
        self.transmit(&Packet::control(&self.options.pool, PacketType::ConnectReject), Instant::now());
        true
    }

    // ── 수신 ────────────────────────────────────────────────

    /// 수신 패킷 처리 (수신 태스크)
    ///
    /// 현재 상태에서 의미 없는 패킷은 조용히 버림.
    pub fn handle_packet(&self, packet: Packet, now: Instant) {
        self.stats.record_received(packet.len());
        self.times.lock().last_receive = now;

        let state = self.state();
        match packet.packet_type() {
            PacketType::ConnectRequest => self.on_connect_request(packet, state, now),
            PacketType::ConnectAccept => self.on_connect_accept(now),
            PacketType::ConnectReject => self.on_connect_reject(),
            PacketType::Disconnect => {
                if matches!(state, ConnectionState::Connected | ConnectionState::Disconnecting) {
                    info!("{} 원격 종료", self.remote_addr);
                    self.close(DisconnectInfo::new(DisconnectReason::RemoteClose));
                }
            }
            PacketType::Ping if state == ConnectionState::Connected => {
                self.transmit(&Packet::pong(&self.options.pool, packet.payload()), now);
            }
            PacketType::Pong if state == ConnectionState::Connected => self.on_pong(&packet, now),
            PacketType::Data if state == ConnectionState::Connected => self.on_data(packet),
            PacketType::Ack if state == ConnectionState::Connected => {
                let acked = self
                    .channels
                    .get(&packet.channel_id())
                    .map(|channel| channel.receive_ack(packet.sequence()))
                    .unwrap_or(false);
                if !acked {
                    trace!(
                        "{} 알 수 없는 ACK (channel={}, seq={})",
                        self.remote_addr,
                        packet.channel_id(),
                        packet.sequence()
                    );
                }
            }
            other => trace!("{} {:?} 무시 (상태 {:?})", self.remote_addr, other, state),
        }
    }

    fn on_connect_request(&self, packet: Packet, state: ConnectionState, now: Instant) {
        match (state, &self.role) {
            (ConnectionState::Connected, Role::Acceptor) => {
                // 수락 응답이 유실된 경우
                debug!("{} 중복 연결 요청, 수락 재전송", self.remote_addr);
                self.transmit(&Packet::control(&self.options.pool, PacketType::ConnectAccept), now);
            }
            (ConnectionState::Connecting, Role::Acceptor) => {
                if self.request_pending.swap(true, Ordering::AcqRel) {
                    trace!("{} 처리 대기 중인 연결 요청 중복", self.remote_addr);
                    return;
                }
                if let Some(connection) = self.self_ref.upgrade() {
                    let _ = self
                        .events
                        .send(NetEvent::ConnectionRequested(ConnectionRequest::new(connection, packet)));
                }
            }
            _ => trace!("{} 연결 요청 무시 (상태 {:?})", self.remote_addr, state),
        }
    }

    fn on_connect_accept(&self, now: Instant) {
        if !self.is_initiator() {
            trace!("{} 요청하지 않은 ConnectAccept 무시", self.remote_addr);
            return;
        }
        if self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            self.times.lock().last_receive = now;
            info!("{} 연결됨", self.remote_addr);
            self.emit(NetEvent::Connected);
        }
    }

    fn on_connect_reject(&self) {
        if !self.is_initiator() {
            trace!("{} 요청하지 않은 ConnectReject 무시", self.remote_addr);
            return;
        }
        if self.transition(ConnectionState::Connecting, ConnectionState::Rejected) {
            info!("{} 연결 거절됨", self.remote_addr);
            self.channels.clear();
            self.emit_disconnected(DisconnectInfo::new(DisconnectReason::Rejected));
        }
    }

    fn on_pong(&self, packet: &Packet, now: Instant) {
        let sent_at = match packet.reader().read_u64() {
            Ok(value) => value,
            Err(e) => {
                debug!("{} 잘못된 Pong: {}", self.remote_addr, e);
                return;
            }
        };

        let sample = now.saturating_duration_since(clock::from_micros(sent_at));
        let rtt = self.rtt.lock().update(sample);
        trace!("{} RTT 샘플 {:?}, 평활 {:?}", self.remote_addr, sample, rtt);

        if let Some(connection) = self.self_ref.upgrade() {
            let _ = self.events.send(NetEvent::RttUpdated { connection, rtt });
        }
    }

    fn on_data(&self, packet: Packet) {
        let Some(connection) = self.self_ref.upgrade() else {
            return;
        };
        let channel_id = packet.channel_id();
        let flags = packet.flags();
        let channel = self
            .channels
            .entry(channel_id)
            .or_insert_with(|| Channel::for_flags(channel_id, flags, &self.options))
            .downgrade();

        let result = channel.receive(packet, &mut |packet: Packet| {
            let _ = self.events.send(NetEvent::DataReceived {
                connection: Arc::clone(&connection),
                channel_id,
                delivery: DeliveryMethod::from_flags(packet.flags()),
                packet,
            });
        });
        if let Err(e) = result {
            self.report_error(e);
        }
    }

    // ── 송신 / 유지보수 ─────────────────────────────────────

    /// 미뤄둔 데이터그램, 모든 채널의 대기 패킷, ACK, 재전송 송신 (송신 태스크)
    ///
    /// 미뤄둔 데이터그램은 상태와 관계없이 보냄 (연결 요청, 종료 알림 포함).
    pub fn flush(&self, now: Instant) {
        if !self.flush_deferred(now) || self.state() != ConnectionState::Connected {
            return;
        }

        let mut failure: Option<io::Error> = None;
        for entry in self.channels.iter() {
            entry.value().process(now, &mut |packet: &Packet| {
                if let Err(e) = self.send_raw(packet, now) {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        self.defer(packet);
                        return;
                    }
                    let replace = match &failure {
                        None => true,
                        Some(previous) => !is_fatal_io_error(previous) && is_fatal_io_error(&e),
                    };
                    if replace {
                        failure = Some(e);
                    }
                }
            });
        }

        // 채널 순회가 끝난 뒤 처리 (close가 채널 맵을 비움)
        if let Some(e) = failure {
            self.report_send_error(e);
        }
    }

    /// Keep-alive, 타임아웃, 연결 요청 재전송 (유지보수 태스크)
    pub fn maintain(&self, now: Instant) {
        let times = *self.times.lock();

        match self.state() {
            ConnectionState::Connected => {
                if now.saturating_duration_since(times.last_receive) > self.config.timeout() {
                    warn!("{} 타임아웃", self.remote_addr);
                    self.close(DisconnectInfo::new(DisconnectReason::Timeout));
                    return;
                }
                if now.saturating_duration_since(times.last_send) >= self.config.keep_alive_interval() {
                    trace!("{} keep-alive Ping", self.remote_addr);
                    self.transmit(&Packet::ping(&self.options.pool, clock::to_micros(now)), now);
                }
            }
            ConnectionState::Connecting => match &self.role {
                Role::Initiator { key } => {
                    if now.saturating_duration_since(times.last_connect_attempt)
                        < self.config.connect_retry_interval()
                    {
                        return;
                    }
                    if times.connect_attempts >= self.config.max_connect_attempts {
                        warn!(
                            "{} 연결 실패 ({}회 시도)",
                            self.remote_addr, times.connect_attempts
                        );
                        self.close(DisconnectInfo::new(DisconnectReason::ConnectionFailed));
                        return;
                    }
                    if let Err(e) = self.send_connect_request(key, now) {
                        warn!("{} 연결 요청 생성 실패: {}", self.remote_addr, e);
                        self.close(DisconnectInfo::new(DisconnectReason::ConnectionFailed));
                    }
                }
                Role::Acceptor => {
                    if now.saturating_duration_since(times.created) > self.config.timeout() {
                        debug!("{} 처리되지 않은 연결 요청 만료", self.remote_addr);
                        self.close(DisconnectInfo::new(DisconnectReason::Timeout));
                    }
                }
            },
            _ => {}
        }
    }

    /// 종료 처리 (종료 상태로 처음 전이한 경우 true)
    ///
    /// Disconnected 이벤트는 애플리케이션이 알고 있는 연결에만 발생:
    /// 연결됐던 연결, 또는 로컬에서 시작한 연결.
    pub(crate) fn close(&self, info: DisconnectInfo) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        let previous = loop {
            let state = ConnectionState::from_u8(current);
            if state.is_terminal() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Disconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break state,
                Err(actual) => current = actual,
            }
        };

        // 큐에 남은 패킷 버퍼 반환
        self.channels.clear();

        let notify = match previous {
            ConnectionState::Connected | ConnectionState::Disconnecting => true,
            ConnectionState::Connecting => self.is_initiator(),
            _ => false,
        };
        debug!("{} 종료: {:?}", self.remote_addr, info.reason);
        if notify {
            self.emit_disconnected(info);
        }
        true
    }

    // ── 내부 ────────────────────────────────────────────────

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn emit<F>(&self, make: F)
    where
        F: FnOnce(Arc<Connection>) -> NetEvent,
    {
        if let Some(connection) = self.self_ref.upgrade() {
            let _ = self.events.send(make(connection));
        }
    }

    /// 애플리케이션에 복구 가능한 에러 알림
    pub(crate) fn report_error(&self, error: Error) {
        let _ = self.events.send(NetEvent::ErrorOccurred {
            addr: self.remote_addr,
            error,
        });
    }

    fn emit_disconnected(&self, info: DisconnectInfo) {
        self.emit(|connection| NetEvent::Disconnected { connection, info });
    }

    fn send_raw(&self, packet: &Packet, now: Instant) -> io::Result<()> {
        match self.transport.send_to(packet.as_bytes(), self.remote_addr) {
            Ok(sent) => {
                self.stats.record_sent(sent);
                self.times.lock().last_send = now;
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e)
            }
        }
    }

    fn transmit(&self, packet: &Packet, now: Instant) {
        match self.send_raw(packet, now) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.defer(packet),
            Err(e) => self.report_send_error(e),
        }
    }

    /// 소켓 송신 버퍼가 가득 찬 경우 복사해 두고 다음 flush에서 재시도
    fn defer(&self, packet: &Packet) {
        trace!("{} 소켓 송신 버퍼 가득 참, 송신 보류", self.remote_addr);
        let mut deferred = self.deferred.lock();
        if deferred.len() >= DEFERRED_CAPACITY {
            deferred.pop_front();
            debug!("{} 보류 큐 가득 참, 가장 오래된 데이터그램 폐기", self.remote_addr);
        }
        deferred.push_back(Bytes::copy_from_slice(packet.as_bytes()));
    }

    /// 보류된 데이터그램을 순서대로 송신 (모두 보냈으면 true)
    fn flush_deferred(&self, now: Instant) -> bool {
        let mut deferred = self.deferred.lock();
        while let Some(datagram) = deferred.pop_front() {
            match self.transport.send_to(&datagram, self.remote_addr) {
                Ok(sent) => {
                    self.stats.record_sent(sent);
                    self.times.lock().last_send = now;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    deferred.push_front(datagram);
                    return false;
                }
                Err(e) => {
                    self.stats.record_send_error();
                    let fatal = is_fatal_io_error(&e);
                    self.report_send_error(e);
                    if fatal {
                        deferred.clear();
                        return false;
                    }
                }
            }
        }
        true
    }

    /// 송신 에러 처리
    ///
    /// - 도달 불가: 연결 종료
    /// - 그 외: 에러 이벤트 후 계속
    fn report_send_error(&self, error: io::Error) {
        if is_fatal_io_error(&error) {
            warn!("{} 치명적 송신 에러: {}", self.remote_addr, error);
            let info = DisconnectInfo::transport_error(&error);
            self.report_error(Error::Io(error));
            self.close(info);
        } else {
            warn!("{} 송신 에러: {}", self.remote_addr, error);
            self.report_error(Error::Io(error));
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("initiator", &self.is_initiator())
            .field("channels", &self.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventQueue;
    use crate::packet::PacketFlags;
    use crate::pool::PooledBuffer;
    use crate::transport::testing::RecordingTransport;
    use bytes::BytesMut;

    struct Harness {
        transport: Arc<RecordingTransport>,
        events: EventQueue,
        context: ConnectionContext,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let transport = Arc::new(RecordingTransport::new());
            let events = EventQueue::new();
            let context = ConnectionContext {
                config: Arc::new(config),
                pool: BufferPool::new(64, 64),
                transport: transport.clone(),
                events: events.sender(),
            };
            Self {
                transport,
                events,
                context,
            }
        }

        fn sent_types(&self) -> Vec<u8> {
            self.transport.take().into_iter().map(|(bytes, _)| bytes[0]).collect()
        }

        fn drain_events(&self) -> Vec<NetEvent> {
            std::iter::from_fn(|| self.events.try_next()).collect()
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn packet(bytes: &[u8]) -> Packet {
        Packet::decode(PooledBuffer::detached(BytesMut::from(bytes))).unwrap()
    }

    fn connect_request(key: &str) -> Packet {
        let pool = BufferPool::new(64, 1);
        let request = Packet::connect_request(&pool, key, 1024).unwrap();
        packet(request.as_bytes())
    }

    /// 수락까지 끝난 acceptor 연결
    fn accepted(harness: &Harness, now: Instant) -> Arc<Connection> {
        let connection = Connection::incoming(peer(), &harness.context, now);
        connection.handle_packet(connect_request("MyKey"), now);
        match harness.events.try_next() {
            Some(NetEvent::ConnectionRequested(request)) => assert!(request.accept()),
            other => panic!("unexpected event: {:?}", other),
        }
        harness.drain_events();
        harness.transport.take();
        connection
    }

    #[test]
    fn test_incoming_request_raises_single_event() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = Connection::incoming(peer(), &harness.context, now);

        connection.handle_packet(connect_request("MyKey"), now);
        connection.handle_packet(connect_request("MyKey"), now);

        let events = harness.drain_events();
        assert_eq!(events.len(), 1);
        let NetEvent::ConnectionRequested(request) = &events[0] else {
            panic!("expected request event");
        };
        assert_eq!(request.key().unwrap(), "MyKey");
        assert_eq!(request.remote_addr(), peer());
        assert_eq!(connection.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_accept_is_idempotent() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = Connection::incoming(peer(), &harness.context, now);
        connection.handle_packet(connect_request("MyKey"), now);

        let Some(NetEvent::ConnectionRequested(request)) = harness.events.try_next() else {
            panic!("expected request event");
        };
        assert!(request.accept_if_key("MyKey"));
        assert!(!request.accept());
        assert!(!request.reject());

        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(harness.sent_types(), vec![PacketType::ConnectAccept as u8]);
        assert!(matches!(harness.events.try_next(), Some(NetEvent::Connected(_))));
        assert!(harness.events.try_next().is_none());
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = Connection::incoming(peer(), &harness.context, now);
        connection.handle_packet(connect_request("Other"), now);

        let Some(NetEvent::ConnectionRequested(request)) = harness.events.try_next() else {
            panic!("expected request event");
        };
        assert!(!request.accept_if_key("MyKey"));

        assert_eq!(connection.state(), ConnectionState::Rejected);
        assert_eq!(harness.sent_types(), vec![PacketType::ConnectReject as u8]);
        // 진단용 에러만 올라가고, 애플리케이션이 모르는 연결이므로 종료 이벤트 없음
        let events = harness.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            NetEvent::ErrorOccurred {
                error: Error::HandshakeKeyMismatch,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_request_after_accept_resends_accept() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = accepted(&harness, now);

        connection.handle_packet(connect_request("MyKey"), now);
        assert_eq!(harness.sent_types(), vec![PacketType::ConnectAccept as u8]);
        assert!(harness.events.try_next().is_none());
    }

    #[test]
    fn test_acceptor_ignores_unsolicited_accept() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = Connection::incoming(peer(), &harness.context, now);

        connection.handle_packet(packet(&[PacketType::ConnectAccept as u8]), now);
        connection.handle_packet(packet(&[PacketType::ConnectReject as u8]), now);

        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(harness.events.try_next().is_none());
    }

    #[test]
    fn test_initiator_handshake() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = Connection::outgoing(peer(), "MyKey", &harness.context, now);
        connection.begin_connect(now).unwrap();

        let sent = harness.transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, peer());
        assert_eq!(packet(&sent[0].0).reader().read_str().unwrap(), "MyKey");

        connection.handle_packet(packet(&[PacketType::ConnectAccept as u8]), now);
        assert!(connection.is_connected());
        assert!(matches!(harness.events.try_next(), Some(NetEvent::Connected(_))));

        // 두 번째 Accept는 무시
        connection.handle_packet(packet(&[PacketType::ConnectAccept as u8]), now);
        assert!(harness.events.try_next().is_none());
    }

    #[test]
    fn test_initiator_rejected() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = Connection::outgoing(peer(), "MyKey", &harness.context, now);
        connection.begin_connect(now).unwrap();

        connection.handle_packet(packet(&[PacketType::ConnectReject as u8]), now);
        assert_eq!(connection.state(), ConnectionState::Rejected);
        match harness.events.try_next() {
            Some(NetEvent::Disconnected { info, .. }) => {
                assert_eq!(info.reason, DisconnectReason::Rejected)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_connect_retry_then_failure() {
        let config = Config {
            connect_retry_interval_ms: 100,
            max_connect_attempts: 3,
            ..Config::default()
        };
        let harness = Harness::new(config);
        let start = Instant::now();
        let connection = Connection::outgoing(peer(), "MyKey", &harness.context, start);
        connection.begin_connect(start).unwrap();
        harness.transport.take();

        // 간격 전에는 재전송 없음
        connection.maintain(start + Duration::from_millis(50));
        assert!(harness.transport.take().is_empty());

        connection.maintain(start + Duration::from_millis(100));
        connection.maintain(start + Duration::from_millis(200));
        assert_eq!(
            harness.sent_types(),
            vec![PacketType::ConnectRequest as u8, PacketType::ConnectRequest as u8]
        );

        connection.maintain(start + Duration::from_millis(300));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        match harness.events.try_next() {
            Some(NetEvent::Disconnected { info, .. }) => {
                assert_eq!(info.reason, DisconnectReason::ConnectionFailed)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unanswered_request_expires_silently() {
        let config = Config {
            timeout_ms: 1000,
            ..Config::default()
        };
        let harness = Harness::new(config);
        let start = Instant::now();
        let connection = Connection::incoming(peer(), &harness.context, start);
        connection.handle_packet(connect_request("MyKey"), start);
        let request = harness.events.try_next();

        connection.maintain(start + Duration::from_millis(1001));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(harness.events.try_next().is_none());

        // 만료 후 수락은 효과 없음
        let Some(NetEvent::ConnectionRequested(request)) = request else {
            panic!("expected request event");
        };
        assert!(!request.accept());
    }

    #[test]
    fn test_timeout_fires_once() {
        let config = Config {
            timeout_ms: 1000,
            keep_alive_interval_ms: 10_000,
            ..Config::default()
        };
        let harness = Harness::new(config);
        let start = Instant::now();
        let connection = accepted(&harness, start);

        connection.maintain(start + Duration::from_millis(500));
        assert!(connection.is_connected());

        connection.maintain(start + Duration::from_millis(1500));
        connection.maintain(start + Duration::from_millis(2500));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let events = harness.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            NetEvent::Disconnected { info, .. } if info.reason == DisconnectReason::Timeout
        ));
    }

    #[test]
    fn test_keep_alive_ping_and_pong() {
        let config = Config {
            keep_alive_interval_ms: 100,
            ..Config::default()
        };
        let harness = Harness::new(config);
        let start = Instant::now();
        let connection = accepted(&harness, start);

        // 마지막 송신 이후 간격이 지나면 Ping
        let later = connection.last_send() + Duration::from_millis(100);
        connection.maintain(later);
        let sent = harness.transport.take();
        assert_eq!(sent.len(), 1);
        let ping = packet(&sent[0].0);
        assert_eq!(ping.packet_type(), PacketType::Ping);

        // 상대 Pong 에코 → RTT 갱신
        let pong = packet(&[&[PacketType::Pong as u8][..], ping.payload()].concat());
        connection.handle_packet(pong, later + Duration::from_millis(40));

        match harness.events.try_next() {
            Some(NetEvent::RttUpdated { rtt, .. }) => {
                assert!(rtt >= Duration::from_millis(39) && rtt <= Duration::from_millis(41))
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_ping_answered_only_when_connected() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = Connection::incoming(peer(), &harness.context, now);
        let ping = packet(&[4, 1, 2, 3, 4, 5, 6, 7, 8]);
        connection.handle_packet(ping, now);
        assert!(harness.transport.take().is_empty());

        let connection = accepted(&harness, now);
        connection.handle_packet(packet(&[4, 1, 2, 3, 4, 5, 6, 7, 8]), now);
        let sent = harness.transport.take();
        assert_eq!(sent[0].0, vec![5, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_send_requires_connection_and_matching_delivery() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let pending = Connection::incoming(peer(), &harness.context, now);
        assert!(matches!(
            pending.send(b"x", DeliveryMethod::Reliable, 0),
            Err(Error::NotConnected)
        ));

        let connection = accepted(&harness, now);
        connection.send(b"x", DeliveryMethod::Reliable, 0).unwrap();
        assert!(matches!(
            connection.send(b"x", DeliveryMethod::Unreliable, 0),
            Err(Error::DeliveryMismatch { channel_id: 0 })
        ));
        connection.send(b"y", DeliveryMethod::Unreliable, 1).unwrap();
        assert_eq!(connection.channel_count(), 2);

        connection.flush(now);
        let sent: Vec<_> = harness
            .transport
            .take()
            .into_iter()
            .map(|(bytes, _)| packet(&bytes))
            .collect();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().any(|p| p.channel_id() == 0 && p.flags().is_reliable()));
        assert!(sent.iter().any(|p| p.channel_id() == 1 && p.flags() == PacketFlags::NONE));
    }

    #[test]
    fn test_data_is_delivered_with_channel_info() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = accepted(&harness, now);

        connection.handle_packet(packet(&[6, 1, 3, 0, 0, 0, b'h', b'i']), now);
        match harness.events.try_next() {
            Some(NetEvent::DataReceived {
                channel_id,
                delivery,
                packet,
                ..
            }) => {
                assert_eq!(channel_id, 3);
                assert_eq!(delivery, DeliveryMethod::Reliable);
                assert_eq!(packet.payload(), b"hi");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // ACK는 다음 flush에서 송신
        connection.flush(now);
        assert_eq!(harness.transport.take()[0].0, vec![7, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn test_reliable_data_on_unreliable_channel_is_acked() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = accepted(&harness, now);
        connection.send(b"u", DeliveryMethod::Unreliable, 2).unwrap();
        connection.flush(now);
        harness.transport.take();

        // 상대가 같은 채널을 신뢰 방식으로 사용
        connection.handle_packet(packet(&[6, 1, 2, 9, 0, 0, b'r']), now);

        let events = harness.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            NetEvent::ErrorOccurred {
                error: Error::DeliveryMismatch { channel_id: 2 },
                ..
            }
        ));

        connection.flush(now);
        let sent = harness.transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec![7, 0, 2, 9, 0, 0]);
    }

    #[test]
    fn test_data_before_connect_is_dropped() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = Connection::incoming(peer(), &harness.context, now);
        connection.handle_packet(packet(&[6, 0, 0, 0, 0, 0, 1]), now);
        assert!(harness.events.try_next().is_none());
        assert_eq!(connection.channel_count(), 0);
    }

    #[test]
    fn test_local_disconnect() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = accepted(&harness, now);

        assert!(connection.disconnect());
        assert!(!connection.disconnect());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(harness.sent_types(), vec![PacketType::Disconnect as u8]);

        let events = harness.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            NetEvent::Disconnected { info, .. } if info.reason == DisconnectReason::LocalClose
        ));
    }

    #[test]
    fn test_remote_disconnect() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = accepted(&harness, now);

        connection.handle_packet(packet(&[PacketType::Disconnect as u8]), now);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            harness.events.try_next(),
            Some(NetEvent::Disconnected { info, .. }) if info.reason == DisconnectReason::RemoteClose
        ));
    }

    #[test]
    fn test_fatal_send_error_closes_connection() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = accepted(&harness, now);
        connection.send(b"x", DeliveryMethod::Reliable, 0).unwrap();

        harness.transport.fail_with(Some(io::ErrorKind::HostUnreachable));
        connection.flush(now);

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        let events = harness.drain_events();
        assert!(matches!(&events[0], NetEvent::ErrorOccurred { addr, .. } if *addr == peer()));
        match &events[1] {
            NetEvent::Disconnected { info, .. } => {
                assert_eq!(info.reason, DisconnectReason::TransportError);
                assert_eq!(info.error_kind, Some(io::ErrorKind::HostUnreachable));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_would_block_defers_until_next_flush() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = Connection::outgoing(peer(), "MyKey", &harness.context, now);

        harness.transport.fail_with(Some(io::ErrorKind::WouldBlock));
        connection.begin_connect(now).unwrap();
        connection.flush(now);

        assert!(harness.transport.take().is_empty());
        assert_eq!(connection.deferred_count(), 1);
        assert!(harness.drain_events().is_empty());

        harness.transport.fail_with(None);
        connection.flush(now);
        assert_eq!(harness.sent_types(), vec![PacketType::ConnectRequest as u8]);
        assert_eq!(connection.deferred_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_would_block_keeps_channel_data() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = accepted(&harness, now);
        connection.send(b"x", DeliveryMethod::Unreliable, 0).unwrap();

        harness.transport.fail_with(Some(io::ErrorKind::WouldBlock));
        connection.flush(now);
        assert_eq!(connection.deferred_count(), 1);
        assert!(connection.is_connected());

        harness.transport.fail_with(None);
        connection.flush(now);
        let sent = harness.transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec![PacketType::Data as u8, 0, 0, 0, 0, 0, b'x']);
        assert!(harness.drain_events().is_empty());
    }

    #[test]
    fn test_transient_send_error_keeps_connection() {
        let harness = Harness::new(Config::default());
        let now = Instant::now();
        let connection = accepted(&harness, now);
        connection.send(b"x", DeliveryMethod::Unreliable, 0).unwrap();

        harness.transport.fail_with(Some(io::ErrorKind::PermissionDenied));
        connection.flush(now);

        assert!(connection.is_connected());
        assert!(matches!(
            harness.events.try_next(),
            Some(NetEvent::ErrorOccurred { .. })
        ));
        assert_eq!(connection.stats().send_errors, 1);
    }
}
