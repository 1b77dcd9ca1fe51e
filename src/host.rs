//! CTP 호스트
//!
//! UDP 소켓 하나로 여러 연결을 다중화.
//!
//! 백그라운드 태스크 3개:
//! - 수신: 데이터그램 디코딩 후 주소별 연결로 전달
//! - 송신: `send_interval`마다 각 연결의 채널 큐/ACK/재전송 flush
//! - 유지보수: keep-alive, 타임아웃, 연결 요청 재전송, 종료된 연결 정리
//!
//! 애플리케이션은 `poll_events`로 이벤트를 받아 처리.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, ConnectionContext};
use crate::event::{EventHandler, EventQueue, EventSender, NetEvent};
use crate::packet::{Packet, PacketType};
use crate::pool::{BufferPool, PooledBuffer};
use crate::transport::SocketTransport;
use crate::{Config, Error, Result};

/// 태스크 간 공유 상태
struct Shared {
    config: Arc<Config>,
    pool: Arc<BufferPool>,
    connections: DashMap<SocketAddr, Arc<Connection>>,
    events: EventSender,
}

/// 실행 중 자원
struct Running {
    transport: Arc<SocketTransport>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Host {
    shared: Arc<Shared>,
    events: EventQueue,
    runtime: Mutex<Option<Running>>,
}

impl Host {
    /// 새 호스트 생성 (설정 검증)
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let events = EventQueue::new();
        let pool = BufferPool::new(config.max_packet_size, config.pool_capacity);
        let shared = Arc::new(Shared {
            config: Arc::new(config),
            pool,
            connections: DashMap::new(),
            events: events.sender(),
        });

        Ok(Self {
            shared,
            events,
            runtime: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// 소켓 바인드 후 백그라운드 태스크 시작, 실제 바인드된 주소 반환
    pub async fn start(&self, bind_addr: SocketAddr) -> Result<SocketAddr> {
        if self.runtime.lock().is_some() {
            return Err(Error::AlreadyRunning);
        }

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        // 송신은 try_send_to만 쓰므로 쓰기 준비 상태를 먼저 받아 둠
        socket.writable().await?;
        let local_addr = socket.local_addr()?;
        let shutdown = CancellationToken::new();
        let transport = Arc::new(SocketTransport::new(Arc::clone(&socket)));
        let context = self.shared.context(Arc::clone(&transport));

        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let tasks = vec![
            tokio::spawn(receive_loop(
                Arc::clone(&self.shared),
                context,
                socket,
                local_addr,
                shutdown.clone(),
            )),
            tokio::spawn(send_loop(Arc::clone(&self.shared), shutdown.clone())),
            tokio::spawn(maintenance_loop(Arc::clone(&self.shared), shutdown.clone())),
        ];

        *runtime = Some(Running {
            transport,
            local_addr,
            shutdown,
            tasks,
        });

        info!("CTP 호스트 시작: {}", local_addr);
        Ok(local_addr)
    }

    /// 연결된 상대에게 종료를 알리고 태스크가 모두 끝난 뒤 소켓 해제
    pub async fn stop(&self) {
        let running = self.runtime.lock().take();
        let Some(running) = running else {
            return;
        };

        self.disconnect_all();
        // 보류된 종료 알림까지 내보낸 뒤 태스크 정지
        self.flush();
        running.shutdown.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("백그라운드 태스크 비정상 종료: {}", e);
            }
        }

        self.shared.connections.clear();
        running.transport.close();
        info!("CTP 호스트 종료: {}", running.local_addr);
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|running| running.local_addr)
    }

    /// 원격 호스트에 연결 시작
    ///
    /// 결과는 `Connected` 또는 `Disconnected` 이벤트로 전달됨.
    /// 같은 주소에 진행 중인 연결이 있으면 그 연결을 반환.
    pub fn connect(&self, remote_addr: SocketAddr, key: &str) -> Result<Arc<Connection>> {
        let transport = match self.runtime.lock().as_ref() {
            Some(running) => Arc::clone(&running.transport),
            None => return Err(Error::NotRunning),
        };
        let context = self.shared.context(transport);
        let now = Instant::now();

        let connection = match self.shared.connections.entry(remote_addr) {
            Entry::Occupied(mut entry) => {
                if !entry.get().state().is_terminal() {
                    return Ok(Arc::clone(entry.get()));
                }
                let connection = Connection::outgoing(remote_addr, key, &context, now);
                entry.insert(Arc::clone(&connection));
                connection
            }
            Entry::Vacant(entry) => {
                let connection = Connection::outgoing(remote_addr, key, &context, now);
                entry.insert(Arc::clone(&connection));
                connection
            }
        };

        if let Err(e) = connection.begin_connect(now) {
            self.shared
                .connections
                .remove_if(&remote_addr, |_, existing| Arc::ptr_eq(existing, &connection));
            return Err(e);
        }

        info!("{} 연결 시작", remote_addr);
        Ok(connection)
    }

    /// 모든 연결 정상 종료
    pub fn disconnect_all(&self) {
        for connection in self.shared.snapshot() {
            connection.disconnect();
        }
    }

    /// 쌓인 이벤트를 처리기로 전달 (블로킹 없음), 처리한 이벤트 수 반환
    pub fn poll_events<H: EventHandler + ?Sized>(&self, handler: &mut H) -> usize {
        self.events.poll(handler)
    }

    /// 이벤트 하나 꺼냄
    pub fn try_next_event(&self) -> Option<NetEvent> {
        self.events.try_next()
    }

    /// 송신 주기를 기다리지 않고 모든 연결 flush
    pub fn flush(&self) {
        let now = Instant::now();
        for connection in self.shared.snapshot() {
            connection.flush(now);
        }
    }

    pub fn connection(&self, remote_addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.shared
            .connections
            .get(remote_addr)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(running) = self.runtime.get_mut().take() {
            running.shutdown.cancel();
            running.transport.close();
        }
        // 이벤트 안의 연결 참조 해제
        self.shared.connections.clear();
        self.events.clear();
    }
}

impl Shared {
    fn context(&self, transport: Arc<SocketTransport>) -> ConnectionContext {
        ConnectionContext {
            config: Arc::clone(&self.config),
            pool: Arc::clone(&self.pool),
            transport,
            events: self.events.clone(),
        }
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn handle_datagram(&self, buffer: PooledBuffer, addr: SocketAddr, context: &ConnectionContext, now: Instant) {
        let packet = match Packet::decode(buffer) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("{} 패킷 디코딩 실패: {}", addr, e);
                let _ = self.events.send(NetEvent::ErrorOccurred { addr, error: e });
                return;
            }
        };

        let Some(connection) = self.resolve(addr, packet.packet_type(), context, now) else {
            trace!("{} 알 수 없는 주소의 {:?} 폐기", addr, packet.packet_type());
            return;
        };

        connection.handle_packet(packet, now);

        if connection.state().is_terminal() {
            self.connections
                .remove_if(&addr, |_, existing| Arc::ptr_eq(existing, &connection));
        }
    }

    /// 주소에 해당하는 연결 조회, 연결 요청이면 새로 생성
    fn resolve(
        &self,
        addr: SocketAddr,
        packet_type: PacketType,
        context: &ConnectionContext,
        now: Instant,
    ) -> Option<Arc<Connection>> {
        if let Some(existing) = self.connections.get(&addr) {
            if !existing.state().is_terminal() {
                return Some(Arc::clone(existing.value()));
            }
        }
        self.connections
            .remove_if(&addr, |_, existing| existing.state().is_terminal());

        if packet_type != PacketType::ConnectRequest {
            return None;
        }

        let entry = self.connections.entry(addr).or_insert_with(|| {
            debug!("{} 새 연결 요청", addr);
            Connection::incoming(addr, context, now)
        });
        Some(Arc::clone(entry.value()))
    }

    fn sweep(&self) {
        self.connections.retain(|addr, connection| {
            let keep = !connection.state().is_terminal();
            if !keep {
                trace!("{} 연결 정리", addr);
            }
            keep
        });
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    context: ConnectionContext,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let max_packet_size = shared.config.max_packet_size;

    loop {
        let mut buffer = shared.pool.rent_zeroed(max_packet_size);
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buffer[..]) => result,
        };

        match result {
            Ok((len, addr)) => {
                buffer.truncate(len);
                shared.handle_datagram(buffer, addr, &context, Instant::now());
            }
            Err(e) => {
                // ICMP port unreachable 등은 다음 수신에 영향 없음
                warn!("수신 에러: {}", e);
                let _ = shared.events.send(NetEvent::ErrorOccurred {
                    addr: local_addr,
                    error: Error::Io(e),
                });
            }
        }
    }

    debug!("수신 루프 종료");
}

async fn send_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.send_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        for connection in shared.snapshot() {
            connection.flush(now);
        }
    }

    debug!("송신 루프 종료");
}

async fn maintenance_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.maintenance_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        for connection in shared.snapshot() {
            connection.maintain(now);
        }
        shared.sweep();
    }

    debug!("유지보수 루프 종료");
}
